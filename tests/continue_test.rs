//! Expect: 100-continue handshake.

mod common;

use common::{ok, serve};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wirenet::Client;

#[tokio::test]
async fn test_continue_then_final_response() {
    let (base, _) = serve(|_, mut conn| async move {
        while let Some(head) = conn.read_head().await {
            assert_eq!(head.header("expect"), Some("100-continue"));
            conn.send(b"HTTP/1.1 100 Continue\r\nX-Interim: yes\r\n\r\n").await;
            let body = conn.read_body(&head).await.unwrap();
            conn.send(ok(&body.len().to_string()).as_bytes()).await;
        }
    })
    .await;
    let client = Client::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let resp = client
        .post(format!("{}/upload", base))
        .body(vec![b'x'; 1000])
        .on_continue(move |status, headers| {
            assert_eq!(status, 100);
            assert_eq!(headers.get("x-interim").unwrap(), "yes");
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "1000");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_body_sent_when_continue_never_comes() {
    let second_expects = Arc::new(AtomicBool::new(true));
    let flag = second_expects.clone();
    let (base, _) = serve(move |_, mut conn| {
        let flag = flag.clone();
        async move {
            let mut count = 0;
            while let Some((head, body)) = conn.read_request().await {
                if count == 1 {
                    flag.store(head.header("expect").is_some(), Ordering::SeqCst);
                }
                count += 1;
                conn.send(ok(&body.len().to_string()).as_bytes()).await;
            }
        }
    })
    .await;
    let client = Client::builder().continue_timeout(Duration::from_millis(100)).build();

    let started = Instant::now();
    let resp = client.post(format!("{}/a", base)).body("hello").send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "5");
    assert!(started.elapsed() >= Duration::from_millis(100));

    // The origin never answered 100; later uploads skip the wait.
    let resp = client.post(format!("{}/b", base)).body("again").send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "5");
    assert!(!second_expects.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_final_status_before_continue_withholds_body() {
    let got_body = Arc::new(AtomicBool::new(false));
    let flag = got_body.clone();
    let (base, _) = serve(move |_, mut conn| {
        let flag = flag.clone();
        async move {
            if conn.read_head().await.is_some() {
                conn.send(b"HTTP/1.1 413 Payload Too Large\r\nContent-Length: 0\r\n\r\n").await;
                // Anything after the head would be the withheld body.
                let mut rest = [0u8; 16];
                let n = tokio::time::timeout(
                    Duration::from_millis(200),
                    tokio::io::AsyncReadExt::read(&mut conn.sock, &mut rest),
                )
                .await;
                if let Ok(Ok(n)) = n {
                    flag.store(n > 0 || !conn.buf.is_empty(), Ordering::SeqCst);
                }
            }
        }
    })
    .await;
    let client = Client::builder().continue_timeout(Duration::from_secs(5)).build();

    let resp = client.post(format!("{}/big", base)).body(vec![0u8; 4096]).send().await.unwrap();
    assert_eq!(resp.status(), 413);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!got_body.load(Ordering::SeqCst));
}
