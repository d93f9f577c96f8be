mod common;

use common::{ok, serve};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use wirenet::{Client, NetError};

#[tokio::test]
async fn test_moved_permanently_turns_post_into_get() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let (base, _) = serve(move |_, mut conn| {
        let log = log.clone();
        async move {
            while let Some((head, body)) = conn.read_request().await {
                log.lock().unwrap().push((head.method.clone(), head.target.clone(), body.len()));
                let resp = if head.target == "/old" {
                    "HTTP/1.1 301 Moved Permanently\r\nLocation: /new\r\nContent-Length: 0\r\n\r\n".to_string()
                } else {
                    ok("moved")
                };
                conn.send(resp.as_bytes()).await;
            }
        }
    })
    .await;
    let client = Client::builder().expect_continue(false).build();

    let request = client.post(format!("{}/old", base)).body("payload").build().unwrap();
    let resp = client.execute(request.clone()).await.unwrap();

    assert_eq!(resp.url().path(), "/new");
    assert_eq!(resp.text().await.unwrap(), "moved");
    assert_eq!(request.redirects(), 1);
    assert_eq!(request.method(), http::Method::GET);

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0], ("POST".to_string(), "/old".to_string(), 7));
    assert_eq!(seen[1], ("GET".to_string(), "/new".to_string(), 0));
}

#[tokio::test]
async fn test_temporary_redirect_keeps_method_and_body() {
    let (base, _) = serve(|_, mut conn| async move {
        while let Some((head, body)) = conn.read_request().await {
            let resp = if head.target == "/old" {
                "HTTP/1.1 307 Temporary Redirect\r\nLocation: /new\r\nContent-Length: 0\r\n\r\n".to_string()
            } else {
                ok(&format!("{} {}", head.method, String::from_utf8_lossy(&body)))
            };
            conn.send(resp.as_bytes()).await;
        }
    })
    .await;
    let client = Client::builder().expect_continue(false).build();

    let resp = client.put(format!("{}/old", base)).body("data").send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "PUT data");
}

#[tokio::test]
async fn test_redirect_limit() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let (base, _) = serve(move |_, mut conn| {
        let counter = counter.clone();
        async move {
            while conn.read_request().await.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
                conn.send(b"HTTP/1.1 302 Found\r\nLocation: /loop\r\nContent-Length: 0\r\n\r\n").await;
            }
        }
    })
    .await;
    let client = Client::new();

    let result = client.get(format!("{}/start", base)).send().await;
    assert_eq!(result.unwrap_err(), NetError::TooManyRedirects);
    // The original request plus fifty redirects.
    assert_eq!(hits.load(Ordering::SeqCst), 51);
}

#[tokio::test]
async fn test_redirect_not_followed_when_disabled() {
    let (base, _) = serve(|_, mut conn| async move {
        while conn.read_request().await.is_some() {
            conn.send(b"HTTP/1.1 302 Found\r\nLocation: /elsewhere\r\nContent-Length: 0\r\n\r\n").await;
        }
    })
    .await;
    let client = Client::builder().auto_redirect(false).build();

    let resp = client.get(format!("{}/start", base)).send().await.unwrap();
    assert_eq!(resp.status(), 302);
    assert_eq!(resp.headers().get("location").unwrap(), "/elsewhere");
}

#[tokio::test]
async fn test_cross_origin_redirect_drops_authorization() {
    let auth_seen = Arc::new(Mutex::new(None));
    let slot = auth_seen.clone();
    let (target, _) = serve(move |_, mut conn| {
        let slot = slot.clone();
        async move {
            if let Some((head, _)) = conn.read_request().await {
                *slot.lock().unwrap() = Some(head.header("authorization").map(str::to_string));
                conn.send(ok("landed").as_bytes()).await;
            }
        }
    })
    .await;
    // Same host, different port: a different origin.
    let location = format!("{}/landing", target);
    let (base, _) = serve(move |_, mut conn| {
        let location = location.clone();
        async move {
            if conn.read_request().await.is_some() {
                let resp = format!("HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\n\r\n", location);
                conn.send(resp.as_bytes()).await;
            }
        }
    })
    .await;
    let client = Client::new();

    let resp = client
        .get(format!("{}/start", base))
        .header("Authorization", "Bearer secret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "landed");
    assert_eq!(*auth_seen.lock().unwrap(), Some(None));
}
