mod common;

use common::{ok, serve};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use wirenet::http::auth::{AuthContext, AuthModule, Authorization};
use wirenet::urlrequest::context::register_auth_module;
use wirenet::Client;

// "user:pass"
const GOOD: &str = "Basic dXNlcjpwYXNz";

fn challenge() -> &'static [u8] {
    b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"vault\"\r\nContent-Length: 6\r\n\r\ndenied"
}

/// Server that wants `user:pass` on every request; counts requests.
async fn guarded_server() -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let (base, _) = serve(move |_, mut conn| {
        let counter = counter.clone();
        async move {
            while let Some((head, _)) = conn.read_request().await {
                counter.fetch_add(1, Ordering::SeqCst);
                if head.header("authorization") == Some(GOOD) {
                    conn.send(ok("secret").as_bytes()).await;
                } else {
                    conn.send(challenge()).await;
                }
            }
        }
    })
    .await;
    (base, hits)
}

#[tokio::test]
async fn test_basic_challenge_is_answered() {
    let (base, hits) = guarded_server().await;
    let client = Client::new();

    let resp = client.get(format!("{}/a", base)).basic_auth("user", "pass").send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "secret");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_accepted_credentials_are_sent_up_front() {
    let (base, hits) = guarded_server().await;
    let client = Client::new();

    let first = client.get(format!("{}/a", base)).basic_auth("user", "pass").send().await.unwrap();
    assert_eq!(first.status(), 200);
    first.bytes().await.unwrap();

    let second = client.get(format!("{}/b", base)).basic_auth("user", "pass").send().await.unwrap();
    assert_eq!(second.status(), 200);
    // One round trip for the challenge, then one each.
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_rejected_credentials_return_the_challenge() {
    let (base, hits) = guarded_server().await;
    let client = Client::new();

    let resp = client.get(format!("{}/a", base)).basic_auth("user", "wrong").send().await.unwrap();
    assert_eq!(resp.status(), 401);
    assert_eq!(resp.text().await.unwrap(), "denied");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_no_credentials_returns_401() {
    let (base, hits) = guarded_server().await;
    let client = Client::new();

    let resp = client.get(format!("{}/a", base)).send().await.unwrap();
    assert_eq!(resp.status(), 401);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_upload_is_replayed_after_challenge() {
    let bodies = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let log = bodies.clone();
    let (base, _) = serve(move |_, mut conn| {
        let log = log.clone();
        async move {
            while let Some((head, body)) = conn.read_request().await {
                log.lock().push(String::from_utf8_lossy(&body).to_string());
                if head.header("authorization") == Some(GOOD) {
                    conn.send(ok("stored").as_bytes()).await;
                } else {
                    conn.send(challenge()).await;
                }
            }
        }
    })
    .await;
    let client = Client::builder().expect_continue(false).build();

    let resp = client
        .post(format!("{}/upload", base))
        .body("document")
        .basic_auth("user", "pass")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "stored");
    assert_eq!(*bodies.lock(), vec!["document".to_string(), "document".to_string()]);
}

/// Three-leg handshake that must stay on one connection.
struct ShakeModule;

impl AuthModule for ShakeModule {
    fn scheme(&self) -> &'static str {
        "Shake"
    }

    fn attempt_authenticate(&self, challenge: &str, _ctx: &AuthContext<'_>) -> Option<Authorization> {
        let (value, complete) = match challenge.trim() {
            "Shake" => ("Shake step1", false),
            "Shake step2" => ("Shake step3", true),
            _ => return None,
        };
        Some(Authorization { value: value.to_string(), complete, realm: None })
    }

    fn pre_authenticate(&self, _ctx: &AuthContext<'_>) -> Option<Authorization> {
        None
    }

    fn requires_connection_affinity(&self) -> bool {
        true
    }
}

fn shake_challenge(value: &str) -> String {
    format!("HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: {}\r\nContent-Length: 0\r\n\r\n", value)
}

#[tokio::test]
async fn test_handshake_legs_share_one_connection() {
    register_auth_module(Arc::new(ShakeModule));

    let locked = Arc::new(Notify::new());
    let other_done = Arc::new(Notify::new());
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let (base, accepted) = {
        let (locked, other_done, seen) = (locked.clone(), other_done.clone(), seen.clone());
        serve(move |index, mut conn| {
            let (locked, other_done, seen) = (locked.clone(), other_done.clone(), seen.clone());
            async move {
                while let Some((head, _)) = conn.read_request().await {
                    seen.lock().push((index, head.target.clone()));
                    if head.target == "/other" {
                        conn.send(ok("other").as_bytes()).await;
                        other_done.notify_one();
                        continue;
                    }
                    match head.header("authorization") {
                        None => conn.send(shake_challenge("Shake").as_bytes()).await,
                        Some("Shake step1") => {
                            // Hold the handshake open while a second request runs.
                            locked.notify_one();
                            other_done.notified().await;
                            conn.send(shake_challenge("Shake step2").as_bytes()).await;
                        }
                        Some("Shake step3") => conn.send(ok("welcome").as_bytes()).await,
                        Some(_) => conn.send(shake_challenge("Shake").as_bytes()).await,
                    }
                }
            }
        })
        .await
    };
    let client = Client::builder().pool_size_per_host(2).build();

    let handshake = {
        let client = client.clone();
        let url = format!("{}/vault", base);
        tokio::spawn(async move {
            let resp = client.get(url).send().await?;
            let status = resp.status();
            Ok::<_, wirenet::NetError>((status, resp.text().await?))
        })
    };

    tokio::time::timeout(Duration::from_secs(5), locked.notified()).await.unwrap();
    let other = client.get(format!("{}/other", base)).send().await.unwrap();
    assert_eq!(other.text().await.unwrap(), "other");

    let (status, body) = tokio::time::timeout(Duration::from_secs(5), handshake).await.unwrap().unwrap().unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "welcome");

    let seen = seen.lock().clone();
    let legs: Vec<usize> = seen.iter().filter(|(_, t)| t == "/vault").map(|(i, _)| *i).collect();
    assert_eq!(legs, vec![0, 0, 0]);
    assert!(seen.contains(&(1, "/other".to_string())));
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}
