use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::thread;
use wirenet::blocking::Client;

/// Thread-per-connection server that answers `METHOD target body` and closes.
fn spawn_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { return };
            thread::spawn(move || {
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let mut parts = line.split_whitespace();
                let method = parts.next().unwrap_or("").to_string();
                let target = parts.next().unwrap_or("").to_string();

                let mut length = 0usize;
                loop {
                    let mut header = String::new();
                    reader.read_line(&mut header).unwrap();
                    if header == "\r\n" || header.is_empty() {
                        break;
                    }
                    if let Some((k, v)) = header.split_once(':') {
                        if k.eq_ignore_ascii_case("content-length") {
                            length = v.trim().parse().unwrap();
                        }
                    }
                }
                let mut body = vec![0u8; length];
                reader.read_exact(&mut body).unwrap();

                let text = format!("{} {} {}", method, target, String::from_utf8_lossy(&body));
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    text.len(),
                    text
                );
                let mut stream = stream;
                stream.write_all(resp.as_bytes()).unwrap();
            });
        }
    });
    format!("http://{}", addr)
}

#[test]
fn test_blocking_get() {
    let base = spawn_server();
    let client = Client::new().unwrap();

    let resp = client.get(format!("{}/hello", base)).send().unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("content-type").unwrap(), "text/plain");
    assert_eq!(resp.text().unwrap(), "GET /hello ");
}

#[test]
fn test_blocking_post_with_body() {
    let base = spawn_server();
    let client = Client::with_builder(wirenet::Client::builder().expect_continue(false)).unwrap();

    let resp = client.post(format!("{}/submit", base)).body("abc").send().unwrap();
    assert_eq!(resp.text().unwrap(), "POST /submit abc");
}

#[test]
fn test_blocking_client_from_many_threads() {
    let base = spawn_server();
    let client = Client::new().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let client = client.clone();
            let url = format!("{}/{}", base, i);
            thread::spawn(move || client.get(url).send().unwrap().text().unwrap())
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), format!("GET /{} ", i));
    }
}

#[test]
fn test_blocking_connection_refused() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = Client::new().unwrap();

    let result = client.get(format!("http://127.0.0.1:{}/", port)).send();
    assert_eq!(result.unwrap_err(), wirenet::NetError::ConnectionRefused);
}
