//! Scripted raw-HTTP responder for tests.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

pub enum Step {
    Write(Vec<u8>),
    Sleep(u64),
}

pub struct TestServer {
    pub port: u16,
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn request_lines(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

/// Answers one connection per script entry, in order, then stops accepting.
pub async fn serve(scripts: Vec<Vec<Step>>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();
    tokio::spawn(async move {
        for script in scripts {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let line = read_request(&mut sock).await;
            seen.lock().unwrap().push(line);
            for step in script {
                match step {
                    Step::Write(b) => {
                        if sock.write_all(&b).await.is_err() {
                            break;
                        }
                        let _ = sock.flush().await;
                    }
                    Step::Sleep(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                }
            }
            let _ = sock.shutdown().await;
        }
    });
    TestServer { port, requests }
}

/// Returns the request line after consuming headers and body.
async fn read_request(sock: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        match sock.read(&mut byte).await {
            Ok(1) => buf.push(byte[0]),
            _ => break,
        }
    }
    let head = String::from_utf8_lossy(&buf).to_string();
    let content_length = head
        .lines()
        .find_map(|l| {
            let (k, v) = l.split_once(':')?;
            k.eq_ignore_ascii_case("content-length")
                .then(|| v.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    let _ = sock.read_exact(&mut body).await;
    head.lines().next().unwrap_or_default().to_string()
}

pub fn head(status: &str, headers: &[(&str, String)]) -> Vec<u8> {
    let mut s = format!("HTTP/1.1 {status}\r\nConnection: close\r\n");
    for (k, v) in headers {
        s.push_str(&format!("{k}: {v}\r\n"));
    }
    s.push_str("\r\n");
    s.into_bytes()
}

pub fn full(status: &str, content_type: &str, body: &str) -> Vec<Step> {
    let mut bytes = head(
        status,
        &[
            ("Content-Type", content_type.to_string()),
            ("Content-Length", body.len().to_string()),
        ],
    );
    bytes.extend_from_slice(body.as_bytes());
    vec![Step::Write(bytes)]
}

pub fn json(status: &str, body: &str) -> Vec<Step> {
    full(status, "application/json", body)
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let l = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    l.local_addr().expect("addr").port()
}
