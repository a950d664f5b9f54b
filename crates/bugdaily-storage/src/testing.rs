//! Canned-response HTTP server for exercising fetch paths without the network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct CannedResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl CannedResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "text/html; charset=utf-8",
            body: body.into(),
        }
    }

    pub fn xml(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "application/rss+xml",
            body: body.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: String::new(),
        }
    }

    fn render(&self) -> Vec<u8> {
        format!(
            "HTTP/1.1 {} Canned\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            self.content_type,
            self.body.len(),
            self.body
        )
        .into_bytes()
    }
}

#[derive(Debug, Clone)]
pub struct TestServer {
    pub base_url: String,
    pub hits: Arc<AtomicUsize>,
    last_request: Arc<Mutex<Option<String>>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Request line and headers of the most recent request.
    pub async fn last_request(&self) -> Option<String> {
        self.last_request.lock().await.clone()
    }

    /// Value of `name` in the most recent request, matched case-insensitively.
    pub async fn last_header(&self, name: &str) -> Option<String> {
        let head = self.last_request().await?;
        head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }
}

/// Serve `responses` in order, one per connection; the last one repeats once the list runs out.
pub async fn serve_sequence(responses: Vec<CannedResponse>) -> std::io::Result<TestServer> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let base_url = format!("http://{}", listener.local_addr()?);
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let last_request = Arc::new(Mutex::new(None));
    let recorder = last_request.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let index = counter.fetch_add(1, Ordering::SeqCst);
            let Some(response) = responses
                .get(index)
                .or_else(|| responses.last())
                .cloned()
            else {
                return;
            };

            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        request.extend_from_slice(&buf[..n]);
                        if request.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                }
            }

            let head = String::from_utf8_lossy(&request);
            let head = head.split("\r\n\r\n").next().unwrap_or_default().to_string();
            *recorder.lock().await = Some(head);

            let _ = socket.write_all(&response.render()).await;
            let _ = socket.shutdown().await;
        }
    });

    Ok(TestServer {
        base_url,
        hits,
        last_request,
    })
}

/// A loopback URL nothing listens on.
pub fn unreachable_url() -> std::io::Result<String> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(format!("http://{addr}/"))
}
