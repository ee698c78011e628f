//! Test helpers: a scripted HTTP/1.1 upload endpoint.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::UploadConfig;
use crate::types::{UploadEvent, UploadObserver};

/// Scripted answer for one connection.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Respond {
        status: u16,
        body: String,
        headers: Vec<(String, String)>,
    },
    /// Read the request, then never answer.
    Hang,
}

impl Reply {
    pub(crate) fn ok(body: &str) -> Self {
        Self::status(200, body)
    }

    pub(crate) fn status(status: u16, body: &str) -> Self {
        Reply::Respond {
            status,
            body: body.to_string(),
            headers: Vec::new(),
        }
    }

    pub(crate) fn redirect(location: &str) -> Self {
        Reply::Respond {
            status: 302,
            body: String::new(),
            headers: vec![("Location".into(), location.into())],
        }
    }
}

#[derive(Debug)]
pub(crate) struct RecordedRequest {
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

pub(crate) struct MockServer {
    pub url: String,
    requests: mpsc::UnboundedReceiver<RecordedRequest>,
    connections: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub(crate) async fn start(replies: Vec<Reply>) -> Self {
        Self::start_with_delay(replies, Duration::ZERO).await
    }

    /// Replies are consumed in connection order; each reply waits `delay`
    /// after the request body has been read.
    pub(crate) async fn start_with_delay(replies: Vec<Reply>, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let (tx, requests) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let task = {
            let connections = connections.clone();
            let max_in_flight = max_in_flight.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let index = connections.fetch_add(1, Ordering::SeqCst);
                    let reply = replies
                        .get(index)
                        .cloned()
                        .unwrap_or_else(|| Reply::status(500, "unexpected request"));
                    let tx = tx.clone();
                    let in_flight = in_flight.clone();
                    let max_in_flight = max_in_flight.clone();
                    tokio::spawn(async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_in_flight.fetch_max(now, Ordering::SeqCst);
                        serve(stream, reply, delay, tx).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            })
        };

        Self {
            url,
            requests,
            connections,
            max_in_flight,
            task,
        }
    }

    pub(crate) async fn next_request(&mut self) -> RecordedRequest {
        tokio::time::timeout(Duration::from_secs(10), self.requests.recv())
            .await
            .expect("timed out waiting for request")
            .expect("server stopped")
    }

    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    reply: Reply,
    delay: Duration,
    tx: mpsc::UnboundedSender<RecordedRequest>,
) {
    let Ok(request) = read_request(&mut stream).await else {
        return;
    };
    let _ = tx.send(request);

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    match reply {
        Reply::Hang => {
            std::future::pending::<()>().await;
        }
        Reply::Respond {
            status,
            body,
            headers,
        } => {
            let mut response = format!(
                "HTTP/1.1 {status} Mock\r\nContent-Length: {}\r\nConnection: close\r\n",
                body.len()
            );
            for (name, value) in headers {
                response.push_str(&format!("{name}: {value}\r\n"));
            }
            response.push_str("\r\n");
            response.push_str(&body);
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    }
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 16 * 1024];

    let header_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let method = lines
        .next()
        .and_then(|l| l.split(' ').next())
        .unwrap_or_default()
        .to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let mut body = buf[header_end..].to_vec();
    let chunked = headers
        .get("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));

    if chunked {
        while !body.ends_with(b"0\r\n\r\n") {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body = decode_chunked(&body);
    } else {
        let len: usize = headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        while body.len() < len {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(len);
    }

    Ok(RecordedRequest {
        method,
        headers,
        body,
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn decode_chunked(mut raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(line_end) = find(raw, b"\r\n") {
        let size_text = String::from_utf8_lossy(&raw[..line_end]);
        let size = usize::from_str_radix(size_text.split(';').next().unwrap_or("0").trim(), 16)
            .unwrap_or(0);
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        out.extend_from_slice(&raw[start..start + size]);
        raw = &raw[start + size + 2..];
    }
    out
}

/// Channel-backed observer for assertions.
pub(crate) fn observer() -> (
    Arc<dyn UploadObserver>,
    mpsc::UnboundedReceiver<UploadEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(tx), rx)
}

pub(crate) async fn next_event(rx: &mut mpsc::UnboundedReceiver<UploadEvent>) -> UploadEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for upload event")
        .expect("observer channel closed")
}

pub(crate) fn test_config(url: &str, staging_dir: &Path) -> UploadConfig {
    UploadConfig {
        base_url: url.to_string(),
        idle_timeout_ms: 10_000,
        staging_dir: Some(staging_dir.to_path_buf()),
        ..Default::default()
    }
}

pub(crate) fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}
