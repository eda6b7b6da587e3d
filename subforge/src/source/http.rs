use super::SubscriptionFetcher;
use crate::prelude::*;
use anyhow::{bail, Context};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Bodies above this size are an error, not a truncation.
pub const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;

// Neutral on purpose: some providers serve engine specific payloads by user agent.
const USER_AGENT: &str = concat!("subforge/", env!("CARGO_PKG_VERSION"));

pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(FETCH_TIMEOUT)
      .user_agent(USER_AGENT)
      .build()
      .context("failed to build HTTP client")?;
    Ok(Self { client })
  }

  async fn download(&self, url: &str) -> Result<Vec<u8>> {
    let mut response = self.client.get(url).send().await?.error_for_status()?;
    if let Some(len) = response.content_length() {
      if len > MAX_RESPONSE_SIZE as u64 {
        bail!("response too large ({} bytes, limit {})", len, MAX_RESPONSE_SIZE);
      }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
      if body.len() + chunk.len() > MAX_RESPONSE_SIZE {
        bail!("response exceeds size limit of {} bytes", MAX_RESPONSE_SIZE);
      }
      body.extend_from_slice(&chunk);
    }
    Ok(body)
  }
}

#[async_trait]
impl SubscriptionFetcher for HttpFetcher {
  async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
    debug!("Fetching subscription {}", url);
    tokio::select! {
      _ = cancel.cancelled() => bail!("fetch of {} cancelled", url),
      body = self.download(url) => body,
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::{TcpListener, TcpStream};

  fn fetcher() -> HttpFetcher {
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    HttpFetcher { client }
  }

  async fn read_request(stream: &mut TcpStream) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
      match stream.read(&mut buf).await {
        Ok(0) | Err(_) => return,
        Ok(n) => request.extend_from_slice(&buf[..n]),
      }
    }
  }

  /// Serves `head` and `body` to one client, returns the URL to fetch.
  async fn serve_once(head: String, body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut stream, _) = listener.accept().await.unwrap();
      read_request(&mut stream).await;
      // the client hangs up early on oversized bodies
      let _ = stream.write_all(head.as_bytes()).await;
      let _ = stream.write_all(&body).await;
      let _ = stream.shutdown().await;
    });
    format!("http://{}/sub", addr)
  }

  #[tokio::test]
  async fn small_body_is_returned() {
    let url = serve_once(
      "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\n".to_string(),
      b"hello".to_vec(),
    )
    .await;
    let body = fetcher().fetch(&url, &CancellationToken::new()).await.unwrap();
    assert_eq!(body, b"hello");
  }

  #[tokio::test]
  async fn declared_length_over_limit_is_an_error() {
    let size = MAX_RESPONSE_SIZE + 1;
    let head = format!(
      "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
      size
    );
    let url = serve_once(head, vec![b'a'; size]).await;
    let err = fetcher().fetch(&url, &CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains("too large"), "{:#}", err);
  }

  #[tokio::test]
  async fn streamed_body_over_limit_is_an_error() {
    let head = "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n".to_string();
    let url = serve_once(head, vec![b'a'; MAX_RESPONSE_SIZE + 4096]).await;
    let err = fetcher().fetch(&url, &CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains("size limit"), "{:#}", err);
  }

  #[tokio::test]
  async fn error_status_is_an_error() {
    let url = serve_once(
      "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
      Vec::new(),
    )
    .await;
    assert!(fetcher().fetch(&url, &CancellationToken::new()).await.is_err());
  }

  #[tokio::test]
  async fn cancel_stops_a_stalled_fetch() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/sub", listener.local_addr().unwrap());
    tokio::spawn(async move {
      let (mut stream, _) = listener.accept().await.unwrap();
      read_request(&mut stream).await;
      // never answer, hold the connection until the client drops it
      let mut buf = [0u8; 64];
      while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
          break;
        }
      }
    });

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), fetcher().fetch(&url, &cancel)).await;
    let err = result.expect("fetch should stop on cancel").unwrap_err();
    assert!(err.to_string().contains("cancelled"), "{:#}", err);
  }
}
