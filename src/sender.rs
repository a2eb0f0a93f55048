//! Outbound delivery attempts
//!
//! A [`Sender`] performs exactly one POST of a serialized batch and reports
//! the raw outcome. Classification of that outcome belongs to the delivery
//! cycle.

use crate::error::{RelayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Response to a delivery attempt
#[derive(Debug, Clone)]
pub struct SendResponse {
    /// HTTP status code
    pub status: u16,

    /// Response body, kept for logging
    pub body: Bytes,
}

impl SendResponse {
    /// Body as lossy UTF-8, truncated for log lines
    pub fn body_preview(&self) -> String {
        const MAX: usize = 512;
        let text = String::from_utf8_lossy(&self.body);
        if text.len() <= MAX {
            return text.into_owned();
        }
        let mut end = MAX;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}

/// One outbound attempt against the delivery target
///
/// `Err` means the request never produced a response (connect failure,
/// timeout, reset) and is treated as transient.
#[async_trait]
pub trait Sender: Send + Sync {
    /// POST a serialized batch
    async fn send(&self, batch: Bytes) -> Result<SendResponse>;
}

/// HTTP sender settings
#[derive(Debug, Clone)]
pub struct HttpSenderConfig {
    /// Endpoint receiving batches
    pub url: String,

    /// Static credential attached to every request
    pub api_key: String,

    /// Whole-request timeout
    pub timeout: Duration,
}

impl Default for HttpSenderConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// `Sender` backed by reqwest
///
/// Sends `Content-Type: application/json`, `Authorization: Bearer <key>` and
/// `apikey: <key>`.
pub struct HttpSender {
    config: HttpSenderConfig,
    client: reqwest::Client,
}

impl HttpSender {
    /// Create a sender with its own connection pool
    pub fn new(config: HttpSenderConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(RelayError::Config("delivery URL must not be empty".into()));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RelayError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// Get the configuration
    pub fn config(&self) -> &HttpSenderConfig {
        &self.config
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(&self, batch: Bytes) -> Result<SendResponse> {
        let mut request = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(batch);

        if !self.config.api_key.is_empty() {
            request = request
                .bearer_auth(&self.config.api_key)
                .header("apikey", &self.config.api_key);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(status, error = %e, "Failed to read response body");
                Bytes::new()
            }
        };

        Ok(SendResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one connection, capture the request head, reply with `status`
    async fn one_shot_server(status: u16, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/ingest", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                request.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {} Status\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).into_owned()
        });

        (url, handle)
    }

    fn sender(url: String) -> HttpSender {
        HttpSender::new(HttpSenderConfig {
            url,
            api_key: "secret-key".to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_http_sender_posts_batch_with_credentials() {
        let (url, server) = one_shot_server(200, "ok").await;

        let response = sender(url).send(Bytes::from_static(b"[]")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], b"ok");

        let request = server.await.unwrap();
        let lower = request.to_ascii_lowercase();
        assert!(request.starts_with("POST /ingest"));
        assert!(lower.contains("content-type: application/json"));
        assert!(lower.contains("authorization: bearer secret-key"));
        assert!(lower.contains("apikey: secret-key"));
        assert!(request.ends_with("[]"));
    }

    #[tokio::test]
    async fn test_http_sender_reports_server_error_status() {
        let (url, server) = one_shot_server(503, "busy").await;
        let response = sender(url).send(Bytes::from_static(b"[]")).await.unwrap();
        assert_eq!(response.status, 503);
        assert_eq!(response.body_preview(), "busy");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_sender_transport_error() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/ingest", listener.local_addr().unwrap());
        drop(listener);

        let err = sender(url).send(Bytes::from_static(b"[]")).await.unwrap_err();
        assert!(matches!(err, RelayError::Http(_)));
    }

    #[test]
    fn test_empty_url_rejected() {
        assert!(matches!(
            HttpSender::new(HttpSenderConfig::default()),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn test_body_preview_truncates() {
        let response = SendResponse {
            status: 500,
            body: Bytes::from("é".repeat(600)),
        };
        let preview = response.body_preview();
        assert!(preview.ends_with('…'));
        assert!(preview.len() <= 512 + '…'.len_utf8());
    }
}
