use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::{ConfigStore, StoreError};

/// Reads objects from a public bucket over HTTPS without credentials.
#[derive(Debug, Clone)]
pub struct GcsConfigStore {
    client: Client,
    endpoint: String,
}

impl GcsConfigStore {
    /// Default request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Creates an anonymous client for `endpoint` (e.g. `https://storage.googleapis.com`).
    ///
    /// # Errors
    /// Returns [`StoreError::Transport`] when the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| StoreError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    /// Public URL of `bucket/key`.
    #[must_use]
    pub fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{bucket}/{}", self.endpoint, key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ConfigStore for GcsConfigStore {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let url = self.object_url(bucket, key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| StoreError::Transport(err.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::not_found(bucket, key)),
            status if !status.is_success() => {
                Err(StoreError::Transport(format!("GET {url} returned {status}")))
            }
            _ => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|err| StoreError::Transport(err.to_string()))?;
                debug!(bucket, key, bytes = body.len(), "downloaded policy blob");
                Ok(body.to_vec())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        task::JoinHandle,
    };

    /// Answers a single request with `status` and `body`; yields the request head.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (endpoint, server)
    }

    #[tokio::test]
    async fn fetch_returns_body_of_public_object() {
        let (endpoint, server) = serve_once("200 OK", r#"{"5Bad":{"type":"hotkey"}}"#).await;
        let store = GcsConfigStore::new(endpoint, Duration::from_secs(5)).unwrap();
        let body = store.fetch("alchemy-public", "miner_blacklist.json").await.unwrap();
        assert_eq!(body, br#"{"5Bad":{"type":"hotkey"}}"#.to_vec());
        let request = server.await.unwrap();
        assert!(request.starts_with("GET /alchemy-public/miner_blacklist.json HTTP/1.1"));
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let (endpoint, _server) = serve_once("404 Not Found", "").await;
        let store = GcsConfigStore::new(endpoint, Duration::from_secs(5)).unwrap();
        assert_eq!(
            store.fetch("alchemy-public", "settings.json").await,
            Err(StoreError::not_found("alchemy-public", "settings.json"))
        );
    }

    #[tokio::test]
    async fn server_error_is_transport() {
        let (endpoint, _server) = serve_once("503 Service Unavailable", "busy").await;
        let store = GcsConfigStore::new(endpoint, Duration::from_secs(5)).unwrap();
        let err = store.fetch("alchemy-public", "settings.json").await.unwrap_err();
        assert!(matches!(err, StoreError::Transport(msg) if msg.contains("503")));
    }

    #[tokio::test]
    async fn refused_connection_is_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let store = GcsConfigStore::new(endpoint, Duration::from_secs(5)).unwrap();
        assert!(matches!(
            store.fetch("alchemy-public", "settings.json").await,
            Err(StoreError::Transport(_))
        ));
    }

    #[test]
    fn builds_public_object_urls() {
        let store =
            GcsConfigStore::new("https://storage.googleapis.com/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            store.object_url("alchemy-public", "/miner_blacklist.json"),
            "https://storage.googleapis.com/alchemy-public/miner_blacklist.json"
        );
    }
}
