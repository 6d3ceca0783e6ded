//! Web server for Hoard.

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::{HoardError, Result, Vault};

use super::router::{create_router, AppState};

/// Web server for the live-update endpoint.
pub struct WebServer {
    /// Server address.
    addr: SocketAddr,
    /// Application state.
    state: AppState,
}

impl WebServer {
    /// Create a new web server.
    pub fn new(config: &ServerConfig, vault: Vault) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| {
                HoardError::Config(format!(
                    "invalid server address {}:{}: {e}",
                    config.host, config.port
                ))
            })?;

        Ok(Self {
            addr,
            state: AppState::new(vault),
        })
    }

    /// Get the configured server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Run the web server until `shutdown` completes.
    pub async fn run<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = create_router(self.state);
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!("Web server listening on http://{}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
    }

    /// Run the server in the background and return the actual bound address.
    ///
    /// This is useful for testing when binding to port 0.
    pub async fn run_with_addr(self) -> std::io::Result<SocketAddr> {
        let router = create_router(self.state);
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Web server listening on http://{}", local_addr);

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!("Web server error: {}", e);
            }
        });

        Ok(local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NotifierConfig, RateLimitConfig};
    use crate::notify::{ChangeEvent, ChangeNotifier, EventType};
    use crate::rate_limit::MutationGovernor;
    use crate::store::{BlobStore, ContentStore};
    use crate::Database;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    async fn create_vault(dir: &TempDir) -> Vault {
        let db = Database::open_in_memory().await.unwrap();
        let blobs = BlobStore::new(dir.path().join("blobs"), 1024).unwrap();
        let store = ContentStore::new(db.clone(), blobs);
        let notifier = ChangeNotifier::new(&NotifierConfig::default());
        let governor = Arc::new(MutationGovernor::new(&RateLimitConfig::default()));
        Vault::new(db, store, notifier, governor, 1024)
    }

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        }
    }

    #[tokio::test]
    async fn test_web_server_new() {
        let dir = TempDir::new().unwrap();
        let server = WebServer::new(&local_config(), create_vault(&dir).await).unwrap();
        assert_eq!(server.addr().ip().to_string(), "127.0.0.1");

        let bad = ServerConfig {
            host: "not an address".to_string(),
            port: 80,
        };
        assert!(matches!(
            WebServer::new(&bad, create_vault(&dir).await),
            Err(HoardError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = TempDir::new().unwrap();
        let server = WebServer::new(&local_config(), create_vault(&dir).await).unwrap();
        let addr = server.run_with_addr().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("OK"));
    }

    #[tokio::test]
    async fn test_websocket_receives_published_events() {
        let dir = TempDir::new().unwrap();
        let vault = create_vault(&dir).await;
        let notifier = vault.notifier().clone();
        let server = WebServer::new(&local_config(), vault).unwrap();
        let addr = server.run_with_addr().await.unwrap();

        let (mut socket, response) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        assert_eq!(response.status().as_u16(), 101);

        // The subscription is registered once the upgrade completes
        for _ in 0..100 {
            if notifier.subscriber_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(notifier.subscriber_count().await, 1);

        notifier.publish(ChangeEvent::new(EventType::FolderCreated, json!({ "id": 9 })));
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = match frame {
            Message::Text(text) => text,
            other => panic!("expected a text frame, got {other:?}"),
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({ "type": "folder_created", "data": { "id": 9 } }));

        // Closing the socket unsubscribes
        socket.close(None).await.unwrap();
        drop(socket);
        for _ in 0..100 {
            if notifier.subscriber_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(notifier.subscriber_count().await, 0);
    }
}
