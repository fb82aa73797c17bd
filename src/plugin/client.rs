//! WebSocket client for a running module plugin.

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use super::types::{
    ApplyRequest, ApplyResponse, BuildRequest, BuildResponse, PluginCommand, PluginMessage,
};
use crate::error::PluginError;

/// Client for one plugin server. Each request opens its own connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleClient {
    host: String,
    port: u16,
}

impl ModuleClient {
    /// Creates a client for a plugin listening on `localhost:port`.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            host: "localhost".to_string(),
            port,
        }
    }

    /// Overrides the host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Port of the plugin server.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// WebSocket endpoint.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}:{}/ws", self.host, self.port)
    }

    /// Builds a module directory into an image.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or the plugin reports one.
    pub async fn build(&self, request: &BuildRequest) -> Result<BuildResponse, PluginError> {
        info!("Building module in {}", request.directory);
        self.request("build", request).await
    }

    /// Applies or destroys a module.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or the plugin reports one.
    pub async fn apply(&self, request: &ApplyRequest) -> Result<ApplyResponse, PluginError> {
        self.request("apply", request).await
    }

    async fn request<R, T>(&self, command: &str, request: &R) -> Result<T, PluginError>
    where
        R: Serialize + Sync,
        T: DeserializeOwned,
    {
        let (mut socket, _) = connect_async(self.url())
            .await
            .map_err(|e| PluginError::connection(format!("{}: {e}", self.url())))?;

        let payload = serde_json::to_string(&PluginCommand { command, request })
            .map_err(|e| PluginError::protocol(e.to_string()))?;
        socket
            .send(Message::Text(payload))
            .await
            .map_err(|e| PluginError::connection(e.to_string()))?;

        while let Some(frame) = socket.next().await {
            let text = match frame.map_err(|e| PluginError::connection(e.to_string()))? {
                Message::Text(text) => text,
                Message::Binary(bytes) => String::from_utf8(bytes)
                    .map_err(|e| PluginError::protocol(format!("non UTF-8 frame: {e}")))?,
                Message::Close(_) => break,
                _ => continue,
            };

            let message: PluginMessage = serde_json::from_str(&text)
                .map_err(|e| PluginError::protocol(format!("invalid frame: {e}")))?;

            if let Some(line) = message.verbose_output {
                debug!(command, port = self.port, "{line}");
            } else if let Some(error) = message.error {
                let _ = socket.close(None).await;
                let message = match error {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                return Err(PluginError::Remote { message });
            } else if let Some(result) = message.result {
                let _ = socket.close(None).await;
                return serde_json::from_value(result)
                    .map_err(|e| PluginError::protocol(format!("invalid {command} result: {e}")));
            }
        }

        Err(PluginError::protocol(format!(
            "connection closed before {command} returned a result"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Serves one connection, replying with `frames` after the request.
    async fn serve_once(frames: Vec<String>) -> (u16, tokio::task::JoinHandle<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
            let request = match ws.next().await.expect("frame").expect("message") {
                Message::Text(text) => serde_json::from_str(&text).expect("json request"),
                other => panic!("unexpected frame {other:?}"),
            };
            for frame in frames {
                ws.send(Message::Text(frame)).await.expect("send");
            }
            request
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_apply_streams_logs_then_result() {
        let (port, server) = serve_once(vec![
            json!({ "verboseOutput": "creating" }).to_string(),
            json!({ "result": { "state": { "v": 1 }, "outputs": { "id": "vpc-1" } } }).to_string(),
        ])
        .await;

        let client = ModuleClient::new(port).with_host("127.0.0.1");
        let request = ApplyRequest {
            plugin_id: "module/vpc@blue".to_string(),
            image: "vpc:1".to_string(),
            inputs: vec![("name".to_string(), json!("main"))],
            state: None,
            destroy: false,
        };
        let response = client.apply(&request).await.expect("apply succeeds");

        assert_eq!(response.outputs["id"], "vpc-1");
        assert_eq!(response.state, Some(json!({ "v": 1 })));

        let received = server.await.expect("server");
        assert_eq!(received["command"], "apply");
        assert_eq!(received["request"]["pluginId"], "module/vpc@blue");
    }

    #[tokio::test]
    async fn test_remote_error_is_surfaced() {
        let (port, _server) =
            serve_once(vec![json!({ "error": "quota exceeded" }).to_string()]).await;

        let client = ModuleClient::new(port).with_host("127.0.0.1");
        let result = client
            .build(&BuildRequest {
                directory: "/tmp/module".to_string(),
            })
            .await;

        match result {
            Err(PluginError::Remote { message }) => assert_eq!(message, "quota exceeded"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let client = ModuleClient::new(port).with_host("127.0.0.1");
        let result = client
            .build(&BuildRequest {
                directory: "/tmp".to_string(),
            })
            .await;
        assert!(matches!(result, Err(PluginError::Connection { .. })));
    }
}
