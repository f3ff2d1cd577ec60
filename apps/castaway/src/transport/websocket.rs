use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

use super::{PushConnector, PushLink, TransportError};

/// Push channel over the service's `/ws/state` websocket.
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    /// Derive the websocket endpoint from the service base URL.
    pub fn new(base: &Url) -> Result<Self, TransportError> {
        let scheme = match base.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        let host = base
            .host_str()
            .ok_or_else(|| TransportError::Connect("server url has no host".to_string()))?;
        let mut raw = format!("{scheme}://{host}");
        if let Some(port) = base.port() {
            raw.push_str(&format!(":{port}"));
        }
        raw.push_str("/ws/state");
        Ok(Self {
            url: Url::parse(&raw)?,
        })
    }
}

#[async_trait]
impl PushConnector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn PushLink>, TransportError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok(Box::new(WebSocketLink { stream }))
    }
}

struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushLink for WebSocketLink {
    async fn next_frame(&mut self) -> Option<String> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => return Some(text),
                    Err(_) => continue, // not a JSON frame; drop it
                },
                Ok(Message::Close(_)) | Err(_) => return None,
                _ => {} // ping/pong and fragments are handled by the stack
            }
        }
        None
    }
}
