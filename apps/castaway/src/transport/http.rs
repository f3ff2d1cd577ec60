use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use super::{SnapshotApi, TransportError};
use crate::client::coalescer::CommandSink;
use crate::protocol::{Command, CommandError, EntityId, EntityKind, EntitySnapshot};

/// HTTP side of the service: the fallback snapshot endpoint plus one command
/// endpoint per controllable field family.
pub struct HttpApi {
    client: Client,
    base: Url,
}

impl HttpApi {
    pub fn new(base: Url) -> Self {
        Self {
            client: Client::new(),
            base,
        }
    }
}

#[derive(Deserialize)]
struct SnapshotBody {
    entities: Vec<EntitySnapshot>,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: String,
}

#[async_trait]
impl SnapshotApi for HttpApi {
    async fn fetch(&self, kind: EntityKind) -> Result<Vec<EntitySnapshot>, TransportError> {
        let url = self.base.join(&format!("api/state/{}", kind.as_str()))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|err| TransportError::Poll(err.to_string()))?;
        let body: SnapshotBody = response
            .json()
            .await
            .map_err(|err| TransportError::Poll(err.to_string()))?;
        Ok(body.entities)
    }
}

#[async_trait]
impl CommandSink for HttpApi {
    async fn submit(
        &self,
        request_id: &str,
        entity_id: &EntityId,
        command: &Command,
    ) -> Result<(), CommandError> {
        let (path, body): (String, Value) = match command {
            Command::SetVolume { percent } => (
                format!("api/nodes/{entity_id}/volume"),
                json!({ "percent": percent }),
            ),
            Command::AssignChannel { channel_id } => (
                format!("api/nodes/{entity_id}/channel"),
                json!({ "channel_id": channel_id }),
            ),
            Command::SetEqBands { bands } => (
                format!("api/nodes/{entity_id}/eq"),
                json!({ "bands": bands }),
            ),
            Command::Seek { position_ms } => (
                "api/player/seek".to_string(),
                json!({ "channel_id": entity_id, "position_ms": position_ms }),
            ),
            Command::SetPlaying { playing } => (
                "api/player/playing".to_string(),
                json!({ "channel_id": entity_id, "playing": playing }),
            ),
        };
        let url = self
            .base
            .join(&path)
            .map_err(|err| CommandError::Unreachable(err.to_string()))?;
        let response = self
            .client
            .post(url)
            .header("x-request-id", request_id)
            .json(&body)
            .send()
            .await
            .map_err(|err| CommandError::Unreachable(err.to_string()))?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status().as_u16();
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.detail)
            .unwrap_or_else(|_| "command failed".to_string());
        Err(CommandError::Rejected { status, message })
    }
}
