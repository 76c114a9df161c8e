//! Typed messages and how they are turned into bytes and back.
use serde::{de::DeserializeOwned, Serialize};

/// A message type that can be published and routed to a handler by its type tag.
///
/// The type tag travels in the AMQP `type` property of each message: consumers use it to pick
/// the handler registered for that type.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    const TYPE_NAME: &'static str;
}

/// Converts message payloads to and from bytes.
pub trait MessageSerializer: Send + Sync + 'static {
    fn serialize<M: Serialize>(&self, message: &M) -> Result<Vec<u8>, anyhow::Error>;

    fn deserialize<M: DeserializeOwned>(
        &self,
        payload: &[u8],
        type_tag: &str,
    ) -> Result<M, anyhow::Error>;

    /// The MIME type stamped on published messages.
    fn content_type(&self) -> &'static str;
}

/// The default serializer: JSON, via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn serialize<M: Serialize>(&self, message: &M) -> Result<Vec<u8>, anyhow::Error> {
        Ok(serde_json::to_vec(message)?)
    }

    fn deserialize<M: DeserializeOwned>(
        &self,
        payload: &[u8],
        type_tag: &str,
    ) -> Result<M, anyhow::Error> {
        serde_json::from_slice(payload)
            .map_err(|e| anyhow::anyhow!(e).context(format!("Failed to deserialize a `{type_tag}` message")))
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}
