use serde::{Deserialize, Serialize};

/// Current envelope wire version.
pub const WIRE_VERSION: u32 = 1;

/// Command of the bootstrap-channel message that carries the host's
/// stable identity, sent as part of the authentication exchange. A peer
/// that has not been given the host identity out-of-band learns it from
/// the first message with this command.
pub const HOST_IDENTITY_COMMAND: &str = "host-identity";

fn default_version() -> u32 {
    WIRE_VERSION
}

fn default_connection_hint() -> i64 {
    -1
}

/// The wire-format message unit exchanged between host and peers,
/// encoded as a compact self-describing JSON object.
///
/// Receivers ignore unknown fields and fill defaulted ones, so envelope
/// revisions stay forward compatible. A missing or empty `command` is a
/// decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default = "default_version")]
    pub version: u32,
    pub command: String,
    #[serde(default)]
    pub data: String,
    /// Sender's local connection handle, -1 when unknown or host-side.
    #[serde(default = "default_connection_hint")]
    pub sender_connection_hint: i64,
    /// Sender's stable identity, empty when unknown.
    #[serde(default)]
    pub sender_peer_hint: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("encoding failed: {0}")]
    Encode(serde_json::Error),
    #[error("decoding failed: {0}")]
    Decode(serde_json::Error),
    #[error("envelope command is empty")]
    EmptyCommand,
}

impl Envelope {
    pub fn new(command: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            version: WIRE_VERSION,
            command: command.into(),
            data: data.into(),
            sender_connection_hint: default_connection_hint(),
            sender_peer_hint: String::new(),
        }
    }

    pub fn with_peer_hint(mut self, identity: impl Into<String>) -> Self {
        self.sender_peer_hint = identity.into();
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        if self.command.is_empty() {
            return Err(EnvelopeError::EmptyCommand);
        }
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)?;
        if envelope.command.is_empty() {
            return Err(EnvelopeError::EmptyCommand);
        }
        Ok(envelope)
    }
}
