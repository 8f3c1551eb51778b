use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed broadcast event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("chat sender mismatch: envelope {envelope} payload {payload}")]
    SenderMismatch { envelope: String, payload: String },
}
