use shared::error::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("failed to join realtime channel: {0}")]
    JoinRejected(String),
    #[error("waiting room closed before admission")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
