use relay_core::errors::{SessionError, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl TurnError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Cancelled))
    }
}
