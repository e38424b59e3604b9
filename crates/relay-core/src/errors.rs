use std::fmt;
use std::time::Duration;

use crate::actions::ActionStatus;
use crate::ids::ActionId;

/// Failures talking to the assistant backend, either opening the chat stream,
/// reading it, or resolving an action.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    /// The backend answered but declined the operation (`success: false`).
    #[error("refused by server: {0}")]
    Refused(String),
    #[error("cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Network(_) | Self::StreamInterrupted(_)
        ) || matches!(self, Self::Status { status, .. } if *status >= 500)
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::Status { .. } => "status",
            Self::Network(_) => "network",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Refused(_) => "refused",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None },
            _ => Self::Status { status, body },
        }
    }
}

/// The operation a caller attempted on a proposed action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionOp {
    Approve,
    Reject,
}

impl fmt::Display for ActionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        })
    }
}

/// Outcomes of approve/reject other than success.
///
/// `InvalidTransition` is an expected rejection of the call (double approve,
/// reject after a terminal state, access after expiry). `Backend` is an actual
/// failure of the resolution request; the action is back in `pending`.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("unknown action {0}")]
    NotFound(ActionId),
    #[error("cannot {attempted} action {id}: status is {from}")]
    InvalidTransition {
        id: ActionId,
        from: ActionStatus,
        attempted: ActionOp,
    },
    #[error("action {0} was already proposed")]
    Duplicate(ActionId),
    #[error("resolving action {id} failed: {source}")]
    Backend {
        id: ActionId,
        #[source]
        source: TransportError,
    },
}

impl ActionError {
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }

    pub fn action_id(&self) -> &ActionId {
        match self {
            Self::NotFound(id) | Self::Duplicate(id) => id,
            Self::InvalidTransition { id, .. } | Self::Backend { id, .. } => id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("a turn is already streaming")]
    TurnInProgress,
    #[error("no turn is awaiting a response")]
    NoActiveTurn,
    #[error("message is empty")]
    EmptyMessage,
}
