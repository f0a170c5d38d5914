use thiserror::Error;

use crate::types::Status;

/// Failure of `connect` or `flush` as a whole.
///
/// Per-operation failures never surface here; they reach the operation's
/// continuation as a [`Status`]. Only a terminal coordinator-link failure
/// or a broken runtime contract aborts the multiplexer itself.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("coordinator unavailable: {0}")]
    Coordinator(String),
    #[error("logic error: {0}")]
    Logic(String),
}

impl ClientError {
    /// The status-table classification of this failure.
    pub fn status(&self) -> Status {
        match self {
            ClientError::Coordinator(_) => Status::CoordFail,
            ClientError::Logic(_) => Status::LogicError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_status_table() {
        assert_eq!(
            ClientError::Coordinator("down".into()).status(),
            Status::CoordFail
        );
        assert_eq!(ClientError::Logic("re-entry".into()).status(), Status::LogicError);
    }
}
