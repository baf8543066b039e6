//! Domain error types.

use std::fmt;

/// External collaborator that failed a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collaborator {
    Scoring,
    History,
    Execution,
    Notification,
    State,
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collaborator::Scoring => write!(f, "scoring"),
            Collaborator::History => write!(f, "history"),
            Collaborator::Execution => write!(f, "execution"),
            Collaborator::Notification => write!(f, "notification"),
            Collaborator::State => write!(f, "state"),
        }
    }
}

/// Why an entry was turned down before any capital was committed.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    BelowThreshold { probability: f64, threshold: f64 },
    ConcurrencyCap { open: usize, cap: usize },
    InsufficientCapital { available: f64, price: f64 },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::BelowThreshold {
                probability,
                threshold,
            } => write!(
                f,
                "rebound probability {probability:.3} below threshold {threshold:.3}"
            ),
            RejectReason::ConcurrencyCap { open, cap } => {
                write!(f, "{open} open positions, cap is {cap}")
            }
            RejectReason::InsufficientCapital { available, price } => write!(
                f,
                "available capital {available:.2} cannot buy one unit at {price:.2}"
            ),
        }
    }
}

/// Top-level error type for rebounder.
#[derive(Debug, thiserror::Error)]
pub enum RebounderError {
    #[error("insufficient history for {what}: have {have}, need {need}")]
    InsufficientHistory {
        what: String,
        have: usize,
        need: usize,
    },

    #[error("invariant violation: {reason}")]
    InvariantViolation { reason: String },

    #[error("{collaborator} collaborator failed: {reason}")]
    Collaborator {
        collaborator: Collaborator,
        reason: String,
    },

    #[error("{side} fill for {instrument} timed out after {timeout_ms}ms; manual reconciliation required")]
    FillTimeout {
        instrument: String,
        side: String,
        timeout_ms: u64,
    },

    #[error("position {id} ({instrument}) awaits manual reconciliation")]
    ReconciliationRequired { id: u64, instrument: String },

    #[error("entry for {instrument} rejected: {reason}")]
    EntryRejected {
        instrument: String,
        reason: RejectReason,
    },

    #[error("no open position with id {id}")]
    PositionNotFound { id: u64 },

    #[error("invalid exit policy: {reason}")]
    InvalidPolicy { reason: String },

    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RebounderError {
    pub fn invariant(reason: impl Into<String>) -> Self {
        RebounderError::InvariantViolation {
            reason: reason.into(),
        }
    }

    pub fn collaborator(collaborator: Collaborator, reason: impl Into<String>) -> Self {
        RebounderError::Collaborator {
            collaborator,
            reason: reason.into(),
        }
    }
}

impl From<&RebounderError> for std::process::ExitCode {
    fn from(err: &RebounderError) -> Self {
        let code: u8 = match err {
            RebounderError::Io(_) => 1,
            RebounderError::ConfigParse { .. }
            | RebounderError::ConfigMissing { .. }
            | RebounderError::ConfigInvalid { .. } => 2,
            RebounderError::Database { .. } | RebounderError::DatabaseQuery { .. } => 3,
            RebounderError::InvalidPolicy { .. } | RebounderError::InvalidInput { .. } => 4,
            RebounderError::InsufficientHistory { .. } => 5,
            RebounderError::EntryRejected { .. } => 6,
            RebounderError::Collaborator { .. }
            | RebounderError::FillTimeout { .. }
            | RebounderError::ReconciliationRequired { .. } => 7,
            RebounderError::InvariantViolation { .. } | RebounderError::PositionNotFound { .. } => {
                8
            }
        };
        std::process::ExitCode::from(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_history_message() {
        let err = RebounderError::InsufficientHistory {
            what: "forward window".into(),
            have: 0,
            need: 1,
        };
        assert_eq!(
            err.to_string(),
            "insufficient history for forward window: have 0, need 1"
        );
    }

    #[test]
    fn rejection_message_names_reason() {
        let err = RebounderError::EntryRejected {
            instrument: "005930".into(),
            reason: RejectReason::ConcurrencyCap { open: 3, cap: 3 },
        };
        assert_eq!(
            err.to_string(),
            "entry for 005930 rejected: 3 open positions, cap is 3"
        );
    }

    #[test]
    fn collaborator_helper_builds_variant() {
        let err = RebounderError::collaborator(Collaborator::Execution, "broker down");
        assert_eq!(err.to_string(), "execution collaborator failed: broker down");
    }

    #[test]
    fn exit_codes_by_category() {
        use std::process::ExitCode;
        let cases = [
            (RebounderError::invariant("x"), ExitCode::from(8)),
            (
                RebounderError::ConfigMissing {
                    section: "capital".into(),
                    key: "total_capital".into(),
                },
                ExitCode::from(2),
            ),
            (
                RebounderError::Database { reason: "x".into() },
                ExitCode::from(3),
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ExitCode::from(&err), expected);
        }
    }
}
