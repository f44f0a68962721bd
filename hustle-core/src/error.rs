//! Error taxonomy for the money core
//!
//! A closed sum type shared by every crate in the workspace. Each variant
//! carries a stable code string that survives serialization into API error
//! envelopes, conflict logs, and DLQ records. Database errors are folded in
//! by SQLSTATE so trigger failures surface as the invariant they protect.

use thiserror::Error;

/// Main error type for all money-core operations
#[derive(Error, Debug)]
pub enum CoreError {
    /// User input rejected before any state change
    #[error("validation failed ({code}): {message}")]
    Validation { code: &'static str, message: String },

    /// A state machine refused an edge
    #[error("illegal transition on {entity}: {from} -> {to}: {reason}")]
    IllegalTransition {
        entity: &'static str,
        from: String,
        to: String,
        reason: String,
    },

    /// A storage-level or guard-level invariant fired; always critical
    #[error("invariant {constraint} violated: {message}")]
    InvariantViolation { constraint: String, message: String },

    /// Serialization failure or deadlock (SQLSTATE 40001 / 40P01)
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// The external payment provider failed or misbehaved
    #[error("provider {provider} error: {message}")]
    ExternalProvider {
        provider: &'static str,
        message: String,
        retriable: bool,
    },

    /// An orphaned claim or in-flight transaction needed sweeper intervention
    #[error("stuck recovery: {0}")]
    StuckRecovery(String),

    /// Entity lookup miss
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Infrastructure fault (pool exhausted, connection dropped, ...)
    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    /// Create a validation error with a stable code
    pub fn validation<S: Into<String>>(code: &'static str, message: S) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    /// Create an illegal transition error
    pub fn illegal_transition<S: Into<String>>(
        entity: &'static str,
        from: S,
        to: S,
        reason: S,
    ) -> Self {
        Self::IllegalTransition {
            entity,
            from: from.into(),
            to: to.into(),
            reason: reason.into(),
        }
    }

    /// Create an invariant violation carrying the constraint tag
    pub fn invariant<C: Into<String>, S: Into<String>>(constraint: C, message: S) -> Self {
        Self::InvariantViolation {
            constraint: constraint.into(),
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(entity: &'static str, id: S) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Create an external provider error
    pub fn provider<S: Into<String>>(provider: &'static str, message: S, retriable: bool) -> Self {
        Self::ExternalProvider {
            provider,
            message: message.into(),
            retriable,
        }
    }

    /// Stable code string for envelopes, logs, and metrics labels
    pub fn code(&self) -> &str {
        match self {
            Self::Validation { code, .. } => code,
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::InvariantViolation { constraint, .. } => constraint,
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::ExternalProvider { .. } => "external_provider",
            Self::StuckRecovery(_) => "stuck_recovery",
            Self::NotFound { .. } => "not_found",
            Self::Storage(_) => "storage",
        }
    }

    /// Whether a local retry (same transaction body, fresh DB transaction)
    /// can resolve this error
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConcurrencyConflict(_) => true,
            Self::ExternalProvider { retriable, .. } => *retriable,
            _ => false,
        }
    }
}

/// Pull the leading `INV-*` tag out of a trigger's RAISE message, if present.
fn invariant_tag(message: &str) -> Option<String> {
    let tag: String = message
        .split(|c: char| c == ':' || c.is_whitespace())
        .next()
        .unwrap_or("")
        .to_string();
    if tag.starts_with("INV-") {
        Some(tag)
    } else {
        None
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.to_string()).unwrap_or_default();
                match code.as_str() {
                    // Serialization failure / deadlock detected
                    "40001" | "40P01" => Self::ConcurrencyConflict(db.message().to_string()),
                    // Unique / check violations map to the named constraint
                    "23505" | "23514" | "23503" => {
                        let constraint = db
                            .constraint()
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| code.clone());
                        Self::InvariantViolation {
                            constraint,
                            message: db.message().to_string(),
                        }
                    }
                    // RAISE EXCEPTION from a constitution trigger
                    "P0001" => {
                        let message = db.message().to_string();
                        let constraint =
                            invariant_tag(&message).unwrap_or_else(|| "P0001".to_string());
                        Self::InvariantViolation {
                            constraint,
                            message,
                        }
                    }
                    _ => Self::Storage(db.message().to_string()),
                }
            }
            sqlx::Error::RowNotFound => Self::Storage("row not found".to_string()),
            _ => Self::Storage(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("serialization: {err}"))
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        Self::ExternalProvider {
            provider: "http",
            message: err.to_string(),
            retriable: err.is_timeout() || err.is_connect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            CoreError::validation("bad_amount", "must be positive").code(),
            "bad_amount"
        );
        assert_eq!(
            CoreError::illegal_transition("task", "open", "completed", "no proof").code(),
            "illegal_transition"
        );
        assert_eq!(CoreError::invariant("INV-4", "entries unbalanced").code(), "INV-4");
        assert_eq!(CoreError::not_found("task", "abc").code(), "not_found");
    }

    #[test]
    fn retriability() {
        assert!(CoreError::ConcurrencyConflict("40001".into()).is_retriable());
        assert!(CoreError::provider("stripe", "502", true).is_retriable());
        assert!(!CoreError::provider("stripe", "card_declined", false).is_retriable());
        assert!(!CoreError::invariant("INV-5", "dup xp").is_retriable());
    }

    #[test]
    fn invariant_tag_parsing() {
        assert_eq!(
            invariant_tag("INV-TERMINAL: tasks row is immutable"),
            Some("INV-TERMINAL".to_string())
        );
        assert_eq!(invariant_tag("INV-4 zero-sum check failed"), Some("INV-4".to_string()));
        assert_eq!(invariant_tag("some other error"), None);
    }
}
