use crate::types::Period;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArborError {
    // ── Peer input ───────────────────────────────────────────────────────────
    #[error("malformed input: {0}")]
    MalformedInput(String),

    // ── Cryptographic verification ───────────────────────────────────────────
    #[error("invalid proof: {0}")]
    InvalidProof(String),

    // ── DAG / chain topology ─────────────────────────────────────────────────
    #[error("unknown ancestor: {0}")]
    UnknownAncestor(String),

    #[error("refers to finalized period {period}")]
    StaleEpoch { period: Period },

    #[error("depends on future period {period}")]
    FutureEpoch { period: Period },

    #[error("duplicate: {0}")]
    Duplicate(String),

    // ── Resource limits ──────────────────────────────────────────────────────
    #[error("queue full: {0}")]
    QueueFull(String),

    // ── Serialization / storage ──────────────────────────────────────────────
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),

    // ── Configuration ────────────────────────────────────────────────────────
    #[error("configuration error: {0}")]
    Config(String),

    // ── Shutdown ─────────────────────────────────────────────────────────────
    #[error("cancelled")]
    Cancelled,
}

impl ArborError {
    /// Whether a caller may swallow the error and carry on.
    ///
    /// Storage and configuration failures must propagate; everything else is
    /// recoverable at the site that observed it (drop, defer or re-queue).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ArborError::Storage(_) | ArborError::Config(_))
    }
}

impl From<bincode::Error> for ArborError {
    fn from(e: bincode::Error) -> Self {
        ArborError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_fatal() {
        assert!(!ArborError::Storage("io".into()).is_recoverable());
        assert!(ArborError::Duplicate("tx".into()).is_recoverable());
        assert!(ArborError::Cancelled.is_recoverable());
    }
}
