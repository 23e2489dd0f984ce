/// Error taxonomy for the funnel engine
///
/// Infrastructure layers (store, queue, scheduler) speak `anyhow::Result`.
/// The types here classify failures the engine has to make decisions about:
/// whether a node failure may be retried, whether a trigger request is the
/// caller's fault, and why a funnel was refused at activation.

use thiserror::Error;

/// Failure produced by a node executor
///
/// Only `Transient` is retryable. `Other` covers errors whose retryability the
/// executor never declared and is therefore treated as permanent.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Network/timeout-class failure, safe to retry
    #[error("transient failure: {0}")]
    Transient(String),

    /// Runtime failure that will not go away on retry
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Node configuration could not be interpreted
    #[error("invalid node configuration: {0}")]
    Config(String),

    /// Unclassified failure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl NodeError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether the job that produced this error may be redelivered
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// No executor is registered for a node type
#[derive(Debug, Error)]
#[error("no executor registered for node type '{0}'")]
pub struct UnknownNodeType(pub String);

/// Errors surfaced by the execution engine's boundary operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("funnel {funnel_id} has no entry node for trigger {trigger_id}")]
    NoEntryNode { funnel_id: String, trigger_id: String },

    #[error("store error: {0}")]
    Store(anyhow::Error),

    #[error("queue error: {0}")]
    Queue(anyhow::Error),
}

/// Errors surfaced by the trigger manager
///
/// The HTTP adapter maps `NotFound` to 404, the rejection variants to 400 and
/// everything else to 500.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("trigger not found: {0}")]
    NotFound(String),

    #[error("trigger {0} is not active")]
    TriggerInactive(String),

    #[error("funnel {0} is not active")]
    FunnelInactive(String),

    #[error("invalid trigger configuration for {trigger_id}: {message}")]
    InvalidConfig { trigger_id: String, message: String },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl TriggerError {
    /// True when the request was refused because of the caller's input or the
    /// funnel's state rather than an engine fault
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::TriggerInactive(_) | Self::FunnelInactive(_) | Self::InvalidConfig { .. }
        )
    }
}

/// Reasons a funnel snapshot is refused at activation time
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("structural error in funnel {funnel_id}: {message}")]
    Structural { funnel_id: String, message: String },

    #[error("funnel {funnel_id} failed validation: {}", errors.join("; "))]
    Validation { funnel_id: String, errors: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_node_errors_are_retryable() {
        assert!(NodeError::transient("timeout").is_retryable());
        assert!(!NodeError::permanent("bad recipient").is_retryable());
        assert!(!NodeError::config("missing template").is_retryable());
        assert!(!NodeError::from(anyhow::anyhow!("boom")).is_retryable());
    }

    #[test]
    fn test_trigger_rejections() {
        assert!(TriggerError::FunnelInactive("f1".into()).is_rejection());
        assert!(TriggerError::TriggerInactive("t1".into()).is_rejection());
        assert!(!TriggerError::NotFound("t1".into()).is_rejection());
    }

    #[test]
    fn test_validation_error_lists_every_problem() {
        let error = ActivationError::Validation {
            funnel_id: "f1".into(),
            errors: vec!["a".into(), "b".into()],
        };
        assert_eq!(error.to_string(), "funnel f1 failed validation: a; b");
    }
}
