use crate::entity::EntityKey;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("entity identity mismatch: {left} vs {right}")]
    IdentityMismatch { left: EntityKey, right: EntityKey },

    #[error("attribute '{name}' has incompatible types: {left} vs {right}")]
    TypeMismatch {
        name: String,
        left: &'static str,
        right: &'static str,
    },

    #[error("dependency {dependent} -> {dependency} would create a cycle")]
    CycleDetected {
        dependent: EntityKey,
        dependency: EntityKey,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("probe '{target}' timed out after {after:?}")]
    ProbeTimeout { target: String, after: Duration },

    #[error("failed to run '{program}': {source}")]
    Command {
        program: String,
        source: std::io::Error,
    },

    #[error("unparseable output from {tool}: {reason}")]
    Parse { tool: String, reason: String },
}

impl MonitorError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        MonitorError::InvalidConfiguration(reason.into())
    }

    pub fn parse(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        MonitorError::Parse {
            tool: tool.into(),
            reason: reason.into(),
        }
    }
}
