//! Crate-wide error types.

use std::path::PathBuf;

use thiserror::Error;

pub type ProfilerResult<T> = Result<T, ProfilerError>;

#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error("profiler agent is not loaded in the target process")]
    AgentNotLoaded,

    #[error("incompatible agent version: expected a prefix of {expected:?}, agent reported {found:?}")]
    InvalidAgentVersion { expected: String, found: String },

    #[error("remote profiler unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("malformed cpu dump at byte {offset} (line {line}): {reason}")]
    MalformedDump {
        offset: usize,
        line: usize,
        reason: String,
    },

    #[error("cannot retransform class {class}: {reason}")]
    RetransformRejected { class: String, reason: String },

    #[error("failed to write {}: {source}", path.display())]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid package filter: {0}")]
    InvalidFilterSyntax(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ProfilerError {
    /// Errors a caller may retry after re-deriving the profiler state.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RemoteUnreachable(_) | Self::Cancelled)
    }
}
