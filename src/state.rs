//! Profiler state and mode enums.

use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

use crate::ProfilerError;

/// Derived on every query from agent reachability, agent version and the
/// remote running flag. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfilerState {
    AgentNotLoaded,
    InvalidVersion,
    Ready,
    Running,
    Unknown,
}

impl ProfilerState {
    /// States in which filter and mode changes are applied.
    pub fn is_operational(self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }
}

impl fmt::Display for ProfilerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AgentNotLoaded => "agent not loaded",
            Self::InvalidVersion => "invalid agent version",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProfilerMode {
    #[default]
    Sampling,
    Bci,
}

impl ProfilerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sampling => "sampling",
            Self::Bci => "bci",
        }
    }
}

impl FromStr for ProfilerMode {
    type Err = ProfilerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sampling" => Ok(Self::Sampling),
            "bci" => Ok(Self::Bci),
            other => Err(ProfilerError::InvalidArgument(format!(
                "unknown profiler type {other:?} (expected sampling|bci)"
            ))),
        }
    }
}
