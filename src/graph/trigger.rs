//! Step freshness and trigger tokens
//!
//! Freshness controls whether a step may be satisfied by something that
//! already exists:
//! - once: look the resource up and reuse it when found
//! - always: execute on every run, stamped with the run's trigger token

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// How often a step executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Create when missing, reuse otherwise
    Once,
    /// Execute on every run
    Always,
}

impl std::fmt::Display for Freshness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Once => write!(f, "once"),
            Self::Always => write!(f, "always"),
        }
    }
}

/// Marker issued once per run
///
/// Two runs never share a token, which is what forces `Always` steps to
/// re-execute even when nothing in the source tree changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerToken {
    issued_at: DateTime<Utc>,
    run_id: Uuid,
}

impl TriggerToken {
    /// Token for a new run
    pub fn fresh() -> Self {
        Self {
            issued_at: Utc::now(),
            run_id: Uuid::new_v4(),
        }
    }

    /// Token with fixed parts (useful for testing)
    pub fn at(issued_at: DateTime<Utc>, run_id: Uuid) -> Self {
        Self { issued_at, run_id }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Unix milliseconds at issue time, the value recorded on each step
    pub fn value(&self) -> String {
        self.issued_at.timestamp_millis().to_string()
    }
}

impl std::fmt::Display for TriggerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value())
    }
}
