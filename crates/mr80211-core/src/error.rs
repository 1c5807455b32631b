use mr80211_abstract::{PhyMode, PhyModeError};
use thiserror::Error;

/// Rejected configuration. The simulation keeps its previous state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error(transparent)]
    PhyMode(#[from] PhyModeError),
    #[error("{0} is not attached")]
    MissingCollaborator(&'static str),
    #[error("invalid {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// A PER table query that could not be answered.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LookupError {
    #[error("no PER calibration rows for {0}")]
    EmptyTable(PhyMode),
    #[error("no calibration point brackets {mode} len={len} target={target}")]
    NoBracket { mode: PhyMode, len: u32, target: f64 },
}

/// Broken internal precondition of the MAC state machine. Never caused by
/// channel conditions; a run that hits one must stop.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MacError {
    #[error("MAC invariant violated: {0}")]
    Invariant(String),
}

impl MacError {
    pub fn invariant(what: impl Into<String>) -> Self {
        MacError::Invariant(what.into())
    }
}

impl From<PhyModeError> for MacError {
    fn from(err: PhyModeError) -> Self {
        MacError::Invariant(format!("frame timing: {err}"))
    }
}
