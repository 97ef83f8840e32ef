//! Recorder session: classifies responses, deduplicates fault records and
//! forwards accepted ones to the configured sinks.

pub mod config;
pub mod recorder;

use std::fmt;

use permdump_audit::SinkError;
use thiserror::Error;

pub use config::RecorderConfig;
pub use recorder::{
    replay, replay_and_close, FaultRecorder, Outcome, RecorderState, RecorderStats, ReplayReport,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkKind {
    Capture,
    Tabular,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capture => f.write_str("capture"),
            Self::Tabular => f.write_str("tabular"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("{kind} sink failure: {source}")]
    Sink { kind: SinkKind, source: SinkError },
    #[error("invalid option: {0}")]
    InvalidOption(String),
    #[error("recorder lock poisoned")]
    Poisoned,
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
