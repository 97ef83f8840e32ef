//! Output sinks for matched exchanges and extracted fault records.

pub mod capture;
pub mod tabular;

use std::path::PathBuf;

use permdump_protocol::{FaultRecord, HttpExchange};
use thiserror::Error;

pub use capture::{CaptureEntry, CaptureReader, CaptureSink};
pub use tabular::{csv_row, TabularSink};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("write failure: {0}")]
    Write(#[from] std::io::Error),
    #[error("read failure: {0}")]
    Read(std::io::Error),
    #[error("sink is closed")]
    Closed,
    #[error("capture encoding failure: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("capture line {line} is invalid: {source}")]
    Decode {
        line: usize,
        source: serde_json::Error,
    },
}

pub type SinkResult<T> = Result<T, SinkError>;

/// Stores full exchanges. Every successful write is flushed.
pub trait ExchangeSink: Send {
    fn write_exchange(&mut self, exchange: &HttpExchange) -> SinkResult<()>;
    fn close(&mut self) -> SinkResult<()>;
}

/// Stores fault records as rows. Every successful write is flushed.
pub trait RecordSink: Send {
    fn write_record(&mut self, record: &FaultRecord) -> SinkResult<()>;
    fn close(&mut self) -> SinkResult<()>;
}

#[derive(Clone, Debug, Default)]
pub struct NoopSink;

impl ExchangeSink for NoopSink {
    fn write_exchange(&mut self, _exchange: &HttpExchange) -> SinkResult<()> {
        Ok(())
    }

    fn close(&mut self) -> SinkResult<()> {
        Ok(())
    }
}

impl RecordSink for NoopSink {
    fn write_record(&mut self, _record: &FaultRecord) -> SinkResult<()> {
        Ok(())
    }

    fn close(&mut self) -> SinkResult<()> {
        Ok(())
    }
}
