//! JSON Lines capture of full exchanges.
//!
//! Each line is one [`CaptureEntry`]. Bodies are base64 encoded so binary
//! responses survive the round trip, and [`CaptureReader`] can replay a file
//! produced by [`CaptureSink`].

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use permdump_protocol::HttpExchange;
use serde::{Deserialize, Serialize};

use crate::{ExchangeSink, SinkError, SinkResult};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureEntry {
    pub captured_at: DateTime<Utc>,
    pub exchange: HttpExchange,
}

pub struct CaptureSink<W: Write + Send> {
    writer: Option<W>,
}

impl CaptureSink<BufWriter<File>> {
    /// Creates (or truncates) the capture file.
    pub fn create(path: &Path) -> SinkResult<Self> {
        let file = File::create(path).map_err(|source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "capture sink opened");
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> CaptureSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    pub fn into_inner(self) -> Option<W> {
        self.writer
    }
}

impl<W: Write + Send> ExchangeSink for CaptureSink<W> {
    fn write_exchange(&mut self, exchange: &HttpExchange) -> SinkResult<()> {
        let writer = self.writer.as_mut().ok_or(SinkError::Closed)?;
        let entry = CaptureEntry {
            captured_at: Utc::now(),
            exchange: exchange.clone(),
        };
        let line = serde_json::to_string(&entry)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> SinkResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Iterates the entries of a capture file, skipping blank lines.
pub struct CaptureReader<R: BufRead> {
    lines: std::io::Lines<R>,
    line_no: usize,
}

impl CaptureReader<BufReader<File>> {
    pub fn open(path: &Path) -> SinkResult<Self> {
        let file = File::open(path).map_err(|source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> CaptureReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

impl<R: BufRead> Iterator for CaptureReader<R> {
    type Item = SinkResult<CaptureEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => return Some(Err(SinkError::Read(err))),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(
                serde_json::from_str(&line).map_err(|source| SinkError::Decode {
                    line: self.line_no,
                    source,
                }),
            );
        }
    }
}
