//! CSV output of fault records.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use permdump_protocol::{FaultRecord, FAULT_RECORD_COLUMNS};

use crate::{RecordSink, SinkError, SinkResult};

const LINE_END: &str = "\r\n";

fn quote_field(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\r', '\n']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

/// One CSV row, without the line terminator.
pub fn csv_row<'a>(fields: impl IntoIterator<Item = &'a str>) -> String {
    fields
        .into_iter()
        .map(quote_field)
        .collect::<Vec<_>>()
        .join(",")
}

/// Writes the header row lazily, right before the first record.
pub struct TabularSink<W: Write + Send> {
    writer: Option<W>,
    header_written: bool,
}

impl TabularSink<BufWriter<File>> {
    /// Creates (or truncates) the CSV file.
    pub fn create(path: &Path) -> SinkResult<Self> {
        let file = File::create(path).map_err(|source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "tabular sink opened");
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> TabularSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
            header_written: false,
        }
    }

    pub fn into_inner(self) -> Option<W> {
        self.writer
    }
}

impl<W: Write + Send> RecordSink for TabularSink<W> {
    fn write_record(&mut self, record: &FaultRecord) -> SinkResult<()> {
        let writer = self.writer.as_mut().ok_or(SinkError::Closed)?;
        let mut chunk = String::new();
        if !self.header_written {
            chunk.push_str(&csv_row(FAULT_RECORD_COLUMNS));
            chunk.push_str(LINE_END);
        }
        chunk.push_str(&csv_row(record.fields()));
        chunk.push_str(LINE_END);

        writer.write_all(chunk.as_bytes())?;
        writer.flush()?;
        self.header_written = true;
        Ok(())
    }

    fn close(&mut self) -> SinkResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}
