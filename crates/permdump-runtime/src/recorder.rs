use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use permdump_audit::{CaptureSink, ExchangeSink, RecordSink, SinkError, TabularSink};
use permdump_fault::{is_permission_fault, try_extract_fields};
use permdump_protocol::{CanonicalKey, FaultRecord, HttpExchange};
use serde::{Deserialize, Serialize};

use crate::{RecorderConfig, RuntimeError, RuntimeResult, SinkKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderState {
    Uninitialized,
    Active,
    Closed,
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("uninitialized"),
            Self::Active => f.write_str("active"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecorderStats {
    pub exchanges_seen: u64,
    pub faults_detected: u64,
    pub incomplete_faults: u64,
    pub records_accepted: u64,
    pub duplicates_suppressed: u64,
    pub write_failures: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    NotAFault,
    /// A `NoPermissionFault` without object or privilege fields.
    Incomplete,
    Duplicate(FaultRecord),
    /// Forwarded to every enabled sink. `repeat` is set when an equal record
    /// had already been accepted and duplicates are being shown.
    Recorded {
        record: FaultRecord,
        repeat: bool,
    },
}

struct Session {
    state: RecorderState,
    show_duplicates: bool,
    client_header: String,
    seen: HashSet<CanonicalKey>,
    capture: Option<Box<dyn ExchangeSink>>,
    tabular: Option<Box<dyn RecordSink>>,
    stats: RecorderStats,
}

impl Session {
    fn new() -> Self {
        Self {
            state: RecorderState::Uninitialized,
            show_duplicates: false,
            client_header: String::new(),
            seen: HashSet::new(),
            capture: None,
            tabular: None,
            stats: RecorderStats::default(),
        }
    }

    fn ensure_uninitialized(&self) -> RuntimeResult<()> {
        if self.state != RecorderState::Uninitialized {
            return Err(RuntimeError::InvalidState(format!(
                "recorder is already {}",
                self.state
            )));
        }
        Ok(())
    }

    fn activate(
        &mut self,
        config: &RecorderConfig,
        capture: Option<Box<dyn ExchangeSink>>,
        tabular: Option<Box<dyn RecordSink>>,
    ) {
        tracing::info!(
            capture = capture.is_some(),
            tabular = tabular.is_some(),
            show_duplicates = config.show_duplicates,
            client_header = %config.client_identifier_header,
            "fault recorder active"
        );
        if capture.is_none() && tabular.is_none() {
            tracing::warn!("no output sinks enabled, faults will only be counted");
        }
        self.show_duplicates = config.show_duplicates;
        self.client_header = config.client_identifier_header.clone();
        self.capture = capture;
        self.tabular = tabular;
        self.state = RecorderState::Active;
    }

    /// Writes to every enabled sink, stopping at the first failure. A sink
    /// that fails is dropped for the rest of the session.
    ///
    /// `key` joins the seen-set as soon as one sink holds the record.
    fn emit(
        &mut self,
        exchange: &HttpExchange,
        record: &FaultRecord,
        key: CanonicalKey,
    ) -> RuntimeResult<()> {
        if let Some(sink) = self.capture.as_mut() {
            if let Err(source) = sink.write_exchange(exchange) {
                self.capture = None;
                return Err(self.write_failed(SinkKind::Capture, source));
            }
            self.seen.insert(key.clone());
        }

        let written = match self.tabular.as_mut() {
            Some(sink) => sink.write_record(record),
            None => Ok(()),
        };
        if let Err(source) = written {
            self.tabular = None;
            return Err(self.write_failed(SinkKind::Tabular, source));
        }

        self.seen.insert(key);
        Ok(())
    }

    fn write_failed(&mut self, kind: SinkKind, source: SinkError) -> RuntimeError {
        self.stats.write_failures += 1;
        tracing::warn!(sink = %kind, error = %source, "sink write failed, sink disabled");
        RuntimeError::Sink { kind, source }
    }
}

/// Session object holding the seen-set and sink handles for one run.
///
/// Lifecycle is `Uninitialized` -> `Active` (via [`FaultRecorder::configure`])
/// -> `Closed` (via [`FaultRecorder::close`]). One mutex guards the whole
/// check-then-insert sequence, so the recorder can be shared across threads.
pub struct FaultRecorder {
    session: Mutex<Session>,
}

impl Default for FaultRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultRecorder {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(Session::new()),
        }
    }

    fn lock(&self) -> RuntimeResult<MutexGuard<'_, Session>> {
        self.session.lock().map_err(|_| RuntimeError::Poisoned)
    }

    pub fn state(&self) -> RuntimeResult<RecorderState> {
        Ok(self.lock()?.state)
    }

    pub fn stats(&self) -> RuntimeResult<RecorderStats> {
        Ok(self.lock()?.stats.clone())
    }

    /// Number of distinct records accepted so far.
    pub fn seen_len(&self) -> RuntimeResult<usize> {
        Ok(self.lock()?.seen.len())
    }

    /// Opens the file sinks named by `config` and activates the recorder.
    /// Any open failure leaves the recorder uninitialized.
    pub fn configure(&self, config: &RecorderConfig) -> RuntimeResult<()> {
        let mut session = self.lock()?;
        session.ensure_uninitialized()?;

        let capture = match config.capture_path() {
            Some(path) => {
                let sink = CaptureSink::create(path).map_err(|source| RuntimeError::Sink {
                    kind: SinkKind::Capture,
                    source,
                })?;
                Some(Box::new(sink) as Box<dyn ExchangeSink>)
            }
            None => None,
        };
        let tabular = match config.tabular_path() {
            Some(path) => {
                let sink = TabularSink::create(path).map_err(|source| RuntimeError::Sink {
                    kind: SinkKind::Tabular,
                    source,
                })?;
                Some(Box::new(sink) as Box<dyn RecordSink>)
            }
            None => None,
        };

        session.activate(config, capture, tabular);
        Ok(())
    }

    /// Activates the recorder with caller-provided sinks. The path options
    /// of `config` are ignored.
    pub fn configure_with_sinks(
        &self,
        config: &RecorderConfig,
        capture: Option<Box<dyn ExchangeSink>>,
        tabular: Option<Box<dyn RecordSink>>,
    ) -> RuntimeResult<()> {
        let mut session = self.lock()?;
        session.ensure_uninitialized()?;
        session.activate(config, capture, tabular);
        Ok(())
    }

    /// Per-response hook.
    pub fn handle_response(&self, exchange: &HttpExchange) -> RuntimeResult<Outcome> {
        let extracted = if is_permission_fault(exchange.status_code(), exchange.body()) {
            Some(try_extract_fields(exchange.body()))
        } else {
            None
        };

        let mut session = self.lock()?;
        if session.state != RecorderState::Active {
            return Err(RuntimeError::InvalidState(format!(
                "cannot handle responses while {}",
                session.state
            )));
        }
        session.stats.exchanges_seen += 1;

        let fields = match extracted {
            None => return Ok(Outcome::NotAFault),
            Some(Err(err)) => {
                session.stats.faults_detected += 1;
                session.stats.incomplete_faults += 1;
                tracing::debug!(
                    status = exchange.status_code(),
                    url = %exchange.request.url,
                    reason = %err,
                    "permission fault without extractable fields"
                );
                return Ok(Outcome::Incomplete);
            }
            Some(Ok(fields)) => {
                session.stats.faults_detected += 1;
                fields
            }
        };

        let record = fields.with_client(exchange.client_identifier(&session.client_header));
        let key = record.canonical_key();
        let repeat = session.seen.contains(&key);
        if repeat && !session.show_duplicates {
            session.stats.duplicates_suppressed += 1;
            tracing::debug!(key = %key, "duplicate permission fault suppressed");
            return Ok(Outcome::Duplicate(record));
        }

        session.emit(exchange, &record, key)?;
        session.stats.records_accepted += 1;
        tracing::info!(
            client = %record.client_identifier,
            object_type = %record.object_type,
            object_name = %record.object_name,
            privilege = %record.missing_privilege,
            repeat,
            "permission fault recorded"
        );

        Ok(Outcome::Recorded { record, repeat })
    }

    /// Flushes and releases both sinks. Both are closed even if the first
    /// one fails; the first failure is returned. Closing twice is a no-op.
    pub fn close(&self) -> RuntimeResult<()> {
        let mut session = self.lock()?;
        if session.state == RecorderState::Closed {
            return Ok(());
        }
        session.state = RecorderState::Closed;

        let capture = session
            .capture
            .take()
            .map_or(Ok(()), |mut sink| sink.close())
            .map_err(|source| RuntimeError::Sink {
                kind: SinkKind::Capture,
                source,
            });
        let tabular = session
            .tabular
            .take()
            .map_or(Ok(()), |mut sink| sink.close())
            .map_err(|source| RuntimeError::Sink {
                kind: SinkKind::Tabular,
                source,
            });

        tracing::debug!(stats = ?session.stats, "fault recorder closed");
        capture.and(tabular)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayReport {
    pub stats: RecorderStats,
    pub source_errors: u64,
    pub processing_errors: u64,
}

impl ReplayReport {
    pub fn is_clean(&self) -> bool {
        self.source_errors == 0 && self.processing_errors == 0
    }
}

/// Feeds a stream of exchanges through an active recorder.
///
/// Unreadable items and sink write failures are logged and counted, and the
/// stream continues with the next exchange. Any other recorder error stops
/// the replay.
pub fn replay<I, E>(recorder: &FaultRecorder, exchanges: I) -> RuntimeResult<ReplayReport>
where
    I: IntoIterator<Item = Result<HttpExchange, E>>,
    E: fmt::Display,
{
    let mut report = ReplayReport::default();
    for (index, item) in exchanges.into_iter().enumerate() {
        let exchange = match item {
            Ok(exchange) => exchange,
            Err(err) => {
                report.source_errors += 1;
                tracing::error!(index, error = %err, "skipping unreadable exchange");
                continue;
            }
        };

        match recorder.handle_response(&exchange) {
            Ok(_) => {}
            Err(err @ RuntimeError::Sink { .. }) => {
                report.processing_errors += 1;
                tracing::error!(index, error = %err, "failed to record permission fault");
            }
            Err(err) => return Err(err),
        }
    }

    report.stats = recorder.stats()?;
    Ok(report)
}

/// [`replay`] followed by [`FaultRecorder::close`]. The recorder is closed
/// even when the replay aborts; the replay error then takes precedence.
pub fn replay_and_close<I, E>(recorder: &FaultRecorder, exchanges: I) -> RuntimeResult<ReplayReport>
where
    I: IntoIterator<Item = Result<HttpExchange, E>>,
    E: fmt::Display,
{
    let replayed = replay(recorder, exchanges);
    let closed = recorder.close();
    let report = replayed?;
    closed?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use permdump_audit::SinkResult;
    use permdump_protocol::{HttpRequest, HttpResponse};

    use super::*;

    const LEGIT_FAULT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"
xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <soapenv:Body>
    <soapenv:Fault>
      <faultcode>ServerFaultCode</faultcode>
      <faultstring>Permission to perform this operation was denied.</faultstring>
      <detail>
        <NoPermissionFault xmlns="urn:vim25" xsi:type="NoPermission">
          <object type="Folder">group-v23485</object>
          <privilegeId>VirtualMachine.Interact.PowerOn</privilegeId>
        </NoPermissionFault>
      </detail>
    </soapenv:Fault>
  </soapenv:Body>
</soapenv:Envelope>"#;

    #[derive(Clone, Default)]
    struct MemoryRows {
        rows: Arc<Mutex<Vec<FaultRecord>>>,
    }

    impl RecordSink for MemoryRows {
        fn write_record(&mut self, record: &FaultRecord) -> SinkResult<()> {
            self.rows
                .lock()
                .map_err(|_| SinkError::Closed)?
                .push(record.clone());
            Ok(())
        }

        fn close(&mut self) -> SinkResult<()> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct CountingCapture {
        writes: Arc<Mutex<usize>>,
    }

    impl ExchangeSink for CountingCapture {
        fn write_exchange(&mut self, _exchange: &HttpExchange) -> SinkResult<()> {
            *self.writes.lock().map_err(|_| SinkError::Closed)? += 1;
            Ok(())
        }

        fn close(&mut self) -> SinkResult<()> {
            Ok(())
        }
    }

    struct FailingRows;

    impl RecordSink for FailingRows {
        fn write_record(&mut self, _record: &FaultRecord) -> SinkResult<()> {
            Err(SinkError::Write(std::io::Error::other("disk full")))
        }

        fn close(&mut self) -> SinkResult<()> {
            Ok(())
        }
    }

    fn exchange(status_code: u16, agent: &str, body: &str) -> HttpExchange {
        HttpExchange {
            request: HttpRequest {
                method: "POST".to_string(),
                url: "https://vcenter.local/sdk".to_string(),
                headers: vec![("User-Agent".to_string(), agent.to_string())],
                body: Vec::new(),
            },
            response: HttpResponse {
                status_code,
                headers: Vec::new(),
                body: body.as_bytes().to_vec(),
            },
        }
    }

    fn active(show_duplicates: bool) -> (FaultRecorder, MemoryRows) {
        let rows = MemoryRows::default();
        let recorder = FaultRecorder::new();
        let config = RecorderConfig {
            show_duplicates,
            ..RecorderConfig::default()
        };
        recorder
            .configure_with_sinks(&config, None, Some(Box::new(rows.clone())))
            .expect("configure");
        (recorder, rows)
    }

    #[test]
    fn events_before_configure_are_rejected() {
        let recorder = FaultRecorder::new();
        let result = recorder.handle_response(&exchange(403, "a", LEGIT_FAULT));
        assert!(matches!(result, Err(RuntimeError::InvalidState(_))));
        assert_eq!(recorder.state().expect("state"), RecorderState::Uninitialized);
    }

    #[test]
    fn events_after_close_are_rejected() {
        let (recorder, _) = active(false);
        recorder.close().expect("close");
        recorder.close().expect("second close");
        assert_eq!(recorder.state().expect("state"), RecorderState::Closed);
        assert!(matches!(
            recorder.handle_response(&exchange(403, "a", LEGIT_FAULT)),
            Err(RuntimeError::InvalidState(_))
        ));
    }

    #[test]
    fn configure_twice_is_rejected() {
        let (recorder, _) = active(false);
        assert!(matches!(
            recorder.configure(&RecorderConfig::default()),
            Err(RuntimeError::InvalidState(_))
        ));
    }

    #[test]
    fn success_responses_are_ignored() {
        let (recorder, rows) = active(false);
        let outcome = recorder
            .handle_response(&exchange(200, "a", LEGIT_FAULT))
            .expect("handle");
        assert_eq!(outcome, Outcome::NotAFault);
        assert!(rows.rows.lock().expect("lock").is_empty());
        assert_eq!(recorder.stats().expect("stats").exchanges_seen, 1);
    }

    #[test]
    fn duplicates_are_suppressed_by_default() {
        let (recorder, rows) = active(false);
        let first = recorder
            .handle_response(&exchange(403, "test-agent/1.0", LEGIT_FAULT))
            .expect("first");
        let second = recorder
            .handle_response(&exchange(403, "test-agent/1.0", LEGIT_FAULT))
            .expect("second");

        assert!(matches!(first, Outcome::Recorded { repeat: false, .. }));
        assert!(matches!(second, Outcome::Duplicate(_)));
        assert_eq!(rows.rows.lock().expect("lock").len(), 1);
        assert_eq!(recorder.seen_len().expect("seen"), 1);

        let stats = recorder.stats().expect("stats");
        assert_eq!(stats.records_accepted, 1);
        assert_eq!(stats.duplicates_suppressed, 1);
    }

    #[test]
    fn duplicates_are_written_when_shown() {
        let (recorder, rows) = active(true);
        recorder
            .handle_response(&exchange(403, "test-agent/1.0", LEGIT_FAULT))
            .expect("first");
        let second = recorder
            .handle_response(&exchange(403, "test-agent/1.0", LEGIT_FAULT))
            .expect("second");

        assert!(matches!(second, Outcome::Recorded { repeat: true, .. }));
        assert_eq!(rows.rows.lock().expect("lock").len(), 2);
        assert_eq!(recorder.seen_len().expect("seen"), 1);
    }

    #[test]
    fn different_clients_are_distinct_records() {
        let (recorder, rows) = active(false);
        recorder
            .handle_response(&exchange(403, "govc/0.30", LEGIT_FAULT))
            .expect("govc");
        recorder
            .handle_response(&exchange(403, "pyvmomi/8.0", LEGIT_FAULT))
            .expect("pyvmomi");

        let rows = rows.rows.lock().expect("lock");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].client_identifier, "govc/0.30");
        assert_eq!(rows[1].client_identifier, "pyvmomi/8.0");
    }

    #[test]
    fn incomplete_fault_is_not_recorded() {
        let (recorder, rows) = active(false);
        let body = LEGIT_FAULT.replace(r#"<object type="Folder">group-v23485</object>"#, "");
        let outcome = recorder
            .handle_response(&exchange(403, "a", &body))
            .expect("handle");

        assert_eq!(outcome, Outcome::Incomplete);
        assert!(rows.rows.lock().expect("lock").is_empty());
        assert_eq!(recorder.seen_len().expect("seen"), 0);
        assert_eq!(recorder.stats().expect("stats").incomplete_faults, 1);
    }

    #[test]
    fn captured_record_is_remembered_when_tabular_write_fails() {
        let capture = CountingCapture::default();
        let recorder = FaultRecorder::new();
        recorder
            .configure_with_sinks(
                &RecorderConfig::default(),
                Some(Box::new(capture.clone())),
                Some(Box::new(FailingRows)),
            )
            .expect("configure");

        let event = exchange(403, "test-agent/1.0", LEGIT_FAULT);
        let first = recorder.handle_response(&event);
        assert!(matches!(
            first,
            Err(RuntimeError::Sink {
                kind: SinkKind::Tabular,
                ..
            })
        ));
        assert_eq!(recorder.seen_len().expect("seen"), 1);

        for _ in 0..2 {
            let outcome = recorder.handle_response(&event).expect("repeat");
            assert!(matches!(outcome, Outcome::Duplicate(_)));
        }
        assert_eq!(*capture.writes.lock().expect("lock"), 1);

        let stats = recorder.stats().expect("stats");
        assert_eq!(stats.write_failures, 1);
        assert_eq!(stats.duplicates_suppressed, 2);
        assert_eq!(stats.records_accepted, 0);
    }

    #[test]
    fn aborted_replay_still_closes_the_recorder() {
        let recorder = FaultRecorder::new();
        let stream: Vec<Result<HttpExchange, String>> =
            vec![Ok(exchange(403, "a", LEGIT_FAULT))];

        let result = replay_and_close(&recorder, stream);
        assert!(matches!(result, Err(RuntimeError::InvalidState(_))));
        assert_eq!(recorder.state().expect("state"), RecorderState::Closed);
    }

    #[test]
    fn replay_and_close_flushes_sinks() {
        let (recorder, rows) = active(false);
        let stream: Vec<Result<HttpExchange, String>> = vec![
            Ok(exchange(403, "a", LEGIT_FAULT)),
            Ok(exchange(403, "a", LEGIT_FAULT)),
        ];

        let report = replay_and_close(&recorder, stream).expect("replay");
        assert!(report.is_clean());
        assert_eq!(report.stats.records_accepted, 1);
        assert_eq!(rows.rows.lock().expect("lock").len(), 1);
        assert_eq!(recorder.state().expect("state"), RecorderState::Closed);
    }

    #[test]
    fn missing_client_header_yields_empty_identifier() {
        let (recorder, _) = active(false);
        let mut anonymous = exchange(500, "ignored", LEGIT_FAULT);
        anonymous.request.headers.clear();

        match recorder.handle_response(&anonymous).expect("handle") {
            Outcome::Recorded { record, .. } => assert_eq!(record.client_identifier, ""),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
