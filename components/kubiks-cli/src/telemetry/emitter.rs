// Local crates
use crate::{
    buffer_batcher::batch_processor::{BatchConfig, BatchProcessor},
    helpers::{
        errors::{KubiksError, error_chain},
        load_config::ExporterConfig,
    },
    shipper::shipper::{LogExporter, OtlpExporter},
    telemetry::record::{
        ATTR_COMMAND, ATTR_ERROR_MESSAGE, ATTR_EVENT_TYPE, ATTR_SERVICE_NAME, ATTR_STATUS,
        ATTR_STREAM, EventType, LogRecord, OutputStream,
    },
};

// External crates
use std::error::Error as StdError;
use std::io;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

const START_BODY: &str = "Command started";
const END_BODY: &str = "Command completed";
const STATUS_SUCCESS: &str = "success";
const STATUS_ERROR: &str = "error";

/// Turns one command invocation into `command.start`, `command.output` and `command.end`
/// log records and hands them to the batch processor.
///
/// Every operation except [`TelemetryEmitter::shutdown`] only enqueues: it never waits on
/// the network and never reports a delivery failure. The emitter owns the processor, and
/// with it the export channel, for the lifetime of the invocation.
#[derive(Debug)]
pub struct TelemetryEmitter {
    service_name: String,
    command: String,
    processor: BatchProcessor,
}

impl TelemetryEmitter {
    /// Connect to the collector and start the export worker.
    ///
    /// An empty token fails with [`KubiksError::Configuration`] before anything touches the
    /// network. Connection problems fail with [`KubiksError::Transport`].
    #[instrument(
        name = "kubiks_emitter::connect",
        target = "telemetry::emitter",
        skip_all,
        fields(service_name = %service_name),
        level = "debug"
    )]
    pub async fn connect(
        token: &str,
        service_name: &str,
        command: &str,
        exporter_config: &ExporterConfig,
        cancel: CancellationToken,
    ) -> Result<Self, KubiksError> {
        if token.trim().is_empty() {
            return Err(KubiksError::configuration(
                "authentication token not found. Please run 'kubiks config add-authtoken YOUR_TOKEN' first",
            ));
        }
        exporter_config.validate()?;

        let exporter = OtlpExporter::connect(exporter_config, token, service_name).await?;
        Ok(Self::with_exporter(
            exporter,
            service_name,
            command,
            BatchConfig::from(exporter_config),
            cancel,
        ))
    }

    /// Build an emitter over an already constructed exporter
    pub fn with_exporter<E: LogExporter>(
        exporter: E,
        service_name: &str,
        command: &str,
        batch_config: BatchConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            service_name: service_name.to_string(),
            command: command.to_string(),
            processor: BatchProcessor::spawn(exporter, batch_config, cancel),
        }
    }

    fn base_record(&self, body: impl Into<String>, event: EventType) -> LogRecord {
        LogRecord::new(body)
            .with_attribute(ATTR_SERVICE_NAME, self.service_name.as_str())
            .with_attribute(ATTR_COMMAND, self.command.as_str())
            .with_attribute(ATTR_EVENT_TYPE, event.as_str())
    }

    /// Queue the `command.start` record
    pub fn emit_start(&self) {
        tracing::debug!(command = %self.command, "Emitting command start event");
        self.processor.enqueue(self.base_record(START_BODY, EventType::Start));
    }

    /// Queue one `command.output` record for `chunk`.
    ///
    /// One call is one record, whatever boundaries the pipe delivered; nothing is split or
    /// buffered across calls. The chunk is decoded as UTF-8, invalid sequences replaced.
    /// Always reports the full length as written. An empty chunk produces no record.
    pub fn write(&self, stream: OutputStream, chunk: &[u8]) -> io::Result<usize> {
        if chunk.is_empty() {
            return Ok(0);
        }

        let record = self
            .base_record(String::from_utf8_lossy(chunk), EventType::Output)
            .with_attribute(ATTR_STREAM, stream.as_str());
        self.processor.enqueue(record);
        Ok(chunk.len())
    }

    /// Queue the `command.end` record, `status=success` without an error,
    /// `status=error` plus `error.message` with one.
    pub fn emit_end(&self, error: Option<&(dyn StdError + 'static)>) {
        let record = self.base_record(END_BODY, EventType::End);
        let record = match error {
            None => record.with_attribute(ATTR_STATUS, STATUS_SUCCESS),
            Some(err) => {
                let mut message = error_chain(err);
                if message.trim().is_empty() {
                    message = "command failed".to_string();
                }
                record
                    .with_attribute(ATTR_STATUS, STATUS_ERROR)
                    .with_attribute(ATTR_ERROR_MESSAGE, message)
            }
        };

        tracing::debug!(
            command = %self.command,
            status = record.attribute(ATTR_STATUS).unwrap_or_default(),
            "Emitting command end event"
        );
        self.processor.enqueue(record);
    }

    /// Flush all queued records, waiting at most `deadline`. Safe to call more than once,
    /// later calls return immediately.
    pub async fn shutdown(&mut self, deadline: Duration) -> Result<(), KubiksError> {
        self.processor.shutdown(deadline).await
    }

    /// `true` once [`TelemetryEmitter::shutdown`] has run
    pub fn is_shut_down(&self) -> bool {
        self.processor.is_shut_down()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::errors::CommandFailure;
    use crate::test_support::RecordingExporter;

    fn emitter(exporter: &RecordingExporter) -> TelemetryEmitter {
        TelemetryEmitter::with_exporter(
            exporter.clone(),
            "svc",
            "echo hello",
            BatchConfig::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn empty_token_is_rejected_before_connecting() {
        // Port 9 (discard) on a TEST-NET address: a connect attempt would hang or fail as
        // a transport error, never as a configuration error.
        let config = ExporterConfig {
            endpoint: "http://192.0.2.1:9".into(),
            ..Default::default()
        };

        for token in ["", "   "] {
            let err = TelemetryEmitter::connect(token, "svc", "echo", &config, CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, KubiksError::Configuration { .. }), "got {err:?}");
        }
    }

    #[tokio::test]
    async fn records_carry_common_attributes_in_order() {
        let exporter = RecordingExporter::default();
        let mut emitter = emitter(&exporter);

        emitter.emit_start();
        assert_eq!(emitter.write(OutputStream::Stdout, b"hello\n").unwrap(), 6);
        emitter.emit_end(None);
        emitter.shutdown(Duration::from_secs(5)).await.unwrap();

        let records = exporter.records();
        assert_eq!(records.len(), 3);

        let events: Vec<_> = records.iter().map(|r| r.event_type().unwrap()).collect();
        assert_eq!(events, vec![EventType::Start, EventType::Output, EventType::End]);

        for record in &records {
            assert_eq!(record.attributes[0], ("service.name".into(), "svc".into()));
            assert_eq!(record.attributes[1], ("command".into(), "echo hello".into()));
            assert_eq!(record.severity.text(), "INFO");
        }

        assert_eq!(records[0].body, "Command started");
        assert_eq!(records[1].body, "hello\n");
        assert_eq!(records[1].attribute("stream"), Some("stdout"));
        assert_eq!(records[2].body, "Command completed");
        assert_eq!(records[2].attribute("status"), Some("success"));
        assert_eq!(records[2].attribute("error.message"), None);
    }

    #[tokio::test]
    async fn end_with_error_sets_status_and_message() {
        let exporter = RecordingExporter::default();
        let mut emitter = emitter(&exporter);

        let failure = CommandFailure::Cancelled;
        emitter.emit_end(Some(&failure));
        emitter.shutdown(Duration::from_secs(5)).await.unwrap();

        let end = &exporter.records()[0];
        let statuses: Vec<_> = end
            .attributes
            .iter()
            .filter(|(k, _)| k == "status")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(statuses, vec!["error"]);
        assert_eq!(
            end.attribute("error.message"),
            Some("cancelled before the command completed")
        );
    }

    #[tokio::test]
    async fn each_write_is_one_record_with_lossy_decoding() {
        let exporter = RecordingExporter::default();
        let mut emitter = emitter(&exporter);

        emitter.write(OutputStream::Stderr, b"line one\nline two\n").unwrap();
        emitter.write(OutputStream::Stdout, &[0x66, 0x6f, 0xff, 0x6f]).unwrap();
        assert_eq!(emitter.write(OutputStream::Stdout, b"").unwrap(), 0);
        emitter.shutdown(Duration::from_secs(5)).await.unwrap();

        let records = exporter.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].body, "line one\nline two\n");
        assert_eq!(records[0].attribute("stream"), Some("stderr"));
        assert_eq!(records[1].body, "fo\u{FFFD}o");
    }

    #[tokio::test]
    async fn shutdown_twice_flushes_once() {
        let exporter = RecordingExporter::default();
        let mut emitter = emitter(&exporter);

        emitter.emit_start();
        emitter.shutdown(Duration::from_secs(5)).await.unwrap();
        emitter.shutdown(Duration::from_secs(5)).await.unwrap();

        assert!(emitter.is_shut_down());
        assert_eq!(exporter.attempts(), 1);
    }

    #[tokio::test]
    async fn end_record_survives_a_backed_up_queue() {
        let exporter = RecordingExporter::slow_first(Duration::from_millis(200));
        let mut emitter = TelemetryEmitter::with_exporter(
            exporter.clone(),
            "svc",
            "yes",
            BatchConfig {
                max_queue_size: 4,
                max_export_batch_size: 1,
                ..BatchConfig::default()
            },
            CancellationToken::new(),
        );

        emitter.emit_start();
        while exporter.attempts() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for _ in 0..10 {
            emitter.write(OutputStream::Stdout, b"y").unwrap();
        }
        emitter.emit_end(None);
        emitter.shutdown(Duration::from_secs(5)).await.unwrap();

        let events: Vec<_> = exporter
            .records()
            .iter()
            .filter_map(LogRecord::event_type)
            .collect();
        assert_eq!(events.first(), Some(&EventType::Start));
        assert_eq!(events.last(), Some(&EventType::End));
        assert_eq!(events.iter().filter(|e| **e == EventType::Output).count(), 4);
    }

    #[tokio::test]
    async fn delivery_failures_do_not_reach_the_writer() {
        let exporter = RecordingExporter::failing();
        let mut emitter = emitter(&exporter);

        emitter.emit_start();
        assert_eq!(emitter.write(OutputStream::Stdout, b"data").unwrap(), 4);
        emitter.emit_end(None);
        assert!(emitter.shutdown(Duration::from_secs(5)).await.is_ok());
        assert_eq!(exporter.attempts(), 3);
    }
}
