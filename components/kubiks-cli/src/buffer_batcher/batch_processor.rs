// Components
// 1. Queue
// Bounded handoff channel between the emitter (producer) and the export worker. Enqueueing
// never waits: when the queue is full an output record is dropped and counted. Two slots past
// `max_queue_size` are held back for `command.start` and `command.end`, so a backed-up queue
// never loses the lifecycle records.
//
// 2. Batcher
// Background worker with 2 flush conditions; size trigger (`max_export_batch_size` records
// collected) and time trigger (`scheduled_delay` since the last tick). Each flush is one
// export call, bounded by `export_timeout`. A failed call loses its batch, nothing is retried.
//
// Control flow:
// 1. Record arrives -> pushed into the channel (or dropped if full)
// 2. Worker receives it -> appends to the current batch
// 3. Batch full OR tick elapsed -> export batch, FIFO
// 4. Shutdown -> stop accepting, drain whatever is still queued in batches, exit
// 5. Cancellation -> the export in flight at that moment is abandoned; later exports
// (the end event, the drain) still run, bounded by the shutdown deadline.

// Local crates
use crate::{
    helpers::{errors::KubiksError, load_config::ExporterConfig},
    metrics::metrics::{
        EXPORT_DURATION_SECONDS, EXPORT_FAILURES_TOTAL, RECORDS_DROPPED_TOTAL,
        RECORDS_EXPORTED_TOTAL, RECORDS_QUEUED_TOTAL, observe_duration, snapshot,
    },
    shipper::shipper::{LogExporter, ShipperError},
    telemetry::record::{EventType, LogRecord},
};

// External crates
use std::mem;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Queue slots only lifecycle records may take
const LIFECYCLE_RESERVE: usize = 2;

/// Lower bound for the flush interval, `tokio::time::interval` rejects zero
const MIN_SCHEDULED_DELAY: Duration = Duration::from_millis(1);

/// Batching policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Output records that may wait for export before new ones are dropped
    pub max_queue_size: usize,
    /// Upper bound on records per export call
    pub max_export_batch_size: usize,
    /// How long a partial batch may wait before it is exported anyway
    pub scheduled_delay: Duration,
    /// Upper bound on a single export call
    pub export_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::from(&ExporterConfig::default())
    }
}

impl From<&ExporterConfig> for BatchConfig {
    fn from(config: &ExporterConfig) -> Self {
        Self {
            max_queue_size: config.max_queue_size.max(1),
            max_export_batch_size: config.max_export_batch_size.max(1),
            scheduled_delay: config.scheduled_delay().max(MIN_SCHEDULED_DELAY),
            export_timeout: config.export_timeout(),
        }
    }
}

/// Producer handle for the export worker.
///
/// Owns the worker task. Dropping the processor without calling [`BatchProcessor::shutdown`]
/// still tells the worker to drain and exit, it just cannot wait for it.
#[derive(Debug)]
pub struct BatchProcessor {
    sender: Option<mpsc::Sender<LogRecord>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker_handle: Option<JoinHandle<()>>,
}

impl BatchProcessor {
    /// Spawn the export worker. Must be called from within a tokio runtime.
    #[instrument(
        name = "kubiks_batch_processor::spawn",
        target = "buffer_batcher::batch_processor",
        skip_all,
        level = "debug"
    )]
    pub fn spawn<E: LogExporter>(exporter: E, config: BatchConfig, cancel: CancellationToken) -> Self {
        tracing::debug!(
            max_queue_size = config.max_queue_size,
            max_export_batch_size = config.max_export_batch_size,
            scheduled_delay = ?config.scheduled_delay,
            "Creating batch processor queue and export worker"
        );
        let (tx, rx) = mpsc::channel(config.max_queue_size.max(1) + LIFECYCLE_RESERVE);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(run_worker(exporter, config, rx, shutdown_rx, cancel));

        Self {
            sender: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            worker_handle: Some(handle),
        }
    }

    /// Hand a record to the worker without waiting.
    ///
    /// Returns `false` if the record was dropped, because the queue is full or the processor
    /// has already been shut down. `command.start` and `command.end` records may use the
    /// reserved slots, everything else only the first `max_queue_size`.
    pub fn enqueue(&self, record: LogRecord) -> bool {
        let Some(sender) = self.sender.as_ref() else {
            RECORDS_DROPPED_TOTAL.inc();
            tracing::warn!("Batch processor already shut down, dropping log record");
            return false;
        };

        let lifecycle = matches!(record.event_type(), Some(EventType::Start | EventType::End));
        // The emitter is the only producer, so free capacity can only grow between the check
        // and the send.
        if !lifecycle && sender.capacity() <= LIFECYCLE_RESERVE {
            RECORDS_DROPPED_TOTAL.inc();
            tracing::warn!("Export queue is full, dropping log record");
            return false;
        }

        match sender.try_send(record) {
            Ok(()) => {
                RECORDS_QUEUED_TOTAL.inc();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                RECORDS_DROPPED_TOTAL.inc();
                tracing::warn!("Export queue is full, dropping log record");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                RECORDS_DROPPED_TOTAL.inc();
                tracing::warn!("Export worker has exited, dropping log record");
                false
            }
        }
    }

    /// `true` once [`BatchProcessor::shutdown`] has run
    pub fn is_shut_down(&self) -> bool {
        self.worker_handle.is_none()
    }

    /// Flush everything still queued and stop the worker.
    ///
    /// Blocks until the worker has drained the queue or `deadline` elapses, whichever comes
    /// first. On timeout the worker is aborted and whatever it had not exported is lost.
    /// Calling this again after it returned is a no-op.
    #[instrument(
        name = "kubiks_batch_processor::shutdown",
        target = "buffer_batcher::batch_processor",
        skip_all,
        level = "debug"
    )]
    pub async fn shutdown(&mut self, deadline: Duration) -> Result<(), KubiksError> {
        let Some(mut handle) = self.worker_handle.take() else {
            tracing::debug!("Batch processor already shut down, nothing to flush");
            return Ok(());
        };

        tracing::debug!("Sending shutdown signal to export worker");
        self.sender.take();
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        tracing::debug!(deadline = ?deadline, "Waiting for export worker to drain the queue");
        let result = match tokio::time::timeout(deadline, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Export worker task failed");
                Ok(())
            }
            Err(_) => {
                handle.abort();
                tracing::warn!(deadline = ?deadline, "Export worker did not drain before the deadline, abandoning remaining records");
                Err(KubiksError::Shutdown(deadline))
            }
        };

        let stats = snapshot();
        tracing::debug!(
            queued = stats.queued,
            exported = stats.exported,
            dropped = stats.dropped,
            export_failures = stats.export_failures,
            "Batch processor shut down"
        );
        result
    }
}

impl Drop for BatchProcessor {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            tracing::debug!("Batch processor dropped without shutdown, signalling worker to drain");
            let _ = shutdown_tx.send(());
        }
    }
}

/// Background worker loop.
///
/// High level algorithm:
/// 1. Multiplex shutdown signal, incoming records and the flush ticker via `tokio::select!`.
/// 2. Export as soon as a batch is full, or on tick if a partial batch is waiting.
/// 3. On shutdown (or every producer gone) close the channel and drain it in batches.
#[instrument(
    name = "kubiks_batch_processor::run_worker",
    target = "buffer_batcher::batch_processor",
    skip_all,
    level = "debug"
)]
async fn run_worker<E: LogExporter>(
    exporter: E,
    config: BatchConfig,
    mut rx: mpsc::Receiver<LogRecord>,
    mut shutdown_rx: oneshot::Receiver<()>,
    cancel: CancellationToken,
) {
    let mut batch: Vec<LogRecord> = Vec::with_capacity(config.max_export_batch_size);
    let mut ticker = tokio::time::interval(config.scheduled_delay.max(MIN_SCHEDULED_DELAY));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_rx => {
                tracing::debug!("Shutdown signal received by export worker, draining queue");
                break;
            }

            maybe_record = rx.recv() => {
                match maybe_record {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= config.max_export_batch_size {
                            export_batch(&exporter, mem::take(&mut batch), &config, Some(&cancel)).await;
                        }
                    }
                    None => {
                        tracing::debug!("All producers gone, export worker draining");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if !batch.is_empty() {
                    export_batch(&exporter, mem::take(&mut batch), &config, Some(&cancel)).await;
                }
            }
        }
    }

    rx.close();
    while let Some(record) = rx.recv().await {
        batch.push(record);
        if batch.len() >= config.max_export_batch_size {
            export_batch(&exporter, mem::take(&mut batch), &config, None).await;
        }
    }
    if !batch.is_empty() {
        export_batch(&exporter, batch, &config, None).await;
    }

    tracing::debug!("Export worker drained queue, exiting");
}

/// Run one export call. Failures are logged and counted, never returned.
///
/// With `cancel` set, the call is abandoned if the token fires while it is in flight. A token
/// that was already cancelled when the call started does not abort it: records produced
/// after cancellation (the end event) still get their chance.
async fn export_batch<E: LogExporter>(
    exporter: &E,
    batch: Vec<LogRecord>,
    config: &BatchConfig,
    cancel: Option<&CancellationToken>,
) {
    let batch_len = batch.len() as u64;
    let abort = async {
        match cancel {
            Some(token) if !token.is_cancelled() => token.cancelled().await,
            _ => std::future::pending::<()>().await,
        }
    };

    let started = Instant::now();
    let outcome = tokio::select! {
        result = tokio::time::timeout(config.export_timeout, exporter.export(batch)) => {
            result.unwrap_or(Err(ShipperError::Timeout(config.export_timeout)))
        }
        _ = abort => Err(ShipperError::Cancelled),
    };
    observe_duration(&EXPORT_DURATION_SECONDS, started);

    match outcome {
        Ok(()) => {
            RECORDS_EXPORTED_TOTAL.inc_by(batch_len);
            tracing::trace!(batch_size = batch_len, "Exported batch");
        }
        Err(e) => {
            EXPORT_FAILURES_TOTAL.inc();
            tracing::warn!(error = %e, batch_size = batch_len, "Failed to export log batch, records lost");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::record::ATTR_EVENT_TYPE;
    use crate::test_support::{RecordingExporter, record};

    fn lifecycle(event: EventType) -> LogRecord {
        record(event.as_str()).with_attribute(ATTR_EVENT_TYPE, event.as_str())
    }

    fn config(batch: usize, queue: usize) -> BatchConfig {
        BatchConfig {
            max_queue_size: queue,
            max_export_batch_size: batch,
            scheduled_delay: Duration::from_secs(60),
            export_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn batch_size_one_exports_each_record_in_order() {
        let exporter = RecordingExporter::default();
        let mut processor = BatchProcessor::spawn(exporter.clone(), config(1, 16), CancellationToken::new());

        for body in ["a", "b", "c"] {
            assert!(processor.enqueue(record(body)));
        }
        processor.shutdown(Duration::from_secs(5)).await.unwrap();

        let batches = exporter.batches();
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![1, 1, 1]);
        assert_eq!(exporter.bodies(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn batches_never_exceed_configured_size() {
        let exporter = RecordingExporter::default();
        let mut processor = BatchProcessor::spawn(exporter.clone(), config(3, 16), CancellationToken::new());

        for i in 0..7 {
            processor.enqueue(record(&i.to_string()));
        }
        processor.shutdown(Duration::from_secs(5)).await.unwrap();

        let sizes: Vec<usize> = exporter.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 7);
        assert!(sizes.iter().all(|size| *size <= 3), "{sizes:?}");
        assert_eq!(exporter.bodies(), vec!["0", "1", "2", "3", "4", "5", "6"]);
    }

    #[tokio::test]
    async fn scheduled_delay_flushes_partial_batch() {
        let exporter = RecordingExporter::default();
        let mut cfg = config(100, 16);
        cfg.scheduled_delay = Duration::from_millis(20);
        let mut processor = BatchProcessor::spawn(exporter.clone(), cfg, CancellationToken::new());

        processor.enqueue(record("lonely"));
        for _ in 0..100 {
            if !exporter.batches().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(exporter.bodies(), vec!["lonely"]);

        processor.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exporter.batches().len(), 1);
    }

    #[tokio::test]
    async fn second_shutdown_is_a_noop() {
        let exporter = RecordingExporter::default();
        let mut processor = BatchProcessor::spawn(exporter.clone(), config(1, 16), CancellationToken::new());

        processor.enqueue(record("only"));
        processor.shutdown(Duration::from_secs(5)).await.unwrap();
        processor.shutdown(Duration::from_secs(5)).await.unwrap();

        assert!(processor.is_shut_down());
        assert_eq!(exporter.batches().len(), 1);
        assert!(!processor.enqueue(record("late")));
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let exporter = RecordingExporter::default();
        let mut processor = BatchProcessor::spawn(exporter.clone(), config(1, 2), CancellationToken::new());

        // Current-thread runtime: the worker cannot run until we yield.
        let accepted = (0..4).filter(|i| processor.enqueue(record(&i.to_string()))).count();
        assert_eq!(accepted, 2);

        processor.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exporter.bodies(), vec!["0", "1"]);
    }

    #[tokio::test]
    async fn full_queue_keeps_room_for_lifecycle_records() {
        let exporter = RecordingExporter::default();
        let mut processor = BatchProcessor::spawn(exporter.clone(), config(1, 2), CancellationToken::new());

        assert!(processor.enqueue(lifecycle(EventType::Start)));
        let accepted = (0..5).filter(|i| processor.enqueue(record(&i.to_string()))).count();
        assert_eq!(accepted, 2);
        assert!(processor.enqueue(lifecycle(EventType::End)));

        processor.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exporter.bodies(), vec!["command.start", "0", "1", "command.end"]);
    }

    #[tokio::test]
    async fn zero_scheduled_delay_is_clamped() {
        let exporter = RecordingExporter::default();
        let mut cfg = config(100, 16);
        cfg.scheduled_delay = Duration::ZERO;
        let mut processor = BatchProcessor::spawn(exporter.clone(), cfg, CancellationToken::new());

        processor.enqueue(record("tick"));
        processor.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exporter.bodies(), vec!["tick"]);

        let from_config = BatchConfig::from(&ExporterConfig {
            scheduled_delay_ms: 0,
            ..Default::default()
        });
        assert_eq!(from_config.scheduled_delay, MIN_SCHEDULED_DELAY);
    }

    #[tokio::test]
    async fn export_failures_are_not_escalated() {
        let exporter = RecordingExporter::failing();
        let mut processor = BatchProcessor::spawn(exporter.clone(), config(1, 16), CancellationToken::new());

        assert!(processor.enqueue(record("lost")));
        assert!(processor.shutdown(Duration::from_secs(5)).await.is_ok());
        assert_eq!(exporter.attempts(), 1);
    }

    #[tokio::test]
    async fn shutdown_gives_up_at_deadline() {
        let exporter = RecordingExporter::slow(Duration::from_secs(10));
        let mut processor = BatchProcessor::spawn(exporter.clone(), config(1, 16), CancellationToken::new());

        processor.enqueue(record("stuck"));
        let started = Instant::now();
        let err = processor.shutdown(Duration::from_millis(50)).await.unwrap_err();

        assert!(matches!(err, KubiksError::Shutdown(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(exporter.batches().is_empty());
    }

    #[tokio::test]
    async fn cancellation_abandons_in_flight_export_only() {
        let exporter = RecordingExporter::slow_first(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let mut processor = BatchProcessor::spawn(exporter.clone(), config(1, 16), cancel.clone());

        processor.enqueue(record("in-flight"));
        while exporter.attempts() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        processor.enqueue(record("after-cancel"));

        processor.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exporter.bodies(), vec!["after-cancel"]);
    }

    #[tokio::test]
    async fn dropping_processor_still_drains() {
        let exporter = RecordingExporter::default();
        let processor = BatchProcessor::spawn(exporter.clone(), config(1, 16), CancellationToken::new());

        processor.enqueue(record("orphan"));
        drop(processor);

        for _ in 0..100 {
            if !exporter.batches().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(exporter.bodies(), vec!["orphan"]);
    }
}
