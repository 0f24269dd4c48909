//! In-memory exporter shared by unit tests.

use crate::shipper::shipper::{LogExporter, ShipperError};
use crate::telemetry::record::LogRecord;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
enum Mode {
    #[default]
    Succeed,
    Fail,
    Slow(Duration),
    SlowFirst(Duration),
}

/// Records every batch it is asked to export
#[derive(Debug, Clone, Default)]
pub struct RecordingExporter {
    mode: Mode,
    attempts: Arc<AtomicUsize>,
    batches: Arc<Mutex<Vec<Vec<LogRecord>>>>,
}

impl RecordingExporter {
    pub fn failing() -> Self {
        Self {
            mode: Mode::Fail,
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            mode: Mode::Slow(delay),
            ..Default::default()
        }
    }

    /// Only the first export call is slow
    pub fn slow_first(delay: Duration) -> Self {
        Self {
            mode: Mode::SlowFirst(delay),
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<LogRecord>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.body).collect()
    }
}

impl LogExporter for RecordingExporter {
    async fn export(&self, batch: Vec<LogRecord>) -> Result<(), ShipperError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            Mode::Succeed => {}
            Mode::Fail => return Err(ShipperError::Status(tonic::Status::unavailable("collector down"))),
            Mode::Slow(delay) => tokio::time::sleep(delay).await,
            Mode::SlowFirst(delay) if attempt == 0 => tokio::time::sleep(delay).await,
            Mode::SlowFirst(_) => {}
        }
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}

pub fn record(body: &str) -> LogRecord {
    LogRecord::new(body)
}
