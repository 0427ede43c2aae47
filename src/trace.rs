//! Per-unit trace capture for estimation runs.
//!
//! One event per terminal sample record, keyed by the global sequence index
//! so a trace can be replayed against the deterministic plan.

use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::sampling::{SampleOutcome, SampleRecord};

#[derive(Debug, Clone, Serialize)]
pub struct SampleTrace {
    pub timestamp_ms: i64,
    pub sequence: usize,
    pub slot: usize,
    pub replicate: usize,
    pub template_ordinal: usize,
    pub template_slug: String,
    pub template_hash: String,
    pub model: String,
    pub probability: Option<f64>,
    pub logit: Option<f64>,
    pub failure: Option<String>,
    pub not_attempted: bool,
    pub cached: bool,
    pub latency_ms: u64,
}

impl SampleTrace {
    pub fn from_record(record: &SampleRecord, model: &str) -> Self {
        let (probability, logit, failure, not_attempted) = match &record.outcome {
            SampleOutcome::Success { probability, logit } => {
                (Some(*probability), Some(*logit), None, false)
            }
            SampleOutcome::Failed { reason } => (None, None, Some(reason.to_string()), false),
            SampleOutcome::NotAttempted => (None, None, None, true),
        };
        Self {
            timestamp_ms: now_epoch_ms(),
            sequence: record.unit.sequence,
            slot: record.unit.slot,
            replicate: record.unit.replicate,
            template_ordinal: record.unit.template_ordinal,
            template_slug: record.unit.template_slug.clone(),
            template_hash: record.unit.template_hash.clone(),
            model: model.to_string(),
            probability,
            logit,
            failure,
            not_attempted,
            cached: record.cached,
            latency_ms: record.latency_ms,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("trace channel closed")]
    Closed,
    #[error("trace worker failed: {0}")]
    Join(String),
}

pub trait TraceSink: Send + Sync {
    fn record(&self, event: SampleTrace) -> Result<(), TraceError>;
}

#[derive(Clone)]
pub struct JsonlTraceSink {
    sender: mpsc::Sender<SampleTrace>,
}

pub struct TraceWorker {
    handle: Option<std::thread::JoinHandle<Result<(), TraceError>>>,
}

impl TraceWorker {
    pub fn join(mut self) -> Result<(), TraceError> {
        let handle = self.handle.take();
        match handle {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(TraceError::Join("trace worker panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl JsonlTraceSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<SampleTrace>();
        let handle = std::thread::spawn(move || write_trace_loop(file, receiver));
        Ok((
            Self { sender },
            TraceWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, event: SampleTrace) -> Result<(), TraceError> {
        self.sender.send(event).map_err(|_| TraceError::Closed)
    }
}

fn write_trace_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<SampleTrace>,
) -> Result<(), TraceError> {
    let mut writer = BufWriter::new(file);
    for event in receiver {
        let line = serde_json::to_string(&event).map_err(|e| TraceError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
