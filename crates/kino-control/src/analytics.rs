//! Analytics event emission
//!
//! Captures control-plane telemetry for:
//! - Ad lifecycle (breaks, impressions, quartiles, clicks, errors)
//! - ABR decisions (startup, caps, switches, manual selections)

use crate::ads::{AdBreakKind, EndReason};
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Analytics event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    /// Ad break began loading; content paused
    AdBreakStart {
        break_id: String,
        kind: AdBreakKind,
    },

    /// Ad break finished and content resumed
    AdBreakEnd {
        break_id: String,
        reason: EndReason,
    },

    AdImpression {
        break_id: String,
    },

    /// First observed progress of the creative
    AdStart {
        break_id: String,
        muted: bool,
    },

    AdQuartile {
        break_id: String,
        quartile: u8,
    },

    AdProgress {
        break_id: String,
        at: f64,
    },

    AdComplete {
        break_id: String,
    },

    AdSkip {
        break_id: String,
    },

    AdClick {
        break_id: String,
        url: String,
    },

    AdIconView {
        break_id: String,
        index: usize,
        program: Option<String>,
    },

    AdIconClick {
        break_id: String,
        index: usize,
        program: Option<String>,
    },

    /// Ad failure; `break_id` is absent for schedule-level failures
    AdError {
        break_id: Option<String>,
        message: String,
    },

    AbrStartup {
        mode: StartupMode,
        height: Option<u32>,
    },

    AbrCap {
        reason: CapReason,
        cap: u32,
    },

    AbrSwitch {
        reason: SwitchReason,
        to: u32,
        dropped_frames_delta: u64,
        buffer_len: f64,
        est_bw: Option<f64>,
        est_bw_ema: Option<f64>,
    },

    AbrManualSelection {
        selection: QualitySelection,
    },

    AbrManualRevert {
        after_ms: u64,
    },
}

/// How the tuner started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupMode {
    Auto,
    Low,
}

/// Source of a resolution cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapReason {
    Viewport,
    Network,
    Manual,
}

/// Reason for an ABR downswitch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    DroppedFrames,
    LowBuffer,
    Stall,
}

/// Destination for analytics events
pub trait AnalyticsSink: Send + Sync {
    fn emit(&self, event: AnalyticsEvent);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAnalytics;

impl AnalyticsSink for NoopAnalytics {
    fn emit(&self, _event: AnalyticsEvent) {}
}

/// Analytics event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsEventRecord {
    /// Unique event ID
    pub id: Uuid,
    /// Session ID
    pub session_id: SessionId,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Sequence number
    pub sequence: u64,
    /// The event
    #[serde(flatten)]
    pub event: AnalyticsEvent,
}

/// Analytics emitter
pub struct AnalyticsEmitter {
    /// Session ID
    session_id: SessionId,
    /// Event sequence counter
    sequence: AtomicU64,
    /// Event buffer
    buffer: Mutex<Vec<AnalyticsEventRecord>>,
    /// Maximum buffer size before flush
    max_buffer_size: usize,
    /// Batches handed to the background processor
    batch_tx: mpsc::UnboundedSender<Vec<AnalyticsEventRecord>>,
}

impl AnalyticsEmitter {
    /// Create a new analytics emitter (requires a tokio runtime)
    pub fn new() -> Self {
        Self::spawn(None)
    }

    /// Create with a collector endpoint that receives flushed batches
    pub fn with_beacon(beacon_url: String) -> Self {
        Self::spawn(Some(beacon_url))
    }

    fn spawn(beacon_url: Option<String>) -> Self {
        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel::<Vec<AnalyticsEventRecord>>();

        // Spawn background processor
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            while let Some(batch) = batch_rx.recv().await {
                info!(count = batch.len(), "Flushing analytics events");
                let Some(ref url) = beacon_url else {
                    continue;
                };
                // Fire-and-forget
                if let Err(e) = client.post(url).json(&batch).send().await {
                    warn!(error = %e, "Analytics flush failed");
                }
            }
        });

        Self {
            session_id: SessionId::new(),
            sequence: AtomicU64::new(0),
            buffer: Mutex::new(Vec::new()),
            max_buffer_size: 50,
            batch_tx,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Get all buffered events
    pub fn get_events(&self) -> Vec<AnalyticsEventRecord> {
        self.lock_buffer().clone()
    }

    /// Hand all buffered events to the background processor
    pub fn flush(&self) {
        let events: Vec<_> = self.lock_buffer().drain(..).collect();
        if !events.is_empty() {
            let _ = self.batch_tx.send(events);
        }
    }

    /// Clear buffer
    pub fn clear(&self) {
        self.lock_buffer().clear();
    }

    fn lock_buffer(&self) -> std::sync::MutexGuard<'_, Vec<AnalyticsEventRecord>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AnalyticsSink for AnalyticsEmitter {
    fn emit(&self, event: AnalyticsEvent) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        let record = AnalyticsEventRecord {
            id: Uuid::new_v4(),
            session_id: self.session_id,
            timestamp: Utc::now(),
            sequence,
            event,
        };

        debug!(event_id = %record.id, event = ?record.event, "Analytics event");

        let mut buffer = self.lock_buffer();
        buffer.push(record);

        // Flush if buffer is full
        if buffer.len() >= self.max_buffer_size {
            let events: Vec<_> = buffer.drain(..).collect();
            drop(buffer);
            let _ = self.batch_tx.send(events);
        }
    }
}

impl Drop for AnalyticsEmitter {
    fn drop(&mut self) {
        self.flush();
    }
}
