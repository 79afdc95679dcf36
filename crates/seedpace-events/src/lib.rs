#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![allow(clippy::module_name_repetitions)]

//! Event bus for the seedpace supervisor.
//!
//! The bus carries the notification events the limit engine emits towards
//! collaborator sinks (a Telegram bridge, a web UI, the log). It provides a
//! typed event enum, sequential identifiers, and replay of recent events for
//! late subscribers. Internally it uses `tokio::broadcast` with a bounded
//! buffer; when the channel overflows, the oldest events are dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::{Receiver, Sender};

/// Identifier assigned to each event emitted by the engine.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Quality grade assigned to a completed announce cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleGrade {
    /// Realised average within 1% of the target.
    Precise,
    /// Realised average within 3% of the target.
    Hit,
    /// Realised average missed the 3% band.
    Miss,
}

impl CycleGrade {
    /// Classify a realised/target ratio.
    #[must_use]
    pub fn from_ratio(ratio: f64) -> Self {
        let off = (ratio - 1.0).abs();
        if off <= 0.01 {
            Self::Precise
        } else if off <= 0.03 {
            Self::Hit
        } else {
            Self::Miss
        }
    }
}

/// Notification events surfaced by the limit engine.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Engine came up and took control of the configured clients.
    Startup {
        /// Representative target in KiB/s (0 when no rule is configured).
        target_kib: i64,
        /// Safety margin applied on top of the target.
        safety_margin: f64,
        /// Whether any site has reannounce optimisation enabled.
        reannounce_opt: bool,
        /// Whether any site has download limiting enabled.
        dl_limit: bool,
        /// Connected client versions, `name:version` per instance.
        client_versions: Vec<String>,
        /// Whether at least one site adapter is available.
        site_assist: bool,
    },
    /// First report for a torrent after it came under control.
    MonitorStarted {
        /// Torrent info-hash.
        hash: String,
        /// Torrent display name.
        name: String,
        /// Payload size in bytes.
        total_size: u64,
        /// Effective target in bytes/second.
        target_bps: i64,
        /// Site torrent id, when the site adapter resolved one.
        tid: Option<i64>,
        /// Promotion label reported by the site, if any.
        promotion: Option<String>,
    },
    /// A tracker-announce cycle closed.
    CycleCompleted {
        /// Torrent info-hash.
        hash: String,
        /// Torrent display name.
        name: String,
        /// Owning client instance.
        client_id: u32,
        /// Index of the completed cycle.
        cycle_index: u64,
        /// Bytes uploaded within the cycle.
        uploaded: u64,
        /// Target in bytes/second the cycle was steered towards.
        target_bps: i64,
        /// Realised average in bytes/second.
        avg_bps: f64,
        /// Realised/target ratio.
        ratio: f64,
        /// Grade derived from the ratio.
        grade: CycleGrade,
    },
    /// Session-wide real average exceeded the hard ceiling.
    OverspeedWarning {
        /// Torrent info-hash.
        hash: String,
        /// Torrent display name.
        name: String,
        /// Observed session average in bytes/second.
        real_avg_bps: f64,
        /// The ceiling that was exceeded, bytes/second.
        ceiling_bps: i64,
    },
    /// A download cap was applied to protect the ceiling.
    DownloadLimitApplied {
        /// Torrent info-hash.
        hash: String,
        /// Torrent display name.
        name: String,
        /// Applied cap in KiB/s.
        cap_kib: i64,
        /// Human-readable reason.
        reason: String,
    },
    /// The engine forced a tracker reannounce.
    ReannounceForced {
        /// Torrent info-hash.
        hash: String,
        /// Torrent display name.
        name: String,
        /// Human-readable reason.
        reason: String,
    },
    /// A site cookie stopped validating.
    CookieInvalid {
        /// Site identifier.
        site_id: u32,
        /// Site display name.
        site_name: String,
    },
    /// Engine shut down; carries the lifetime counters.
    Shutdown {
        /// Cycles completed over the engine lifetime.
        total_cycles: u64,
        /// Cycles within the 3% band.
        success_cycles: u64,
        /// Cycles within the 1% band.
        precision_cycles: u64,
        /// Bytes uploaded under control.
        total_limit_uploaded: u64,
    },
}

impl Event {
    /// Machine-friendly discriminator, also used for notification gating.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Startup { .. } => "startup",
            Self::MonitorStarted { .. } => "monitor_started",
            Self::CycleCompleted { .. } => "cycle_completed",
            Self::OverspeedWarning { .. } => "overspeed_warning",
            Self::DownloadLimitApplied { .. } => "download_limit_applied",
            Self::ReannounceForced { .. } => "reannounce_forced",
            Self::CookieInvalid { .. } => "cookie_invalid",
            Self::Shutdown { .. } => "shutdown",
        }
    }

    /// Info-hash the event refers to, when it is torrent-scoped.
    #[must_use]
    pub fn hash(&self) -> Option<&str> {
        match self {
            Self::MonitorStarted { hash, .. }
            | Self::CycleCompleted { hash, .. }
            | Self::OverspeedWarning { hash, .. }
            | Self::DownloadLimitApplied { hash, .. }
            | Self::ReannounceForced { hash, .. } => Some(hash),
            Self::Startup { .. } | Self::CookieInvalid { .. } | Self::Shutdown { .. } => None,
        }
    }
}

/// Metadata wrapper around events; tracks the event id and emission time.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Monotonic identifier assigned to the wrapped event.
    pub id: EventId,
    /// Timestamp recording when the envelope was produced.
    pub timestamp: DateTime<Utc>,
    /// Wrapped event payload.
    pub event: Event,
}

/// Shared event bus built on top of `tokio::broadcast`.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    buffer: Arc<Mutex<VecDeque<EventEnvelope>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
    replay_capacity: usize,
}

impl EventBus {
    /// Construct a new bus with the provided broadcast capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event bus capacity must be positive");
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            next_id: Arc::new(std::sync::atomic::AtomicU64::new(1)),
            replay_capacity: capacity,
        }
    }

    /// Construct a bus with the default in-memory buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish a new event to the bus, assigning it a sequential identifier.
    pub fn publish(&self, event: Event) -> EventId {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };

        {
            let mut buffer = self.lock_buffer();
            if buffer.len() == self.replay_capacity {
                buffer.pop_front();
            }
            buffer.push_back(envelope.clone());
        }

        let _ = self.sender.send(envelope);
        id
    }

    /// Subscribe to the bus, replaying any buffered events newer than `since_id`.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let mut backlog = VecDeque::new();
        if let Some(since) = since_id {
            let buffer = self.lock_buffer();
            for item in buffer.iter() {
                if item.id > since {
                    backlog.push_back(item.clone());
                }
            }
        }

        let receiver = self.sender.subscribe();
        EventStream { backlog, receiver }
    }

    /// Return a snapshot of buffered events newer than the supplied identifier.
    #[must_use]
    pub fn backlog_since(&self, since_id: EventId) -> Vec<EventEnvelope> {
        let buffer = self.lock_buffer();
        buffer
            .iter()
            .filter(|item| item.id > since_id)
            .cloned()
            .collect()
    }

    /// Last assigned identifier, if any events have been published.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        let buffer = self.lock_buffer();
        buffer.back().map(|event| event.id)
    }

    fn lock_buffer(&self) -> MutexGuard<'_, VecDeque<EventEnvelope>> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream wrapper that yields events either from the replay backlog or from
/// the live broadcast channel.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
}

impl EventStream {
    /// Receive the next event, respecting the replay backlog first.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => self.receiver.recv().await.ok(),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
