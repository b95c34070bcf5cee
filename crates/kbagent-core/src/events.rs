//! Real-time event pipeline.
//!
//! The pipeline emits structured events (logs, phase updates, progress,
//! task status) through an [`EventBus`]. Events are validated on submission,
//! rate-limited by a global token bucket, batched, and delivered to
//! subscribers over a broadcast channel. A background monitor pings the
//! delivery channel; after enough consecutive failures the bus buffers
//! events in a bounded ring and drains it in order once the channel
//! recovers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::types::{PhaseStatus, TaskStatus};

/// Log messages longer than this are truncated with a `...` suffix.
pub const MAX_LOG_MESSAGE_CHARS: usize = 10_000;

// ── Event kinds ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    LogMessage {
        message: String,
        level: LogLevel,
        timestamp: i64,
        truncated: bool,
    },
    PhaseUpdate {
        phase_id: String,
        status: PhaseStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        processed_count: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_count: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_count: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        estimated_seconds_remaining: Option<f64>,
        is_sub_step: bool,
    },
    ProgressUpdate {
        processed_count: u64,
        total_count: u64,
        percentage: f64,
    },
    #[serde(rename = "task_status")]
    TaskStatusUpdate {
        task_id: String,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress_percent: Option<i64>,
    },
}

impl AgentEvent {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        let mut message: String = message.into();
        let mut truncated = false;
        if message.chars().count() > MAX_LOG_MESSAGE_CHARS {
            message = message.chars().take(MAX_LOG_MESSAGE_CHARS).collect::<String>() + "...";
            truncated = true;
        }
        AgentEvent::LogMessage {
            message,
            level,
            timestamp: chrono::Utc::now().timestamp(),
            truncated,
        }
    }

    pub fn progress(processed_count: u64, total_count: u64) -> Self {
        let percentage = if total_count == 0 {
            0.0
        } else {
            100.0 * processed_count as f64 / total_count as f64
        };
        AgentEvent::ProgressUpdate { processed_count, total_count, percentage }
    }

    /// Counter constraints each kind must satisfy to be emitted.
    fn is_valid(&self) -> bool {
        match self {
            AgentEvent::ProgressUpdate { processed_count, total_count, .. } => {
                processed_count <= total_count
            }
            AgentEvent::PhaseUpdate { processed_count, total_count, .. } => {
                match (processed_count, total_count) {
                    (Some(p), Some(t)) => p <= t,
                    _ => true,
                }
            }
            _ => true,
        }
    }
}

// ── Delivery channel ─────────────────────────────────────────────────────

/// Abstraction over the transport subscribers sit behind. The default is an
/// in-process broadcast channel; an out-of-process transport (e.g. a pub/sub
/// bridge) plugs in here via [`EventBus::with_channel`] and owns its own
/// connection configuration.
pub trait DeliveryChannel: Send + Sync {
    fn deliver(&self, batch: Vec<AgentEvent>) -> bool;
    fn ping(&self) -> bool;
}

struct BroadcastChannel {
    tx: broadcast::Sender<Vec<AgentEvent>>,
}

impl DeliveryChannel for BroadcastChannel {
    fn deliver(&self, batch: Vec<AgentEvent>) -> bool {
        // No subscribers is not a failure; events are simply unobserved.
        let _ = self.tx.send(batch);
        true
    }

    fn ping(&self) -> bool {
        true
    }
}

// ── Configuration ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    pub rate_per_second: u32,
    pub rate_per_minute: u32,
    pub batch_max: usize,
    pub batch_max_age: Duration,
    /// Events buffered while the delivery channel is unhealthy.
    pub ring_capacity: usize,
    pub ping_interval: Duration,
    /// Consecutive ping failures before the bus is marked unhealthy.
    pub fail_threshold: u32,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            rate_per_second: 100,
            rate_per_minute: 2000,
            batch_max: 25,
            batch_max_age: Duration::from_millis(250),
            ring_capacity: 1000,
            ping_interval: Duration::from_secs(5),
            fail_threshold: 3,
        }
    }
}

impl EventBusConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            rate_per_second: config.event_rate_per_second,
            rate_per_minute: config.event_rate_per_minute,
            batch_max: config.event_batch_max.max(1),
            batch_max_age: Duration::from_millis(config.event_batch_max_age_ms),
            ring_capacity: config.event_buffer_capacity,
            ..Self::default()
        }
    }
}

// ── Rate limiting ────────────────────────────────────────────────────────

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last: std::time::Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_window: Duration) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / refill_window.as_secs_f64(),
            last: std::time::Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = std::time::Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct RateLimiter {
    per_second: TokenBucket,
    per_minute: TokenBucket,
}

impl RateLimiter {
    fn try_take(&mut self) -> bool {
        // Both buckets must admit the event.
        self.per_second.try_take() && self.per_minute.try_take()
    }
}

// ── Bus ──────────────────────────────────────────────────────────────────

struct BusShared {
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    ring: Mutex<VecDeque<AgentEvent>>,
    ring_capacity: usize,
    rejected: AtomicU64,
    rate_limited: AtomicU64,
    buffer_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EventBusCounters {
    pub rejected: u64,
    pub rate_limited: u64,
    pub buffer_dropped: u64,
}

pub struct EventBus {
    ingest: mpsc::UnboundedSender<AgentEvent>,
    out: broadcast::Sender<Vec<AgentEvent>>,
    limiter: Mutex<RateLimiter>,
    shared: Arc<BusShared>,
}

impl EventBus {
    /// Bus delivering to in-process broadcast subscribers.
    pub fn new(config: EventBusConfig) -> Arc<Self> {
        let (out, _) = broadcast::channel(256);
        let channel = Arc::new(BroadcastChannel { tx: out.clone() });
        Self::with_channel(config, channel, out, None)
    }

    /// Bus delivering through a caller-supplied channel. `reconnect` fires
    /// once each time the bus transitions to unhealthy.
    pub fn with_channel(
        config: EventBusConfig,
        channel: Arc<dyn DeliveryChannel>,
        out: broadcast::Sender<Vec<AgentEvent>>,
        reconnect: Option<Box<dyn Fn() + Send + Sync>>,
    ) -> Arc<Self> {
        let (ingest, ingest_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(BusShared {
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            ring: Mutex::new(VecDeque::new()),
            ring_capacity: config.ring_capacity,
            rejected: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            buffer_dropped: AtomicU64::new(0),
        });

        let bus = Arc::new(Self {
            ingest,
            out,
            limiter: Mutex::new(RateLimiter {
                per_second: TokenBucket::new(config.rate_per_second, Duration::from_secs(1)),
                per_minute: TokenBucket::new(config.rate_per_minute, Duration::from_secs(60)),
            }),
            shared: Arc::clone(&shared),
        });

        tokio::spawn(flusher(
            ingest_rx,
            Arc::clone(&channel),
            Arc::clone(&shared),
            config.batch_max,
            config.batch_max_age,
        ));
        tokio::spawn(monitor(
            Arc::downgrade(&shared),
            channel,
            config.ping_interval,
            config.fail_threshold,
            reconnect,
        ));

        bus
    }

    /// Submit an event. Invalid events are rejected and counted; events over
    /// the rate quota are dropped and counted.
    pub fn emit(&self, event: AgentEvent) {
        if !event.is_valid() {
            self.shared.rejected.fetch_add(1, Ordering::Relaxed);
            warn!("event bus rejected invalid event: {event:?}");
            return;
        }
        let admitted = self
            .limiter
            .lock()
            .map(|mut l| l.try_take())
            .unwrap_or(true);
        if !admitted {
            self.shared.rate_limited.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let _ = self.ingest.send(event);
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(AgentEvent::log(level, message));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<AgentEvent>> {
        self.out.subscribe()
    }

    pub fn is_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> EventBusCounters {
        EventBusCounters {
            rejected: self.shared.rejected.load(Ordering::Relaxed),
            rate_limited: self.shared.rate_limited.load(Ordering::Relaxed),
            buffer_dropped: self.shared.buffer_dropped.load(Ordering::Relaxed),
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────────────

async fn flusher(
    mut rx: mpsc::UnboundedReceiver<AgentEvent>,
    channel: Arc<dyn DeliveryChannel>,
    shared: Arc<BusShared>,
    batch_max: usize,
    batch_max_age: Duration,
) {
    let mut buffer: Vec<AgentEvent> = Vec::new();
    'outer: loop {
        let Some(first) = rx.recv().await else { break };
        buffer.push(first);
        let deadline = tokio::time::Instant::now() + batch_max_age;
        while buffer.len() < batch_max {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(event) => buffer.push(event),
                    None => {
                        flush(&mut buffer, &channel, &shared);
                        break 'outer;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        flush(&mut buffer, &channel, &shared);
    }
}

fn flush(buffer: &mut Vec<AgentEvent>, channel: &Arc<dyn DeliveryChannel>, shared: &BusShared) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    if shared.healthy.load(Ordering::Acquire) {
        channel.deliver(batch);
    } else {
        let mut ring = match shared.ring.lock() {
            Ok(r) => r,
            Err(e) => e.into_inner(),
        };
        for event in batch {
            if ring.len() >= shared.ring_capacity {
                ring.pop_front();
                shared.buffer_dropped.fetch_add(1, Ordering::Relaxed);
            }
            ring.push_back(event);
        }
    }
}

async fn monitor(
    shared: Weak<BusShared>,
    channel: Arc<dyn DeliveryChannel>,
    ping_interval: Duration,
    fail_threshold: u32,
    reconnect: Option<Box<dyn Fn() + Send + Sync>>,
) {
    let mut interval = tokio::time::interval(ping_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else { break };
        if channel.ping() {
            shared.consecutive_failures.store(0, Ordering::Release);
            if !shared.healthy.swap(true, Ordering::AcqRel) {
                drain_ring(&shared, &channel);
            }
        } else {
            let failures = shared.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            if failures >= fail_threshold && shared.healthy.swap(false, Ordering::AcqRel) {
                warn!("event bus unhealthy after {failures} failed pings; buffering events");
                if let Some(cb) = &reconnect {
                    cb();
                }
            }
        }
    }
}

/// On recovery the buffered events are delivered in their original order.
fn drain_ring(shared: &BusShared, channel: &Arc<dyn DeliveryChannel>) {
    let buffered: Vec<AgentEvent> = {
        let mut ring = match shared.ring.lock() {
            Ok(r) => r,
            Err(e) => e.into_inner(),
        };
        ring.drain(..).collect()
    };
    if !buffered.is_empty() {
        channel.deliver(buffered);
    }
}
