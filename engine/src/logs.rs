//! Log broadcasting
//! Fans captured backend output out to live subscribers without ever
//! blocking the producer

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::debug;

/// Lines retained per backend for late subscribers
pub const DEFAULT_RING_CAPACITY: usize = 100;

/// Lines buffered per subscriber before drop-oldest kicks in
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// One captured output line from a backend process
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub timestamp_ms: u64,
    pub source: LogSource,
    pub backend_id: String,
    pub text: String,
}

impl LogLine {
    pub fn now(backend_id: impl Into<String>, source: LogSource, text: impl Into<String>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            timestamp_ms,
            source,
            backend_id: backend_id.into(),
            text: text.into(),
        }
    }
}

struct BackendChannel {
    ring: VecDeque<LogLine>,
    tx: broadcast::Sender<LogLine>,
}

/// Per-backend fan-out of captured output lines
///
/// Publishing never awaits: the ring buffer drops its oldest line when
/// full, and a slow subscriber loses its oldest queued lines (broadcast
/// lag) rather than stalling the producer. Per backend, each subscriber
/// observes lines in publish order.
pub struct LogBroadcaster {
    ring_capacity: usize,
    queue_depth: usize,
    channels: Mutex<HashMap<String, BackendChannel>>,
}

impl LogBroadcaster {
    pub fn new(ring_capacity: usize, queue_depth: usize) -> Self {
        Self {
            ring_capacity: ring_capacity.max(1),
            queue_depth: queue_depth.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Append to the backend's ring buffer and forward to subscribers
    pub fn publish(&self, line: LogLine) {
        let mut channels = self.channels.lock().unwrap();
        let channel = Self::channel_entry(
            &mut channels,
            &line.backend_id,
            self.queue_depth,
        );

        if channel.ring.len() == self.ring_capacity {
            channel.ring.pop_front();
        }
        channel.ring.push_back(line.clone());

        // Err means no live subscribers, which is fine
        let _ = channel.tx.send(line);
    }

    /// Subscribe to a backend's log stream: ring-buffer backlog first,
    /// then live lines. Dropping the subscription releases it.
    pub fn subscribe(&self, backend_id: &str) -> LogSubscription {
        let mut channels = self.channels.lock().unwrap();
        let channel = Self::channel_entry(&mut channels, backend_id, self.queue_depth);

        debug!(backend = backend_id, "log subscription created");

        LogSubscription {
            backlog: channel.ring.clone(),
            rx: channel.tx.subscribe(),
        }
    }

    /// Current live subscriber count for a backend
    pub fn subscriber_count(&self, backend_id: &str) -> usize {
        let channels = self.channels.lock().unwrap();
        channels
            .get(backend_id)
            .map(|c| c.tx.receiver_count())
            .unwrap_or(0)
    }

    fn channel_entry<'a>(
        channels: &'a mut HashMap<String, BackendChannel>,
        backend_id: &str,
        queue_depth: usize,
    ) -> &'a mut BackendChannel {
        channels
            .entry(backend_id.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(queue_depth);
                BackendChannel {
                    ring: VecDeque::new(),
                    tx,
                }
            })
    }
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY, DEFAULT_QUEUE_DEPTH)
    }
}

/// Live handle over one backend's log stream
#[derive(Debug)]
pub struct LogSubscription {
    backlog: VecDeque<LogLine>,
    rx: broadcast::Receiver<LogLine>,
}

impl LogSubscription {
    /// Next line, or None once the broadcaster is gone.
    ///
    /// Skips over lag gaps silently: the contract is drop-oldest, not
    /// delivery of every line to a slow consumer.
    pub async fn next(&mut self) -> Option<LogLine> {
        if let Some(line) = self.backlog.pop_front() {
            return Some(line);
        }

        loop {
            match self.rx.recv().await {
                Ok(line) => return Some(line),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped = skipped, "slow log subscriber dropped oldest lines");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
