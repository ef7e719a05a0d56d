//! Message-queue transport contract and an in-memory implementation.
//!
//! The SMPP pipeline assumes at-least-once delivery with visibility
//! timeouts: a received message stays invisible until acknowledged, and
//! reappears if the consumer dies first. Queues may optionally be FIFO, in
//! which case the group id is the queue name and the deduplication id is the
//! MD5 of the body.

use async_trait::async_trait;
use md5::{Digest, Md5};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Default visibility timeout for the in-memory transport
const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a receive call waits for a message before returning empty
const RECEIVE_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue '{0}' does not exist")]
    QueueNotFound(String),

    #[error("queue transport unavailable: {0}")]
    Transport(String),
}

/// A message leased from a queue. `receipt` acknowledges this particular
/// delivery; the body is redelivered if the lease lapses un-acked.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: String,
    pub receipt: String,
    pub body: String,
}

/// Queue transport contract (the reference deployment is SQS-shaped).
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Create the queue if it does not exist yet
    async fn ensure_queue(&self, name: &str) -> Result<(), QueueError>;

    async fn send(&self, queue: &str, body: String) -> Result<(), QueueError>;

    /// Lease up to `max` messages; may return empty after a short wait
    async fn receive(&self, queue: &str, max: usize) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge (delete) leased messages by receipt
    async fn ack(&self, queue: &str, receipts: &[String]) -> Result<(), QueueError>;
}

/// FIFO deduplication id: MD5 of the body, hex encoded.
pub fn dedup_id(body: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derive a connector's work-queue name: `<prefix>smppconn_<sanitized><suffix>`
/// where sanitization maps characters outside `[A-Za-z0-9_-]` to `-` and
/// deletes spaces.
pub fn connector_queue_name(prefix: &str, connector: &str, suffix: &str) -> String {
    let sanitized = sanitize_queue_name(&format!("smppconn_{connector}"));
    format!("{prefix}{sanitized}{suffix}")
}

pub fn sanitize_queue_name(name: &str) -> String {
    name.chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                Some(c)
            } else if c == ' ' {
                None
            } else {
                Some('-')
            }
        })
        .collect()
}

struct InflightMessage {
    message: QueueMessage,
    visible_again: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueueMessage>,
    inflight: HashMap<String, InflightMessage>,
    seen_dedup_ids: HashSet<String>,
}

/// In-memory transport used by tests and single-process runs.
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: tokio::sync::Notify,
    use_fifo: bool,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(false)
    }
}

impl MemoryQueue {
    pub fn new(use_fifo: bool) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            notify: tokio::sync::Notify::new(),
            use_fifo,
        }
    }

    /// Number of ready (not in-flight) messages, for tests
    pub fn depth(&self, queue: &str) -> usize {
        let queues = self.queues.lock().expect("queue lock");
        queues.get(queue).map_or(0, |q| q.ready.len())
    }

    fn requeue_lapsed(state: &mut QueueState) {
        let now = Instant::now();
        let lapsed: Vec<String> = state
            .inflight
            .iter()
            .filter(|(_, m)| m.visible_again <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in lapsed {
            if let Some(inflight) = state.inflight.remove(&receipt) {
                state.ready.push_back(inflight.message);
            }
        }
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn ensure_queue(&self, name: &str) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().expect("queue lock");
        queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn send(&self, queue: &str, body: String) -> Result<(), QueueError> {
        {
            let mut queues = self.queues.lock().expect("queue lock");
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;

            if self.use_fifo && !state.seen_dedup_ids.insert(dedup_id(&body)) {
                // Duplicate publish within the dedup window, dropped
                return Ok(());
            }

            state.ready.push_back(QueueMessage {
                id: uuid::Uuid::new_v4().to_string(),
                receipt: uuid::Uuid::new_v4().to_string(),
                body,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str, max: usize) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + RECEIVE_WAIT;

        loop {
            {
                let mut queues = self.queues.lock().expect("queue lock");
                let state = queues
                    .get_mut(queue)
                    .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;

                Self::requeue_lapsed(state);

                if !state.ready.is_empty() {
                    let mut leased = Vec::new();
                    while leased.len() < max {
                        let Some(message) = state.ready.pop_front() else {
                            break;
                        };
                        state.inflight.insert(
                            message.receipt.clone(),
                            InflightMessage {
                                message: message.clone(),
                                visible_again: Instant::now() + VISIBILITY_TIMEOUT,
                            },
                        );
                        leased.push(message);
                    }
                    return Ok(leased);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, self.notify.notified()).await;
        }
    }

    async fn ack(&self, queue: &str, receipts: &[String]) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().expect("queue lock");
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;

        for receipt in receipts {
            state.inflight.remove(receipt);
        }
        Ok(())
    }
}
