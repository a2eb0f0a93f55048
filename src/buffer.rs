//! Persistent, bounded message buffer
//!
//! `PersistentBuffer` holds messages oldest-first, evicts from the head when
//! capacity is exceeded, and rewrites its [`MessageStore`] after every
//! mutation. It owns the per-message [`BackoffTracker`] and the delivery
//! target's [`CircuitBreaker`].
//!
//! Every mutation takes the write lock only for the in-memory change and a
//! snapshot copy; the store is written after the lock is released. Writes are
//! serialized and tagged with a generation number so a slow writer can never
//! replace a newer snapshot with an older one.

use crate::backoff::{BackoffEntry, BackoffPolicy, BackoffTracker};
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::error::{RelayError, Result};
use crate::store::{FileMessageStore, MessageStore};
use crate::types::{Message, Payload, Stats};
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

/// Buffer sizing and retry policy
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Maximum number of buffered messages
    pub capacity: usize,

    /// Failed attempts after which a message is discarded
    pub max_retries: u32,

    /// Retry delay schedule
    pub backoff: BackoffPolicy,

    /// Delivery target's circuit breaker
    pub breaker: BreakerConfig,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_retries: 5,
            backoff: BackoffPolicy::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Result of [`PersistentBuffer::record_failure`]
#[derive(Debug, Clone, Default)]
pub struct FailureReport {
    /// Messages rescheduled with a backoff delay
    pub retried: usize,

    /// Messages discarded after reaching the retry limit
    pub given_up: Vec<Message>,
}

/// Result of [`PersistentBuffer::cleanup`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Messages older than the retention window
    pub expired_messages: usize,

    /// Backoff entries past their grace period
    pub expired_backoffs: usize,
}

#[derive(Debug, Default)]
struct BufferState {
    messages: VecDeque<Message>,
    backoff: BackoffTracker,
    last_flush: Option<DateTime<Utc>>,
    /// Nanosecond component of the last issued id
    last_id_nanos: i64,
    dropped_total: u64,
    /// Bumped on every mutation that must reach the store
    generation: u64,
}

impl BufferState {
    fn next_id(&mut self, topic: &str) -> String {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let nanos = now.max(self.last_id_nanos.saturating_add(1));
        self.last_id_nanos = nanos;
        format!("{}-{}", nanos, topic)
    }

    /// Drop from the head until at most `capacity` remain
    fn rotate(&mut self, capacity: usize) -> usize {
        let mut evicted = 0;
        while self.messages.len() > capacity {
            if let Some(old) = self.messages.pop_front() {
                self.backoff.remove(&old.id);
                evicted += 1;
            }
        }
        self.dropped_total += evicted as u64;
        evicted
    }

    fn eligible_count(&self, now: Instant) -> usize {
        self.messages
            .iter()
            .filter(|m| self.backoff.is_eligible(&m.id, now))
            .count()
    }

    fn commit(&mut self) -> (u64, Vec<Message>) {
        self.generation += 1;
        (self.generation, self.messages.iter().cloned().collect())
    }
}

/// Ordered, capacity-bounded, crash-recoverable message buffer
pub struct PersistentBuffer {
    config: BufferConfig,
    state: RwLock<BufferState>,
    breaker: CircuitBreaker,
    store: Arc<dyn MessageStore>,
    /// Generation of the last snapshot written to the store
    persisted: Mutex<u64>,
}

impl PersistentBuffer {
    /// Create a buffer backed by `store`, loading whatever it holds
    ///
    /// Corrupt stored contents are logged and discarded; the buffer starts
    /// empty. Other load failures (e.g. permission denied) are returned.
    pub fn new(config: BufferConfig, store: Arc<dyn MessageStore>) -> Result<Self> {
        if config.capacity == 0 {
            return Err(RelayError::Config("buffer capacity must be at least 1".into()));
        }

        let loaded = match store.load() {
            Ok(messages) => messages,
            Err(RelayError::Serialization(e)) => {
                tracing::error!(
                    location = %store.describe(),
                    error = %e,
                    "Buffer file is corrupt, starting empty (buffered messages lost)"
                );
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let mut state = BufferState {
            backoff: BackoffTracker::new(config.backoff.clone()),
            ..Default::default()
        };
        state.last_id_nanos = loaded
            .iter()
            .filter_map(|m| m.id.split_once('-').and_then(|(n, _)| n.parse::<i64>().ok()))
            .max()
            .unwrap_or(0);
        state.messages = loaded.into();

        let trimmed = state.messages.len().saturating_sub(config.capacity);
        if trimmed > 0 {
            state.messages.drain(..trimmed);
            tracing::warn!(
                dropped = trimmed,
                capacity = config.capacity,
                "Loaded buffer exceeds capacity, dropped oldest messages"
            );
        }

        tracing::info!(
            location = %store.describe(),
            count = state.messages.len(),
            "Buffer opened"
        );

        Ok(Self {
            breaker: CircuitBreaker::new(config.breaker.clone()),
            config,
            state: RwLock::new(state),
            store,
            persisted: Mutex::new(0),
        })
    }

    /// Create a buffer persisted to a JSON file at `path`
    pub fn open(config: BufferConfig, path: impl Into<PathBuf>) -> Result<Self> {
        Self::new(config, Arc::new(FileMessageStore::new(path)))
    }

    /// Get the configuration
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// The delivery target's circuit breaker
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Append a message, evicting the oldest when over capacity, and persist
    ///
    /// Returns the stored message with its assigned id.
    pub async fn add(&self, topic: impl Into<String>, payload: Payload) -> Result<Message> {
        let topic = topic.into();

        let (message, generation, snapshot) = {
            let mut state = self.state.write().await;
            let message = Message {
                id: state.next_id(&topic),
                topic,
                payload,
                received_at: Utc::now(),
                retry_count: 0,
            };
            state.messages.push_back(message.clone());

            let evicted = state.rotate(self.config.capacity);
            if evicted > 0 {
                tracing::warn!(
                    evicted,
                    capacity = self.config.capacity,
                    dropped_total = state.dropped_total,
                    "Buffer full, dropped oldest messages"
                );
            }

            let (generation, snapshot) = state.commit();
            (message, generation, snapshot)
        };

        tracing::trace!(id = %message.id, topic = %message.topic, "Message buffered");
        self.persist(generation, snapshot).await?;
        Ok(message)
    }

    /// Messages not inside a backoff window, in buffer order
    pub async fn eligible(&self) -> Vec<Message> {
        let state = self.state.read().await;
        let now = Instant::now();
        state
            .messages
            .iter()
            .filter(|m| state.backoff.is_eligible(&m.id, now))
            .cloned()
            .collect()
    }

    /// Remove the named messages and their backoff entries, then persist
    ///
    /// Unknown ids are ignored. Returns how many messages were removed.
    pub async fn remove(&self, ids: &[String]) -> Result<usize> {
        let (removed, generation, snapshot) = {
            let mut state = self.state.write().await;
            let targets: HashSet<&str> = ids.iter().map(String::as_str).collect();

            let before = state.messages.len();
            state.messages.retain(|m| !targets.contains(m.id.as_str()));
            for id in &targets {
                state.backoff.remove(id);
            }
            state.last_flush = Some(Utc::now());

            let removed = before - state.messages.len();
            let (generation, snapshot) = state.commit();
            (removed, generation, snapshot)
        };

        tracing::debug!(removed, "Messages removed from buffer");
        self.persist(generation, snapshot).await?;
        Ok(removed)
    }

    /// Count a failed attempt against each named message
    ///
    /// Messages reaching `max_retries` are discarded; the rest get a backoff
    /// entry of `min(base * 2^retry_count, max_delay)`. Ids no longer in the
    /// buffer are skipped.
    pub async fn record_failure(&self, ids: &[String]) -> Result<FailureReport> {
        let (report, generation, snapshot) = {
            let mut state = self.state.write().await;
            let now = Instant::now();
            let mut report = FailureReport::default();

            for id in ids {
                let Some(pos) = state.messages.iter().position(|m| &m.id == id) else {
                    tracing::debug!(id = %id, "Failed message no longer buffered, skipping");
                    continue;
                };

                let retries = {
                    let msg = &mut state.messages[pos];
                    msg.retry_count = msg.retry_count.saturating_add(1);
                    msg.retry_count
                };

                if retries >= self.config.max_retries {
                    state.backoff.remove(id);
                    if let Some(msg) = state.messages.remove(pos) {
                        tracing::error!(
                            id = %msg.id,
                            topic = %msg.topic,
                            retries,
                            "Message exceeded max retries, discarding (data loss)"
                        );
                        report.given_up.push(msg);
                    }
                    continue;
                }

                let delay = state.backoff.schedule(id, retries, now);
                report.retried += 1;
                tracing::debug!(
                    id = %id,
                    attempt = retries,
                    delay_secs = delay.as_secs_f64(),
                    "Message delivery failed, backing off"
                );
            }

            let (generation, snapshot) = state.commit();
            (report, generation, snapshot)
        };

        self.persist(generation, snapshot).await?;
        Ok(report)
    }

    /// Expire stale backoff entries and messages older than `retention`
    ///
    /// The store is rewritten only when a message was removed.
    pub async fn cleanup(&self, retention: Duration) -> Result<SweepReport> {
        let (report, pending) = {
            let mut state = self.state.write().await;
            let mut report = SweepReport {
                expired_backoffs: state.backoff.sweep(Instant::now()),
                ..Default::default()
            };

            // A retention too large to represent expires nothing
            if let Some(cutoff) = chrono::Duration::from_std(retention)
                .ok()
                .and_then(|r| Utc::now().checked_sub_signed(r))
            {
                let mut expired = Vec::new();
                state.messages.retain(|m| {
                    let keep = m.received_at > cutoff;
                    if !keep {
                        expired.push(m.id.clone());
                    }
                    keep
                });
                for id in &expired {
                    state.backoff.remove(id);
                }
                report.expired_messages = expired.len();
            }

            let pending = (report.expired_messages > 0).then(|| state.commit());
            (report, pending)
        };

        if report.expired_messages > 0 {
            tracing::info!(count = report.expired_messages, "Cleaned up old messages");
        }
        if report.expired_backoffs > 0 {
            tracing::debug!(count = report.expired_backoffs, "Cleaned up stale backoff entries");
        }

        if let Some((generation, snapshot)) = pending {
            self.persist(generation, snapshot).await?;
        }
        Ok(report)
    }

    /// Point-in-time statistics
    pub async fn stats(&self) -> Stats {
        let state = self.state.read().await;
        let breaker = self.breaker.snapshot();
        Stats {
            total_messages: state.messages.len(),
            eligible_messages: state.eligible_count(Instant::now()),
            backoff_entries: state.backoff.len(),
            breaker_state: breaker.state,
            breaker_failures: breaker.consecutive_failures,
            last_flush: state.last_flush,
            dropped_total: state.dropped_total,
        }
    }

    /// Copy of every buffered message, oldest first
    pub async fn messages(&self) -> Vec<Message> {
        self.state.read().await.messages.iter().cloned().collect()
    }

    /// Backoff entry for `id`, if one is live
    pub async fn backoff_entry(&self, id: &str) -> Option<BackoffEntry> {
        self.state.read().await.backoff.get(id).cloned()
    }

    /// Number of buffered messages
    pub async fn len(&self) -> usize {
        self.state.read().await.messages.len()
    }

    /// Whether the buffer is empty
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.messages.is_empty()
    }

    async fn persist(&self, generation: u64, snapshot: Vec<Message>) -> Result<()> {
        let mut written = self.persisted.lock().await;
        if *written >= generation {
            // A newer snapshot already reached the store
            return Ok(());
        }

        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .map_err(|e| {
                RelayError::storage(self.store.describe(), format!("persist task failed: {}", e))
            })??;

        *written = generation;
        Ok(())
    }
}
