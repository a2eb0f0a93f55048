//! Delivery cycle — one batch send per invocation
//!
//! `run_once` asks the breaker for permission, snapshots the eligible
//! messages, sends them as one JSON array and applies the classified outcome
//! to the buffer. No buffer lock is held while the request is in flight, so
//! ingestion continues during slow or stalled attempts.

use crate::buffer::PersistentBuffer;
use crate::dead_letter::{DeadLetter, DeadLetterHandler, DeadLetterReason, LogDeadLetters};
use crate::error::Result;
use crate::sender::Sender;
use crate::types::Message;
use bytes::Bytes;
use std::sync::Arc;

/// How a response status is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx: delivered
    Success,
    /// 4xx: the endpoint will never accept this batch
    Permanent,
    /// 5xx: endpoint unhealthy, counts against the breaker
    ServerError,
    /// Anything else: retried, breaker untouched
    Unexpected,
}

impl StatusClass {
    /// Classify an HTTP status code
    pub fn of(status: u16) -> Self {
        match status {
            200..=299 => StatusClass::Success,
            400..=499 => StatusClass::Permanent,
            500..=599 => StatusClass::ServerError,
            _ => StatusClass::Unexpected,
        }
    }
}

/// What a delivery cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Breaker refused the attempt; buffer untouched
    BreakerOpen,
    /// Nothing eligible to send
    Idle,
    /// Batch accepted
    Delivered { status: u16 },
    /// Batch rejected with a client error and discarded
    Rejected { status: u16 },
    /// Server error; messages backed off
    ServerError { status: u16 },
    /// Unclassified status; messages backed off
    Unexpected { status: u16 },
    /// No response; messages backed off
    TransportFailed,
}

/// Counters for one delivery cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// Messages in the attempted batch
    pub sent: usize,
    /// Messages removed after delivery or rejection
    pub removed: usize,
    /// Messages rescheduled with backoff
    pub retried: usize,
    /// Messages discarded at the retry limit
    pub given_up: usize,
}

impl CycleReport {
    fn skipped(outcome: CycleOutcome) -> Self {
        Self {
            outcome,
            sent: 0,
            removed: 0,
            retried: 0,
            given_up: 0,
        }
    }
}

/// Moves eligible messages from the buffer to the sender
pub struct DeliveryCycle {
    buffer: Arc<PersistentBuffer>,
    sender: Arc<dyn Sender>,
    dead_letters: Arc<dyn DeadLetterHandler>,
}

impl DeliveryCycle {
    /// Create a cycle that logs discarded messages
    pub fn new(buffer: Arc<PersistentBuffer>, sender: Arc<dyn Sender>) -> Self {
        Self {
            buffer,
            sender,
            dead_letters: Arc::new(LogDeadLetters),
        }
    }

    /// Route discarded messages to `handler`
    pub fn with_dead_letters(mut self, handler: Arc<dyn DeadLetterHandler>) -> Self {
        self.dead_letters = handler;
        self
    }

    /// Get the buffer
    pub fn buffer(&self) -> &Arc<PersistentBuffer> {
        &self.buffer
    }

    /// Run one delivery attempt
    ///
    /// Errors are storage failures while applying the outcome; delivery
    /// failures themselves are reported through `CycleOutcome`.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let breaker = self.buffer.breaker();
        if !breaker.can_attempt() {
            tracing::debug!("Circuit breaker open, skipping delivery");
            return Ok(CycleReport::skipped(CycleOutcome::BreakerOpen));
        }

        let messages = self.buffer.eligible().await;
        if messages.is_empty() {
            return Ok(CycleReport::skipped(CycleOutcome::Idle));
        }

        let batch = Bytes::from(serde_json::to_vec(&messages)?);
        let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
        let sent = messages.len();

        tracing::info!(count = sent, bytes = batch.len(), "Sending batch");

        let response = match self.sender.send(batch).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(count = sent, error = %e, "Batch delivery failed");
                breaker.record_failure();
                return self.back_off(CycleOutcome::TransportFailed, sent, &ids).await;
            }
        };

        let status = response.status;
        match StatusClass::of(status) {
            StatusClass::Success => {
                tracing::info!(count = sent, status, "Batch delivered");
                breaker.record_success();
                let removed = self.buffer.remove(&ids).await?;
                Ok(CycleReport {
                    outcome: CycleOutcome::Delivered { status },
                    sent,
                    removed,
                    retried: 0,
                    given_up: 0,
                })
            }
            StatusClass::Permanent => {
                tracing::warn!(
                    count = sent,
                    status,
                    body = %response.body_preview(),
                    "Batch rejected by endpoint, discarding"
                );
                let removed = self.buffer.remove(&ids).await?;
                self.dead_letter(messages, DeadLetterReason::Rejected { status })
                    .await;
                Ok(CycleReport {
                    outcome: CycleOutcome::Rejected { status },
                    sent,
                    removed,
                    retried: 0,
                    given_up: 0,
                })
            }
            StatusClass::ServerError => {
                tracing::warn!(
                    count = sent,
                    status,
                    body = %response.body_preview(),
                    "Server error, backing off"
                );
                breaker.record_failure();
                self.back_off(CycleOutcome::ServerError { status }, sent, &ids)
                    .await
            }
            StatusClass::Unexpected => {
                tracing::warn!(
                    count = sent,
                    status,
                    body = %response.body_preview(),
                    "Unexpected status, backing off"
                );
                self.back_off(CycleOutcome::Unexpected { status }, sent, &ids)
                    .await
            }
        }
    }

    async fn back_off(
        &self,
        outcome: CycleOutcome,
        sent: usize,
        ids: &[String],
    ) -> Result<CycleReport> {
        let report = self.buffer.record_failure(ids).await?;
        let given_up = report.given_up.len();

        for message in report.given_up {
            let retries = message.retry_count;
            self.dead_letter(vec![message], DeadLetterReason::MaxRetries { retries })
                .await;
        }

        Ok(CycleReport {
            outcome,
            sent,
            removed: 0,
            retried: report.retried,
            given_up,
        })
    }

    async fn dead_letter(&self, messages: Vec<Message>, reason: DeadLetterReason) {
        for message in messages {
            let id = message.id.clone();
            if let Err(e) = self
                .dead_letters
                .handle(DeadLetter::new(message, reason.clone()))
                .await
            {
                tracing::warn!(id = %id, error = %e, "Dead letter handler failed");
            }
        }
    }
}
