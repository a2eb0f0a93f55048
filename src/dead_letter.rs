//! Dead letters — messages discarded without successful delivery
//!
//! The delivery cycle hands every message it gives up on to a
//! `DeadLetterHandler`: those that reached the retry limit and those the
//! endpoint rejected with a client error. The buffer has already dropped
//! them; handlers only observe.

use crate::error::Result;
use crate::types::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Why a message was discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Reached the configured retry limit
    MaxRetries { retries: u32 },

    /// Endpoint answered with a 4xx status
    Rejected { status: u16 },
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterReason::MaxRetries { retries } => {
                write!(f, "max retries exceeded after {} attempts", retries)
            }
            DeadLetterReason::Rejected { status } => write!(f, "rejected with status {}", status),
        }
    }
}

/// A discarded message with context
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The message as it was when discarded
    pub message: Message,

    /// Why it was discarded
    pub reason: DeadLetterReason,

    /// When it was discarded
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Create a new dead letter stamped now
    pub fn new(message: Message, reason: DeadLetterReason) -> Self {
        Self {
            message,
            reason,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Trait for dead letter handlers
#[async_trait]
pub trait DeadLetterHandler: Send + Sync {
    /// Observe a discarded message
    async fn handle(&self, letter: DeadLetter) -> Result<()>;
}

/// Handler that only logs; the default
#[derive(Debug, Default)]
pub struct LogDeadLetters;

#[async_trait]
impl DeadLetterHandler for LogDeadLetters {
    async fn handle(&self, letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            id = %letter.message.id,
            topic = %letter.message.topic,
            retries = letter.message.retry_count,
            reason = %letter.reason,
            "Message dead-lettered"
        );
        Ok(())
    }
}

/// In-memory handler keeping the most recent dead letters
///
/// Oldest entries are drained once `max_letters` is exceeded.
pub struct MemoryDeadLetters {
    letters: Arc<RwLock<Vec<DeadLetter>>>,
    max_letters: usize,
}

impl MemoryDeadLetters {
    /// Create a new in-memory handler
    pub fn new(max_letters: usize) -> Self {
        Self {
            letters: Arc::new(RwLock::new(Vec::new())),
            max_letters,
        }
    }

    /// Number of retained dead letters
    pub async fn count(&self) -> usize {
        self.letters.read().await.len()
    }

    /// Most recent dead letters first
    pub async fn list(&self, limit: usize) -> Vec<DeadLetter> {
        let letters = self.letters.read().await;
        letters.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for MemoryDeadLetters {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DeadLetterHandler for MemoryDeadLetters {
    async fn handle(&self, letter: DeadLetter) -> Result<()> {
        let mut letters = self.letters.write().await;
        letters.push(letter);

        if self.max_letters > 0 && letters.len() > self.max_letters {
            let drain_count = letters.len() - self.max_letters;
            letters.drain(..drain_count);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Payload;

    fn letter(n: u32) -> DeadLetter {
        DeadLetter::new(
            Message {
                id: format!("{}-t", n),
                topic: "t".to_string(),
                payload: Payload::Raw(vec![]),
                received_at: Utc::now(),
                retry_count: n,
            },
            DeadLetterReason::MaxRetries { retries: n },
        )
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(
            DeadLetterReason::Rejected { status: 422 }.to_string(),
            "rejected with status 422"
        );
        assert_eq!(
            DeadLetterReason::MaxRetries { retries: 5 }.to_string(),
            "max retries exceeded after 5 attempts"
        );
    }

    #[tokio::test]
    async fn test_memory_handler_lists_most_recent_first() {
        let handler = MemoryDeadLetters::default();
        for n in 0..5 {
            handler.handle(letter(n)).await.unwrap();
        }

        let list = handler.list(3).await;
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].message.retry_count, 4);
        assert_eq!(list[2].message.retry_count, 2);
    }

    #[tokio::test]
    async fn test_memory_handler_max_capacity() {
        let handler = MemoryDeadLetters::new(3);
        for n in 0..5 {
            handler.handle(letter(n)).await.unwrap();
        }

        assert_eq!(handler.count().await, 3);
        let list = handler.list(10).await;
        assert_eq!(list[0].message.retry_count, 4);
        assert_eq!(list[2].message.retry_count, 2);
    }

    #[tokio::test]
    async fn test_log_handler_accepts() {
        tokio_test::assert_ok!(LogDeadLetters.handle(letter(1)).await);
    }
}
