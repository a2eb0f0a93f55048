//! # a3s-relay
//!
//! Store-and-forward relay from MQTT or NATS to an HTTP ingestion endpoint.
//!
//! ## Overview
//!
//! `a3s-relay` buffers inbound events in a bounded, disk-backed queue and
//! forwards them in batches. Failed deliveries are retried per message with
//! exponential backoff, a circuit breaker stops hammering an unhealthy
//! endpoint, and a periodic sweep drops messages past their retention window.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_relay::{BufferConfig, DeliveryCycle, HttpSender, HttpSenderConfig, PersistentBuffer, Payload};
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_relay::Result<()> {
//! let buffer = Arc::new(PersistentBuffer::open(BufferConfig::default(), "relay-buffer.json")?);
//! buffer.add("tele.sensor", Payload::parse(br#"{"temp": 21.5}"#)).await?;
//!
//! let sender = HttpSender::new(HttpSenderConfig {
//!     url: "https://ingest.example.com/events".to_string(),
//!     ..Default::default()
//! })?;
//! let cycle = DeliveryCycle::new(buffer.clone(), Arc::new(sender));
//! let report = cycle.run_once().await?;
//! println!("{:?}", report.outcome);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **PersistentBuffer** — bounded FIFO, rewritten atomically after every mutation
//! - **BackoffTracker** — per-message retry schedule
//! - **CircuitBreaker** — closed/open/half-open guard on the delivery target
//! - **DeliveryCycle** — one batch attempt and its outcome handling
//! - **RelayService** — delivery, retention and stats on independent tasks
//! - **Ingestor** / **MqttIngest** / **NatsIngest** — inbound events from MQTT topics and NATS subjects

pub mod backoff;
pub mod breaker;
pub mod buffer;
pub mod config;
pub mod dead_letter;
pub mod delivery;
pub mod error;
pub mod ingest;
pub mod sender;
pub mod service;
pub mod store;
pub mod types;

// Re-export core types
pub use backoff::{BackoffEntry, BackoffPolicy, BackoffTracker};
pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use buffer::{BufferConfig, FailureReport, PersistentBuffer, SweepReport};
pub use config::RelayConfig;
pub use dead_letter::{
    DeadLetter, DeadLetterHandler, DeadLetterReason, LogDeadLetters, MemoryDeadLetters,
};
pub use delivery::{CycleOutcome, CycleReport, DeliveryCycle, StatusClass};
pub use error::{RelayError, Result};
pub use ingest::{Ingestor, MqttIngest, NatsIngest};
pub use sender::{HttpSender, HttpSenderConfig, SendResponse, Sender};
pub use service::{RelayService, ServiceIntervals};
pub use store::{FileMessageStore, MemoryMessageStore, MessageStore};
pub use types::{Message, Payload, Stats};
