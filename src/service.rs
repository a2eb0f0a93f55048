//! Periodic relay routines
//!
//! `RelayService` runs delivery, retention and statistics as independent
//! tokio tasks over a shared buffer. Shutdown is observed between ticks, so
//! a routine that is already running finishes before its task exits.

use crate::buffer::PersistentBuffer;
use crate::config::RelayConfig;
use crate::delivery::DeliveryCycle;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Periods of the background routines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceIntervals {
    /// Delivery cycle period
    pub flush: Duration,
    /// Retention sweep period
    pub cleanup: Duration,
    /// Maximum age of a buffered message
    pub retention: Duration,
    /// Statistics log period
    pub stats: Duration,
}

impl Default for ServiceIntervals {
    fn default() -> Self {
        Self {
            flush: Duration::from_secs(10),
            cleanup: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            stats: Duration::from_secs(60),
        }
    }
}

impl ServiceIntervals {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            flush: config.flush_interval(),
            cleanup: config.cleanup_interval(),
            retention: config.retention(),
            stats: config.stats_interval(),
        }
    }
}

/// Running relay routines
pub struct RelayService {
    buffer: Arc<PersistentBuffer>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayService {
    /// Spawn the delivery, retention and stats tasks
    pub fn start(cycle: Arc<DeliveryCycle>, intervals: ServiceIntervals) -> Self {
        let buffer = cycle.buffer().clone();
        let (shutdown, rx) = watch::channel(false);

        let delivery = spawn_periodic("delivery", intervals.flush, rx.clone(), move || {
            let cycle = cycle.clone();
            async move {
                if let Err(e) = cycle.run_once().await {
                    tracing::error!(error = %e, "Delivery cycle failed");
                }
            }
        });

        let retention_buffer = buffer.clone();
        let retention = intervals.retention;
        let cleanup = spawn_periodic("retention", intervals.cleanup, rx.clone(), move || {
            let buffer = retention_buffer.clone();
            async move {
                match buffer.cleanup(retention).await {
                    Ok(report) if report.expired_messages > 0 || report.expired_backoffs > 0 => {
                        tracing::info!(
                            messages = report.expired_messages,
                            backoffs = report.expired_backoffs,
                            "Retention sweep removed expired entries"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Retention sweep failed"),
                }
            }
        });

        let stats_buffer = buffer.clone();
        let stats = spawn_periodic("stats", intervals.stats, rx, move || {
            let buffer = stats_buffer.clone();
            async move {
                let stats = buffer.stats().await;
                tracing::info!(
                    total = stats.total_messages,
                    eligible = stats.eligible_messages,
                    backoff = stats.backoff_entries,
                    breaker = %stats.breaker_state,
                    failures = stats.breaker_failures,
                    dropped = stats.dropped_total,
                    last_flush = ?stats.last_flush,
                    "Buffer statistics"
                );
            }
        });

        tracing::info!(
            flush_secs = intervals.flush.as_secs(),
            cleanup_secs = intervals.cleanup.as_secs(),
            "Relay service started"
        );

        Self {
            buffer,
            shutdown,
            tasks: vec![delivery, cleanup, stats],
        }
    }

    /// Get the buffer
    pub fn buffer(&self) -> &Arc<PersistentBuffer> {
        &self.buffer
    }

    /// Stop scheduling and wait for running routines to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Relay task failed");
            }
        }
        tracing::info!("Relay service stopped");
    }
}

/// Longest period a periodic task is scheduled with
const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Run `routine` every `period` until `shutdown` changes
///
/// The first run happens one period after start.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut routine: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    // tokio intervals panic on a zero period, and the first deadline must
    // stay representable
    let period = period.clamp(Duration::from_millis(1), MAX_PERIOD);

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => routine().await,
            }
        }

        tracing::debug!(task = name, "Periodic task stopped");
    })
}
