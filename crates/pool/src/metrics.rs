//! Metrics collection for pool events.
//!
//! Subscribes to a pool's [`EventBus`] and translates events into counters
//! and histograms via the `metrics` crate. Every series carries an `alias`
//! label.
//!
//! Gated behind the `metrics` feature.

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, PoolEvent};

/// Background collector that records pool events as metrics.
///
/// # Usage
///
/// ```rust,ignore
/// let collector = MetricsCollector::new(pool.events());
/// let cancel = CancellationToken::new();
/// tokio::spawn(collector.run(cancel));
/// ```
pub struct MetricsCollector {
    receiver: broadcast::Receiver<PoolEvent>,
}

impl MetricsCollector {
    /// Create a collector subscribed to the given event bus.
    #[must_use]
    pub fn new(event_bus: &EventBus) -> Self {
        Self {
            receiver: event_bus.subscribe(),
        }
    }

    /// Consume events until the bus is dropped or `cancel` fires.
    ///
    /// Lagged events are skipped with a warning.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                result = self.receiver.recv() => {
                    match result {
                        Ok(event) => Self::record_event(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "metrics collector lagged behind pool events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    }

    fn record_event(event: &PoolEvent) {
        match event {
            PoolEvent::Born { alias, .. } => {
                metrics::counter!("pool.connection.created.total", "alias" => alias.clone())
                    .increment(1);
            }
            PoolEvent::Served { alias, .. } => {
                metrics::counter!("pool.served.total", "alias" => alias.clone()).increment(1);
            }
            PoolEvent::Refused { alias, .. } => {
                metrics::counter!("pool.refused.total", "alias" => alias.clone()).increment(1);
            }
            PoolEvent::Returned {
                alias, active_time, ..
            } => {
                metrics::histogram!("pool.active.duration_seconds", "alias" => alias.clone())
                    .record(active_time.as_secs_f64());
            }
            PoolEvent::Removed { alias, reason, .. } => {
                metrics::counter!(
                    "pool.connection.removed.total",
                    "alias" => alias.clone(),
                    "reason" => reason_label(reason)
                )
                .increment(1);
            }
            PoolEvent::UpStateChanged { alias, to, .. } => {
                metrics::counter!(
                    "pool.up_state.changes.total",
                    "alias" => alias.clone(),
                    "to" => to.to_string()
                )
                .increment(1);
            }
            PoolEvent::MarkedForExpiry { .. } => {}
        }
    }
}

fn reason_label(reason: &crate::events::RemovalReason) -> &'static str {
    use crate::events::RemovalReason;
    match reason {
        RemovalReason::Expired { .. } => "expired",
        RemovalReason::ExpiryRequested => "expiry_requested",
        RemovalReason::ValidationFailed { .. } => "validation_failed",
        RemovalReason::AppearsClosed => "appears_closed",
        RemovalReason::ActiveTooLong { .. } => "active_too_long",
        RemovalReason::ManuallyKilled => "manually_killed",
        RemovalReason::Discarded => "discarded",
        RemovalReason::Shutdown => "shutdown",
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish()
    }
}

/// Create a [`MetricsCollector`] for a pool's event bus and spawn it.
pub fn spawn_metrics_collector(
    event_bus: &EventBus,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let collector = MetricsCollector::new(event_bus);
    tokio::spawn(collector.run(cancel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RemovalReason;
    use crate::status::{Status, UpState};
    use std::time::Duration;

    #[tokio::test]
    async fn collector_processes_events_without_panic() {
        let bus = EventBus::new(64);
        let cancel = CancellationToken::new();
        let handle = spawn_metrics_collector(&bus, cancel.clone());

        let alias = "db".to_string();
        bus.emit(PoolEvent::Born {
            alias: alias.clone(),
            id: 1,
            status: Status::Active,
        });
        bus.emit(PoolEvent::Returned {
            alias: alias.clone(),
            id: 1,
            active_time: Duration::from_millis(42),
        });
        bus.emit(PoolEvent::Removed {
            alias: alias.clone(),
            id: 1,
            reason: RemovalReason::Shutdown,
        });
        bus.emit(PoolEvent::UpStateChanged {
            alias,
            from: UpState::Busy,
            to: UpState::Quiet,
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }
}
