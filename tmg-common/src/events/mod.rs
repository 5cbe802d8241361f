//! Event types for the timing event system
//!
//! Provides pipeline event definitions and the EventBus shared by the
//! pipeline, the notifier and anything else that wants to observe a run.

mod warning_types;

pub use warning_types::{Severity, WarningEvent, WarningKind};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Pipeline event types
///
/// Events are broadcast via EventBus and serialize with a `type` tag so they
/// can be forwarded as JSON unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TmgEvent {
    /// Batch run started
    RunStarted {
        run_id: Uuid,
        /// Pulsars selected for this run
        pulsars: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Master Database scan finished
    IngestCompleted {
        run_id: Uuid,
        /// Files matched by the data-path globs
        discovered: usize,
        /// Rows newly inserted
        catalogued: usize,
        /// Files skipped as unreadable or malformed
        skipped: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// One pulsar finished (any outcome)
    PulsarProcessed {
        run_id: Uuid,
        psr_id: String,
        /// "succeeded", "skipped" or "failed"
        status: String,
        new_toas: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A warning fired for a pulsar
    ///
    /// Triggers:
    /// - Notifier: one outbound message per event
    WarningRaised {
        run_id: Uuid,
        warning: WarningEvent,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Monitoring state written
    MonitoringRefreshed {
        pulsars: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Batch run finished
    RunCompleted {
        run_id: Uuid,
        succeeded: usize,
        skipped: usize,
        failed: usize,
        warnings: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use tmg_common::events::{EventBus, TmgEvent};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(TmgEvent::MonitoringRefreshed {
///     pulsars: 3,
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TmgEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// * `capacity` - Number of events to buffer before dropping old events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<TmgEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: TmgEvent,
    ) -> Result<usize, broadcast::error::SendError<TmgEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: TmgEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_errors() {
        let bus = EventBus::new(10);
        let result = bus.emit(TmgEvent::MonitoringRefreshed {
            pulsars: 0,
            timestamp: chrono::Utc::now(),
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_subscriber_receives_warning() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        let warning = WarningEvent::new(
            "J1234+5678",
            Some(1),
            WarningKind::OutlierToa,
            Severity::Low,
            "Residual at MJD 60400 is 4.2 sigma",
        );
        let run_id = Uuid::new_v4();
        bus.emit(TmgEvent::WarningRaised {
            run_id,
            warning: warning.clone(),
            timestamp: chrono::Utc::now(),
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            TmgEvent::WarningRaised { run_id: got, warning: w, .. } => {
                assert_eq!(got, run_id);
                assert_eq!(w, warning);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = TmgEvent::RunCompleted {
            run_id: Uuid::nil(),
            succeeded: 2,
            skipped: 1,
            failed: 0,
            warnings: 3,
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "RunCompleted");
        assert_eq!(json["succeeded"], 2);
    }

    #[test]
    fn test_capacity_reported() {
        assert_eq!(EventBus::new(42).capacity(), 42);
    }
}
