//! Supervisor lifecycle events
//!
//! Every state change the supervisor makes (launch, restart, page opened,
//! recovered or closed) is published here. The server forwards them to the
//! client as log notifications; nothing inside the supervisor consumes
//! them. Receivers that fall behind lose the oldest events, never block the
//! supervisor.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::page::PageId;

/// Backlog kept for slow receivers
const EVENT_BACKLOG: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    Started { generation: u64, endpoint: String },
    Stopped,
    Unhealthy { reason: String },
    Restarting { attempt: u32 },
    Restarted { generation: u64, restored_pages: usize },
    /// Restart limit reached; terminal until the next `start()`
    Failed { attempts: u32 },
    PageOpened { page_id: PageId, url: String },
    PageRecovered { old_page_id: PageId, page_id: PageId, recovery_count: u32 },
    PageClosed { page_id: PageId },
}

impl SupervisorEvent {
    /// Log level for forwarding, in the client's vocabulary
    pub fn level(&self) -> &'static str {
        match self {
            SupervisorEvent::Failed { .. } => "error",
            SupervisorEvent::Unhealthy { .. } | SupervisorEvent::Restarting { .. } => "warning",
            SupervisorEvent::PageOpened { .. } | SupervisorEvent::PageClosed { .. } => "debug",
            _ => "info",
        }
    }
}

pub struct EventBus {
    sender: broadcast::Sender<SupervisorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BACKLOG);
        Self { sender }
    }

    /// Fire and forget. Returns how many receivers will see the event.
    pub fn publish(&self, event: SupervisorEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                trace!(?event, "no event subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_events_in_order() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(SupervisorEvent::Stopped), 0);

        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.publish(SupervisorEvent::Restarting { attempt: 1 }), 2);
        bus.publish(SupervisorEvent::Failed { attempts: 5 });

        for rx in [&mut first, &mut second] {
            assert_eq!(rx.recv().await.unwrap(), SupervisorEvent::Restarting { attempt: 1 });
            assert_eq!(rx.recv().await.unwrap(), SupervisorEvent::Failed { attempts: 5 });
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for attempt in 0..(EVENT_BACKLOG as u32 + 10) {
            bus.publish(SupervisorEvent::Restarting { attempt });
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(10))
        ));
        assert_eq!(rx.recv().await.unwrap(), SupervisorEvent::Restarting { attempt: 10 });
    }

    #[test]
    fn test_wire_shape_and_level() {
        let event = SupervisorEvent::Restarting { attempt: 2 };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"event": "restarting", "attempt": 2})
        );
        assert_eq!(event.level(), "warning");
        assert_eq!(SupervisorEvent::Failed { attempts: 5 }.level(), "error");
        assert_eq!(SupervisorEvent::Stopped.level(), "info");
    }
}
