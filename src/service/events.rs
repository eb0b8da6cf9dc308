use tokio::sync::broadcast;
use tracing::trace;

use crate::service::stats::{BackendStatus, HealthRecord};

/// Lifecycle notifications for external layers (configuration UI,
/// dashboards). Subscribers that lag simply miss events; the core never
/// blocks on delivery.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Registered {
        backend_id: String,
    },
    Unregistered {
        backend_id: String,
    },
    StatusChanged {
        backend_id: String,
        status: BackendStatus,
    },
    HealthUpdated {
        backend_id: String,
        health: HealthRecord,
    },
    ModelConfigured {
        backend_id: String,
        model_id: String,
    },
    ConfigurationError {
        backend_id: String,
        message: String,
    },
    RequestStarted {
        request_id: String,
        backend_id: String,
    },
    RequestCompleted {
        request_id: String,
        backend_id: String,
    },
    RequestFailed {
        request_id: String,
        backend_id: String,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ServiceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.sender.subscribe()
    }

    /// Fire-and-forget; a send error only means nobody is listening.
    pub fn emit(&self, event: ServiceEvent) {
        if self.sender.send(event).is_err() {
            trace!("Event emitted with no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(ServiceEvent::Registered {
            backend_id: "p1".to_string(),
        });

        match rx.recv().await.unwrap() {
            ServiceEvent::Registered { backend_id } => assert_eq!(backend_id, "p1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.emit(ServiceEvent::Unregistered {
            backend_id: "p1".to_string(),
        });
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(ServiceEvent::ModelConfigured {
            backend_id: "p1".to_string(),
            model_id: "m1".to_string(),
        });

        assert!(matches!(
            rx1.recv().await.unwrap(),
            ServiceEvent::ModelConfigured { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            ServiceEvent::ModelConfigured { .. }
        ));
    }
}
