use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::providers::BackendAdapter;
use crate::service::events::{EventBus, ServiceEvent};
use crate::service::stats::{BackendStatus, HealthRecord};

type BackendMap = HashMap<String, Arc<dyn BackendAdapter>>;
type HealthMap = HashMap<String, HealthRecord>;

/// Periodic background prober. Each tick, every registered backend is
/// probed in its own task so one slow provider never delays the others.
/// Probe failures update the health record and are otherwise swallowed.
pub struct HealthMonitor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    pub fn spawn(
        backends: Arc<RwLock<BackendMap>>,
        health: Arc<RwLock<HealthMap>>,
        events: EventBus,
        interval: Duration,
    ) -> Self {
        let (shutdown, mut rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!("Health monitor started, probing every {:?}", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        probe_all(&backends, &health, &events);
                    }
                    _ = rx.changed() => break,
                }
            }
            debug!("Health monitor stopped");
        });

        Self { shutdown, handle }
    }

    pub fn stop(self) {
        let _ = self.shutdown.send(true);
        // in-flight probes are detached and finish on their own
        drop(self.handle);
    }
}

/// Fans out one detached probe task per backend. Returns immediately; a
/// hung probe only affects its own backend's record.
fn probe_all(
    backends: &Arc<RwLock<BackendMap>>,
    health: &Arc<RwLock<HealthMap>>,
    events: &EventBus,
) {
    let targets: Vec<(String, Arc<dyn BackendAdapter>)> = backends
        .read()
        .iter()
        .map(|(id, adapter)| (id.clone(), adapter.clone()))
        .collect();

    for (backend_id, adapter) in targets {
        let health = health.clone();
        let events = events.clone();
        tokio::spawn(async move {
            probe_backend(backend_id, adapter, health, events).await;
        });
    }
}

async fn probe_backend(
    backend_id: String,
    adapter: Arc<dyn BackendAdapter>,
    health: Arc<RwLock<HealthMap>>,
    events: EventBus,
) {
    // Backends under maintenance keep their operator-set status.
    match health.read().get(&backend_id) {
        Some(record) if record.status == BackendStatus::Maintenance => return,
        Some(_) => {}
        None => return,
    }

    let configured = adapter.configured_models();

    let updated = if let Some(model_id) = configured.first() {
        let started = Instant::now();
        let outcome = adapter.test_connection(model_id).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut map = health.write();
        let record = match map.get_mut(&backend_id) {
            Some(record) => record,
            // backend was unregistered while the probe was in flight
            None => return,
        };
        let previous_status = record.status;

        match outcome {
            Ok(true) => record.record_probe_success(elapsed_ms),
            Ok(false) => {
                warn!("Connection test failed for '{}'", backend_id);
                record.record_probe_error("connection test returned false");
            }
            Err(e) => {
                warn!("Health probe for '{}' errored: {}", backend_id, e);
                record.record_probe_error(e.to_string());
            }
        }

        let snapshot = record.clone();
        drop(map);

        if snapshot.status != previous_status {
            events.emit(ServiceEvent::StatusChanged {
                backend_id: backend_id.clone(),
                status: snapshot.status,
            });
        }
        snapshot
    } else {
        let mut map = health.write();
        let record = match map.get_mut(&backend_id) {
            Some(record) => record,
            None => return,
        };
        record.mark_inactive("no models configured");
        record.clone()
    };

    events.emit(ServiceEvent::HealthUpdated {
        backend_id,
        health: updated,
    });
}
