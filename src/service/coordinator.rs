use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::{broadcast, oneshot, Semaphore};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheKey, ResponseCache};
use crate::config::RelayConfig;
use crate::credentials::CredentialStore;
use crate::error::{Error, Result};
use crate::providers::{
    create_adapter, validate_credential_format, BackendAdapter, ConfigureOptions,
    GenerationRequest, GenerationResponse,
};
use crate::resilience::{
    CircuitBreaker, ErrorHistory, ErrorRecord, ErrorStatistics, RetryConfig, RetryPolicy,
};
use crate::service::events::{EventBus, ServiceEvent};
use crate::service::health::HealthMonitor;
use crate::service::stats::{HealthRecord, UsageStats};

type BackendMap = HashMap<String, Arc<dyn BackendAdapter>>;
type PendingMap = HashMap<String, oneshot::Sender<Result<GenerationResponse>>>;

/// Handle returned by `send_request`. The request id can be used to cancel;
/// `wait` resolves to the terminal outcome exactly once.
pub struct RequestTicket {
    id: String,
    receiver: oneshot::Receiver<Result<GenerationResponse>>,
}

impl RequestTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolves when the request completes. A dropped registration
    /// (cancellation or coordinator cleanup) resolves to `Cancelled`.
    pub async fn wait(self) -> Result<GenerationResponse> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        }
    }
}

/// Aggregate snapshot across all registered backends.
#[derive(Debug, Clone)]
pub struct CoordinatorSummary {
    pub total_backends: usize,
    pub active_backends: usize,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub total_cost: Decimal,
    pub backend_status: HashMap<String, String>,
}

/// Owns the backend registry and applies breaker, retry and cache policy
/// around every dispatch. Constructed once at process start and passed by
/// handle; all shared state is behind per-structure locks so requests to
/// different backends do not contend.
pub struct Coordinator {
    config: RelayConfig,
    backends: Arc<RwLock<BackendMap>>,
    breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
    health: Arc<RwLock<HashMap<String, HealthRecord>>>,
    stats: Arc<RwLock<HashMap<String, UsageStats>>>,
    cache: Arc<ResponseCache>,
    history: Arc<ErrorHistory>,
    retry_policy: Arc<Mutex<RetryPolicy>>,
    events: EventBus,
    pending: Arc<Mutex<PendingMap>>,
    workers: Arc<Semaphore>,
    credential_store: Option<Arc<dyn CredentialStore>>,
}

impl Coordinator {
    pub fn new(config: RelayConfig) -> Self {
        info!(
            "Initializing coordinator: {} workers, breaker threshold {}, cache capacity {}",
            config.max_workers, config.breaker.failure_threshold, config.cache.capacity
        );

        Self {
            cache: Arc::new(ResponseCache::new(config.cache.clone())),
            history: Arc::new(ErrorHistory::new(config.error_history_limit)),
            retry_policy: Arc::new(Mutex::new(RetryPolicy::new(config.retry.clone()))),
            workers: Arc::new(Semaphore::new(config.max_workers)),
            backends: Arc::new(RwLock::new(HashMap::new())),
            breakers: Arc::new(RwLock::new(HashMap::new())),
            health: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(HashMap::new())),
            events: EventBus::default(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            credential_store: None,
            config,
        }
    }

    pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credential_store = Some(store);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    /// Constructs the adapter for a known provider id via the factory and
    /// registers it.
    pub fn register_backend(&self, backend_id: &str) -> Result<()> {
        let adapter = create_adapter(backend_id)?;
        self.register_adapter(adapter)
    }

    /// Registers an externally constructed adapter. Initializes its
    /// breaker, health record and usage stats.
    pub fn register_adapter(&self, adapter: Arc<dyn BackendAdapter>) -> Result<()> {
        let backend_id = adapter.provider_id().to_string();

        {
            let mut backends = self.backends.write();
            if backends.contains_key(&backend_id) {
                return Err(Error::validation(format!(
                    "backend '{}' is already registered",
                    backend_id
                )));
            }
            backends.insert(backend_id.clone(), adapter);
        }

        self.breakers.write().insert(
            backend_id.clone(),
            Arc::new(CircuitBreaker::new(
                backend_id.clone(),
                self.config.breaker.failure_threshold,
                Duration::from_secs(self.config.breaker.recovery_timeout_secs),
            )),
        );
        self.health
            .write()
            .insert(backend_id.clone(), HealthRecord::new(&backend_id));
        self.stats
            .write()
            .insert(backend_id.clone(), UsageStats::new(&backend_id));

        info!("Registered backend '{}'", backend_id);
        self.events.emit(ServiceEvent::Registered {
            backend_id: backend_id.clone(),
        });
        Ok(())
    }

    /// Removes a backend and all its associated state.
    pub fn unregister_backend(&self, backend_id: &str) -> Result<()> {
        let removed = self.backends.write().remove(backend_id);
        if removed.is_none() {
            return Err(Error::validation(format!(
                "backend '{}' is not registered",
                backend_id
            )));
        }

        self.breakers.write().remove(backend_id);
        self.health.write().remove(backend_id);
        self.stats.write().remove(backend_id);

        info!("Unregistered backend '{}'", backend_id);
        self.events.emit(ServiceEvent::Unregistered {
            backend_id: backend_id.to_string(),
        });
        Ok(())
    }

    /// Validates the credential format for the provider, then delegates to
    /// the adapter. The secret is forwarded, never persisted here.
    pub async fn configure_model(
        &self,
        backend_id: &str,
        model_id: &str,
        credential: &str,
        options: &ConfigureOptions,
    ) -> Result<()> {
        let adapter = self.adapter(backend_id)?;

        if !validate_credential_format(backend_id, credential) {
            let message = format!("credential format invalid for provider '{}'", backend_id);
            self.events.emit(ServiceEvent::ConfigurationError {
                backend_id: backend_id.to_string(),
                message: message.clone(),
            });
            return Err(Error::credential(message));
        }

        match adapter.configure_model(model_id, credential, options).await {
            Ok(()) => {
                if let Some(store) = &self.credential_store {
                    let mut metadata = HashMap::new();
                    metadata.insert("model_id".to_string(), model_id.to_string());
                    metadata.insert("configured_at".to_string(), Utc::now().to_rfc3339());
                    store.store_credential(backend_id, credential, metadata);
                }

                info!("Configured model '{}.{}'", backend_id, model_id);
                self.events.emit(ServiceEvent::ModelConfigured {
                    backend_id: backend_id.to_string(),
                    model_id: model_id.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                warn!("Failed to configure '{}.{}': {}", backend_id, model_id, e);
                self.events.emit(ServiceEvent::ConfigurationError {
                    backend_id: backend_id.to_string(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Dispatches a request. Returns synchronously with a ticket; the
    /// outcome arrives through the ticket exactly once. Cache hits and
    /// breaker rejections resolve immediately without a worker.
    pub fn send_request(
        &self,
        backend_id: &str,
        model_id: &str,
        mut request: GenerationRequest,
    ) -> Result<RequestTicket> {
        let adapter = self.adapter(backend_id)?;

        if !adapter.configured_models().iter().any(|m| m == model_id) {
            return Err(Error::validation(format!(
                "model '{}.{}' is not configured",
                backend_id, model_id
            )));
        }

        request.model_id = model_id.to_string();
        let request_id = Uuid::new_v4().to_string();
        let cache_key = CacheKey::new(backend_id, model_id, &request.prompt);

        // Cache hit short-circuits breaker, retry and stats entirely.
        if let Some(cached) = self.cache.get(&cache_key) {
            debug!(
                "Cache hit for '{}.{}', resolving request {} immediately",
                backend_id, model_id, request_id
            );
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Ok(cached));
            return Ok(RequestTicket {
                id: request_id,
                receiver: rx,
            });
        }

        let breaker = self.breaker(backend_id)?;

        // Fast-fail while open: resolve immediately, leave stats untouched.
        if breaker.would_reject() {
            let error = Error::CircuitOpen {
                backend: backend_id.to_string(),
            };
            self.history.record(ErrorRecord::from_error(
                &error,
                backend_id,
                model_id,
                &request_id,
            ));
            self.events.emit(ServiceEvent::RequestFailed {
                request_id: request_id.clone(),
                backend_id: backend_id.to_string(),
                message: error.to_string(),
            });

            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Err(error));
            return Ok(RequestTicket {
                id: request_id,
                receiver: rx,
            });
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        self.events.emit(ServiceEvent::RequestStarted {
            request_id: request_id.clone(),
            backend_id: backend_id.to_string(),
        });

        let ctx = DispatchContext {
            backend_id: backend_id.to_string(),
            model_id: model_id.to_string(),
            request_id: request_id.clone(),
            adapter,
            breaker,
            policy: self.retry_policy.clone(),
            cache: self.cache.clone(),
            cache_key,
            history: self.history.clone(),
            stats: self.stats.clone(),
            health: self.health.clone(),
            pending: self.pending.clone(),
            events: self.events.clone(),
            workers: self.workers.clone(),
        };

        tokio::spawn(ctx.run(request));

        Ok(RequestTicket {
            id: request_id,
            receiver: rx,
        })
    }

    /// Best-effort: removes the pending registration so a late completion
    /// is dropped silently. The in-flight network call is not aborted.
    pub fn cancel_request(&self, request_id: &str) -> bool {
        let cancelled = self.pending.lock().remove(request_id).is_some();
        if cancelled {
            debug!("Cancelled request {}", request_id);
        }
        cancelled
    }

    pub async fn test_connection(&self, backend_id: &str, model_id: &str) -> Result<bool> {
        let adapter = self.adapter(backend_id)?;
        adapter.test_connection(model_id).await
    }

    pub fn estimate_cost(&self, backend_id: &str, model_id: &str, prompt: &str) -> Decimal {
        match self.adapter(backend_id) {
            Ok(adapter) => adapter.estimate_cost(&GenerationRequest::new(prompt, model_id)),
            Err(_) => Decimal::ZERO,
        }
    }

    pub fn get_health(&self, backend_id: &str) -> Option<HealthRecord> {
        self.health.read().get(backend_id).cloned()
    }

    pub fn get_usage_stats(&self, backend_id: &str) -> Option<UsageStats> {
        self.stats.read().get(backend_id).cloned()
    }

    /// Breaker state per backend, as coarse state labels.
    pub fn get_circuit_breaker_status(&self) -> HashMap<String, String> {
        self.breakers
            .read()
            .iter()
            .map(|(id, breaker)| (id.clone(), breaker.state().as_str().to_string()))
            .collect()
    }

    pub fn get_error_statistics(&self) -> ErrorStatistics {
        self.history.statistics()
    }

    pub fn reset_circuit_breaker(&self, backend_id: &str) -> bool {
        match self.breakers.read().get(backend_id) {
            Some(breaker) => {
                breaker.force_close();
                info!("Reset circuit breaker for '{}'", backend_id);
                true
            }
            None => false,
        }
    }

    /// Operator toggle. While in maintenance the health monitor leaves the
    /// backend's status alone; clearing it returns the backend to inactive
    /// until the next probe.
    pub fn set_maintenance(&self, backend_id: &str, enabled: bool) -> bool {
        let status = {
            let mut health = self.health.write();
            match health.get_mut(backend_id) {
                Some(record) => {
                    record.set_maintenance(enabled);
                    record.status
                }
                None => return false,
            }
        };

        info!(
            "Backend '{}' maintenance {}",
            backend_id,
            if enabled { "enabled" } else { "cleared" }
        );
        self.events.emit(ServiceEvent::StatusChanged {
            backend_id: backend_id.to_string(),
            status,
        });
        true
    }

    pub fn reset_usage_stats(&self, backend_id: &str) -> bool {
        match self.stats.write().get_mut(backend_id) {
            Some(stats) => {
                stats.reset();
                info!("Reset usage stats for '{}'", backend_id);
                true
            }
            None => false,
        }
    }

    pub fn update_retry_config(&self, config: RetryConfig) {
        self.retry_policy.lock().update_config(config);
        info!("Updated retry configuration");
    }

    /// Models each backend can serve, configured or not.
    pub fn available_models(&self) -> HashMap<String, Vec<String>> {
        self.backends
            .read()
            .iter()
            .map(|(id, adapter)| (id.clone(), adapter.available_models()))
            .collect()
    }

    /// Configured models per backend, omitting backends with none.
    pub fn configured_models(&self) -> HashMap<String, Vec<String>> {
        self.backends
            .read()
            .iter()
            .filter_map(|(id, adapter)| {
                let models = adapter.configured_models();
                (!models.is_empty()).then(|| (id.clone(), models))
            })
            .collect()
    }

    pub fn get_summary(&self) -> CoordinatorSummary {
        let health = self.health.read();
        let stats = self.stats.read();

        CoordinatorSummary {
            total_backends: self.backends.read().len(),
            active_backends: health
                .values()
                .filter(|h| h.status == crate::service::stats::BackendStatus::Active)
                .count(),
            total_requests: stats.values().map(|s| s.total_requests).sum(),
            total_tokens: stats.values().map(|s| s.total_tokens).sum(),
            total_cost: stats.values().map(|s| s.total_cost).sum(),
            backend_status: health
                .iter()
                .map(|(id, h)| (id.clone(), h.status.as_str().to_string()))
                .collect(),
        }
    }

    pub fn cache_hit_count(&self) -> u64 {
        self.cache.hit_count()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Starts the periodic health monitor over this coordinator's
    /// registry. The returned handle stops the task.
    pub fn start_health_monitor(&self) -> HealthMonitor {
        HealthMonitor::spawn(
            self.backends.clone(),
            self.health.clone(),
            self.events.clone(),
            Duration::from_secs(self.config.health.check_interval_secs),
        )
    }

    /// Releases all state. Pending waiters resolve to `Cancelled`.
    pub fn cleanup(&self) {
        self.pending.lock().clear();
        self.backends.write().clear();
        self.breakers.write().clear();
        self.health.write().clear();
        self.stats.write().clear();
        self.cache.clear();
        self.history.clear();
        info!("Coordinator cleaned up");
    }

    fn adapter(&self, backend_id: &str) -> Result<Arc<dyn BackendAdapter>> {
        self.backends
            .read()
            .get(backend_id)
            .cloned()
            .ok_or_else(|| Error::validation(format!("backend '{}' is not registered", backend_id)))
    }

    fn breaker(&self, backend_id: &str) -> Result<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .get(backend_id)
            .cloned()
            .ok_or_else(|| Error::validation(format!("backend '{}' is not registered", backend_id)))
    }
}

/// Everything one dispatched request needs, cloned out of the coordinator
/// so the worker task holds no reference back to it.
struct DispatchContext {
    backend_id: String,
    model_id: String,
    request_id: String,
    adapter: Arc<dyn BackendAdapter>,
    breaker: Arc<CircuitBreaker>,
    // shared, not a snapshot: config updates apply to in-flight requests
    policy: Arc<Mutex<RetryPolicy>>,
    cache: Arc<ResponseCache>,
    cache_key: CacheKey,
    history: Arc<ErrorHistory>,
    stats: Arc<RwLock<HashMap<String, UsageStats>>>,
    health: Arc<RwLock<HashMap<String, HealthRecord>>>,
    pending: Arc<Mutex<PendingMap>>,
    events: EventBus,
    workers: Arc<Semaphore>,
}

impl DispatchContext {
    async fn run(self, request: GenerationRequest) {
        let started = Instant::now();

        let _permit = match self.workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.deliver(Err(Error::unknown("worker pool is shut down")));
                return;
            }
        };

        let (outcome, backend_called) = self.execute_with_retry(&request).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) => {
                {
                    let mut stats = self.stats.write();
                    if let Some(entry) = stats.get_mut(&self.backend_id) {
                        entry.record_success(
                            response.usage.total_tokens as u64,
                            response.cost,
                            elapsed_ms,
                        );
                    }
                }
                if let Some(entry) = self.health.write().get_mut(&self.backend_id) {
                    entry.record_call_outcome(true);
                }
                self.cache.put(self.cache_key.clone(), response.clone());

                debug!(
                    "Request {} to '{}.{}' completed in {}ms",
                    self.request_id, self.backend_id, self.model_id, elapsed_ms
                );
                self.events.emit(ServiceEvent::RequestCompleted {
                    request_id: self.request_id.clone(),
                    backend_id: self.backend_id.clone(),
                });
                self.deliver(Ok(response));
            }
            Err(error) => {
                // Rejections that never reached the backend leave stats
                // untouched; real attempts count as a failed request even
                // when the breaker opened mid-retry.
                if backend_called {
                    {
                        let mut stats = self.stats.write();
                        if let Some(entry) = stats.get_mut(&self.backend_id) {
                            entry.record_failure(elapsed_ms);
                        }
                    }
                    if let Some(entry) = self.health.write().get_mut(&self.backend_id) {
                        entry.record_call_outcome(false);
                    }
                }

                self.events.emit(ServiceEvent::RequestFailed {
                    request_id: self.request_id.clone(),
                    backend_id: self.backend_id.clone(),
                    message: error.to_string(),
                });
                self.deliver(Err(error));
            }
        }
    }

    /// The resubmission loop: each failed attempt is classified, recorded,
    /// and either retried after the computed backoff or surfaced as
    /// terminal. Breaker rejections are never retried here; the breaker's
    /// recovery timeout governs that at a coarser grain. The bool reports
    /// whether the backend was actually invoked at least once.
    async fn execute_with_retry(
        &self,
        request: &GenerationRequest,
    ) -> (Result<GenerationResponse>, bool) {
        let mut attempt: u32 = 0;
        let mut backend_called = false;

        loop {
            let result = self
                .breaker
                .call(|| self.adapter.send_request(request))
                .await;

            match result {
                Ok(response) => return (Ok(response), true),
                Err(error @ Error::CircuitOpen { .. }) => {
                    self.history.record(
                        ErrorRecord::from_error(
                            &error,
                            &self.backend_id,
                            &self.model_id,
                            &self.request_id,
                        )
                        .with_retry_count(attempt),
                    );
                    return (Err(error), backend_called);
                }
                Err(error) => {
                    backend_called = true;
                    let record = ErrorRecord::from_error(
                        &error,
                        &self.backend_id,
                        &self.model_id,
                        &self.request_id,
                    )
                    .with_retry_count(attempt);

                    let (should_retry, delay) = {
                        let policy = self.policy.lock();
                        (policy.should_retry(&record), policy.next_delay(&record))
                    };
                    self.history.record(record);

                    if !should_retry {
                        let terminal = if attempt > 0 {
                            Error::RetriesExhausted {
                                backend: self.backend_id.clone(),
                                attempts: attempt + 1,
                                last: error.to_string(),
                            }
                        } else {
                            error
                        };
                        return (Err(terminal), true);
                    }

                    debug!(
                        "Retrying request {} to '{}' in {:?} (attempt {})",
                        self.request_id,
                        self.backend_id,
                        delay,
                        attempt + 1
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Resolves the ticket exactly once. A missing registration means the
    /// request was cancelled; the outcome is dropped silently.
    fn deliver(&self, result: Result<GenerationResponse>) {
        let sender = self.pending.lock().remove(&self.request_id);
        match sender {
            Some(tx) => {
                if tx.send(result).is_err() {
                    debug!("Receiver for request {} went away", self.request_id);
                }
            }
            None => {
                debug!(
                    "Request {} was cancelled, dropping late completion",
                    self.request_id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ModelDescriptor, TokenUsage};
    use crate::service::stats::BackendStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    /// Scriptable adapter: fails the first `fail_times` sends with a given
    /// message, counts invocations, optionally parks until released.
    struct MockAdapter {
        id: String,
        failure_message: String,
        fail_times: AtomicU32,
        invocations: AtomicU32,
        hold: Option<Arc<Notify>>,
        configured: parking_lot::RwLock<Vec<String>>,
    }

    impl MockAdapter {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                failure_message: "connection refused".to_string(),
                fail_times: AtomicU32::new(0),
                invocations: AtomicU32::new(0),
                hold: None,
                configured: parking_lot::RwLock::new(Vec::new()),
            })
        }

        fn failing(id: &str, times: u32, message: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                failure_message: message.to_string(),
                fail_times: AtomicU32::new(times),
                invocations: AtomicU32::new(0),
                hold: None,
                configured: parking_lot::RwLock::new(Vec::new()),
            })
        }

        fn holding(id: &str, hold: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                failure_message: "connection refused".to_string(),
                fail_times: AtomicU32::new(0),
                invocations: AtomicU32::new(0),
                hold: Some(hold),
                configured: parking_lot::RwLock::new(Vec::new()),
            })
        }

        fn holding_failing(id: &str, hold: Arc<Notify>, times: u32, message: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                failure_message: message.to_string(),
                fail_times: AtomicU32::new(times),
                invocations: AtomicU32::new(0),
                hold: Some(hold),
                configured: parking_lot::RwLock::new(Vec::new()),
            })
        }

        fn invocations(&self) -> u32 {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackendAdapter for MockAdapter {
        fn provider_id(&self) -> &str {
            &self.id
        }

        fn display_name(&self) -> &str {
            "Mock"
        }

        fn available_models(&self) -> Vec<String> {
            vec!["mock-model".to_string()]
        }

        async fn configure_model(
            &self,
            model_id: &str,
            _credential: &str,
            _options: &ConfigureOptions,
        ) -> Result<()> {
            self.configured.write().push(model_id.to_string());
            Ok(())
        }

        async fn send_request(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
            self.invocations.fetch_add(1, Ordering::SeqCst);

            if let Some(hold) = &self.hold {
                hold.notified().await;
            }

            let remaining = self.fail_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_times.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::backend(self.failure_message.clone()));
            }

            Ok(GenerationResponse::new(
                format!("echo: {}", request.prompt),
                TokenUsage::new(5, 10),
                "stop",
            ))
        }

        async fn test_connection(&self, _model_id: &str) -> Result<bool> {
            Ok(self.fail_times.load(Ordering::SeqCst) == 0)
        }

        fn estimate_cost(&self, _request: &GenerationRequest) -> Decimal {
            Decimal::ZERO
        }

        fn get_model_info(&self, _model_id: &str) -> Option<ModelDescriptor> {
            None
        }

        fn configured_models(&self) -> Vec<String> {
            self.configured.read().clone()
        }
    }

    fn test_config() -> RelayConfig {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let mut config = RelayConfig::default();
        config.breaker.failure_threshold = 3;
        config.retry.jitter = false;
        config
    }

    async fn configured_coordinator(
        adapter: Arc<MockAdapter>,
        config: RelayConfig,
    ) -> Coordinator {
        let coordinator = Coordinator::new(config);
        coordinator.register_adapter(adapter.clone()).unwrap();
        coordinator
            .configure_model(adapter.provider_id(), "mock-model", "sk-0123456789abcdef", &ConfigureOptions::new())
            .await
            .unwrap();
        coordinator
    }

    #[tokio::test]
    async fn test_register_and_duplicate() {
        let coordinator = Coordinator::new(test_config());
        let mut events = coordinator.subscribe();

        coordinator.register_adapter(MockAdapter::new("p1")).unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            ServiceEvent::Registered { .. }
        ));

        let duplicate = coordinator.register_adapter(MockAdapter::new("p1"));
        assert!(duplicate.is_err());

        // breaker, health and stats exist for the registered backend
        assert!(coordinator.get_health("p1").is_some());
        assert!(coordinator.get_usage_stats("p1").is_some());
        assert_eq!(
            coordinator.get_circuit_breaker_status().get("p1").unwrap(),
            "closed"
        );
    }

    #[tokio::test]
    async fn test_unregister_clears_state() {
        let coordinator = Coordinator::new(test_config());
        coordinator.register_adapter(MockAdapter::new("p1")).unwrap();

        coordinator.unregister_backend("p1").unwrap();
        assert!(coordinator.get_health("p1").is_none());
        assert!(coordinator.get_usage_stats("p1").is_none());
        assert!(coordinator.unregister_backend("p1").is_err());
    }

    #[tokio::test]
    async fn test_configure_rejects_bad_credential_format() {
        let coordinator = Coordinator::new(test_config());
        coordinator.register_adapter(MockAdapter::new("wenxin")).unwrap();
        let mut events = coordinator.subscribe();

        let result = coordinator
            .configure_model("wenxin", "ernie-bot", "not-compound", &ConfigureOptions::new())
            .await;
        assert!(matches!(result, Err(Error::Credential(_))));
        assert!(matches!(
            events.recv().await.unwrap(),
            ServiceEvent::ConfigurationError { .. }
        ));
    }

    #[tokio::test]
    async fn test_configure_forwards_to_credential_store() {
        let store = Arc::new(crate::credentials::MemoryCredentialStore::new());
        let coordinator = Coordinator::new(test_config()).with_credential_store(store.clone());
        coordinator.register_adapter(MockAdapter::new("p1")).unwrap();

        coordinator
            .configure_model("p1", "mock-model", "sk-0123456789abcdef", &ConfigureOptions::new())
            .await
            .unwrap();

        use crate::credentials::CredentialStore;
        assert_eq!(
            store.get_credential("p1").as_deref(),
            Some("sk-0123456789abcdef")
        );
    }

    #[tokio::test]
    async fn test_send_to_unknown_backend_or_model() {
        let coordinator = Coordinator::new(test_config());
        assert!(coordinator
            .send_request("ghost", "m", GenerationRequest::new("hi", "m"))
            .is_err());

        coordinator.register_adapter(MockAdapter::new("p1")).unwrap();
        // registered but model not configured
        assert!(coordinator
            .send_request("p1", "mock-model", GenerationRequest::new("hi", "mock-model"))
            .is_err());
    }

    #[tokio::test]
    async fn test_successful_request_updates_stats_and_cache() {
        let adapter = MockAdapter::new("p1");
        let coordinator = configured_coordinator(adapter.clone(), test_config()).await;

        let ticket = coordinator
            .send_request("p1", "mock-model", GenerationRequest::new("hello", "mock-model"))
            .unwrap();
        let response = ticket.wait().await.unwrap();
        assert_eq!(response.content, "echo: hello");

        let stats = coordinator.get_usage_stats("p1").unwrap();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.total_tokens, 15);

        let health = coordinator.get_health("p1").unwrap();
        assert_eq!(health.success_count, 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_adapter_and_stats() {
        let adapter = MockAdapter::new("p1");
        let coordinator = configured_coordinator(adapter.clone(), test_config()).await;

        let request = GenerationRequest::new("same prompt", "mock-model");
        let first = coordinator
            .send_request("p1", "mock-model", request.clone())
            .unwrap();
        first.wait().await.unwrap();

        let second = coordinator
            .send_request("p1", "mock-model", request)
            .unwrap();
        let response = second.wait().await.unwrap();

        assert_eq!(response.content, "echo: same prompt");
        assert_eq!(adapter.invocations(), 1);
        assert_eq!(coordinator.cache_hit_count(), 1);
        // only the first dispatch touched stats
        assert_eq!(coordinator.get_usage_stats("p1").unwrap().total_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_rejects_without_invocation() {
        // auth failures are never retried, so each send is one invocation
        let adapter = MockAdapter::failing("p1", 10, "401 unauthorized");
        let coordinator = configured_coordinator(adapter.clone(), test_config()).await;

        for i in 0..3 {
            let ticket = coordinator
                .send_request(
                    "p1",
                    "mock-model",
                    GenerationRequest::new(format!("prompt {}", i), "mock-model"),
                )
                .unwrap();
            assert!(ticket.wait().await.is_err());
        }

        assert_eq!(adapter.invocations(), 3);
        assert_eq!(
            coordinator.get_circuit_breaker_status().get("p1").unwrap(),
            "open"
        );

        // fourth call fails fast: zero new invocations, stats untouched
        let ticket = coordinator
            .send_request("p1", "mock-model", GenerationRequest::new("prompt 4", "mock-model"))
            .unwrap();
        let result = ticket.wait().await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(adapter.invocations(), 3);
        assert_eq!(coordinator.get_usage_stats("p1").unwrap().total_requests, 3);

        // operator reset closes the breaker again
        assert!(coordinator.reset_circuit_breaker("p1"));
        assert_eq!(
            coordinator.get_circuit_breaker_status().get("p1").unwrap(),
            "closed"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_success() {
        let adapter = MockAdapter::failing("p1", 2, "connection refused");
        let coordinator = configured_coordinator(adapter.clone(), test_config()).await;

        let ticket = coordinator
            .send_request("p1", "mock-model", GenerationRequest::new("hello", "mock-model"))
            .unwrap();
        let response = ticket.wait().await.unwrap();

        assert_eq!(response.content, "echo: hello");
        assert_eq!(adapter.invocations(), 3);

        let stats = coordinator.get_usage_stats("p1").unwrap();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.successful_requests, 1);

        // both failed attempts were recorded
        let errors = coordinator.get_error_statistics();
        assert_eq!(errors.total_errors, 2);
        assert_eq!(errors.by_kind.get("network"), Some(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_is_terminal() {
        let mut config = test_config();
        config.retry.max_retries = 2;
        config.breaker.failure_threshold = 10;

        let adapter = MockAdapter::failing("p1", 10, "connection refused");
        let coordinator = configured_coordinator(adapter.clone(), config).await;

        let ticket = coordinator
            .send_request("p1", "mock-model", GenerationRequest::new("hello", "mock-model"))
            .unwrap();
        let result = ticket.wait().await;

        match result {
            Err(Error::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetriesExhausted, got {:?}", other.map(|r| r.content)),
        }

        // initial attempt plus two retries
        assert_eq!(adapter.invocations(), 3);
        let stats = coordinator.get_usage_stats("p1").unwrap();
        assert_eq!(stats.failed_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opening_mid_retry_still_counts_failure() {
        // threshold 3, max_retries 3: three real network failures open the
        // breaker, the fourth loop pass is rejected and ends the request
        let adapter = MockAdapter::failing("p1", 10, "connection refused");
        let coordinator = configured_coordinator(adapter.clone(), test_config()).await;

        let ticket = coordinator
            .send_request("p1", "mock-model", GenerationRequest::new("hello", "mock-model"))
            .unwrap();
        let result = ticket.wait().await;

        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(adapter.invocations(), 3);
        assert_eq!(
            coordinator.get_circuit_breaker_status().get("p1").unwrap(),
            "open"
        );

        // the attempts reached the backend, so the request is a failure
        let stats = coordinator.get_usage_stats("p1").unwrap();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(coordinator.get_health("p1").unwrap().error_count, 1);
    }

    #[tokio::test]
    async fn test_set_maintenance_toggles_status() {
        let coordinator = Coordinator::new(test_config());
        coordinator.register_adapter(MockAdapter::new("p1")).unwrap();
        let mut events = coordinator.subscribe();

        assert!(coordinator.set_maintenance("p1", true));
        assert_eq!(
            coordinator.get_health("p1").unwrap().status,
            BackendStatus::Maintenance
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            ServiceEvent::StatusChanged {
                status: BackendStatus::Maintenance,
                ..
            }
        ));

        assert!(coordinator.set_maintenance("p1", false));
        assert_eq!(
            coordinator.get_health("p1").unwrap().status,
            BackendStatus::Inactive
        );

        assert!(!coordinator.set_maintenance("ghost", true));
    }

    #[tokio::test]
    async fn test_retry_config_update_applies_to_inflight_requests() {
        let hold = Arc::new(Notify::new());
        let adapter = MockAdapter::holding_failing("p1", hold.clone(), 10, "connection refused");
        let coordinator = configured_coordinator(adapter.clone(), test_config()).await;

        let ticket = coordinator
            .send_request("p1", "mock-model", GenerationRequest::new("hello", "mock-model"))
            .unwrap();

        // first attempt is parked inside the adapter; disable retries now
        let mut retry = RetryConfig::default();
        retry.max_retries = 0;
        coordinator.update_retry_config(retry);

        hold.notify_one();
        let result = ticket.wait().await;

        // the updated policy was consulted after the attempt failed
        assert!(matches!(result, Err(Error::Backend(_))));
        assert_eq!(adapter.invocations(), 1);
        assert_eq!(coordinator.get_usage_stats("p1").unwrap().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_cancel_suppresses_delivery() {
        let hold = Arc::new(Notify::new());
        let adapter = MockAdapter::holding("p1", hold.clone());
        let coordinator = configured_coordinator(adapter.clone(), test_config()).await;

        let ticket = coordinator
            .send_request("p1", "mock-model", GenerationRequest::new("hello", "mock-model"))
            .unwrap();
        let request_id = ticket.id().to_string();

        assert!(coordinator.cancel_request(&request_id));
        assert!(!coordinator.cancel_request(&request_id));

        hold.notify_one();
        // late completion is dropped; the waiter observes cancellation
        assert!(matches!(ticket.wait().await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_backends_complete_independently() {
        let hold = Arc::new(Notify::new());
        let blocked = MockAdapter::holding("blocked", hold.clone());
        let healthy = MockAdapter::new("healthy");

        let coordinator = Coordinator::new(test_config());
        coordinator.register_adapter(blocked.clone()).unwrap();
        coordinator.register_adapter(healthy.clone()).unwrap();
        for id in ["blocked", "healthy"] {
            coordinator
                .configure_model(id, "mock-model", "sk-0123456789abcdef", &ConfigureOptions::new())
                .await
                .unwrap();
        }

        let stuck = coordinator
            .send_request("blocked", "mock-model", GenerationRequest::new("hi", "mock-model"))
            .unwrap();
        let quick = coordinator
            .send_request("healthy", "mock-model", GenerationRequest::new("hi", "mock-model"))
            .unwrap();

        // the healthy backend resolves while the other is parked
        let response = quick.wait().await.unwrap();
        assert_eq!(response.content, "echo: hi");

        hold.notify_one();
        assert!(stuck.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_summary_aggregates() {
        let adapter = MockAdapter::new("p1");
        let coordinator = configured_coordinator(adapter.clone(), test_config()).await;

        let ticket = coordinator
            .send_request("p1", "mock-model", GenerationRequest::new("hello", "mock-model"))
            .unwrap();
        ticket.wait().await.unwrap();

        let summary = coordinator.get_summary();
        assert_eq!(summary.total_backends, 1);
        assert_eq!(summary.total_requests, 1);
        assert_eq!(summary.total_tokens, 15);
        assert_eq!(summary.backend_status.get("p1").unwrap(), "inactive");
    }

    #[tokio::test]
    async fn test_cleanup_resolves_pending_as_cancelled() {
        let hold = Arc::new(Notify::new());
        let adapter = MockAdapter::holding("p1", hold.clone());
        let coordinator = configured_coordinator(adapter.clone(), test_config()).await;

        let ticket = coordinator
            .send_request("p1", "mock-model", GenerationRequest::new("hello", "mock-model"))
            .unwrap();

        coordinator.cleanup();
        assert!(coordinator.get_health("p1").is_none());

        hold.notify_one();
        assert!(matches!(ticket.wait().await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_health_monitor_marks_backend_active() {
        let mut config = test_config();
        config.health.check_interval_secs = 1;

        let adapter = MockAdapter::new("p1");
        let coordinator = configured_coordinator(adapter.clone(), config).await;
        assert_eq!(
            coordinator.get_health("p1").unwrap().status,
            BackendStatus::Inactive
        );

        let monitor = coordinator.start_health_monitor();

        // first probe fires immediately
        let mut events = coordinator.subscribe();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(ServiceEvent::HealthUpdated { backend_id, .. }) = events.recv().await {
                    if backend_id == "p1" {
                        break;
                    }
                }
            }
        })
        .await
        .expect("health update never arrived");

        let health = coordinator.get_health("p1").unwrap();
        assert_eq!(health.status, BackendStatus::Active);
        assert!(health.success_count >= 1);

        monitor.stop();
    }
}
