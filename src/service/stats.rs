use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Liveness status of a registered backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Active,
    Inactive,
    Error,
    Maintenance,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Active => "active",
            BackendStatus::Inactive => "inactive",
            BackendStatus::Error => "error",
            BackendStatus::Maintenance => "maintenance",
        }
    }
}

/// Shared health record, written by the coordinator after each call and by
/// the health monitor after each probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub backend_id: String,
    pub status: BackendStatus,
    pub last_check: DateTime<Utc>,
    pub response_time_ms: u64,
    pub error_rate: f64,
    pub success_count: u64,
    pub error_count: u64,
    pub error_message: Option<String>,
}

impl HealthRecord {
    pub fn new(backend_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            status: BackendStatus::Inactive,
            last_check: Utc::now(),
            response_time_ms: 0,
            error_rate: 0.0,
            success_count: 0,
            error_count: 0,
            error_message: None,
        }
    }

    /// Probe succeeded: full refresh including status and response time.
    pub fn record_probe_success(&mut self, response_time_ms: u64) {
        self.status = BackendStatus::Active;
        self.last_check = Utc::now();
        self.response_time_ms = response_time_ms;
        self.success_count += 1;
        self.error_message = None;
        self.recompute_error_rate();
    }

    /// Probe failed: full refresh including status and error message.
    pub fn record_probe_error(&mut self, message: impl Into<String>) {
        self.status = BackendStatus::Error;
        self.last_check = Utc::now();
        self.error_count += 1;
        self.error_message = Some(message.into());
        self.recompute_error_rate();
    }

    /// Request-path bookkeeping: counters only, status stays with the
    /// monitor's last verdict.
    pub fn record_call_outcome(&mut self, success: bool) {
        if success {
            self.success_count += 1;
        } else {
            self.error_count += 1;
        }
        self.recompute_error_rate();
    }

    pub fn mark_inactive(&mut self, message: impl Into<String>) {
        self.status = BackendStatus::Inactive;
        self.last_check = Utc::now();
        self.error_message = Some(message.into());
    }

    /// Operator toggle. Leaving maintenance drops back to inactive; the
    /// next probe decides the real status.
    pub fn set_maintenance(&mut self, enabled: bool) {
        self.status = if enabled {
            BackendStatus::Maintenance
        } else {
            BackendStatus::Inactive
        };
        self.last_check = Utc::now();
        self.error_message = None;
    }

    fn recompute_error_rate(&mut self) {
        let total = self.success_count + self.error_count;
        self.error_rate = if total > 0 {
            self.error_count as f64 / total as f64
        } else {
            0.0
        };
    }
}

/// Per-backend usage counters. Monotonic, reset only by explicit operator
/// action.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub backend_id: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_tokens: u64,
    pub total_cost: Decimal,
    pub average_response_time_ms: f64,
    pub last_used: Option<DateTime<Utc>>,
}

impl UsageStats {
    pub fn new(backend_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            total_tokens: 0,
            total_cost: Decimal::ZERO,
            average_response_time_ms: 0.0,
            last_used: None,
        }
    }

    pub fn record_success(&mut self, tokens: u64, cost: Decimal, response_time_ms: u64) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.total_tokens += tokens;
        self.total_cost += cost;
        self.update_average(response_time_ms);
        self.last_used = Some(Utc::now());
    }

    pub fn record_failure(&mut self, response_time_ms: u64) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.update_average(response_time_ms);
        self.last_used = Some(Utc::now());
    }

    pub fn reset(&mut self) {
        let backend_id = self.backend_id.clone();
        *self = UsageStats::new(backend_id);
    }

    fn update_average(&mut self, response_time_ms: u64) {
        let n = self.total_requests as f64;
        self.average_response_time_ms =
            (self.average_response_time_ms * (n - 1.0) + response_time_ms as f64) / n;
    }
}
