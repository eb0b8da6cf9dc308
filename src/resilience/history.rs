use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, warn};

use crate::error::{classify, Error, ErrorKind, Severity};

/// One handled failure, as recorded for later inspection.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub backend_id: String,
    pub model_id: String,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub retry_count: u32,
    pub context: HashMap<String, String>,
}

impl ErrorRecord {
    pub fn from_error(
        error: &Error,
        backend_id: impl Into<String>,
        model_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        let classification = classify(error);
        Self {
            kind: classification.kind,
            severity: classification.severity,
            message: error.to_string(),
            backend_id: backend_id.into(),
            model_id: model_id.into(),
            timestamp: Utc::now(),
            request_id: request_id.into(),
            retry_count: 0,
            context: HashMap::new(),
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Bounded append-only history of handled failures. The oldest entry is
/// evicted once the limit is reached.
#[derive(Debug)]
pub struct ErrorHistory {
    entries: Mutex<VecDeque<ErrorRecord>>,
    limit: usize,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ErrorStatistics {
    pub total_errors: usize,
    pub by_kind: HashMap<String, usize>,
    pub by_backend: HashMap<String, usize>,
    pub recent: Vec<ErrorRecord>,
}

impl ErrorHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(limit.min(64))),
            limit,
        }
    }

    /// Appends a record, logging it at a level weighted by severity.
    pub fn record(&self, record: ErrorRecord) {
        match record.severity {
            Severity::Critical | Severity::High => error!(
                backend = %record.backend_id,
                model = %record.model_id,
                kind = record.kind.as_str(),
                request_id = %record.request_id,
                retry_count = record.retry_count,
                "Backend failure: {}",
                record.message
            ),
            Severity::Medium => warn!(
                backend = %record.backend_id,
                model = %record.model_id,
                kind = record.kind.as_str(),
                request_id = %record.request_id,
                retry_count = record.retry_count,
                "Backend failure: {}",
                record.message
            ),
        }

        let mut entries = self.entries.lock();
        if entries.len() >= self.limit {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn statistics(&self) -> ErrorStatistics {
        let entries = self.entries.lock();

        let mut by_kind: HashMap<String, usize> = HashMap::new();
        let mut by_backend: HashMap<String, usize> = HashMap::new();
        for record in entries.iter() {
            *by_kind.entry(record.kind.as_str().to_string()).or_default() += 1;
            *by_backend.entry(record.backend_id.clone()).or_default() += 1;
        }

        let recent = entries.iter().rev().take(10).rev().cloned().collect();

        ErrorStatistics {
            total_errors: entries.len(),
            by_kind,
            by_backend,
            recent,
        }
    }
}
