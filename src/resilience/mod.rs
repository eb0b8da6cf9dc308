pub mod circuit_breaker;
pub mod history;
pub mod retry;

pub use circuit_breaker::{BreakerSnapshot, BreakerStateKind, CircuitBreaker};
pub use history::{ErrorHistory, ErrorRecord, ErrorStatistics};
pub use retry::{RetryConfig, RetryPolicy};
