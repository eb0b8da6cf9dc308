pub mod coordinator;
pub mod events;
pub mod health;
pub mod stats;

pub use coordinator::{Coordinator, CoordinatorSummary, RequestTicket};
pub use events::{EventBus, ServiceEvent};
pub use health::HealthMonitor;
pub use stats::{BackendStatus, HealthRecord, UsageStats};
