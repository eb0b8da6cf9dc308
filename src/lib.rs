pub mod cache;
pub mod config;
pub mod credentials;
pub mod error;
pub mod providers;
pub mod resilience;
pub mod service;

pub use config::RelayConfig;
pub use error::{Error, Result};
pub use providers::{BackendAdapter, GenerationRequest, GenerationResponse};
pub use service::{Coordinator, RequestTicket, ServiceEvent};
