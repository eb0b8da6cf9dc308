pub mod adapter;
pub mod factory;
pub mod glm;
pub mod http;
pub mod qwen;
pub mod wenxin;

pub use adapter::{
    BackendAdapter, Capability, ConfigureOptions, ContextMessage, GenerationRequest,
    GenerationResponse, ModelDescriptor, TokenUsage,
};
pub use factory::{available_providers, create_adapter, validate_credential_format};
pub use glm::GlmAdapter;
pub use http::{HttpTransport, RawResponse};
pub use qwen::QwenAdapter;
pub use wenxin::WenxinAdapter;
