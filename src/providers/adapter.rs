use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What a configured model can do, as advertised by its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    TextGeneration,
    CodeGeneration,
    Translation,
    Summarization,
}

/// Immutable description of one provider model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub version: String,
    pub max_tokens: u32,
    pub cost_per_1k_tokens: Decimal,
    pub capabilities: Vec<Capability>,
    pub supported_languages: Vec<String>,
}

/// Normalized request sent to any backend. Value type, never mutated after
/// submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model_id: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub stream: bool,
    pub system_prompt: Option<String>,
    pub context: Option<Vec<ContextMessage>>,
    pub metadata: Option<serde_json::Value>,
}

/// Prior conversation turn carried along with a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model_id: model_id.into(),
            max_tokens: 1000,
            temperature: 0.7,
            top_p: 0.9,
            stream: false,
            system_prompt: None,
            context: None,
            metadata: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_context(mut self, context: Vec<ContextMessage>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Parameter sanity checks shared by every adapter.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(Error::validation("prompt must not be empty"));
        }
        if self.max_tokens == 0 {
            return Err(Error::validation("max_tokens must be positive"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::validation("temperature must be in [0, 2]"));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(Error::validation("top_p must be in [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// Normalized response from any backend. Cloned on cache insert so the
/// cached copy never aliases the caller's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub finish_reason: String,
    pub cost: Decimal,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

impl GenerationResponse {
    pub fn new(content: impl Into<String>, usage: TokenUsage, finish_reason: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage,
            finish_reason: finish_reason.into(),
            cost: Decimal::ZERO,
            created_at: Utc::now(),
            metadata: None,
        }
    }

    pub fn with_cost(mut self, cost: Decimal) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Provider-specific knobs passed through at configuration time.
pub type ConfigureOptions = HashMap<String, serde_json::Value>;

/// The capability surface every provider implementation exposes.
/// Implementations differ only in how they translate a normalized request
/// into a provider call and parse the provider's reply back.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn provider_id(&self) -> &str;

    fn display_name(&self) -> &str;

    /// Models this provider can serve, configured or not.
    fn available_models(&self) -> Vec<String>;

    /// Attaches a credential to a model. Must be called before
    /// `send_request` or `test_connection` for that model.
    async fn configure_model(
        &self,
        model_id: &str,
        credential: &str,
        options: &ConfigureOptions,
    ) -> Result<()>;

    async fn send_request(&self, request: &GenerationRequest) -> Result<GenerationResponse>;

    /// Issues a minimal real call to verify the model is reachable.
    async fn test_connection(&self, model_id: &str) -> Result<bool>;

    fn estimate_cost(&self, request: &GenerationRequest) -> Decimal;

    fn get_model_info(&self, model_id: &str) -> Option<ModelDescriptor>;

    fn configured_models(&self) -> Vec<String>;
}

/// Rough token estimate shared by cost estimation across adapters.
pub(crate) fn approximate_tokens(prompt: &str, max_tokens: u32) -> u64 {
    (prompt.chars().count() as u64 / 4) + max_tokens as u64
}

/// `tokens / 1000 * cost_per_1k` for the request's model.
pub(crate) fn estimate_request_cost(
    descriptor: Option<&ModelDescriptor>,
    request: &GenerationRequest,
) -> Decimal {
    let Some(descriptor) = descriptor else {
        return Decimal::ZERO;
    };
    let tokens = approximate_tokens(&request.prompt, request.max_tokens);
    Decimal::from(tokens) * descriptor.cost_per_1k_tokens / Decimal::from(1000)
}
