use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::providers::adapter::{
    estimate_request_cost, BackendAdapter, Capability, ConfigureOptions, GenerationRequest,
    GenerationResponse, ModelDescriptor, TokenUsage,
};
use crate::providers::http::HttpTransport;

const DEFAULT_API_BASE: &str = "https://open.bigmodel.cn";

/// GLM (Zhipu) adapter. Single opaque API key, OpenAI-style chat
/// completions wire shape.
pub struct GlmAdapter {
    transport: HttpTransport,
    api_base: String,
    api_key: RwLock<Option<String>>,
    models: HashMap<String, ModelDescriptor>,
    configured: RwLock<HashMap<String, ModelDescriptor>>,
}

impl GlmAdapter {
    pub fn new() -> Result<Self> {
        Self::with_api_base(DEFAULT_API_BASE)
    }

    pub fn with_api_base(api_base: impl Into<String>) -> Result<Self> {
        let transport = HttpTransport::new(Duration::from_secs(60))?;

        let mut models = HashMap::new();
        models.insert(
            "glm-4".to_string(),
            ModelDescriptor {
                name: "GLM-4".to_string(),
                version: "4.0".to_string(),
                max_tokens: 4096,
                cost_per_1k_tokens: Decimal::from_str("0.1").unwrap_or_default(),
                capabilities: vec![
                    Capability::TextGeneration,
                    Capability::CodeGeneration,
                    Capability::Translation,
                ],
                supported_languages: vec!["zh".to_string(), "en".to_string()],
            },
        );
        models.insert(
            "glm-3-turbo".to_string(),
            ModelDescriptor {
                name: "GLM-3 Turbo".to_string(),
                version: "3.0".to_string(),
                max_tokens: 2048,
                cost_per_1k_tokens: Decimal::from_str("0.005").unwrap_or_default(),
                capabilities: vec![Capability::TextGeneration, Capability::Summarization],
                supported_languages: vec!["zh".to_string(), "en".to_string()],
            },
        );

        Ok(Self {
            transport,
            api_base: api_base.into(),
            api_key: RwLock::new(None),
            models,
            configured: RwLock::new(HashMap::new()),
        })
    }

    fn create_headers(&self) -> Result<HeaderMap> {
        let key = self
            .api_key
            .read()
            .clone()
            .ok_or_else(|| Error::credential("glm: no API key, configure a model first"))?;

        let mut headers = HeaderMap::new();
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", key))
            .map_err(|e| Error::credential(format!("Invalid API key format: {}", e)))?;
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn build_messages(request: &GenerationRequest) -> Vec<GlmMessage> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(GlmMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        if let Some(context) = &request.context {
            for turn in context {
                messages.push(GlmMessage {
                    role: turn.role.clone(),
                    content: turn.content.clone(),
                });
            }
        }
        messages.push(GlmMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });
        messages
    }
}

#[async_trait]
impl BackendAdapter for GlmAdapter {
    fn provider_id(&self) -> &str {
        "glm"
    }

    fn display_name(&self) -> &str {
        "Zhipu GLM"
    }

    fn available_models(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    async fn configure_model(
        &self,
        model_id: &str,
        credential: &str,
        _options: &ConfigureOptions,
    ) -> Result<()> {
        let descriptor = self
            .models
            .get(model_id)
            .ok_or_else(|| Error::validation(format!("glm: unknown model '{}'", model_id)))?
            .clone();

        if credential.trim().len() < 16 {
            return Err(Error::credential("glm: API key looks too short"));
        }

        *self.api_key.write() = Some(credential.trim().to_string());
        self.configured.write().insert(model_id.to_string(), descriptor);

        info!("Configured glm model '{}'", model_id);
        Ok(())
    }

    async fn send_request(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        request.validate()?;

        if !self.configured.read().contains_key(&request.model_id) {
            return Err(Error::validation(format!(
                "glm: model '{}' is not configured",
                request.model_id
            )));
        }

        let url = format!("{}/api/paas/v4/chat/completions", self.api_base);
        let headers = self.create_headers()?;

        let wire_request = GlmRequest {
            model: request.model_id.clone(),
            messages: Self::build_messages(request),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stream: request.stream,
        };

        debug!(
            "Sending request to glm: model={}, prompt_len={}",
            request.model_id,
            request.prompt.len()
        );

        let body = serde_json::to_value(&wire_request)?;
        let raw = self.transport.post_json(&url, headers, &body).await?;
        if !raw.is_success() {
            return Err(raw.into_error());
        }

        let wire: GlmResponse = serde_json::from_str(&raw.body)?;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::backend("glm: response carried no choices"))?;

        let usage = wire
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_else(|| TokenUsage::new(0, 0));

        let cost = self
            .configured
            .read()
            .get(&request.model_id)
            .map(|d| Decimal::from(usage.total_tokens) * d.cost_per_1k_tokens / Decimal::from(1000))
            .unwrap_or_default();

        Ok(
            GenerationResponse::new(choice.message.content, usage, choice.finish_reason)
                .with_cost(cost)
                .with_metadata(serde_json::json!({
                    "provider": "glm",
                    "model": request.model_id,
                    "response_id": wire.id,
                })),
        )
    }

    async fn test_connection(&self, model_id: &str) -> Result<bool> {
        let probe = GenerationRequest::new("ping", model_id).with_max_tokens(16);
        Ok(self.send_request(&probe).await.is_ok())
    }

    fn estimate_cost(&self, request: &GenerationRequest) -> Decimal {
        estimate_request_cost(self.models.get(&request.model_id), request)
    }

    fn get_model_info(&self, model_id: &str) -> Option<ModelDescriptor> {
        self.models.get(model_id).cloned()
    }

    fn configured_models(&self) -> Vec<String> {
        self.configured.read().keys().cloned().collect()
    }
}

// Zhipu wire structures
#[derive(Debug, Serialize)]
struct GlmRequest {
    model: String,
    messages: Vec<GlmMessage>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct GlmMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct GlmResponse {
    id: Option<String>,
    choices: Vec<GlmChoice>,
    usage: Option<GlmUsage>,
}

#[derive(Debug, Deserialize)]
struct GlmChoice {
    message: GlmMessage,
    finish_reason: String,
}

#[derive(Debug, Deserialize)]
struct GlmUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[allow(dead_code)]
    total_tokens: u32,
}
