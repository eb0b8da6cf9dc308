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

const DEFAULT_API_BASE: &str = "https://dashscope.aliyuncs.com";

/// Qwen (DashScope) adapter. Single opaque API key.
pub struct QwenAdapter {
    transport: HttpTransport,
    api_base: String,
    api_key: RwLock<Option<String>>,
    models: HashMap<String, ModelDescriptor>,
    configured: RwLock<HashMap<String, ModelDescriptor>>,
}

impl QwenAdapter {
    pub fn new() -> Result<Self> {
        Self::with_api_base(DEFAULT_API_BASE)
    }

    pub fn with_api_base(api_base: impl Into<String>) -> Result<Self> {
        let transport = HttpTransport::new(Duration::from_secs(60))?;

        let mut models = HashMap::new();
        models.insert(
            "qwen-turbo".to_string(),
            ModelDescriptor {
                name: "Qwen Turbo".to_string(),
                version: "1.0".to_string(),
                max_tokens: 1500,
                cost_per_1k_tokens: Decimal::from_str("0.008").unwrap_or_default(),
                capabilities: vec![Capability::TextGeneration, Capability::Summarization],
                supported_languages: vec!["zh".to_string(), "en".to_string()],
            },
        );
        models.insert(
            "qwen-plus".to_string(),
            ModelDescriptor {
                name: "Qwen Plus".to_string(),
                version: "1.0".to_string(),
                max_tokens: 2000,
                cost_per_1k_tokens: Decimal::from_str("0.02").unwrap_or_default(),
                capabilities: vec![
                    Capability::TextGeneration,
                    Capability::CodeGeneration,
                    Capability::Summarization,
                ],
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
            .ok_or_else(|| Error::credential("qwen: no API key, configure a model first"))?;

        let mut headers = HeaderMap::new();
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", key))
            .map_err(|e| Error::credential(format!("Invalid API key format: {}", e)))?;
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn build_messages(request: &GenerationRequest) -> Vec<QwenMessage> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(QwenMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        if let Some(context) = &request.context {
            for turn in context {
                messages.push(QwenMessage {
                    role: turn.role.clone(),
                    content: turn.content.clone(),
                });
            }
        }
        messages.push(QwenMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });
        messages
    }
}

#[async_trait]
impl BackendAdapter for QwenAdapter {
    fn provider_id(&self) -> &str {
        "qwen"
    }

    fn display_name(&self) -> &str {
        "Alibaba Qwen"
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
            .ok_or_else(|| Error::validation(format!("qwen: unknown model '{}'", model_id)))?
            .clone();

        if credential.trim().len() < 16 {
            return Err(Error::credential("qwen: API key looks too short"));
        }

        *self.api_key.write() = Some(credential.trim().to_string());
        self.configured.write().insert(model_id.to_string(), descriptor);

        info!("Configured qwen model '{}'", model_id);
        Ok(())
    }

    async fn send_request(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        request.validate()?;

        if !self.configured.read().contains_key(&request.model_id) {
            return Err(Error::validation(format!(
                "qwen: model '{}' is not configured",
                request.model_id
            )));
        }

        let url = format!(
            "{}/api/v1/services/aigc/text-generation/generation",
            self.api_base
        );
        let headers = self.create_headers()?;

        let wire_request = QwenRequest {
            model: request.model_id.clone(),
            input: QwenInput {
                messages: Self::build_messages(request),
            },
            parameters: QwenParameters {
                max_tokens: request.max_tokens,
                temperature: request.temperature,
                top_p: request.top_p,
                result_format: "message".to_string(),
            },
        };

        debug!(
            "Sending request to qwen: model={}, prompt_len={}",
            request.model_id,
            request.prompt.len()
        );

        let body = serde_json::to_value(&wire_request)?;
        let raw = self.transport.post_json(&url, headers, &body).await?;
        if !raw.is_success() {
            return Err(raw.into_error());
        }

        let wire: QwenResponse = serde_json::from_str(&raw.body)?;

        let choice = wire
            .output
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::backend("qwen: response carried no choices"))?;

        let usage = wire
            .usage
            .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens))
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
                    "provider": "qwen",
                    "model": request.model_id,
                    "request_id": wire.request_id,
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

// DashScope wire structures
#[derive(Debug, Serialize)]
struct QwenRequest {
    model: String,
    input: QwenInput,
    parameters: QwenParameters,
}

#[derive(Debug, Serialize)]
struct QwenInput {
    messages: Vec<QwenMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct QwenMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct QwenParameters {
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    result_format: String,
}

#[derive(Debug, Deserialize)]
struct QwenResponse {
    output: QwenOutput,
    usage: Option<QwenUsage>,
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QwenOutput {
    choices: Vec<QwenChoice>,
}

#[derive(Debug, Deserialize)]
struct QwenChoice {
    message: QwenMessage,
    finish_reason: String,
}

#[derive(Debug, Deserialize)]
struct QwenUsage {
    input_tokens: u32,
    output_tokens: u32,
}
