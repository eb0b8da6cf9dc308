use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
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

const DEFAULT_API_BASE: &str = "https://aip.baidubce.com";

/// ERNIE (Wenxin) adapter. Requires a compound `client_id|client_secret`
/// credential which is exchanged for an OAuth access token at configure
/// time.
pub struct WenxinAdapter {
    transport: HttpTransport,
    api_base: String,
    access_token: RwLock<Option<String>>,
    models: HashMap<String, ModelDescriptor>,
    configured: RwLock<HashMap<String, ModelDescriptor>>,
}

impl WenxinAdapter {
    pub fn new() -> Result<Self> {
        Self::with_api_base(DEFAULT_API_BASE)
    }

    pub fn with_api_base(api_base: impl Into<String>) -> Result<Self> {
        let transport = HttpTransport::new(Duration::from_secs(60))?;

        let mut models = HashMap::new();
        models.insert(
            "ernie-bot-4".to_string(),
            ModelDescriptor {
                name: "ERNIE Bot 4.0".to_string(),
                version: "4.0".to_string(),
                max_tokens: 2048,
                cost_per_1k_tokens: Decimal::from_str("0.12").unwrap_or_default(),
                capabilities: vec![Capability::TextGeneration, Capability::Translation],
                supported_languages: vec!["zh".to_string(), "en".to_string()],
            },
        );
        models.insert(
            "ernie-bot".to_string(),
            ModelDescriptor {
                name: "ERNIE Bot".to_string(),
                version: "3.5".to_string(),
                max_tokens: 1024,
                cost_per_1k_tokens: Decimal::from_str("0.008").unwrap_or_default(),
                capabilities: vec![Capability::TextGeneration, Capability::Translation],
                supported_languages: vec!["zh".to_string(), "en".to_string()],
            },
        );

        Ok(Self {
            transport,
            api_base: api_base.into(),
            access_token: RwLock::new(None),
            models,
            configured: RwLock::new(HashMap::new()),
        })
    }

    fn create_headers(&self) -> Result<HeaderMap> {
        let token = self
            .access_token
            .read()
            .clone()
            .ok_or_else(|| Error::credential("wenxin: no access token, configure a model first"))?;

        let mut headers = HeaderMap::new();
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| Error::credential(format!("Invalid access token: {}", e)))?;
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn build_messages(request: &GenerationRequest) -> Vec<WenxinMessage> {
        let mut messages = Vec::new();
        if let Some(context) = &request.context {
            for turn in context {
                messages.push(WenxinMessage {
                    role: turn.role.clone(),
                    content: turn.content.clone(),
                });
            }
        }
        messages.push(WenxinMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });
        messages
    }

    async fn exchange_token(&self, client_id: &str, client_secret: &str) -> Result<String> {
        let url = format!("{}/oauth/2.0/token", self.api_base);
        let raw = self
            .transport
            .post_form(
                &url,
                &[
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id),
                    ("client_secret", client_secret),
                ],
            )
            .await?;

        if !raw.is_success() {
            return Err(raw.into_error());
        }

        let token: WenxinTokenResponse = serde_json::from_str(&raw.body)?;
        token
            .access_token
            .ok_or_else(|| Error::credential("wenxin: token endpoint returned no access_token"))
    }
}

#[async_trait]
impl BackendAdapter for WenxinAdapter {
    fn provider_id(&self) -> &str {
        "wenxin"
    }

    fn display_name(&self) -> &str {
        "Baidu ERNIE"
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
            .ok_or_else(|| Error::validation(format!("wenxin: unknown model '{}'", model_id)))?
            .clone();

        let (client_id, client_secret) = credential
            .split_once('|')
            .ok_or_else(|| Error::credential("wenxin: credential must be 'client_id|client_secret'"))?;

        let token = self.exchange_token(client_id, client_secret).await?;
        *self.access_token.write() = Some(token);
        self.configured.write().insert(model_id.to_string(), descriptor);

        info!("Configured wenxin model '{}'", model_id);
        Ok(())
    }

    async fn send_request(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        request.validate()?;

        if !self.configured.read().contains_key(&request.model_id) {
            return Err(Error::validation(format!(
                "wenxin: model '{}' is not configured",
                request.model_id
            )));
        }

        let url = format!(
            "{}/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/completions",
            self.api_base
        );
        let headers = self.create_headers()?;

        let wire_request = WenxinRequest {
            messages: Self::build_messages(request),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stream: request.stream,
            system: request.system_prompt.clone(),
        };

        debug!(
            "Sending request to wenxin: model={}, prompt_len={}",
            request.model_id,
            request.prompt.len()
        );

        let body = serde_json::to_value(&wire_request)?;
        let raw = self.transport.post_json(&url, headers, &body).await?;
        if !raw.is_success() {
            return Err(raw.into_error());
        }

        let wire: WenxinResponse = serde_json::from_str(&raw.body)?;

        // Wenxin reports API errors in a 200 body
        if let Some(code) = wire.error_code {
            let msg = wire.error_msg.unwrap_or_default();
            return Err(Error::backend(format!("wenxin error {}: {}", code, msg)));
        }

        let content = wire
            .result
            .ok_or_else(|| Error::backend("wenxin: response carried no result"))?;
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

        Ok(GenerationResponse::new(content, usage, "stop")
            .with_cost(cost)
            .with_metadata(serde_json::json!({
                "provider": "wenxin",
                "model": request.model_id,
                "response_id": wire.id,
                "created": Utc::now().timestamp(),
            })))
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

// Wenxin wire structures
#[derive(Debug, Serialize)]
struct WenxinRequest {
    messages: Vec<WenxinMessage>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WenxinMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WenxinTokenResponse {
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WenxinResponse {
    id: Option<String>,
    result: Option<String>,
    usage: Option<WenxinUsage>,
    error_code: Option<i64>,
    error_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WenxinUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[allow(dead_code)]
    total_tokens: u32,
}
