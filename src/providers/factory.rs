use std::sync::Arc;

use crate::error::{Error, Result};
use crate::providers::adapter::BackendAdapter;
use crate::providers::glm::GlmAdapter;
use crate::providers::qwen::QwenAdapter;
use crate::providers::wenxin::WenxinAdapter;

/// Provider ids the factory can construct.
pub fn available_providers() -> &'static [&'static str] {
    &["wenxin", "qwen", "glm"]
}

/// Constructs the adapter for a provider id.
pub fn create_adapter(provider_id: &str) -> Result<Arc<dyn BackendAdapter>> {
    match provider_id {
        "wenxin" => Ok(Arc::new(WenxinAdapter::new()?)),
        "qwen" => Ok(Arc::new(QwenAdapter::new()?)),
        "glm" => Ok(Arc::new(GlmAdapter::new()?)),
        other => Err(Error::validation(format!("unknown provider '{}'", other))),
    }
}

/// Per-provider credential format contract, checked before any network
/// call. Providers needing a two-part credential expect `id|secret`;
/// single-token providers expect an opaque key of at least 16 characters.
pub fn validate_credential_format(provider_id: &str, credential: &str) -> bool {
    let credential = credential.trim();
    if credential.is_empty() {
        return false;
    }

    match provider_id {
        "wenxin" | "spark" => {
            let mut parts = credential.splitn(3, '|');
            matches!(
                (parts.next(), parts.next(), parts.next()),
                (Some(id), Some(secret), None) if !id.is_empty() && !secret.is_empty()
            )
        }
        "qwen" | "glm" | "baichuan" | "moonshot" => credential.len() >= 16,
        _ => true,
    }
}
