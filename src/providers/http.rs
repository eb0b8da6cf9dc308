use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::Client;
use tracing::debug;

use crate::error::{Error, Result};

/// Raw status/body pair. The adapter that issued the call is alone
/// responsible for parsing it into a normalized response or a classified
/// failure.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Converts a non-2xx reply into the API error the classifier
    /// understands.
    pub fn into_error(self) -> Error {
        Error::api(self.status, self.body)
    }
}

/// Thin HTTP client abstraction shared by all adapters: method, URL,
/// headers, JSON body, timeout in; status and body text out.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::backend(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    pub async fn post_json(
        &self,
        url: &str,
        headers: HeaderMap,
        body: &serde_json::Value,
    ) -> Result<RawResponse> {
        debug!("POST {}", url);

        let response = self
            .client
            .post(url)
            .headers(headers)
            .json(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;

        debug!("POST {} -> {}", url, status);
        Ok(RawResponse { status, body })
    }

    /// POST with query parameters and an empty body (OAuth-style token
    /// endpoints).
    pub async fn post_form(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<RawResponse> {
        debug!("POST {} (form)", url);

        let response = self.client.post(url).query(params).send().await?;

        let status = response.status().as_u16();
        let body = response.text().await?;

        debug!("POST {} -> {}", url, status);
        Ok(RawResponse { status, body })
    }
}
