//! reqwest-backed [`HttpClient`] for the OAuth flow

use std::time::Duration;

use async_trait::async_trait;
use chat_payments::{HttpClient, HttpResponse, Result, transport_error};
use serde_json::Value;

/// [`HttpClient`] over a shared `reqwest::Client`
#[derive(Clone, Debug)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    async fn finish(url: &str, request: reqwest::RequestBuilder) -> Result<HttpResponse> {
        let response = request.send().await.map_err(|e| transport_error(url, e))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| transport_error(url, e))?;
        tracing::debug!(url, status, "OAuth HTTP exchange");
        Ok(HttpResponse::new(status, body))
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str) -> Result<HttpResponse> {
        Self::finish(url, self.client.get(url).header("Accept", "application/json")).await
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse> {
        Self::finish(url, self.client.post(url).json(body)).await
    }

    async fn post_form(&self, url: &str, form: &[(String, String)]) -> Result<HttpResponse> {
        Self::finish(url, self.client.post(url).form(form)).await
    }
}
