//! HTTP Client Seam
//!
//! The OAuth client talks to discovery, registration and token endpoints
//! through [`HttpClient`], so the whole flow runs against
//! [`MockHttpClient`] in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{PaymentError, Result};

/// Status and raw body of a completed request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json_body(status: u16, body: &Value) -> Self {
        Self::new(status, body.to_string())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Deserialize the body
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Minimal HTTP client used by the OAuth flow
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse>;

    /// POST a JSON body
    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse>;

    /// POST an `application/x-www-form-urlencoded` body
    async fn post_form(&self, url: &str, form: &[(String, String)]) -> Result<HttpResponse>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

/// A request seen by [`MockHttpClient`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    /// JSON body for `post_json`
    pub json: Option<Value>,
    /// Form fields for `post_form`
    pub form: Vec<(String, String)>,
}

impl RecordedRequest {
    /// Value of a form field
    pub fn form_value(&self, name: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
struct Routes {
    responses: HashMap<(Method, String), VecDeque<HttpResponse>>,
    requests: Vec<RecordedRequest>,
}

/// Mock HTTP client with canned responses per method and URL
///
/// A route's last queued response keeps being served; unknown routes
/// answer 404.
#[derive(Default)]
pub struct MockHttpClient {
    routes: Mutex<Routes>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on(&self, method: Method, url: impl Into<String>, response: HttpResponse) -> &Self {
        self.routes()
            .responses
            .entry((method, url.into()))
            .or_default()
            .push_back(response);
        self
    }

    pub fn on_get(&self, url: impl Into<String>, status: u16, body: Value) -> &Self {
        self.on(Method::Get, url, HttpResponse::json_body(status, &body))
    }

    pub fn on_post(&self, url: impl Into<String>, status: u16, body: Value) -> &Self {
        self.on(Method::Post, url, HttpResponse::json_body(status, &body))
    }

    /// Every request received, in order
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.routes().requests.clone()
    }

    /// Requests sent to `url`
    pub fn requests_to(&self, url: &str) -> Vec<RecordedRequest> {
        self.routes()
            .requests
            .iter()
            .filter(|r| r.url == url)
            .cloned()
            .collect()
    }

    fn respond(&self, request: RecordedRequest) -> HttpResponse {
        let mut routes = self.routes();
        let key = (request.method, request.url.clone());
        routes.requests.push(request);
        match routes.responses.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(not_found),
            Some(queue) => queue.front().cloned().unwrap_or_else(not_found),
            None => not_found(),
        }
    }
}

fn not_found() -> HttpResponse {
    HttpResponse::new(404, r#"{"error":"not_found"}"#)
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn get(&self, url: &str) -> Result<HttpResponse> {
        Ok(self.respond(RecordedRequest {
            method: Method::Get,
            url: url.to_string(),
            json: None,
            form: Vec::new(),
        }))
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse> {
        Ok(self.respond(RecordedRequest {
            method: Method::Post,
            url: url.to_string(),
            json: Some(body.clone()),
            form: Vec::new(),
        }))
    }

    async fn post_form(&self, url: &str, form: &[(String, String)]) -> Result<HttpResponse> {
        Ok(self.respond(RecordedRequest {
            method: Method::Post,
            url: url.to_string(),
            json: None,
            form: form.to_vec(),
        }))
    }
}

/// Map a transport failure onto [`PaymentError::Http`]
pub fn transport_error(url: &str, err: impl std::fmt::Display) -> PaymentError {
    PaymentError::Http {
        url: url.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_routes() {
        let http = MockHttpClient::new();
        http.on_get("https://a/x", 500, json!({}))
            .on_get("https://a/x", 200, json!({"ok": true}));

        assert_eq!(http.get("https://a/x").await.unwrap().status, 500);
        assert_eq!(http.get("https://a/x").await.unwrap().status, 200);
        assert_eq!(http.get("https://a/x").await.unwrap().status, 200);
        assert_eq!(http.get("https://a/missing").await.unwrap().status, 404);
        assert_eq!(http.requests_to("https://a/x").len(), 3);
    }

    #[tokio::test]
    async fn test_form_recording() {
        let http = MockHttpClient::new();
        http.post_form("https://a/token", &[("code".into(), "c1".into())])
            .await
            .unwrap();
        let sent = &http.requests()[0];
        assert_eq!(sent.method, Method::Post);
        assert_eq!(sent.form_value("code"), Some("c1"));
    }
}
