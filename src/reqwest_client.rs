use serde_json::Value as JsonValue;

use crate::error::Error;
use crate::http::{HttpClient, HttpRequest, HttpResponse, RequestBody};

/// [`HttpClient`] backed by `reqwest`, with a cookie store so credentials
/// are sent on every call.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    http: reqwest::Client,
}

impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestClient {
    #[must_use]
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to a default HTTP client");
                reqwest::Client::new()
            });
        Self { http }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(client: reqwest::Client) -> Self {
        Self { http: client }
    }
}

impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| Error::Transport(e.to_string()))?;

        let mut builder = self.http.request(method, &request.url);
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = match request.data {
            Some(RequestBody::Json(body)) => builder.json(&body),
            Some(RequestBody::Form(pairs)) => builder.form(&pairs),
            Some(RequestBody::Text(text)) => builder.body(text),
            None => builder,
        };

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_owned(), v.to_owned()))
            })
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let data = if text.is_empty() {
            JsonValue::Null
        } else {
            match serde_json::from_str(&text) {
                Ok(json) => json,
                Err(_) => JsonValue::String(text),
            }
        };

        Ok(HttpResponse {
            status,
            headers,
            data,
        })
    }
}
