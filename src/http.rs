use std::collections::BTreeMap;
use std::future::Future;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

/// Request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RequestBody {
    Json(JsonValue),
    /// `application/x-www-form-urlencoded` pairs, in order.
    Form(Vec<(String, String)>),
    Text(String),
}

/// An outbound HTTP call proxied by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct HttpRequest {
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<RequestBody>,
}

impl HttpRequest {
    #[must_use]
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            params: Vec::new(),
            data: None,
        }
    }

    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    #[must_use]
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_json(mut self, body: JsonValue) -> Self {
        self.data = Some(RequestBody::Json(body));
        self
    }

    #[must_use]
    pub fn with_form(mut self, pairs: Vec<(String, String)>) -> Self {
        self.data = Some(RequestBody::Form(pairs));
        self
    }

    pub(crate) fn with_bearer(self, token: &str) -> Self {
        self.with_header("Authorization", format!("Bearer {token}"))
    }
}

/// Response of a proxied call. `data` holds the decoded JSON body, or the
/// raw text as a JSON string when the body is not JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub data: JsonValue,
}

impl HttpResponse {
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            data: JsonValue::Null,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Deserialize the body into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] if the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_value(self.data.clone()).map_err(Into::into)
    }
}

/// Transport used by the worker for every outbound call.
///
/// Implementations resolve with `Ok` for any HTTP status; `Err` is reserved
/// for failures to obtain a response at all.
///
/// # Example
///
/// ```rust,ignore
/// struct Fixed;
///
/// impl HttpClient for Fixed {
///     async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, Error> {
///         Ok(HttpResponse::new(204))
///     }
/// }
/// ```
pub trait HttpClient: Send + Sync + 'static {
    fn send(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, Error>> + Send;
}

/// Passes 2xx responses through and turns anything else into [`Error::Http`].
pub(crate) fn ensure_success(response: HttpResponse) -> Result<HttpResponse, Error> {
    if response.is_success() {
        return Ok(response);
    }
    Err(Error::http(response))
}

/// Whether `url` starts with one of the allow-listed base URLs.
#[must_use]
pub fn is_allowed(url: &str, base_urls: &[String]) -> bool {
    base_urls.iter().any(|base| url.starts_with(base.as_str()))
}
