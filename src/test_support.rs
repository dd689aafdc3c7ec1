use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value as JsonValue, json};

use crate::config::Config;
use crate::error::Error;
use crate::http::{HttpClient, HttpRequest, HttpResponse};

pub(crate) const ORIGIN: &str = "https://idp.example.com";
pub(crate) const ISSUER: &str = "https://idp.example.com/oauth2/token";
pub(crate) const TOKEN_URL: &str = "https://idp.example.com/oauth2/token";
pub(crate) const REVOKE_URL: &str = "https://idp.example.com/oauth2/revoke";
pub(crate) const JWKS_URL: &str = "https://idp.example.com/oauth2/jwks";
pub(crate) const API: &str = "https://api.example.com";
pub(crate) const CLIENT_ID: &str = "client";

const SECRET: &[u8] = b"test-signing-secret-for-id-tokens";
const KID: &str = "k1";

/// Routes `tracing` output through the test harness; set `RUST_LOG` to see it.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn test_config() -> Config {
    Config::new(
        CLIENT_ID,
        "https://app.example.com",
        ORIGIN,
        "https://app.example.com/callback",
        "https://app.example.com/logged-out",
        vec![API.to_owned()],
    )
}

/// HS256 ID token signed with the key published by [`test_jwks`].
pub(crate) fn sign_id_token(sub: &str, preferred_username: Option<&str>, aud: &str) -> String {
    let mut claims = json!({
        "sub": sub,
        "email": format!("{sub}@example.com"),
        "iss": ISSUER,
        "aud": aud,
        "exp": time::OffsetDateTime::now_utc().unix_timestamp() + 3600,
    });
    if let Some(name) = preferred_username {
        claims["preferred_username"] = JsonValue::String(name.to_owned());
    }

    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(KID.to_owned());
    jsonwebtoken::encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
}

pub(crate) fn jwks_json() -> JsonValue {
    json!({
        "keys": [{
            "kty": "oct",
            "kid": KID,
            "alg": "HS256",
            "k": URL_SAFE_NO_PAD.encode(SECRET),
        }]
    })
}

pub(crate) fn test_jwks() -> JwkSet {
    serde_json::from_value(jwks_json()).unwrap()
}

/// Token endpoint reply for `sub`, expiring in an hour.
pub(crate) fn token_response(access_token: &str, sub: &str) -> HttpResponse {
    HttpResponse::new(200).with_data(json!({
        "access_token": access_token,
        "refresh_token": format!("refresh-{access_token}"),
        "id_token": sign_id_token(sub, None, CLIENT_ID),
        "token_type": "Bearer",
        "expires_in": 3600,
        "scope": "openid profile",
    }))
}

/// Scripted [`HttpClient`] keyed by URL (query string excluded).
///
/// Queued replies are served first, in order; after that the URL's
/// standing reply, if any; otherwise `404`. Every request is recorded.
#[derive(Default)]
pub(crate) struct MockHttpClient {
    queued: Mutex<HashMap<String, VecDeque<Result<HttpResponse, Error>>>>,
    standing: Mutex<HashMap<String, HttpResponse>>,
    delays: Mutex<HashMap<String, Duration>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Provider whose discovery fails, leaving the default endpoints, and
    /// whose JWKS endpoint serves the test key.
    pub(crate) fn with_provider() -> Self {
        let mock = Self::new();
        mock.always(JWKS_URL, HttpResponse::new(200).with_data(jwks_json()));
        mock
    }

    pub(crate) fn enqueue(&self, url: &str, response: HttpResponse) -> &Self {
        self.queued
            .lock()
            .unwrap()
            .entry(url.to_owned())
            .or_default()
            .push_back(Ok(response));
        self
    }

    pub(crate) fn enqueue_error(&self, url: &str, error: Error) -> &Self {
        self.queued
            .lock()
            .unwrap()
            .entry(url.to_owned())
            .or_default()
            .push_back(Err(error));
        self
    }

    pub(crate) fn always(&self, url: &str, response: HttpResponse) -> &Self {
        self.standing
            .lock()
            .unwrap()
            .insert(url.to_owned(), response);
        self
    }

    /// Holds every later reply from `url` back for `delay`. The request is
    /// recorded before the wait.
    pub(crate) fn delay(&self, url: &str, delay: Duration) -> &Self {
        self.delays.lock().unwrap().insert(url.to_owned(), delay);
        self
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn requests_to(&self, url: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url == url)
            .collect()
    }

    fn reply(&self, url: &str) -> Result<HttpResponse, Error> {
        if let Some(next) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front)
        {
            return next;
        }
        Ok(self
            .standing
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| HttpResponse::new(404)))
    }
}

impl HttpClient for MockHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
        let url = request.url.clone();
        self.requests.lock().unwrap().push(request);
        let delay = self.delays.lock().unwrap().get(&url).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.reply(&url)
    }
}

/// Form value `name` of a recorded request.
pub(crate) fn form_value(request: &HttpRequest, name: &str) -> Option<String> {
    match &request.data {
        Some(crate::http::RequestBody::Form(pairs)) => pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone()),
        _ => None,
    }
}
