//! OpenID Connect protocol mechanics: discovery, authorization URLs, token
//! endpoint requests and ID token validation.
//!
//! Everything here is stateless. [`WorkerHost`](crate::worker::WorkerHost)
//! reads endpoints and tokens out of its session, passes them in, and
//! stores whatever comes back.

use std::collections::BTreeMap;

use jsonwebtoken::jwk::JwkSet;
use serde::Deserialize;
use url::Url;

use crate::config::Config;
use crate::error::Error;
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::pkce;
use crate::token::{self, AuthenticatedUser};
use crate::well_known::{OpenIdConfiguration, ServiceEndpoints, WELL_KNOWN_PATH};

pub const OIDC_SCOPE: &str = "openid";

pub const TOKEN_TAG: &str = "{{token}}";
pub const USERNAME_TAG: &str = "{{username}}";
pub const SCOPE_TAG: &str = "{{scope}}";
pub const CLIENT_ID_TAG: &str = "{{clientID}}";
pub const CLIENT_SECRET_TAG: &str = "{{clientSecret}}";

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Authorization URL plus the PKCE verifier bound to it, if PKCE is on.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AuthorizationRequest {
    pub url: String,
    pub code_verifier: Option<String>,
}

/// Values substituted into custom grant templates.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GrantTemplate<'a> {
    pub(crate) token: &'a str,
    pub(crate) username: &'a str,
    pub(crate) scope: &'a str,
    pub(crate) client_id: &'a str,
    pub(crate) client_secret: &'a str,
}

impl GrantTemplate<'_> {
    fn render(&self, value: &str) -> String {
        value
            .replace(TOKEN_TAG, self.token)
            .replace(USERNAME_TAG, self.username)
            .replace(SCOPE_TAG, self.scope)
            .replace(CLIENT_ID_TAG, self.client_id)
            .replace(CLIENT_SECRET_TAG, self.client_secret)
    }
}

fn endpoint<'a>(value: &'a str, message: &str) -> Result<&'a str, Error> {
    if value.trim().is_empty() {
        return Err(Error::OAuth(message.into()));
    }
    Ok(value)
}

fn pair(name: &str, value: impl Into<String>) -> (String, String) {
    (name.to_owned(), value.into())
}

/// Form POST to an identity provider endpoint.
fn provider_post(config: &Config, url: &str, form: Vec<(String, String)>) -> HttpRequest {
    HttpRequest::post(url)
        .with_header("Accept", "application/json")
        .with_header("Access-Control-Allow-Origin", config.client_host.as_str())
        .with_form(form)
}

/// Only `200` counts; the token endpoint never answers anything else on
/// success.
pub(crate) fn expect_ok(response: HttpResponse) -> Result<HttpResponse, Error> {
    if response.status == 200 {
        return Ok(response);
    }
    Err(Error::http(response))
}

/// Loads the discovery document, falling back to the default endpoints on
/// any failure.
pub(crate) async fn discover<C: HttpClient>(http: &C, server_origin: &str) -> ServiceEndpoints {
    let origin = server_origin.trim_end_matches('/');
    let well_known = format!("{origin}{WELL_KNOWN_PATH}");

    let document = match http.send(HttpRequest::get(well_known.as_str())).await {
        Ok(response) => expect_ok(response).and_then(|r| r.json::<OpenIdConfiguration>()),
        Err(e) => Err(e),
    };

    match document {
        Ok(doc) => {
            tracing::info!(%well_known, "Loaded OpenID provider configuration");
            ServiceEndpoints::from_discovery(origin, doc)
        }
        Err(e) => {
            tracing::warn!(
                %well_known,
                error = %e,
                "Discovery failed, using default OpenID provider endpoints"
            );
            ServiceEndpoints::defaults(origin)
        }
    }
}

/// Builds the authorization request URL.
///
/// # Errors
///
/// Returns [`Error::OAuth`] if the authorize endpoint is missing or not a URL.
pub fn authorization_url(
    config: &Config,
    authorize_endpoint: &str,
) -> Result<AuthorizationRequest, Error> {
    const INVALID: &str = "Invalid authorize endpoint found.";

    let mut url = Url::parse(endpoint(authorize_endpoint, INVALID)?)
        .map_err(|_| Error::OAuth(INVALID.into()))?;

    let code_verifier = {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", &config.client_id)
            .append_pair("scope", &config.scope_string())
            .append_pair("redirect_uri", &config.sign_in_redirect_url);

        if let Some(mode) = config.response_mode {
            query.append_pair("response_mode", mode.as_str());
        }

        let code_verifier = config.enable_pkce.then(pkce::generate_code_verifier);
        if let Some(verifier) = &code_verifier {
            query
                .append_pair("code_challenge_method", pkce::CHALLENGE_METHOD)
                .append_pair("code_challenge", &pkce::generate_code_challenge(verifier));
        }

        if let Some(prompt) = &config.prompt {
            query.append_pair("prompt", prompt);
        }
        code_verifier
    };

    Ok(AuthorizationRequest {
        url: url.into(),
        code_verifier,
    })
}

/// Authorization code grant.
///
/// # Errors
///
/// Returns [`Error::OAuth`] if the token endpoint is unknown.
pub fn token_request(
    config: &Config,
    token_endpoint: &str,
    code: &str,
    code_verifier: Option<&str>,
) -> Result<HttpRequest, Error> {
    let url = endpoint(token_endpoint, "Invalid token endpoint found.")?;

    let mut form = vec![pair("client_id", config.client_id.as_str())];
    if let Some(secret) = config.client_secret.as_deref() {
        form.push(pair("client_secret", secret));
    }
    form.push(pair("code", code));
    form.push(pair("grant_type", "authorization_code"));
    form.push(pair("redirect_uri", config.sign_in_redirect_url.as_str()));
    if let Some(verifier) = code_verifier.filter(|_| config.enable_pkce) {
        form.push(pair("code_verifier", verifier));
    }

    Ok(provider_post(config, url, form))
}

/// Refresh token grant.
///
/// # Errors
///
/// Returns [`Error::OAuth`] if the token endpoint or refresh token is missing.
pub fn refresh_token_request(
    config: &Config,
    token_endpoint: &str,
    refresh_token: Option<&str>,
) -> Result<HttpRequest, Error> {
    let url = endpoint(token_endpoint, "Invalid token endpoint found.")?;
    let refresh_token =
        refresh_token.ok_or_else(|| Error::OAuth("No refresh token found in the session.".into()))?;

    Ok(provider_post(
        config,
        url,
        vec![
            pair("client_id", config.client_id.as_str()),
            pair("refresh_token", refresh_token),
            pair("grant_type", "refresh_token"),
        ],
    ))
}

/// Access token revocation (RFC 7009).
///
/// # Errors
///
/// Returns [`Error::OAuth`] if the revoke endpoint is unknown.
pub fn revoke_token_request(
    config: &Config,
    revoke_endpoint: &str,
    access_token: &str,
) -> Result<HttpRequest, Error> {
    let url = endpoint(revoke_endpoint, "Invalid revoke token endpoint found.")?;

    Ok(provider_post(
        config,
        url,
        vec![
            pair("client_id", config.client_id.as_str()),
            pair("token", access_token),
            pair("token_type_hint", "access_token"),
        ],
    ))
}

/// Token endpoint request whose form values are caller templates.
pub(crate) fn custom_grant_request(
    config: &Config,
    token_endpoint: &str,
    data: &BTreeMap<String, String>,
    template: &GrantTemplate<'_>,
) -> Result<HttpRequest, Error> {
    let url = endpoint(token_endpoint, "Invalid token endpoint found.")?;
    let form = data
        .iter()
        .map(|(name, value)| pair(name, template.render(value)))
        .collect();
    Ok(provider_post(config, url, form))
}

/// RP-initiated logout URL.
///
/// # Errors
///
/// Returns [`Error::OAuth`] if the end-session endpoint, ID token or
/// redirect URL is missing.
pub fn sign_out_url(
    end_session_endpoint: Option<&str>,
    id_token: Option<&str>,
    post_logout_redirect_uri: &str,
) -> Result<String, Error> {
    let logout = end_session_endpoint
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| Error::OAuth("No logout endpoint found in the session.".into()))?;
    let id_token = id_token
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| Error::OAuth("Invalid id_token found in the session.".into()))?;
    if post_logout_redirect_uri.trim().is_empty() {
        return Err(Error::OAuth("No callback URL found in the session.".into()));
    }

    let mut url = Url::parse(logout).map_err(|e| Error::OAuth(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("id_token_hint", id_token)
        .append_pair("post_logout_redirect_uri", post_logout_redirect_uri);
    Ok(url.into())
}

/// Checks the status and decodes a token endpoint reply.
pub(crate) fn parse_token_response(response: HttpResponse) -> Result<TokenResponse, Error> {
    expect_ok(response)?.json()
}

/// Resolves the user from an ID token, verifying it against the provider's
/// JWKS when the configuration asks for it.
pub(crate) async fn validate_id_token<C: HttpClient>(
    http: &C,
    config: &Config,
    jwks_uri: &str,
    issuer: &str,
    id_token: &str,
) -> Result<AuthenticatedUser, Error> {
    if !config.validate_id_token {
        return Ok(AuthenticatedUser::from_claims(&token::decode_id_token_claims(
            id_token,
        )?));
    }

    let jwks_uri = endpoint(jwks_uri, "Invalid JWKS URI found.")?;
    let response = http.send(HttpRequest::get(jwks_uri)).await?;
    if response.status != 200 {
        return Err(Error::OAuth(format!(
            "Failed to load public keys from JWKS URI: {jwks_uri}"
        )));
    }
    let jwks: JwkSet = response.json()?;

    let fallback;
    let issuer = if issuer.trim().is_empty() {
        fallback = ServiceEndpoints::defaults(&config.server_origin).issuer;
        fallback.as_str()
    } else {
        issuer
    };

    let claims = token::verify_id_token(&jwks, id_token, &config.client_id, issuer)?;
    Ok(AuthenticatedUser::from_claims(&claims))
}
