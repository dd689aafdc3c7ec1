use serde::{Deserialize, Serialize};

use crate::error::Error;

/// `response_mode` sent with the authorization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResponseMode {
    Query,
    FormPost,
}

impl ResponseMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::FormPost => "form_post",
        }
    }
}

impl TryFrom<String> for ResponseMode {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "query" => Ok(Self::Query),
            "form_post" => Ok(Self::FormPost),
            _ => Err("The responseMode is invalid".into()),
        }
    }
}

impl From<ResponseMode> for String {
    fn from(mode: ResponseMode) -> Self {
        mode.as_str().to_owned()
    }
}

impl std::str::FromStr for ResponseMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_owned()).map_err(Error::Config)
    }
}

/// Identity provider and client registration settings.
///
/// Supplied once through `INIT` and immutable for the lifetime of the
/// worker. Required fields are constructor parameters; optional ones are
/// set with the `with_*` methods.
///
/// ```rust,ignore
/// use oidc_worker::Config;
///
/// let config = Config::new(
///     "my-client-id",
///     "https://app.example.com",
///     "https://idp.example.com",
///     "https://app.example.com/callback",
///     "https://app.example.com/logged-out",
///     vec!["https://api.example.com".into()],
/// )
/// .with_scope(vec!["profile".into()]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Config {
    // `authorization_type`, `consent_denied`, `tenant` and `tenant_path` are
    // accepted for compatibility with existing configurations but unused.
    #[serde(rename = "authorizationType", default, skip_serializing_if = "Option::is_none")]
    pub(crate) authorization_type: Option<String>,
    #[serde(rename = "baseUrls")]
    pub(crate) base_urls: Vec<String>,
    #[serde(rename = "signInRedirectURL")]
    pub(crate) sign_in_redirect_url: String,
    #[serde(rename = "signOutRedirectURL")]
    pub(crate) sign_out_redirect_url: String,
    #[serde(rename = "clientHost")]
    pub(crate) client_host: String,
    #[serde(rename = "clientID")]
    pub(crate) client_id: String,
    #[serde(rename = "clientSecret", default, skip_serializing_if = "Option::is_none")]
    pub(crate) client_secret: Option<String>,
    #[serde(rename = "consentDenied", default, skip_serializing_if = "Option::is_none")]
    pub(crate) consent_denied: Option<bool>,
    #[serde(rename = "enablePKCE", default = "default_true")]
    pub(crate) enable_pkce: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) prompt: Option<String>,
    #[serde(rename = "responseMode", default, skip_serializing_if = "Option::is_none")]
    pub(crate) response_mode: Option<ResponseMode>,
    #[serde(default)]
    pub(crate) scope: Vec<String>,
    #[serde(rename = "serverOrigin")]
    pub(crate) server_origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) tenant: Option<String>,
    #[serde(rename = "tenantPath", default, skip_serializing_if = "Option::is_none")]
    pub(crate) tenant_path: Option<String>,
    #[serde(rename = "validateIDToken", default = "default_true")]
    pub(crate) validate_id_token: bool,
}

fn default_true() -> bool {
    true
}

impl Config {
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        client_host: impl Into<String>,
        server_origin: impl Into<String>,
        sign_in_redirect_url: impl Into<String>,
        sign_out_redirect_url: impl Into<String>,
        base_urls: Vec<String>,
    ) -> Self {
        Self {
            authorization_type: None,
            base_urls,
            sign_in_redirect_url: sign_in_redirect_url.into(),
            sign_out_redirect_url: sign_out_redirect_url.into(),
            client_host: client_host.into(),
            client_id: client_id.into(),
            client_secret: None,
            consent_denied: None,
            enable_pkce: true,
            prompt: None,
            response_mode: None,
            scope: Vec::new(),
            server_origin: server_origin.into(),
            tenant: None,
            tenant_path: None,
            validate_id_token: true,
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `OIDC_CLIENT_ID`
    /// - `OIDC_CLIENT_HOST`
    /// - `OIDC_SERVER_ORIGIN`
    /// - `OIDC_SIGN_IN_REDIRECT_URL`
    /// - `OIDC_SIGN_OUT_REDIRECT_URL`
    /// - `OIDC_BASE_URLS`: comma-separated allow-list for API calls
    ///
    /// # Optional env vars
    /// - `OIDC_CLIENT_SECRET`, `OIDC_PROMPT`, `OIDC_TENANT`, `OIDC_TENANT_PATH`
    /// - `OIDC_SCOPE`: comma-separated scopes
    /// - `OIDC_ENABLE_PKCE`, `OIDC_VALIDATE_ID_TOKEN`: `"0"`/`"false"` to disable
    /// - `OIDC_RESPONSE_MODE`: `query` or `form_post`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a required variable is missing or a value
    /// is malformed. The result is also passed through [`Config::validate`].
    pub fn from_env() -> Result<Self, Error> {
        fn required(name: &str) -> Result<String, Error> {
            std::env::var(name).map_err(|_| Error::Config(format!("{name} is required")))
        }

        fn list(value: &str) -> Vec<String> {
            value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        }

        let mut config = Self::new(
            required("OIDC_CLIENT_ID")?,
            required("OIDC_CLIENT_HOST")?,
            required("OIDC_SERVER_ORIGIN")?,
            required("OIDC_SIGN_IN_REDIRECT_URL")?,
            required("OIDC_SIGN_OUT_REDIRECT_URL")?,
            list(&required("OIDC_BASE_URLS")?),
        );

        if let Ok(secret) = std::env::var("OIDC_CLIENT_SECRET") {
            config = config.with_client_secret(secret);
        }
        if let Ok(scope) = std::env::var("OIDC_SCOPE") {
            config = config.with_scope(list(&scope));
        }
        if let Ok(prompt) = std::env::var("OIDC_PROMPT") {
            config = config.with_prompt(prompt);
        }
        if let Ok(tenant) = std::env::var("OIDC_TENANT") {
            config = config.with_tenant(tenant);
        }
        if let Ok(path) = std::env::var("OIDC_TENANT_PATH") {
            config = config.with_tenant_path(path);
        }
        if let Ok(mode) = std::env::var("OIDC_RESPONSE_MODE") {
            config = config.with_response_mode(mode.parse()?);
        }
        if let Ok(flag) = std::env::var("OIDC_ENABLE_PKCE") {
            config = config.with_pkce(!matches!(flag.as_str(), "0" | "false"));
        }
        if let Ok(flag) = std::env::var("OIDC_VALIDATE_ID_TOKEN") {
            config = config.with_id_token_validation(!matches!(flag.as_str(), "0" | "false"));
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON configuration document (the `INIT` payload shape).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the missing or malformed field.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field's shape. The first violation is reported.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] with a message naming the offending field.
    pub fn validate(&self) -> Result<(), Error> {
        fn optional(value: Option<&String>, message: &str) -> Result<(), Error> {
            match value {
                Some(v) if v.trim().is_empty() => Err(Error::Config(message.into())),
                _ => Ok(()),
            }
        }

        fn required(value: &str, message: &str) -> Result<(), Error> {
            if value.trim().is_empty() {
                return Err(Error::Config(message.into()));
            }
            Ok(())
        }

        optional(
            self.authorization_type.as_ref(),
            "The authorizationType must be a non-empty string",
        )?;
        if self.base_urls.is_empty() {
            return Err(Error::Config("baseUrls must contain at least one URL".into()));
        }
        if self.base_urls.iter().any(|u| u.trim().is_empty()) {
            return Err(Error::Config(
                "Array elements of baseUrls must all be non-empty strings".into(),
            ));
        }
        required(
            &self.sign_in_redirect_url,
            "The sign-in redirect URL must be a non-empty string",
        )?;
        required(
            &self.sign_out_redirect_url,
            "The sign-out redirect URL must be a non-empty string",
        )?;
        required(&self.client_host, "The clientHost must be a non-empty string")?;
        required(&self.client_id, "The clientID must be a non-empty string")?;
        optional(
            self.client_secret.as_ref(),
            "The clientSecret must be a non-empty string",
        )?;
        optional(self.prompt.as_ref(), "The prompt must be a non-empty string")?;
        if self.scope.iter().any(|s| s.trim().is_empty()) {
            return Err(Error::Config(
                "Array elements of scope must all be non-empty strings".into(),
            ));
        }
        required(&self.server_origin, "serverOrigin must be a non-empty string")?;
        optional(self.tenant.as_ref(), "The tenant must be a non-empty string")?;
        optional(
            self.tenant_path.as_ref(),
            "The tenantPath must be a non-empty string",
        )?;
        Ok(())
    }

    /// Reserved. Validated and carried to the worker, which does not act on
    /// it.
    #[must_use]
    pub fn with_authorization_type(mut self, authorization_type: impl Into<String>) -> Self {
        self.authorization_type = Some(authorization_type.into());
        self
    }

    #[must_use]
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Reserved. Validated and carried to the worker, which does not act on
    /// it.
    #[must_use]
    pub fn with_consent_denied(mut self, denied: bool) -> Self {
        self.consent_denied = Some(denied);
        self
    }

    /// Enable or disable PKCE (default: enabled).
    #[must_use]
    pub fn with_pkce(mut self, enabled: bool) -> Self {
        self.enable_pkce = enabled;
        self
    }

    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn with_response_mode(mut self, mode: ResponseMode) -> Self {
        self.response_mode = Some(mode);
        self
    }

    /// Requested scopes. `openid` is always added when missing.
    #[must_use]
    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = scope;
        self
    }

    /// Reserved, like [`with_tenant_path`](Self::with_tenant_path). Tenant
    /// scoping comes from the provider's discovery document.
    #[must_use]
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Reserved. Validated and carried to the worker, which does not act on
    /// it.
    #[must_use]
    pub fn with_tenant_path(mut self, path: impl Into<String>) -> Self {
        self.tenant_path = Some(path.into());
        self
    }

    /// Verify ID token signatures against the provider JWKS (default: enabled).
    #[must_use]
    pub fn with_id_token_validation(mut self, enabled: bool) -> Self {
        self.validate_id_token = enabled;
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn client_secret(&self) -> Option<&str> {
        self.client_secret.as_deref()
    }

    #[must_use]
    pub fn client_host(&self) -> &str {
        &self.client_host
    }

    /// Identity provider origin, e.g. `https://idp.example.com`.
    #[must_use]
    pub fn server_origin(&self) -> &str {
        &self.server_origin
    }

    /// URL prefixes API calls are allowed to target.
    #[must_use]
    pub fn base_urls(&self) -> &[String] {
        &self.base_urls
    }

    #[must_use]
    pub fn sign_in_redirect_url(&self) -> &str {
        &self.sign_in_redirect_url
    }

    #[must_use]
    pub fn sign_out_redirect_url(&self) -> &str {
        &self.sign_out_redirect_url
    }

    #[must_use]
    pub fn pkce_enabled(&self) -> bool {
        self.enable_pkce
    }

    #[must_use]
    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    #[must_use]
    pub fn response_mode(&self) -> Option<ResponseMode> {
        self.response_mode
    }

    #[must_use]
    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    #[must_use]
    pub fn id_token_validation(&self) -> bool {
        self.validate_id_token
    }

    /// Space-separated scope string with `openid` guaranteed present.
    pub(crate) fn scope_string(&self) -> String {
        if self.scope.is_empty() {
            return crate::oidc::OIDC_SCOPE.to_owned();
        }
        let mut scopes = self.scope.clone();
        if !scopes.iter().any(|s| s == crate::oidc::OIDC_SCOPE) {
            scopes.push(crate::oidc::OIDC_SCOPE.to_owned());
        }
        scopes.join(" ")
    }
}
