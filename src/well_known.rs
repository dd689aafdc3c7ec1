use serde::{Deserialize, Serialize};

/// Discovery document path relative to the server origin.
pub const WELL_KNOWN_PATH: &str = "/oauth2/token/.well-known/openid-configuration";

const AUTHORIZE_PATH: &str = "/oauth2/authorize";
const TOKEN_PATH: &str = "/oauth2/token";
const REVOKE_PATH: &str = "/oauth2/revoke";
const LOGOUT_PATH: &str = "/oidc/logout";
const JWKS_PATH: &str = "/oauth2/jwks";
const CHECK_SESSION_PATH: &str = "/oidc/checksession";

/// Subset of the OpenID provider metadata the worker relies on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct OpenIdConfiguration {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub check_session_iframe: Option<String>,
}

/// Resolved identity provider endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServiceEndpoints {
    pub authorize: String,
    pub token: String,
    pub revoke: String,
    pub end_session: String,
    pub jwks: String,
    pub issuer: String,
    pub check_session_iframe: String,
    pub well_known: String,
}

impl ServiceEndpoints {
    /// Endpoints assumed when the discovery document cannot be loaded.
    #[must_use]
    pub fn defaults(server_origin: &str) -> Self {
        let origin = server_origin.trim_end_matches('/');
        Self {
            authorize: format!("{origin}{AUTHORIZE_PATH}"),
            token: format!("{origin}{TOKEN_PATH}"),
            revoke: format!("{origin}{REVOKE_PATH}"),
            end_session: format!("{origin}{LOGOUT_PATH}"),
            jwks: format!("{origin}{JWKS_PATH}"),
            issuer: format!("{origin}{TOKEN_PATH}"),
            check_session_iframe: format!("{origin}{CHECK_SESSION_PATH}"),
            well_known: format!("{origin}{WELL_KNOWN_PATH}"),
        }
    }

    /// Merge a discovery document over the defaults for `server_origin`.
    ///
    /// Without an advertised revocation endpoint, the token endpoint with its
    /// trailing `token` segment replaced by `revoke` is used.
    #[must_use]
    pub fn from_discovery(server_origin: &str, doc: OpenIdConfiguration) -> Self {
        let defaults = Self::defaults(server_origin);
        let revoke = doc.revocation_endpoint.unwrap_or_else(|| {
            match doc.token_endpoint.rfind("token") {
                Some(idx) => format!("{}revoke", &doc.token_endpoint[..idx]),
                None => defaults.revoke.clone(),
            }
        });

        Self {
            authorize: doc.authorization_endpoint,
            revoke,
            end_session: doc.end_session_endpoint.unwrap_or(defaults.end_session),
            jwks: doc.jwks_uri.unwrap_or(defaults.jwks),
            issuer: doc.issuer.unwrap_or(defaults.issuer),
            check_session_iframe: doc
                .check_session_iframe
                .unwrap_or(defaults.check_session_iframe),
            token: doc.token_endpoint,
            well_known: defaults.well_known,
        }
    }
}
