use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Error;

/// Claims read from an OpenID Connect ID token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct IdTokenClaims {
    pub sub: String,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<JsonValue>,
    #[serde(default)]
    pub exp: Option<i64>,
}

/// Identity derived from ID token claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// `preferred_username`, falling back to `sub`.
    pub display_name: String,
    pub email: Option<String>,
    /// Always the `sub` claim.
    pub username: String,
}

impl AuthenticatedUser {
    #[must_use]
    pub fn from_claims(claims: &IdTokenClaims) -> Self {
        Self {
            display_name: claims
                .preferred_username
                .clone()
                .unwrap_or_else(|| claims.sub.clone()),
            email: claims.email.clone(),
            username: claims.sub.clone(),
        }
    }
}

/// Decodes the payload segment of a JWT without checking its signature.
///
/// # Errors
///
/// Returns `Error::Token` if the token is not three dot-separated segments
/// or the payload is not base64url JSON.
pub fn decode_id_token_claims(id_token: &str) -> Result<IdTokenClaims, Error> {
    let parts: Vec<&str> = id_token.split('.').collect();
    if parts.len() != 3 {
        return Err(Error::Token("invalid token format".into()));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|_| Error::Token("invalid payload encoding".into()))?;

    serde_json::from_slice(&payload).map_err(|e| Error::Token(format!("invalid payload: {e}")))
}

/// Verifies an ID token's signature, `aud`, `iss` and `exp` against a JWKS.
///
/// The key is selected by the header `kid`; a `kid`-less token is accepted
/// only when the set holds exactly one key.
///
/// # Errors
///
/// Returns `Error::Token` if no key matches or verification fails.
pub fn verify_id_token(
    jwks: &JwkSet,
    id_token: &str,
    client_id: &str,
    issuer: &str,
) -> Result<IdTokenClaims, Error> {
    let header =
        jsonwebtoken::decode_header(id_token).map_err(|e| Error::Token(e.to_string()))?;

    let jwk = match header.kid.as_deref() {
        Some(kid) => jwks.find(kid),
        None if jwks.keys.len() == 1 => jwks.keys.first(),
        None => None,
    }
    .ok_or_else(|| Error::Token("no matching key in JWKS".into()))?;

    let key = DecodingKey::from_jwk(jwk).map_err(|e| Error::Token(e.to_string()))?;

    let mut validation = Validation::new(header.alg);
    validation.set_audience(&[client_id]);
    validation.set_issuer(&[issuer]);

    jsonwebtoken::decode::<IdTokenClaims>(id_token, &key, &validation)
        .map(|data| data.claims)
        .map_err(|e| Error::Token(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ISSUER, sign_id_token, test_jwks};

    #[test]
    fn decodes_unverified_claims() {
        let token = sign_id_token("alice", Some("Alice"), "client");
        let claims = decode_id_token_claims(&token).unwrap();

        assert_eq!(claims.sub, "alice");
        let user = AuthenticatedUser::from_claims(&claims);
        assert_eq!(user.display_name, "Alice");
        assert_eq!(user.username, "alice");
        assert_eq!(user.email.as_deref(), Some("alice@example.com"));
    }

    #[test]
    fn display_name_falls_back_to_sub() {
        let token = sign_id_token("bob", None, "client");
        let user = AuthenticatedUser::from_claims(&decode_id_token_claims(&token).unwrap());
        assert_eq!(user.display_name, "bob");
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!(decode_id_token_claims("not-a-jwt").is_err());
        assert!(decode_id_token_claims("a.!!!.c").is_err());
    }

    #[test]
    fn verifies_against_jwks() {
        let token = sign_id_token("alice", None, "client");
        let claims = verify_id_token(&test_jwks(), &token, "client", ISSUER).unwrap();
        assert_eq!(claims.sub, "alice");
    }

    #[test]
    fn rejects_wrong_audience_or_issuer() {
        let token = sign_id_token("alice", None, "someone-else");
        assert!(matches!(
            verify_id_token(&test_jwks(), &token, "client", ISSUER),
            Err(Error::Token(_))
        ));

        let token = sign_id_token("alice", None, "client");
        assert!(verify_id_token(&test_jwks(), &token, "client", "https://other").is_err());
    }

    #[test]
    fn rejects_unknown_key() {
        let token = sign_id_token("alice", None, "client");
        let empty = JwkSet { keys: vec![] };
        let err = verify_id_token(&empty, &token, "client", ISSUER).unwrap_err();
        assert!(err.to_string().contains("no matching key"));
    }
}
