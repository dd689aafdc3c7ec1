use std::collections::HashMap;

use crate::well_known::ServiceEndpoints;

/// Keys of the worker-local session store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[non_exhaustive]
pub enum SessionKey {
    #[display("access_token")]
    AccessToken,
    #[display("refresh_token")]
    RefreshToken,
    #[display("id_token")]
    IdToken,
    #[display("token_type")]
    TokenType,
    #[display("expires_in")]
    ExpiresIn,
    #[display("issued_at")]
    IssuedAt,
    #[display("scope")]
    AllowedScopes,
    #[display("display_name")]
    DisplayName,
    #[display("email")]
    Email,
    #[display("username")]
    Username,
    #[display("authorization_code")]
    AuthorizationCode,
    #[display("pkce_code_verifier")]
    PkceCodeVerifier,
    #[display("session_state")]
    SessionState,
    #[display("authorization_endpoint")]
    AuthorizationEndpoint,
    #[display("token_endpoint")]
    TokenEndpoint,
    #[display("revoke_token_endpoint")]
    RevokeEndpoint,
    #[display("end_session_endpoint")]
    EndSessionEndpoint,
    #[display("jwks_uri")]
    JwksUri,
    #[display("issuer")]
    Issuer,
    #[display("check_session_iframe")]
    CheckSessionIframe,
    #[display("op_config_initiated")]
    OpConfigInitiated,
}

const USER_SESSION_KEYS: &[SessionKey] = &[
    SessionKey::AccessToken,
    SessionKey::RefreshToken,
    SessionKey::IdToken,
    SessionKey::TokenType,
    SessionKey::ExpiresIn,
    SessionKey::IssuedAt,
    SessionKey::AllowedScopes,
    SessionKey::DisplayName,
    SessionKey::Email,
    SessionKey::Username,
    SessionKey::SessionState,
];

const OP_CONFIGURATION_KEYS: &[SessionKey] = &[
    SessionKey::AuthorizationEndpoint,
    SessionKey::TokenEndpoint,
    SessionKey::RevokeEndpoint,
    SessionKey::EndSessionEndpoint,
    SessionKey::JwksUri,
    SessionKey::Issuer,
    SessionKey::CheckSessionIframe,
    SessionKey::OpConfigInitiated,
];

/// Authentication state held in worker memory.
///
/// Never handed to the client thread as a whole; replies carry only the
/// derived [`UserInfo`](crate::protocol::UserInfo).
#[derive(Debug, Default, Clone)]
pub struct Session {
    values: HashMap<SessionKey, String>,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: SessionKey) -> Option<&str> {
        self.values.get(&key).map(String::as_str)
    }

    /// Stores `value`, treating an empty string as removal.
    pub fn set(&mut self, key: SessionKey, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            self.values.remove(&key);
        } else {
            self.values.insert(key, value);
        }
    }

    pub fn set_opt(&mut self, key: SessionKey, value: Option<impl Into<String>>) {
        match value {
            Some(v) => self.set(key, v),
            None => {
                self.values.remove(&key);
            }
        }
    }

    pub fn remove(&mut self, key: SessionKey) -> Option<String> {
        self.values.remove(&key)
    }

    #[must_use]
    pub fn contains(&self, key: SessionKey) -> bool {
        self.values.contains_key(&key)
    }

    /// Drop tokens and identity claims.
    pub fn clear_user_session(&mut self) {
        for key in USER_SESSION_KEYS {
            self.values.remove(key);
        }
    }

    /// Drop the discovered identity provider endpoints.
    pub fn clear_op_configuration(&mut self) {
        for key in OP_CONFIGURATION_KEYS {
            self.values.remove(key);
        }
    }

    #[must_use]
    pub fn op_configuration_initiated(&self) -> bool {
        self.contains(SessionKey::OpConfigInitiated)
    }

    pub(crate) fn store_endpoints(&mut self, endpoints: &ServiceEndpoints) {
        self.set(SessionKey::AuthorizationEndpoint, endpoints.authorize.as_str());
        self.set(SessionKey::TokenEndpoint, endpoints.token.as_str());
        self.set(SessionKey::RevokeEndpoint, endpoints.revoke.as_str());
        self.set(SessionKey::EndSessionEndpoint, endpoints.end_session.as_str());
        self.set(SessionKey::JwksUri, endpoints.jwks.as_str());
        self.set(SessionKey::Issuer, endpoints.issuer.as_str());
        self.set(
            SessionKey::CheckSessionIframe,
            endpoints.check_session_iframe.as_str(),
        );
        self.set(SessionKey::OpConfigInitiated, "true");
    }

    /// Endpoints currently stored, with blanks for anything missing.
    pub(crate) fn endpoints(&self, well_known: &str) -> ServiceEndpoints {
        let get = |key| self.get(key).unwrap_or_default().to_owned();
        ServiceEndpoints {
            authorize: get(SessionKey::AuthorizationEndpoint),
            token: get(SessionKey::TokenEndpoint),
            revoke: get(SessionKey::RevokeEndpoint),
            end_session: get(SessionKey::EndSessionEndpoint),
            jwks: get(SessionKey::JwksUri),
            issuer: get(SessionKey::Issuer),
            check_session_iframe: get(SessionKey::CheckSessionIframe),
            well_known: well_known.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_value_removes_key() {
        let mut session = Session::new();
        session.set(SessionKey::AccessToken, "abc");
        assert_eq!(session.get(SessionKey::AccessToken), Some("abc"));

        session.set(SessionKey::AccessToken, "");
        assert!(!session.contains(SessionKey::AccessToken));
    }

    #[test]
    fn clearing_user_session_keeps_endpoints() {
        let mut session = Session::new();
        session.store_endpoints(&ServiceEndpoints::defaults("https://idp.example.com"));
        session.set(SessionKey::AccessToken, "abc");
        session.set(SessionKey::Username, "alice");

        session.clear_user_session();

        assert!(session.get(SessionKey::AccessToken).is_none());
        assert!(session.get(SessionKey::Username).is_none());
        assert!(session.op_configuration_initiated());
        assert_eq!(
            session.get(SessionKey::TokenEndpoint),
            Some("https://idp.example.com/oauth2/token")
        );

        session.clear_op_configuration();
        assert!(!session.op_configuration_initiated());
        assert!(session.get(SessionKey::TokenEndpoint).is_none());
    }

    #[test]
    fn remove_is_single_use() {
        let mut session = Session::new();
        session.set(SessionKey::AuthorizationCode, "code-1");
        assert_eq!(session.remove(SessionKey::AuthorizationCode).as_deref(), Some("code-1"));
        assert!(session.remove(SessionKey::AuthorizationCode).is_none());
        assert_eq!(SessionKey::AuthorizationCode.to_string(), "authorization_code");
    }
}
