//! Messages exchanged between [`WorkerClient`](crate::WorkerClient) and the
//! worker thread.
//!
//! Every request is a [`Message`] serialized to JSON and posted together with
//! its own one-shot reply port, so replies are correlated per call without a
//! request-id table. Each payload type implements [`Operation`], which fixes
//! its [`MessageType`] and the type of its reply at compile time.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;

use crate::config::Config;
use crate::error::Error;
use crate::http::{HttpRequest, HttpResponse};
use crate::well_known::ServiceEndpoints;

/// Request kinds understood by the worker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    #[display("INIT")]
    Init,
    #[display("SIGN_IN")]
    SignIn,
    #[display("API_CALL")]
    ApiCall,
    #[display("API_CALL_ALL")]
    ApiCallAll,
    #[display("CUSTOM_GRANT")]
    CustomGrant,
    #[display("LOGOUT")]
    Logout,
    #[display("REVOKE_TOKEN")]
    RevokeToken,
    #[display("GET_SERVICE_ENDPOINTS")]
    GetServiceEndpoints,
    #[display("GET_USER_INFO")]
    GetUserInfo,
}

impl MessageType {
    pub const ALL: [Self; 9] = [
        Self::Init,
        Self::SignIn,
        Self::ApiCall,
        Self::ApiCallAll,
        Self::CustomGrant,
        Self::Logout,
        Self::RevokeToken,
        Self::GetServiceEndpoints,
        Self::GetUserInfo,
    ];

    /// Whether the worker must hold an access token before handling this
    /// kind. `CUSTOM_GRANT` decides per request.
    #[must_use]
    pub fn requires_session(&self) -> bool {
        matches!(
            self,
            Self::ApiCall | Self::ApiCallAll | Self::Logout | Self::RevokeToken | Self::GetUserInfo
        )
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.to_string() == s)
            .ok_or_else(|| Error::UnknownMessageType(s.to_owned()))
    }
}

/// Request envelope: `{ "type": ..., "data": ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message<T> {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub data: T,
}

/// A message as decoded by the worker before its type is resolved.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawMessage {
    #[serde(rename = "type")]
    pub(crate) kind: String,
    #[serde(default)]
    pub(crate) data: JsonValue,
}

/// Reply envelope. `data` and `error` hold JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

const UNSERIALIZABLE_ERROR: &str =
    r#"{"kind":"invalid_message","detail":"reply could not be serialized"}"#;

impl ResponseMessage {
    #[must_use]
    pub fn ok<R: Serialize>(reply: &R) -> Self {
        match serde_json::to_string(reply) {
            Ok(data) => Self {
                success: true,
                data: Some(data),
                error: None,
            },
            Err(e) => Self::failure(&Error::from(e)),
        }
    }

    #[must_use]
    pub fn failure(error: &Error) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(
                serde_json::to_string(error).unwrap_or_else(|_| UNSERIALIZABLE_ERROR.to_owned()),
            ),
        }
    }

    #[must_use]
    pub fn from_result<R: Serialize>(result: &Result<R, Error>) -> Self {
        match result {
            Ok(reply) => Self::ok(reply),
            Err(e) => Self::failure(e),
        }
    }

    /// Decode into the reply type or the transported error.
    ///
    /// # Errors
    ///
    /// Returns the worker's error, or [`Error::InvalidMessage`] if either
    /// side of the envelope cannot be decoded.
    pub fn into_result<R: DeserializeOwned>(self) -> Result<R, Error> {
        if self.success {
            let data = self.data.as_deref().unwrap_or("null");
            return serde_json::from_str(data).map_err(Into::into);
        }
        match self.error {
            Some(error) => Err(serde_json::from_str(&error)?),
            None => Err(Error::InvalidMessage("failure reply without an error".into())),
        }
    }
}

/// One-shot reply channel handed to the worker with each message.
pub type ReplyPort = oneshot::Sender<ResponseMessage>;

/// What actually crosses the thread boundary.
#[derive(Debug)]
pub struct Envelope {
    /// JSON text of a [`Message`].
    pub message: String,
    pub port: ReplyPort,
}

/// Binds a payload type to its message kind and reply type.
pub trait Operation: Serialize + DeserializeOwned + Send + 'static {
    const TYPE: MessageType;
    type Reply: Serialize + DeserializeOwned + Send + 'static;
}

/// Authorization code captured from the redirect back to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCode {
    pub code: String,
    #[serde(default)]
    pub session_state: Option<String>,
    #[serde(default)]
    pub pkce: Option<String>,
}

/// `SIGN_IN` payload; `None` asks the worker to start a new flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInRequest(pub Option<AuthCode>);

/// `API_CALL_ALL` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest(pub Vec<HttpRequest>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogoutRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeTokenRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpointsRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfoRequest;

/// Identity details exposed to the application.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct UserInfo {
    pub allowed_scopes: String,
    pub authorization_endpoint: String,
    pub display_name: String,
    pub email: String,
    pub oidc_session_iframe: String,
    pub username: String,
}

/// `SIGNED_IN` payload: the user plus the URL that ends the provider session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub user: UserInfo,
    pub logout_url: String,
}

/// Outcome of `SIGN_IN`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignInResponse {
    SignedIn { data: SessionData },
    /// `code` is the authorization URL to navigate to.
    AuthRequired {
        code: String,
        #[serde(default)]
        pkce: Option<String>,
    },
}

/// Token-endpoint request with caller-supplied grant parameters.
///
/// Values may contain the template tags `{{token}}`, `{{username}}`,
/// `{{scope}}`, `{{clientID}}` and `{{clientSecret}}`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct CustomGrantRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub sign_in_required: bool,
    #[serde(default)]
    pub attach_token: bool,
    #[serde(default)]
    pub returns_session: bool,
    #[serde(default)]
    pub return_response: bool,
}

impl CustomGrantRequest {
    #[must_use]
    pub fn new(data: BTreeMap<String, String>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn sign_in_required(mut self, required: bool) -> Self {
        self.sign_in_required = required;
        self
    }

    #[must_use]
    pub fn attach_token(mut self, attach: bool) -> Self {
        self.attach_token = attach;
        self
    }

    #[must_use]
    pub fn returns_session(mut self, returns: bool) -> Self {
        self.returns_session = returns;
        self
    }

    #[must_use]
    pub fn return_response(mut self, returns: bool) -> Self {
        self.return_response = returns;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CustomGrantResponse {
    Session(SignInResponse),
    Response(HttpResponse),
    Completed(bool),
}

/// Unsolicited worker-to-client notifications about proxied HTTP calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
    RequestStart,
    RequestSuccess(HttpResponse),
    RequestError(Error),
    RequestFinish,
}

impl Operation for Config {
    const TYPE: MessageType = MessageType::Init;
    type Reply = ();
}

impl Operation for SignInRequest {
    const TYPE: MessageType = MessageType::SignIn;
    type Reply = SignInResponse;
}

impl Operation for HttpRequest {
    const TYPE: MessageType = MessageType::ApiCall;
    type Reply = HttpResponse;
}

impl Operation for BatchRequest {
    const TYPE: MessageType = MessageType::ApiCallAll;
    type Reply = Vec<HttpResponse>;
}

impl Operation for CustomGrantRequest {
    const TYPE: MessageType = MessageType::CustomGrant;
    type Reply = CustomGrantResponse;
}

impl Operation for LogoutRequest {
    const TYPE: MessageType = MessageType::Logout;
    type Reply = String;
}

impl Operation for RevokeTokenRequest {
    const TYPE: MessageType = MessageType::RevokeToken;
    type Reply = bool;
}

impl Operation for ServiceEndpointsRequest {
    const TYPE: MessageType = MessageType::GetServiceEndpoints;
    type Reply = ServiceEndpoints;
}

impl Operation for UserInfoRequest {
    const TYPE: MessageType = MessageType::GetUserInfo;
    type Reply = UserInfo;
}

/// Serialize `data` as a `Message` of kind `O::TYPE`.
pub(crate) fn encode<O: Operation>(data: &O) -> Result<String, Error> {
    serde_json::to_string(&Message {
        kind: O::TYPE,
        data,
    })
    .map_err(Into::into)
}
