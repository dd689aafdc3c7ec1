use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};

use crate::config::Config;
use crate::error::Error;
use crate::http::{self, HttpClient, HttpRequest, HttpResponse};
use crate::oidc::{self, GrantTemplate, TokenResponse};
use crate::protocol::{
    CustomGrantRequest, CustomGrantResponse, Notification, SessionData, SignInResponse, UserInfo,
};
use crate::session::{Session, SessionKey};
use crate::token::AuthenticatedUser;
use crate::well_known::ServiceEndpoints;

/// Seconds before expiry at which the access token is refreshed.
const REFRESH_MARGIN_SECS: u64 = 10;

/// Owns the authentication session and runs every operation that touches
/// the identity provider or the allow-listed APIs.
///
/// Lives on the worker thread behind an `Arc` so the refresh timer can call
/// back into it. The session lock is only ever held between awaits.
pub struct WorkerHost<C> {
    config: Config,
    http: Arc<C>,
    session: Mutex<Session>,
    refresh_timer: Mutex<Option<AbortHandle>>,
    /// Bumped each time the session is destroyed. Tokens obtained under an
    /// older generation are discarded.
    generation: AtomicU64,
    notifications: mpsc::UnboundedSender<Notification>,
    this: Weak<Self>,
}

impl<C: HttpClient> WorkerHost<C> {
    /// Validates `config` and creates a host with an empty session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first invalid field.
    pub fn initialize(
        config: Config,
        http: Arc<C>,
        notifications: mpsc::UnboundedSender<Notification>,
    ) -> Result<Arc<Self>, Error> {
        config.validate()?;
        Ok(Arc::new_cyclic(|this| Self {
            config,
            http,
            session: Mutex::new(Session::new()),
            refresh_timer: Mutex::new(None),
            generation: AtomicU64::new(0),
            notifications,
            this: this.clone(),
        }))
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_value(&self, key: SessionKey) -> String {
        self.session().get(key).unwrap_or_default().to_owned()
    }

    #[must_use]
    pub fn is_signed_in(&self) -> bool {
        self.session().contains(SessionKey::AccessToken)
    }

    /// Same predicate as [`is_signed_in`](Self::is_signed_in), kept for
    /// callers that only care whether a bearer token can be attached.
    #[must_use]
    pub fn does_token_exist(&self) -> bool {
        self.is_signed_in()
    }

    /// Records a code obtained from the redirect so the next
    /// [`sign_in`](Self::sign_in) exchanges it.
    pub fn set_auth_code(&self, code: &str, session_state: Option<&str>, pkce: Option<&str>) {
        let mut session = self.session();
        session.set(SessionKey::AuthorizationCode, code);
        session.set_opt(SessionKey::SessionState, session_state);
        if let Some(pkce) = pkce {
            session.set(SessionKey::PkceCodeVerifier, pkce);
        }
    }

    /// Discovers the provider endpoints unless already known.
    pub async fn initialize_op_configuration(&self, force: bool) {
        let initiated = self.session().op_configuration_initiated();
        if initiated && !force {
            return;
        }
        let endpoints = oidc::discover(&*self.http, &self.config.server_origin).await;
        self.session().store_endpoints(&endpoints);
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn sign_in(&self) -> Result<SignInResponse, Error> {
        let generation = self.generation();
        self.initialize_op_configuration(false).await;

        let code = self.session().remove(SessionKey::AuthorizationCode);
        let Some(code) = code else {
            if self.is_signed_in() {
                return Ok(SignInResponse::SignedIn {
                    data: self.session_data()?,
                });
            }
            return self.auth_required();
        };

        let verifier = self.session().remove(SessionKey::PkceCodeVerifier);
        let token_endpoint = self.session_value(SessionKey::TokenEndpoint);
        let request =
            oidc::token_request(&self.config, &token_endpoint, &code, verifier.as_deref())?;

        let tokens = match self
            .http
            .send(request)
            .await
            .and_then(oidc::parse_token_response)
        {
            Ok(tokens) => tokens,
            Err(e) if e.status() == Some(400) => {
                tracing::warn!(error = %e, "Authorization code rejected, restarting sign-in");
                return self.auth_required();
            }
            Err(e) => return Err(e),
        };

        self.establish_session(tokens, generation).await?;
        let data = self.session_data()?;
        tracing::info!(username = %data.user.username, "Signed in");
        Ok(SignInResponse::SignedIn { data })
    }

    fn auth_required(&self) -> Result<SignInResponse, Error> {
        let authorize_endpoint = self.session_value(SessionKey::AuthorizationEndpoint);
        let request = oidc::authorization_url(&self.config, &authorize_endpoint)?;
        if let Some(verifier) = &request.code_verifier {
            self.session()
                .set(SessionKey::PkceCodeVerifier, verifier.as_str());
        }
        Ok(SignInResponse::AuthRequired {
            code: request.url,
            pkce: request.code_verifier,
        })
    }

    /// Validates the ID token of a token endpoint reply and stores the
    /// resulting session, unless the session was destroyed since
    /// `generation` was read.
    async fn establish_session(
        &self,
        tokens: TokenResponse,
        generation: u64,
    ) -> Result<(), Error> {
        let id_token = tokens
            .id_token
            .clone()
            .ok_or_else(|| Error::OAuth("No id_token in the token response.".into()))?;
        let (jwks_uri, issuer) = {
            let session = self.session();
            (
                session.get(SessionKey::JwksUri).unwrap_or_default().to_owned(),
                session.get(SessionKey::Issuer).unwrap_or_default().to_owned(),
            )
        };

        let user =
            oidc::validate_id_token(&*self.http, &self.config, &jwks_uri, &issuer, &id_token)
                .await?;
        self.init_user_session(&tokens, &id_token, &user, generation)
    }

    fn init_user_session(
        &self,
        tokens: &TokenResponse,
        id_token: &str,
        user: &AuthenticatedUser,
        generation: u64,
    ) -> Result<(), Error> {
        {
            let mut session = self.session();
            if self.generation() != generation {
                tracing::debug!("Session ended while tokens were in flight, discarding them");
                return Err(Error::NotSignedIn);
            }
            session.set(SessionKey::AccessToken, tokens.access_token.as_str());
            if let Some(refresh_token) = &tokens.refresh_token {
                session.set(SessionKey::RefreshToken, refresh_token.as_str());
            }
            session.set(SessionKey::IdToken, id_token);
            session.set_opt(SessionKey::TokenType, tokens.token_type.as_deref());
            session.set_opt(
                SessionKey::ExpiresIn,
                tokens.expires_in.map(|secs| secs.to_string()),
            );
            session.set(
                SessionKey::IssuedAt,
                time::OffsetDateTime::now_utc().unix_timestamp().to_string(),
            );
            session.set_opt(SessionKey::AllowedScopes, tokens.scope.as_deref());
            session.set(SessionKey::DisplayName, user.display_name.as_str());
            session.set_opt(SessionKey::Email, user.email.as_deref());
            session.set(SessionKey::Username, user.username.as_str());
        }
        self.schedule_refresh(tokens.expires_in);
        Ok(())
    }

    /// Replaces any pending refresh with one firing `expires_in - 10`
    /// seconds from now. Lifetimes of ten seconds or less are not scheduled.
    fn schedule_refresh(&self, expires_in: Option<u64>) {
        self.cancel_refresh();

        let Some(delay) = expires_in
            .and_then(|secs| secs.checked_sub(REFRESH_MARGIN_SECS))
            .filter(|secs| *secs > 0)
        else {
            return;
        };

        let host = self.this.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay)).await;
            let Some(host) = host.upgrade() else {
                return;
            };
            host.refresh_timer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Err(e) = host.refresh_access_token().await {
                tracing::warn!(error = %e, "Scheduled token refresh failed");
            }
        });

        *self
            .refresh_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(timer.abort_handle());
    }

    fn cancel_refresh(&self) {
        let timer = self
            .refresh_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            timer.abort();
        }
    }

    #[cfg(test)]
    fn has_scheduled_refresh(&self) -> bool {
        self.refresh_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Exchanges the refresh token and re-initialises the session.
    pub async fn refresh_access_token(&self) -> Result<(), Error> {
        let generation = self.generation();
        let (token_endpoint, refresh_token) = {
            let session = self.session();
            (
                session
                    .get(SessionKey::TokenEndpoint)
                    .unwrap_or_default()
                    .to_owned(),
                session.get(SessionKey::RefreshToken).map(ToOwned::to_owned),
            )
        };
        let request =
            oidc::refresh_token_request(&self.config, &token_endpoint, refresh_token.as_deref())?;
        let tokens = oidc::parse_token_response(self.http.send(request).await?)?;
        self.establish_session(tokens, generation).await?;
        tracing::info!("Access token refreshed");
        Ok(())
    }

    fn notify(&self, notification: Notification) {
        if self.notifications.send(notification).is_err() {
            tracing::debug!("No listener for HTTP lifecycle notifications");
        }
    }

    /// Runs `call`; on a `401` refreshes once and runs it again. The second
    /// outcome is returned as is.
    async fn retry_unauthorized<T, F, Fut>(&self, mut call: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        match call().await {
            Err(e) if e.status() == Some(401) => {
                tracing::warn!("Access token rejected, refreshing before retry");
                self.cancel_refresh();
                self.refresh_access_token().await?;
                call().await
            }
            outcome => outcome,
        }
    }

    async fn send_authorized(&self, request: &HttpRequest) -> Result<HttpResponse, Error> {
        let token = self.session_value(SessionKey::AccessToken);
        let response = self.http.send(request.clone().with_bearer(&token)).await?;
        http::ensure_success(response)
    }

    /// Sends the batch concurrently; the first failure wins.
    async fn send_all_authorized(
        &self,
        requests: &[HttpRequest],
    ) -> Result<Vec<HttpResponse>, Error> {
        let token = self.session_value(SessionKey::AccessToken);
        let mut calls = JoinSet::new();
        for (index, request) in requests.iter().cloned().enumerate() {
            let http = Arc::clone(&self.http);
            let request = request.with_bearer(&token);
            calls.spawn(async move {
                let outcome = http.send(request).await.and_then(http::ensure_success);
                (index, outcome)
            });
        }

        let mut responses = vec![None; requests.len()];
        while let Some(joined) = calls.join_next().await {
            let (index, outcome) = joined.map_err(|e| Error::Transport(e.to_string()))?;
            responses[index] = Some(outcome?);
        }
        Ok(responses.into_iter().flatten().collect())
    }

    /// Proxies one call to an allow-listed API with the access token
    /// attached.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalUrl`] without sending anything when the URL is not
    /// allow-listed; otherwise the transport or HTTP error of the final
    /// attempt.
    pub async fn http_request(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
        if !http::is_allowed(&request.url, &self.config.base_urls) {
            return Err(Error::IllegalUrl);
        }

        self.notify(Notification::RequestStart);
        let outcome = self
            .retry_unauthorized(|| self.send_authorized(&request))
            .await;
        match &outcome {
            Ok(response) => self.notify(Notification::RequestSuccess(response.clone())),
            Err(e) => self.notify(Notification::RequestError(e.clone())),
        }
        self.notify(Notification::RequestFinish);
        outcome
    }

    /// Batch form of [`http_request`](Self::http_request). Every URL is
    /// checked before anything is sent.
    pub async fn http_request_all(
        &self,
        requests: Vec<HttpRequest>,
    ) -> Result<Vec<HttpResponse>, Error> {
        if !requests
            .iter()
            .all(|r| http::is_allowed(&r.url, &self.config.base_urls))
        {
            return Err(Error::IllegalUrl);
        }

        self.notify(Notification::RequestStart);
        let outcome = self
            .retry_unauthorized(|| self.send_all_authorized(&requests))
            .await;
        match &outcome {
            Ok(responses) => {
                for response in responses {
                    self.notify(Notification::RequestSuccess(response.clone()));
                }
            }
            Err(e) => self.notify(Notification::RequestError(e.clone())),
        }
        self.notify(Notification::RequestFinish);
        outcome
    }

    fn destroy_session(&self) {
        self.cancel_refresh();
        let mut session = self.session();
        self.generation.fetch_add(1, Ordering::SeqCst);
        session.clear_user_session();
        session.clear_op_configuration();
    }

    /// Returns the provider logout URL and forgets the session.
    pub fn sign_out(&self) -> Result<String, Error> {
        let url = {
            let session = self.session();
            oidc::sign_out_url(
                session.get(SessionKey::EndSessionEndpoint),
                session.get(SessionKey::IdToken),
                &self.config.sign_out_redirect_url,
            )?
        };
        self.destroy_session();
        tracing::info!("Signed out");
        Ok(url)
    }

    /// Revokes the access token, then forgets the session and the
    /// discovered endpoints.
    pub async fn end_user_session(&self) -> Result<bool, Error> {
        let revoke_endpoint = self.session_value(SessionKey::RevokeEndpoint);
        let access_token = self.session_value(SessionKey::AccessToken);
        let request = oidc::revoke_token_request(&self.config, &revoke_endpoint, &access_token)?;

        oidc::expect_ok(self.http.send(request).await?)?;
        self.destroy_session();
        tracing::info!("User session ended");
        Ok(true)
    }

    pub async fn custom_grant(
        &self,
        params: CustomGrantRequest,
    ) -> Result<CustomGrantResponse, Error> {
        let generation = self.generation();
        self.initialize_op_configuration(false).await;

        let (token_endpoint, access_token, username) = {
            let session = self.session();
            let get = |key| session.get(key).unwrap_or_default().to_owned();
            (
                get(SessionKey::TokenEndpoint),
                get(SessionKey::AccessToken),
                get(SessionKey::Username),
            )
        };
        let scope = self.config.scope_string();
        let template = GrantTemplate {
            token: &access_token,
            username: &username,
            scope: &scope,
            client_id: &self.config.client_id,
            client_secret: self.config.client_secret.as_deref().unwrap_or_default(),
        };

        let mut request =
            oidc::custom_grant_request(&self.config, &token_endpoint, &params.data, &template)?;
        if params.attach_token {
            request = request.with_bearer(&access_token);
        }

        let response = oidc::expect_ok(self.http.send(request).await?)?;

        if params.returns_session {
            self.establish_session(response.json()?, generation).await?;
            tracing::info!(grant = ?params.id, "Custom grant established a session");
            if params.return_response {
                return Ok(CustomGrantResponse::Session(SignInResponse::SignedIn {
                    data: self.session_data()?,
                }));
            }
            return Ok(CustomGrantResponse::Completed(true));
        }

        if params.return_response {
            return Ok(CustomGrantResponse::Response(response));
        }
        Ok(CustomGrantResponse::Completed(true))
    }

    pub async fn service_endpoints(&self) -> ServiceEndpoints {
        self.initialize_op_configuration(false).await;
        let well_known = ServiceEndpoints::defaults(&self.config.server_origin).well_known;
        self.session().endpoints(&well_known)
    }

    #[must_use]
    pub fn user_info(&self) -> UserInfo {
        let session = self.session();
        let get = |key| session.get(key).unwrap_or_default().to_owned();
        UserInfo {
            allowed_scopes: get(SessionKey::AllowedScopes),
            authorization_endpoint: get(SessionKey::AuthorizationEndpoint),
            display_name: get(SessionKey::DisplayName),
            email: get(SessionKey::Email),
            oidc_session_iframe: get(SessionKey::CheckSessionIframe),
            username: get(SessionKey::Username),
        }
    }

    fn session_data(&self) -> Result<SessionData, Error> {
        let logout_url = {
            let session = self.session();
            oidc::sign_out_url(
                session.get(SessionKey::EndSessionEndpoint),
                session.get(SessionKey::IdToken),
                &self.config.sign_out_redirect_url,
            )?
        };
        Ok(SessionData {
            user: self.user_info(),
            logout_url,
        })
    }
}

impl<C> Drop for WorkerHost<C> {
    fn drop(&mut self) {
        if let Some(timer) = self
            .refresh_timer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::test_support::{
        API, MockHttpClient, REVOKE_URL, TOKEN_URL, form_value, test_config, token_response,
    };

    fn host(
        http: &Arc<MockHttpClient>,
    ) -> (
        Arc<WorkerHost<MockHttpClient>>,
        mpsc::UnboundedReceiver<Notification>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let host = WorkerHost::initialize(test_config(), Arc::clone(http), tx).unwrap();
        (host, rx)
    }

    async fn signed_in_host(
        http: &Arc<MockHttpClient>,
    ) -> (
        Arc<WorkerHost<MockHttpClient>>,
        mpsc::UnboundedReceiver<Notification>,
    ) {
        let (host, rx) = host(http);
        http.enqueue(TOKEN_URL, token_response("at-1", "alice"));
        host.set_auth_code("code-1", Some("state-1"), Some("verifier-1"));
        let response = host.sign_in().await.unwrap();
        assert!(matches!(response, SignInResponse::SignedIn { .. }));
        (host, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn initialize_rejects_invalid_config() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut config = test_config();
        config.client_id = String::new();

        let err = WorkerHost::initialize(config, Arc::new(MockHttpClient::new()), tx)
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: The clientID must be a non-empty string"
        );
    }

    #[tokio::test]
    async fn sign_in_without_code_requires_auth() {
        let http = Arc::new(MockHttpClient::with_provider());
        let (host, _rx) = host(&http);

        let SignInResponse::AuthRequired { code, pkce } = host.sign_in().await.unwrap() else {
            panic!("expected AUTH_REQUIRED");
        };
        assert!(code.starts_with("https://idp.example.com/oauth2/authorize?response_type=code"));
        let pkce = pkce.unwrap();
        assert_eq!(
            host.session().get(SessionKey::PkceCodeVerifier),
            Some(pkce.as_str())
        );
        assert!(!host.is_signed_in());
    }

    #[tokio::test]
    async fn sign_in_exchanges_code() {
        let http = Arc::new(MockHttpClient::with_provider());
        let (host, _rx) = signed_in_host(&http).await;

        let exchange = &http.requests_to(TOKEN_URL)[0];
        assert_eq!(form_value(exchange, "code").as_deref(), Some("code-1"));
        assert_eq!(form_value(exchange, "code_verifier").as_deref(), Some("verifier-1"));

        assert!(host.is_signed_in());
        assert!(host.does_token_exist());
        assert!(host.has_scheduled_refresh());
        let user = host.user_info();
        assert_eq!(user.username, "alice");
        assert_eq!(user.email, "alice@example.com");
        assert_eq!(user.allowed_scopes, "openid profile");

        // The code is single use; signing in again reports the live session.
        let SignInResponse::SignedIn { data } = host.sign_in().await.unwrap() else {
            panic!("expected SIGNED_IN");
        };
        assert!(data.logout_url.contains("id_token_hint="));
        assert_eq!(http.requests_to(TOKEN_URL).len(), 1);
    }

    #[tokio::test]
    async fn rejected_code_restarts_sign_in() {
        let http = Arc::new(MockHttpClient::with_provider());
        let (host, _rx) = host(&http);
        http.enqueue(TOKEN_URL, HttpResponse::new(400));
        host.set_auth_code("stale", None, None);

        let response = host.sign_in().await.unwrap();
        assert!(matches!(response, SignInResponse::AuthRequired { .. }));
        assert!(!host.is_signed_in());
    }

    #[tokio::test]
    async fn token_endpoint_failure_is_surfaced() {
        let http = Arc::new(MockHttpClient::with_provider());
        let (host, _rx) = host(&http);
        http.enqueue(TOKEN_URL, HttpResponse::new(500));
        host.set_auth_code("code", None, None);

        assert_eq!(host.sign_in().await.unwrap_err().status(), Some(500));
    }

    #[tokio::test]
    async fn illegal_url_never_reaches_the_client() {
        let http = Arc::new(MockHttpClient::with_provider());
        let (host, mut rx) = host(&http);

        let err = host
            .http_request(HttpRequest::get("https://evil.example.com/steal"))
            .await
            .unwrap_err();
        assert_eq!(err, Error::IllegalUrl);

        let err = host
            .http_request_all(vec![
                HttpRequest::get(format!("{API}/ok")),
                HttpRequest::get("https://evil.example.com/steal"),
            ])
            .await
            .unwrap_err();
        assert_eq!(err, Error::IllegalUrl);

        assert!(http.requests().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn unauthorized_is_refreshed_once() {
        let http = Arc::new(MockHttpClient::with_provider());
        let (host, mut rx) = signed_in_host(&http).await;
        let url = format!("{API}/users");
        http.enqueue(&url, HttpResponse::new(401))
            .enqueue(&url, HttpResponse::new(200).with_data(serde_json::json!({ "n": 1 })));
        http.enqueue(TOKEN_URL, token_response("at-2", "alice"));

        let response = host.http_request(HttpRequest::get(&url)).await.unwrap();
        assert_eq!(response.status, 200);

        let refreshes: Vec<_> = http
            .requests_to(TOKEN_URL)
            .into_iter()
            .filter(|r| form_value(r, "grant_type").as_deref() == Some("refresh_token"))
            .collect();
        assert_eq!(refreshes.len(), 1);
        assert_eq!(
            form_value(&refreshes[0], "refresh_token").as_deref(),
            Some("refresh-at-1")
        );

        let calls = http.requests_to(&url);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].headers["Authorization"], "Bearer at-1");
        assert_eq!(calls[1].headers["Authorization"], "Bearer at-2");

        let notifications = drain(&mut rx);
        assert_eq!(notifications.len(), 3);
        assert_eq!(notifications[0], Notification::RequestStart);
        assert!(matches!(notifications[1], Notification::RequestSuccess(_)));
        assert_eq!(notifications[2], Notification::RequestFinish);
    }

    #[tokio::test]
    async fn second_unauthorized_is_returned() {
        let http = Arc::new(MockHttpClient::with_provider());
        let (host, mut rx) = signed_in_host(&http).await;
        let url = format!("{API}/users");
        http.enqueue(&url, HttpResponse::new(401))
            .enqueue(&url, HttpResponse::new(401).with_data(serde_json::json!("second")));
        http.enqueue(TOKEN_URL, token_response("at-2", "alice"));

        let err = host.http_request(HttpRequest::get(&url)).await.unwrap_err();
        let Error::Http { status, response } = &err else {
            panic!("expected an HTTP error, got {err:?}");
        };
        assert_eq!(*status, 401);
        assert_eq!(response.data, serde_json::json!("second"));
        assert_eq!(http.requests_to(&url).len(), 2);

        let notifications = drain(&mut rx);
        assert_eq!(notifications[1], Notification::RequestError(err.clone()));
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let http = Arc::new(MockHttpClient::with_provider());
        let (host, _rx) = signed_in_host(&http).await;
        let url = format!("{API}/missing");

        let err = host.http_request(HttpRequest::get(&url)).await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(http.requests_to(&url).len(), 1);
        assert_eq!(http.requests_to(TOKEN_URL).len(), 1);
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let http = Arc::new(MockHttpClient::with_provider());
        let (host, _rx) = signed_in_host(&http).await;
        for n in 0..3 {
            http.always(
                &format!("{API}/items/{n}"),
                HttpResponse::new(200).with_data(serde_json::json!(n)),
            );
        }

        let responses = host
            .http_request_all(
                (0..3)
                    .map(|n| HttpRequest::get(format!("{API}/items/{n}")))
                    .collect(),
            )
            .await
            .unwrap();
        let values: Vec<_> = responses.iter().map(|r| r.data.clone()).collect();
        assert_eq!(values, vec![serde_json::json!(0), serde_json::json!(1), serde_json::json!(2)]);
    }

    #[tokio::test]
    async fn sign_out_forgets_everything() {
        let http = Arc::new(MockHttpClient::with_provider());
        let (host, _rx) = signed_in_host(&http).await;

        let url = host.sign_out().unwrap();
        assert!(url.starts_with("https://idp.example.com/oidc/logout?id_token_hint="));
        assert!(!host.is_signed_in());
        assert!(!host.session().op_configuration_initiated());
        assert!(!host.has_scheduled_refresh());

        assert!(host.sign_out().is_err());
    }

    #[tokio::test]
    async fn end_user_session_revokes_then_clears() {
        let http = Arc::new(MockHttpClient::with_provider());
        let (host, _rx) = signed_in_host(&http).await;
        http.enqueue(REVOKE_URL, HttpResponse::new(200));

        assert!(host.end_user_session().await.unwrap());
        let revoke = &http.requests_to(REVOKE_URL)[0];
        assert_eq!(form_value(revoke, "token").as_deref(), Some("at-1"));
        assert_eq!(
            form_value(revoke, "token_type_hint").as_deref(),
            Some("access_token")
        );
        assert!(!host.is_signed_in());
        assert!(!host.session().op_configuration_initiated());
    }

    #[tokio::test]
    async fn failed_revocation_keeps_session() {
        let http = Arc::new(MockHttpClient::with_provider());
        let (host, _rx) = signed_in_host(&http).await;
        http.enqueue(REVOKE_URL, HttpResponse::new(503));

        assert_eq!(host.end_user_session().await.unwrap_err().status(), Some(503));
        assert!(host.is_signed_in());
    }

    #[tokio::test]
    async fn custom_grant_variants() {
        let http = Arc::new(MockHttpClient::with_provider());
        let (host, _rx) = signed_in_host(&http).await;
        let mut data = BTreeMap::new();
        data.insert("grant_type".to_owned(), "organization_switch".to_owned());
        data.insert("token".to_owned(), "{{token}}".to_owned());

        http.enqueue(TOKEN_URL, HttpResponse::new(200).with_data(serde_json::json!({ "ok": true })));
        let plain = host
            .custom_grant(CustomGrantRequest::new(data.clone()).attach_token(true))
            .await
            .unwrap();
        assert_eq!(plain, CustomGrantResponse::Completed(true));
        let sent = http.requests_to(TOKEN_URL).pop().unwrap();
        assert_eq!(form_value(&sent, "token").as_deref(), Some("at-1"));
        assert_eq!(sent.headers["Authorization"], "Bearer at-1");

        http.enqueue(TOKEN_URL, HttpResponse::new(200).with_data(serde_json::json!({ "ok": true })));
        let raw = host
            .custom_grant(CustomGrantRequest::new(data.clone()).return_response(true))
            .await
            .unwrap();
        assert!(matches!(raw, CustomGrantResponse::Response(r) if r.data["ok"] == true));

        http.enqueue(TOKEN_URL, token_response("at-9", "carol"));
        let session = host
            .custom_grant(
                CustomGrantRequest::new(data)
                    .returns_session(true)
                    .return_response(true),
            )
            .await
            .unwrap();
        let CustomGrantResponse::Session(SignInResponse::SignedIn { data }) = session else {
            panic!("expected a session");
        };
        assert_eq!(data.user.username, "carol");
        assert_eq!(host.session_value(SessionKey::AccessToken), "at-9");
    }

    #[tokio::test]
    async fn service_endpoints_are_discovered_on_demand() {
        let http = Arc::new(MockHttpClient::with_provider());
        let (host, _rx) = host(&http);

        let endpoints = host.service_endpoints().await;
        assert_eq!(endpoints.token, TOKEN_URL);
        assert_eq!(
            endpoints.well_known,
            "https://idp.example.com/oauth2/token/.well-known/openid-configuration"
        );
        assert!(host.session().op_configuration_initiated());
    }

    #[tokio::test(start_paused = true)]
    async fn token_is_refreshed_before_expiry() {
        let http = Arc::new(MockHttpClient::with_provider());
        let (host, _rx) = signed_in_host(&http).await;
        http.enqueue(TOKEN_URL, token_response("at-2", "alice"));

        tokio::time::sleep(Duration::from_secs(3600 - REFRESH_MARGIN_SECS + 1)).await;

        assert_eq!(host.session_value(SessionKey::AccessToken), "at-2");
        assert!(host.has_scheduled_refresh());
    }

    #[tokio::test]
    async fn transport_errors_pass_through() {
        let http = Arc::new(MockHttpClient::with_provider());
        let (host, mut rx) = signed_in_host(&http).await;
        let url = format!("{API}/users");
        http.enqueue_error(&url, Error::Transport("connection reset".into()));

        let err = host.http_request(HttpRequest::get(&url)).await.unwrap_err();

        assert_eq!(err, Error::Transport("connection reset".into()));
        assert_eq!(http.requests_to(&url).len(), 1);
        assert_eq!(http.requests_to(TOKEN_URL).len(), 1);
        assert_eq!(drain(&mut rx)[1], Notification::RequestError(err));
    }

    #[tokio::test]
    async fn failed_refresh_after_unauthorized_is_returned() {
        let http = Arc::new(MockHttpClient::with_provider());
        let (host, _rx) = signed_in_host(&http).await;
        let url = format!("{API}/users");
        http.enqueue(&url, HttpResponse::new(401));
        http.enqueue(TOKEN_URL, HttpResponse::new(400));

        let err = host.http_request(HttpRequest::get(&url)).await.unwrap_err();

        assert_eq!(err.status(), Some(400));
        assert_eq!(http.requests_to(&url).len(), 1);
        assert_eq!(http.requests_to(TOKEN_URL).len(), 2);
    }

    async fn unvalidated_signed_in_host(
        http: &Arc<MockHttpClient>,
    ) -> Arc<WorkerHost<MockHttpClient>> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = test_config().with_id_token_validation(false);
        let host = WorkerHost::initialize(config, Arc::clone(http), tx).unwrap();
        http.enqueue(TOKEN_URL, token_response("at-1", "alice"));
        host.set_auth_code("code-1", None, None);
        host.sign_in().await.unwrap();
        assert!(host.is_signed_in());
        host
    }

    #[tokio::test(start_paused = true)]
    async fn sign_out_during_scheduled_refresh_stays_signed_out() {
        let http = Arc::new(MockHttpClient::with_provider());
        let host = unvalidated_signed_in_host(&http).await;
        http.enqueue(TOKEN_URL, token_response("at-2", "alice"));
        http.delay(TOKEN_URL, Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(3600 - REFRESH_MARGIN_SECS + 1)).await;
        assert_eq!(http.requests_to(TOKEN_URL).len(), 2, "refresh should be in flight");

        host.sign_out().unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(!host.is_signed_in());
        assert_eq!(host.session().get(SessionKey::AccessToken), None);
        assert!(!host.has_scheduled_refresh());
    }

    #[tokio::test(start_paused = true)]
    async fn sign_out_during_unauthorized_retry_stays_signed_out() {
        let http = Arc::new(MockHttpClient::with_provider());
        let host = unvalidated_signed_in_host(&http).await;
        let url = format!("{API}/users");
        http.enqueue(&url, HttpResponse::new(401));
        http.enqueue(TOKEN_URL, token_response("at-2", "alice"));
        http.delay(TOKEN_URL, Duration::from_secs(5));

        let (outcome, signed_out) = tokio::join!(host.http_request(HttpRequest::get(&url)), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            host.sign_out()
        });

        assert!(signed_out.is_ok());
        assert_eq!(outcome.unwrap_err(), Error::NotSignedIn);
        assert_eq!(http.requests_to(&url).len(), 1);
        assert!(!host.is_signed_in());
        assert!(!host.has_scheduled_refresh());
    }
}
