//! The application-facing façade over the worker thread.

mod browser;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

pub use browser::{
    AUTHORIZATION_CODE, LOGOUT_URL, Location, MemoryLocation, MemoryStorage, PKCE_CODE_VERIFIER,
    SessionStorage,
};

use crate::config::Config;
use crate::error::Error;
use crate::http::{HttpRequest, HttpResponse};
use crate::protocol::{
    self, AuthCode, BatchRequest, CustomGrantRequest, CustomGrantResponse, Envelope,
    LogoutRequest, Notification, Operation, RevokeTokenRequest, ServiceEndpointsRequest,
    SessionData, SignInRequest, SignInResponse, UserInfo, UserInfoRequest,
};
use crate::well_known::ServiceEndpoints;
use crate::worker::WorkerChannel;

/// How long [`WorkerClient::communicate`] waits for a reply by default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

type Callback = Arc<dyn Fn() + Send + Sync>;
type ResponseCallback = Arc<dyn Fn(&HttpResponse) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Clone, Default)]
struct HttpHandlers {
    start: Option<Callback>,
    success: Option<ResponseCallback>,
    error: Option<ErrorCallback>,
    finish: Option<Callback>,
}

impl HttpHandlers {
    fn handle(&self, notification: &Notification) {
        match notification {
            Notification::RequestStart => {
                if let Some(f) = &self.start {
                    f();
                }
            }
            Notification::RequestSuccess(response) => {
                if let Some(f) = &self.success {
                    f(response);
                }
            }
            Notification::RequestError(error) => {
                if let Some(f) = &self.error {
                    f(error);
                }
            }
            Notification::RequestFinish => {
                if let Some(f) = &self.finish {
                    f();
                }
            }
        }
    }
}

/// Async façade over the worker.
///
/// Every operation is one [`communicate`](Self::communicate) round trip.
/// The `initialized` and `signed_in` flags only let obviously invalid calls
/// fail without a round trip; the worker checks again.
///
/// ```rust,ignore
/// let client = WorkerClient::get_instance();
/// client.initialize(Config::from_env()?).await?;
/// let user = client.sign_in().await?;
/// let me = client.http_request(HttpRequest::get("https://api.example.com/me")).await?;
/// ```
pub struct WorkerClient {
    sender: mpsc::Sender<Envelope>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    handlers: Arc<Mutex<HttpHandlers>>,
    storage: Arc<dyn SessionStorage>,
    location: Arc<dyn Location>,
    timeout: Duration,
    initialized: AtomicBool,
    signed_in: AtomicBool,
}

/// Builder for [`WorkerClient`]s outside the process-wide instance.
#[must_use]
pub struct WorkerClientBuilder {
    storage: Arc<dyn SessionStorage>,
    location: Arc<dyn Location>,
    timeout: Duration,
}

impl Default for WorkerClientBuilder {
    fn default() -> Self {
        Self {
            storage: Arc::new(MemoryStorage::new()),
            location: Arc::new(MemoryLocation::default()),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl WorkerClientBuilder {
    pub fn storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn location(mut self, location: Arc<dyn Location>) -> Self {
        self.location = location;
        self
    }

    /// Default reply timeout (10 seconds unless set).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self, channel: WorkerChannel) -> WorkerClient {
        WorkerClient {
            sender: channel.sender,
            notifications: Mutex::new(Some(channel.notifications)),
            handlers: Arc::new(Mutex::new(HttpHandlers::default())),
            storage: self.storage,
            location: self.location,
            timeout: self.timeout,
            initialized: AtomicBool::new(false),
            signed_in: AtomicBool::new(false),
        }
    }
}

#[cfg(feature = "reqwest")]
static INSTANCE: std::sync::OnceLock<WorkerClient> = std::sync::OnceLock::new();

impl WorkerClient {
    pub fn builder() -> WorkerClientBuilder {
        WorkerClientBuilder::default()
    }

    /// The process-wide client, backed by one `reqwest` worker thread that
    /// is started on first use and lives until the process exits.
    ///
    /// If the worker thread cannot be started, the instance is still
    /// returned and every call fails with [`Error::WorkerTerminated`].
    #[cfg(feature = "reqwest")]
    pub fn get_instance() -> &'static WorkerClient {
        Self::instance_in(&INSTANCE, crate::worker::Worker::spawn_default)
    }

    /// The client in `cell`, spawning its worker with `spawn` only if the
    /// cell is still empty.
    #[cfg(any(feature = "reqwest", test))]
    fn instance_in(
        cell: &'static std::sync::OnceLock<WorkerClient>,
        spawn: impl FnOnce() -> Result<WorkerChannel, Error>,
    ) -> &'static WorkerClient {
        cell.get_or_init(|| {
            let channel = spawn().unwrap_or_else(|e| {
                tracing::error!(error = %e, "Authentication worker unavailable");
                WorkerChannel::closed()
            });
            Self::builder().build(channel)
        })
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_signed_in(&self) -> bool {
        self.signed_in.load(Ordering::SeqCst)
    }

    /// Sends `data` to the worker and waits for the reply with the default
    /// timeout.
    pub async fn communicate<O: Operation>(&self, data: &O) -> Result<O::Reply, Error> {
        self.communicate_with_timeout(data, self.timeout).await
    }

    /// Sends `data` on a fresh reply port and waits at most `timeout`.
    ///
    /// A timed-out call keeps running on the worker; its reply is dropped.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when no reply arrives in time,
    /// [`Error::WorkerTerminated`] when the worker is gone, otherwise the
    /// error the worker replied with.
    pub async fn communicate_with_timeout<O: Operation>(
        &self,
        data: &O,
        timeout: Duration,
    ) -> Result<O::Reply, Error> {
        let message = protocol::encode(data)?;
        let (port, reply) = oneshot::channel();

        let exchange = async {
            self.sender
                .send(Envelope { message, port })
                .await
                .map_err(|_| Error::WorkerTerminated)?;
            reply.await.map_err(|_| Error::WorkerTerminated)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(response) => response?.into_result(),
            Err(_) => {
                tracing::warn!(kind = %O::TYPE, ?timeout, "Worker did not reply in time");
                Err(Error::Timeout)
            }
        }
    }

    fn require_initialized(&self) -> Result<(), Error> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }

    fn require_signed_in(&self) -> Result<(), Error> {
        self.require_initialized()?;
        if !self.is_signed_in() {
            return Err(Error::NotSignedIn);
        }
        Ok(())
    }

    /// Validates `config` locally, then sends it to the worker.
    ///
    /// Lifecycle callbacks registered earlier are cleared.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] without contacting the worker when a field is
    /// invalid.
    pub async fn initialize(&self, config: Config) -> Result<(), Error> {
        config.validate()?;

        *self.handlers.lock().unwrap_or_else(PoisonError::into_inner) = HttpHandlers::default();
        self.start_listener();

        self.communicate(&config).await?;
        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(client_id = %config.client_id(), "Authentication client initialized");
        Ok(())
    }

    /// Relays worker notifications to the registered callbacks. Started once.
    fn start_listener(&self) {
        let receiver = self
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut receiver) = receiver else {
            return;
        };

        let handlers = Arc::clone(&self.handlers);
        tokio::spawn(async move {
            while let Some(notification) = receiver.recv().await {
                let current = handlers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                current.handle(&notification);
            }
        });
    }

    fn update_handlers(&self, update: impl FnOnce(&mut HttpHandlers)) {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut handlers);
    }

    pub fn on_http_request_start(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.update_handlers(|h| h.start = Some(Arc::new(callback)));
    }

    pub fn on_http_request_success(
        &self,
        callback: impl Fn(&HttpResponse) + Send + Sync + 'static,
    ) {
        self.update_handlers(|h| h.success = Some(Arc::new(callback)));
    }

    pub fn on_http_request_error(&self, callback: impl Fn(&Error) + Send + Sync + 'static) {
        self.update_handlers(|h| h.error = Some(Arc::new(callback)));
    }

    pub fn on_http_request_finish(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.update_handlers(|h| h.finish = Some(Arc::new(callback)));
    }

    fn complete_sign_in(&self, data: SessionData) -> UserInfo {
        self.signed_in.store(true, Ordering::SeqCst);
        self.storage.set_item(LOGOUT_URL, &data.logout_url);
        data.user
    }

    /// Signs the user in.
    ///
    /// Resumes the code exchange when the page URL carries an authorization
    /// code or a PKCE verifier is stashed. Otherwise asks the worker; if the
    /// provider must be visited, the verifier is stashed, the page navigates
    /// to the authorization URL and an empty [`UserInfo`] is returned.
    pub async fn sign_in(&self) -> Result<UserInfo, Error> {
        self.require_initialized()?;

        let (code, _) = browser::callback_params(&self.location.href());
        if code.is_some() || self.storage.get_item(PKCE_CODE_VERIFIER).is_some() {
            return self.send_authorization_code().await;
        }

        match self.communicate(&SignInRequest(None)).await? {
            SignInResponse::SignedIn { data } => Ok(self.complete_sign_in(data)),
            SignInResponse::AuthRequired { code, pkce } => {
                if code.is_empty() {
                    return Err(Error::Authentication(
                        "No authorization url was received.".into(),
                    ));
                }
                if let Some(pkce) = pkce {
                    self.storage.set_item(PKCE_CODE_VERIFIER, &pkce);
                }
                self.location.assign(&code);
                Ok(UserInfo::default())
            }
        }
    }

    /// The URL and the stashed verifier are cleaned before the worker
    /// replies, whatever the outcome.
    async fn send_authorization_code(&self) -> Result<UserInfo, Error> {
        let href = self.location.href();
        let (code, session_state) = browser::callback_params(&href);
        let code = code.or_else(|| self.storage.get_item(AUTHORIZATION_CODE));
        let pkce = self.storage.get_item(PKCE_CODE_VERIFIER);
        let request = SignInRequest(code.map(|code| AuthCode {
            code,
            session_state,
            pkce,
        }));

        self.location
            .replace_state(&browser::strip_callback_params(&href));
        self.storage.remove_item(PKCE_CODE_VERIFIER);
        self.storage.remove_item(AUTHORIZATION_CODE);

        match self.communicate(&request).await? {
            SignInResponse::SignedIn { data } => Ok(self.complete_sign_in(data)),
            SignInResponse::AuthRequired { .. } => Err(Error::Authentication(
                "Failed during signing in after getting the authorization code.".into(),
            )),
        }
    }

    pub async fn http_request(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
        self.require_signed_in()?;
        self.communicate(&request).await
    }

    /// Sends the whole batch as one message.
    pub async fn http_request_all(
        &self,
        requests: Vec<HttpRequest>,
    ) -> Result<Vec<HttpResponse>, Error> {
        self.require_signed_in()?;
        self.communicate(&BatchRequest(requests)).await
    }

    pub async fn custom_grant(
        &self,
        params: CustomGrantRequest,
    ) -> Result<CustomGrantResponse, Error> {
        self.require_initialized()?;
        if params.sign_in_required && !self.is_signed_in() {
            return Err(Error::NotSignedIn);
        }

        let returns_session = params.returns_session;
        let response = self.communicate(&params).await?;
        if returns_session {
            self.signed_in.store(true, Ordering::SeqCst);
            if let CustomGrantResponse::Session(SignInResponse::SignedIn { data }) = &response {
                self.storage.set_item(LOGOUT_URL, &data.logout_url);
            }
        }
        Ok(response)
    }

    /// Ends the session and navigates to the provider's logout page.
    ///
    /// Without a live session, a logout URL stashed by an earlier page load
    /// is used instead.
    pub async fn sign_out(&self) -> Result<bool, Error> {
        if !self.is_signed_in() {
            let Some(logout_url) = self.storage.get_item(LOGOUT_URL) else {
                return Err(Error::NotSignedIn);
            };
            self.storage.remove_item(LOGOUT_URL);
            self.location.assign(&logout_url);
            return Ok(true);
        }

        let logout_url = self.communicate(&LogoutRequest).await?;
        self.signed_in.store(false, Ordering::SeqCst);
        self.storage.remove_item(LOGOUT_URL);
        self.location.assign(&logout_url);
        Ok(true)
    }

    /// Revokes the access token without visiting the provider.
    pub async fn end_user_session(&self) -> Result<bool, Error> {
        if !self.is_signed_in() {
            return Err(Error::NotSignedIn);
        }

        let revoked = self.communicate(&RevokeTokenRequest).await?;
        if revoked {
            self.signed_in.store(false, Ordering::SeqCst);
            self.storage.remove_item(LOGOUT_URL);
        }
        Ok(revoked)
    }

    pub async fn get_service_endpoints(&self) -> Result<ServiceEndpoints, Error> {
        self.require_initialized()?;
        self.communicate(&ServiceEndpointsRequest).await
    }

    pub async fn get_user_info(&self) -> Result<UserInfo, Error> {
        self.require_signed_in()?;
        self.communicate(&UserInfoRequest).await
    }
}
