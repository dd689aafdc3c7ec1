use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::error::Error;
use crate::http::{HttpClient, HttpRequest};
use crate::protocol::{
    BatchRequest, CustomGrantRequest, Envelope, LogoutRequest, MessageType, Notification,
    Operation, RawMessage, ReplyPort, ResponseMessage, RevokeTokenRequest,
    ServiceEndpointsRequest, SignInRequest, UserInfoRequest,
};
use crate::worker::host::WorkerHost;

type PendingReply = Pin<Box<dyn Future<Output = ResponseMessage> + Send>>;

enum Handled {
    Done(ResponseMessage),
    Pending(PendingReply),
}

/// Routes worker messages to [`WorkerHost`] and posts exactly one reply per
/// message.
///
/// Preconditions are checked when a message is received, in arrival order;
/// the work itself runs as a task on the worker's runtime, so handlers for
/// concurrent messages interleave.
pub struct Dispatcher<C> {
    http: Arc<C>,
    host: Option<Arc<WorkerHost<C>>>,
    notifications: mpsc::UnboundedSender<Notification>,
}

impl<C: HttpClient> Dispatcher<C> {
    #[must_use]
    pub fn new(http: Arc<C>, notifications: mpsc::UnboundedSender<Notification>) -> Self {
        Self {
            http,
            host: None,
            notifications,
        }
    }

    /// Serves `inbox` until every sender is gone, then waits for in-flight
    /// handlers.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<Envelope>) {
        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => self.dispatch(envelope, &mut handlers),
                    None => break,
                },
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Message handler panicked");
                    }
                }
            }
        }

        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Message handler panicked");
            }
        }
        tracing::debug!("Dispatcher stopped");
    }

    fn dispatch(&mut self, envelope: Envelope, handlers: &mut JoinSet<()>) {
        let Envelope { message, port } = envelope;
        match self.handle(&message) {
            Ok(Handled::Done(reply)) => deliver(port, reply),
            Ok(Handled::Pending(reply)) => {
                handlers.spawn(async move { deliver(port, reply.await) });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Rejected message");
                deliver(port, ResponseMessage::failure(&e));
            }
        }
    }

    fn handle(&mut self, message: &str) -> Result<Handled, Error> {
        let raw: RawMessage = serde_json::from_str(message)?;
        let kind: MessageType = raw.kind.parse()?;
        tracing::debug!(%kind, "Dispatching message");

        if kind != MessageType::Init {
            let host = self.host()?;
            if kind.requires_session() && !host.is_signed_in() {
                return Err(Error::NotSignedIn);
            }
        }

        let data = raw.data;
        match kind {
            MessageType::Init => {
                self.initialize(data)?;
                Ok(Handled::Done(ResponseMessage::ok(&())))
            }
            MessageType::SignIn => {
                self.pending::<SignInRequest, _, _>(data, |host, SignInRequest(code)| async move {
                    if let Some(code) = code {
                        host.set_auth_code(
                            &code.code,
                            code.session_state.as_deref(),
                            code.pkce.as_deref(),
                        );
                    }
                    host.sign_in().await
                })
            }
            MessageType::ApiCall => {
                self.pending::<HttpRequest, _, _>(data, |host, request| async move {
                    host.http_request(request).await
                })
            }
            MessageType::ApiCallAll => {
                self.pending::<BatchRequest, _, _>(data, |host, BatchRequest(requests)| async move {
                    host.http_request_all(requests).await
                })
            }
            MessageType::CustomGrant => {
                self.pending::<CustomGrantRequest, _, _>(data, |host, params| async move {
                    if params.sign_in_required && !host.is_signed_in() {
                        return Err(Error::NotSignedIn);
                    }
                    host.custom_grant(params).await
                })
            }
            MessageType::Logout => {
                self.pending::<LogoutRequest, _, _>(data, |host, _| async move { host.sign_out() })
            }
            MessageType::RevokeToken => {
                self.pending::<RevokeTokenRequest, _, _>(data, |host, _| async move {
                    host.end_user_session().await
                })
            }
            MessageType::GetServiceEndpoints => {
                self.pending::<ServiceEndpointsRequest, _, _>(data, |host, _| async move {
                    Ok(host.service_endpoints().await)
                })
            }
            MessageType::GetUserInfo => {
                self.pending::<UserInfoRequest, _, _>(data, |host, _| async move {
                    Ok(host.user_info())
                })
            }
        }
    }

    fn host(&self) -> Result<Arc<WorkerHost<C>>, Error> {
        self.host.clone().ok_or(Error::WorkerNotInitiated)
    }

    /// Decodes the payload of `O` and wraps `handler` into a reply future.
    fn pending<O, F, Fut>(&self, data: JsonValue, handler: F) -> Result<Handled, Error>
    where
        O: Operation,
        F: FnOnce(Arc<WorkerHost<C>>, O) -> Fut,
        Fut: Future<Output = Result<O::Reply, Error>> + Send + 'static,
    {
        let host = self.host()?;
        let payload: O = serde_json::from_value(data)?;
        let reply = handler(host, payload);
        Ok(Handled::Pending(Box::pin(async move {
            let outcome = reply.await;
            if let Err(e) = &outcome {
                tracing::error!(kind = %O::TYPE, error = %e, "Worker operation failed");
            }
            ResponseMessage::from_result(&outcome)
        })))
    }

    /// A repeated `INIT` is validated and acknowledged but keeps the first
    /// configuration and its session.
    fn initialize(&mut self, data: JsonValue) -> Result<(), Error> {
        let config: Config =
            serde_json::from_value(data).map_err(|e| Error::Config(e.to_string()))?;

        if self.host.is_some() {
            config.validate()?;
            tracing::warn!("Worker already initiated, keeping the existing configuration");
            return Ok(());
        }

        let host = WorkerHost::initialize(
            config,
            Arc::clone(&self.http),
            self.notifications.clone(),
        )?;
        tracing::info!(client_id = %host.config().client_id(), "Worker initiated");
        self.host = Some(host);
        Ok(())
    }
}

fn deliver(port: ReplyPort, reply: ResponseMessage) {
    if port.send(reply).is_err() {
        tracing::debug!("Caller stopped waiting, reply dropped");
    }
}
