//! The worker thread: a dedicated OS thread running a single-threaded tokio
//! runtime that owns the session and serves [`Envelope`]s.

mod dispatcher;
mod host;

use std::sync::Arc;

use tokio::sync::mpsc;

pub use dispatcher::Dispatcher;
pub use host::WorkerHost;

use crate::error::Error;
use crate::http::HttpClient;
use crate::protocol::{Envelope, Notification};

/// Name of the worker's OS thread.
pub const THREAD_NAME: &str = "oidc-worker";

/// Messages that may queue up before the worker picks them up.
const INBOX_CAPACITY: usize = 64;

/// Client-side ends of a worker's channels.
#[derive(Debug)]
pub struct WorkerChannel {
    pub sender: mpsc::Sender<Envelope>,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
}

impl WorkerChannel {
    #[must_use]
    pub fn new(
        sender: mpsc::Sender<Envelope>,
        notifications: mpsc::UnboundedReceiver<Notification>,
    ) -> Self {
        Self {
            sender,
            notifications,
        }
    }

    /// A channel with no worker behind it; every call fails with
    /// [`Error::WorkerTerminated`].
    #[must_use]
    pub fn closed() -> Self {
        let (sender, _) = mpsc::channel(1);
        let (_, notifications) = mpsc::unbounded_channel();
        Self::new(sender, notifications)
    }
}

pub struct Worker;

impl Worker {
    /// Starts the worker thread. It exits once every sender is dropped and
    /// in-flight handlers have replied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerTerminated`] if the OS refuses to spawn the
    /// thread.
    pub fn spawn<C: HttpClient>(http: C) -> Result<WorkerChannel, Error> {
        let (sender, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (notify, notifications) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(Arc::new(http), notify);

        std::thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to start worker runtime");
                        return;
                    }
                };
                runtime.block_on(dispatcher.run(inbox));
            })
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to spawn worker thread");
                Error::WorkerTerminated
            })?;

        Ok(WorkerChannel::new(sender, notifications))
    }

    /// [`spawn`](Self::spawn) with the `reqwest` transport.
    #[cfg(feature = "reqwest")]
    pub fn spawn_default() -> Result<WorkerChannel, Error> {
        Self::spawn(crate::reqwest_client::ReqwestClient::new())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;
    use crate::protocol::{self, ResponseMessage, ServiceEndpointsRequest};
    use crate::test_support::{MockHttpClient, init_tracing, test_config};

    async fn call(channel: &WorkerChannel, message: String) -> ResponseMessage {
        let (port, reply) = oneshot::channel();
        channel
            .sender
            .send(Envelope { message, port })
            .await
            .unwrap();
        reply.await.unwrap()
    }

    #[tokio::test]
    async fn serves_messages_on_its_own_thread() {
        init_tracing();
        let channel = Worker::spawn(MockHttpClient::with_provider()).unwrap();

        let init = call(&channel, protocol::encode(&test_config()).unwrap()).await;
        assert!(init.success);

        let endpoints = call(&channel, protocol::encode(&ServiceEndpointsRequest).unwrap())
            .await
            .into_result::<crate::well_known::ServiceEndpoints>()
            .unwrap();
        assert_eq!(endpoints.authorize, "https://idp.example.com/oauth2/authorize");
    }

    #[tokio::test]
    async fn closed_channel_has_no_worker() {
        let channel = WorkerChannel::closed();
        let (port, _reply) = oneshot::channel();
        let sent = channel
            .sender
            .send(Envelope {
                message: String::new(),
                port,
            })
            .await;
        assert!(sent.is_err());
    }
}
