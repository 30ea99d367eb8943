//! Client connections to the active server.
//!
//! The [`ClusterDirectory`] publishes the current active endpoint through a
//! `watch` channel. A [`Connection`] sends requests to that endpoint and
//! waits for the reply. When the endpoint stops answering, the connection
//! re-resolves the active from the directory and opens a new session under a
//! fresh [`ConnectionId`]; idempotent requests are then retried.

use crate::core::error::{LifecycleError, TrellisError, TrellisResult};
use crate::core::identity::{ClientIdentity, ConnectionId, HoldToken, ServerId};
use crate::entity::{EntityRequest, EntityResponse};
use crate::server::ServerMessage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Address of a server able to take client requests.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Server id.
    pub server: ServerId,
    /// Server mailbox.
    pub mailbox: mpsc::Sender<ServerMessage>,
}

impl Endpoint {
    /// Check whether the server behind this endpoint is still running.
    pub fn is_open(&self) -> bool {
        !self.mailbox.is_closed()
    }
}

/// Where clients look up the active server.
#[derive(Debug)]
pub struct ClusterDirectory {
    active: watch::Sender<Option<Endpoint>>,
    next_connection: AtomicU64,
}

impl Default for ClusterDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterDirectory {
    /// Create a directory with no active server.
    pub fn new() -> Self {
        let (active, _) = watch::channel(None);
        Self {
            active,
            next_connection: AtomicU64::new(1),
        }
    }

    /// Announce a new active server.
    pub fn publish(&self, endpoint: Endpoint) {
        tracing::debug!(server = %endpoint.server, "active endpoint published");
        self.active.send_replace(Some(endpoint));
    }

    /// Withdraw the active server, e.g. when it was terminated.
    pub fn withdraw(&self) {
        self.active.send_replace(None);
    }

    /// Current active endpoint, if any.
    pub fn current(&self) -> Option<Endpoint> {
        self.active.borrow().clone().filter(Endpoint::is_open)
    }

    /// Wait until an open active endpoint is published.
    pub async fn wait_for_active(&self, timeout: Duration) -> Option<Endpoint> {
        let mut rx = self.active.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|endpoint| endpoint.as_ref().is_some_and(Endpoint::is_open)),
        )
        .await;
        match waited {
            Ok(Ok(endpoint)) => endpoint.clone(),
            _ => None,
        }
    }

    fn allocate_connection(&self) -> ConnectionId {
        ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed))
    }
}

/// Timeouts used by a connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// How long to wait for a reply from the active.
    pub request_timeout: Duration,
    /// How long to wait for an active to (re)appear.
    pub reconnect_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            reconnect_timeout: Duration::from_secs(10),
        }
    }
}

/// How often a request is retried across reconnects.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Reconnects attempted before the request fails with connection loss.
    pub max_reconnect_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    endpoint: Endpoint,
    id: ConnectionId,
}

/// A client's session with the active server.
#[derive(Debug)]
pub struct Connection {
    client: ClientIdentity,
    directory: Arc<ClusterDirectory>,
    settings: ConnectionSettings,
    retry: RetryPolicy,
    session: Mutex<Option<Session>>,
    next_hold: AtomicU64,
}

impl Connection {
    /// Connect to the current active, waiting up to the reconnect timeout.
    pub async fn connect(
        directory: Arc<ClusterDirectory>,
        client: ClientIdentity,
        settings: ConnectionSettings,
        retry: RetryPolicy,
    ) -> TrellisResult<Self> {
        let endpoint = directory
            .wait_for_active(settings.reconnect_timeout)
            .await
            .ok_or(TrellisError::NoActiveServer {
                waited_ms: settings.reconnect_timeout.as_millis() as u64,
            })?;
        let id = directory.allocate_connection();
        tracing::debug!(client = %client, connection = %id, server = %endpoint.server, "connected");
        Ok(Self {
            client,
            directory,
            settings,
            retry,
            session: Mutex::new(Some(Session { endpoint, id })),
            next_hold: AtomicU64::new(1),
        })
    }

    /// Identity this connection acts for.
    pub fn client(&self) -> ClientIdentity {
        self.client
    }

    /// Current connection id; `None` once closed.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.session.lock().as_ref().map(|s| s.id)
    }

    /// Server currently serving this connection.
    pub fn active_server(&self) -> Option<ServerId> {
        self.session.lock().as_ref().map(|s| s.endpoint.server)
    }

    /// Mint a hold token unique for this client.
    pub fn mint_hold_token(&self) -> HoldToken {
        HoldToken::new(self.client, self.next_hold.fetch_add(1, Ordering::Relaxed))
    }

    /// Check whether the connection was closed.
    pub fn is_closed(&self) -> bool {
        self.session.lock().is_none()
    }

    /// Send a request to the active and wait for the entity's answer.
    ///
    /// The outer result reports transport failures, the inner one the
    /// entity's verdict. Transport failures trigger a reconnect; the request
    /// is then retried if it is idempotent, otherwise connection loss is
    /// reported.
    pub async fn call(
        &self,
        request: EntityRequest,
    ) -> TrellisResult<Result<EntityResponse, LifecycleError>> {
        let mut reconnects = 0;
        loop {
            let session = self
                .session
                .lock()
                .clone()
                .ok_or_else(|| TrellisError::connection_lost("connection closed"))?;

            let reason = match self.send(&session, request.clone()).await {
                Ok(Err(LifecycleError::NotActive { server })) => format!("{server} is not active"),
                Ok(result) => return Ok(result),
                Err(reason) => reason,
            };

            tracing::warn!(
                client = %self.client,
                connection = %session.id,
                server = %session.endpoint.server,
                operation = request.operation(),
                reason = %reason,
                "lost connection to active"
            );

            if reconnects >= self.retry.max_reconnect_attempts {
                return Err(TrellisError::connection_lost(reason));
            }
            reconnects += 1;
            self.reconnect(session.id).await?;

            if !request.is_idempotent() {
                return Err(TrellisError::connection_lost(format!(
                    "{reason}; {} not retried",
                    request.operation()
                )));
            }
        }
    }

    async fn send(
        &self,
        session: &Session,
        request: EntityRequest,
    ) -> Result<Result<EntityResponse, LifecycleError>, String> {
        let (reply, rx) = oneshot::channel();
        session
            .endpoint
            .mailbox
            .send(ServerMessage::Invoke {
                client: self.client,
                connection: session.id,
                request,
                reply,
            })
            .await
            .map_err(|_| format!("{} is unreachable", session.endpoint.server))?;

        match tokio::time::timeout(self.settings.request_timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(format!("{} dropped the request", session.endpoint.server)),
            Err(_) => Err(format!(
                "no reply from {} within {}ms",
                session.endpoint.server,
                self.settings.request_timeout.as_millis()
            )),
        }
    }

    /// Re-resolve the active and open a new session, unless another caller
    /// already replaced the failed one.
    async fn reconnect(&self, failed: ConnectionId) -> TrellisResult<()> {
        if self.session.lock().as_ref().map(|s| s.id) != Some(failed) {
            return Ok(());
        }

        let endpoint = self
            .directory
            .wait_for_active(self.settings.reconnect_timeout)
            .await
            .ok_or(TrellisError::NoActiveServer {
                waited_ms: self.settings.reconnect_timeout.as_millis() as u64,
            })?;

        let mut session = self.session.lock();
        match session.as_ref() {
            Some(current) if current.id == failed => {
                let id = self.directory.allocate_connection();
                tracing::info!(
                    client = %self.client,
                    connection = %id,
                    server = %endpoint.server,
                    "reconnected to active"
                );
                *session = Some(Session { endpoint, id });
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(TrellisError::connection_lost("connection closed")),
        }
    }

    /// Close the session. The active releases state bound to it.
    pub fn close(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        let message = ServerMessage::Disconnect {
            client: self.client,
            connection: session.id,
        };
        if session.endpoint.mailbox.try_send(message).is_err() {
            tracing::debug!(client = %self.client, connection = %session.id, "disconnect not delivered");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
