//! Server process.
//!
//! A [`ServerNode`] is a single task draining its mailbox, so every request
//! against the entities it hosts is serialized in mailbox order. While
//! active, each mutating request is planned, applied locally, and replicated
//! to every standby; the client reply is sent only after all standbys
//! acknowledged. A standby that cannot be reached is dropped from the
//! replication set; one that reports divergence is resynced from a snapshot.
//!
//! A standby dropped from the replication set is told to demote itself and
//! the active republishes its [`InSyncRoster`]. A demoted server misses
//! later entries, so it refuses promotion until it is synced again.
//!
//! Promotion needs no catch-up: a standby in the roster already holds every
//! acknowledged entry. The promoted server resyncs the remaining standbys,
//! because an active that died mid-replication may have reached only some of
//! them.

use super::message::{NodeStatus, ServerMessage, ServerRole, StandbyLink};
use super::roster::InSyncRoster;
use crate::core::error::{LifecycleError, ReplicationError};
use crate::core::identity::{ClientIdentity, ConnectionId, ServerId};
use crate::entity::configuration::ServerResources;
use crate::entity::{EntityRequest, EntityResponse};
use crate::replication::{ReplicaSnapshot, ReplicaState, ReplicatedOp, ReplicationEntry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Tunables of a server process.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// Mailbox capacity.
    pub mailbox_capacity: usize,
    /// How long the active waits for a standby acknowledgement.
    pub replication_timeout: Duration,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            replication_timeout: Duration::from_secs(5),
        }
    }
}

/// Handle to a running server task.
#[derive(Debug)]
pub struct ServerHandle {
    id: ServerId,
    mailbox: mpsc::Sender<ServerMessage>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Server id.
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// Mailbox of the server.
    pub fn mailbox(&self) -> &mpsc::Sender<ServerMessage> {
        &self.mailbox
    }

    /// Replication link to this server.
    pub fn link(&self) -> StandbyLink {
        StandbyLink {
            server: self.id,
            mailbox: self.mailbox.clone(),
        }
    }

    /// Check whether the task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Query the server's status. `None` if it is gone.
    pub async fn status(&self) -> Option<NodeStatus> {
        let (reply, rx) = oneshot::channel();
        self.mailbox.send(ServerMessage::Status { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Kill the server abruptly. In-flight requests are dropped unanswered.
    pub fn terminate(self) {
        tracing::warn!(server = %self.id, "terminating server");
        self.task.abort();
    }
}

/// Failure to deliver an entry to a standby.
enum StandbyFailure {
    Unreachable,
    Diverged(ReplicationError),
}

/// Server process state.
pub struct ServerNode {
    id: ServerId,
    role: ServerRole,
    state: ReplicaState,
    resources: Arc<ServerResources>,
    standbys: Vec<StandbyLink>,
    roster: InSyncRoster,
    settings: NodeSettings,
    mailbox: mpsc::Receiver<ServerMessage>,
    crash_on: Option<&'static str>,
    crashed: bool,
}

impl ServerNode {
    /// Spawn a server task with a roster of its own.
    pub fn spawn(
        id: ServerId,
        role: ServerRole,
        resources: Arc<ServerResources>,
        settings: NodeSettings,
    ) -> ServerHandle {
        Self::spawn_with_roster(id, role, resources, settings, InSyncRoster::new())
    }

    /// Spawn a server task sharing `roster` with the rest of its cluster.
    pub fn spawn_with_roster(
        id: ServerId,
        role: ServerRole,
        resources: Arc<ServerResources>,
        settings: NodeSettings,
        roster: InSyncRoster,
    ) -> ServerHandle {
        let (tx, rx) = mpsc::channel(settings.mailbox_capacity.max(1));
        let node = Self {
            id,
            role,
            state: ReplicaState::new(),
            resources,
            standbys: Vec::new(),
            roster,
            settings,
            mailbox: rx,
            crash_on: None,
            crashed: false,
        };
        tracing::info!(server = %id, role = %role, "server started");
        let task = tokio::spawn(node.run());
        ServerHandle {
            id,
            mailbox: tx,
            task,
        }
    }

    async fn run(mut self) {
        while let Some(message) = self.mailbox.recv().await {
            self.handle(message).await;
            if self.crashed {
                tracing::warn!(server = %self.id, "server crashed");
                return;
            }
        }
        tracing::debug!(server = %self.id, "mailbox closed");
    }

    async fn handle(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Invoke {
                client,
                connection,
                request,
                reply,
            } => {
                let operation = request.operation();
                let result = self.invoke(request, client, connection).await;
                if self.crash_on == Some(operation) {
                    // Close first so clients never see this endpoint as open
                    // once the reply is gone.
                    self.mailbox.close();
                    self.crashed = true;
                    tracing::warn!(server = %self.id, operation, "dropping reply and crashing");
                    return;
                }
                // The client may have given up; nothing to do then.
                let _ = reply.send(result);
            }
            ServerMessage::Disconnect { client, connection } => {
                self.disconnect(client, connection).await;
            }
            ServerMessage::Replicate { entry, ack } => {
                let _ = ack.send(self.accept(&entry));
            }
            ServerMessage::Sync { snapshot, ack } => {
                let _ = ack.send(self.install(&snapshot));
            }
            ServerMessage::AttachStandby { link, ack } => {
                let _ = ack.send(self.attach(link).await);
            }
            ServerMessage::Demote => self.demote(),
            ServerMessage::Promote { standbys, ack } => {
                self.promote(standbys).await;
                let _ = ack.send(self.status());
            }
            ServerMessage::Status { reply } => {
                let _ = reply.send(self.status());
            }
            ServerMessage::CrashOn { operation, ack } => {
                tracing::warn!(server = %self.id, operation, "crash armed");
                self.crash_on = Some(operation);
                let _ = ack.send(());
            }
        }
    }

    async fn invoke(
        &mut self,
        request: EntityRequest,
        client: ClientIdentity,
        connection: ConnectionId,
    ) -> Result<EntityResponse, LifecycleError> {
        if self.role != ServerRole::Active {
            return Err(LifecycleError::NotActive { server: self.id });
        }

        let plan = self
            .state
            .plan(&request, client, connection, &self.resources)
            .map_err(|err| {
                tracing::debug!(
                    server = %self.id,
                    client = %client,
                    operation = request.operation(),
                    error = %err,
                    "request rejected"
                );
                err
            })?;

        tracing::debug!(
            server = %self.id,
            client = %client,
            connection = %connection,
            operation = request.operation(),
            entries = plan.ops.len(),
            "request planned"
        );
        self.commit(plan.ops).await;
        Ok(plan.response)
    }

    async fn disconnect(&mut self, client: ClientIdentity, connection: ConnectionId) {
        if self.role != ServerRole::Active {
            return;
        }
        let ops = self.state.plan_disconnect(client, connection);
        if !ops.is_empty() {
            tracing::info!(
                server = %self.id,
                client = %client,
                connection = %connection,
                released = ops.len(),
                "releasing state of closed connection"
            );
        }
        self.commit(ops).await;
    }

    /// Apply and replicate operations in order.
    async fn commit(&mut self, ops: Vec<ReplicatedOp>) {
        for op in ops {
            match self.state.append(op) {
                Ok(entry) => self.replicate(&entry).await,
                Err(err) => {
                    tracing::error!(server = %self.id, error = %err, "planned operation failed to apply");
                }
            }
        }
    }

    async fn replicate(&mut self, entry: &ReplicationEntry) {
        let mut lost = Vec::new();
        for (idx, link) in self.standbys.iter().enumerate() {
            match self.send_entry(link, entry).await {
                Ok(()) => {}
                Err(StandbyFailure::Diverged(err)) => {
                    tracing::warn!(
                        server = %self.id,
                        standby = %link.server,
                        error = %err,
                        "standby diverged, resyncing"
                    );
                    if let Err(err) = self.sync_standby(link).await {
                        tracing::warn!(standby = %link.server, error = %err, "resync failed");
                        lost.push(idx);
                    }
                }
                Err(StandbyFailure::Unreachable) => lost.push(idx),
            }
        }
        if lost.is_empty() {
            return;
        }
        for idx in lost.into_iter().rev() {
            let link = self.standbys.remove(idx);
            tracing::warn!(
                server = %self.id,
                standby = %link.server,
                "standby unreachable, removed from replication set"
            );
            Self::send_demote(&link);
        }
        self.publish_roster();
    }

    fn send_demote(link: &StandbyLink) {
        if link.mailbox.try_send(ServerMessage::Demote).is_err() {
            tracing::debug!(standby = %link.server, "demote not delivered");
        }
    }

    fn publish_roster(&self) {
        self.roster
            .publish(self.standbys.iter().map(|link| link.server));
    }

    async fn send_entry(
        &self,
        link: &StandbyLink,
        entry: &ReplicationEntry,
    ) -> Result<(), StandbyFailure> {
        let (ack, rx) = oneshot::channel();
        link.mailbox
            .send(ServerMessage::Replicate {
                entry: entry.clone(),
                ack,
            })
            .await
            .map_err(|_| StandbyFailure::Unreachable)?;
        match tokio::time::timeout(self.settings.replication_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(err))) => Err(StandbyFailure::Diverged(err)),
            Ok(Err(_)) | Err(_) => Err(StandbyFailure::Unreachable),
        }
    }

    async fn sync_standby(&self, link: &StandbyLink) -> Result<(), ReplicationError> {
        let snapshot = ReplicaSnapshot::capture(self.id, &self.state)?;
        let size = snapshot.size_bytes();
        let unreachable = || ReplicationError::Snapshot(format!("{} unreachable", link.server));

        let (ack, rx) = oneshot::channel();
        link.mailbox
            .send(ServerMessage::Sync { snapshot, ack })
            .await
            .map_err(|_| unreachable())?;
        tokio::time::timeout(self.settings.replication_timeout, rx)
            .await
            .map_err(|_| unreachable())?
            .map_err(|_| unreachable())??;

        tracing::info!(server = %self.id, standby = %link.server, bytes = size, "standby synced");
        Ok(())
    }

    async fn attach(&mut self, link: StandbyLink) -> Result<(), ReplicationError> {
        if self.role != ServerRole::Active {
            return Err(ReplicationError::NotStandby { server: self.id });
        }
        self.sync_standby(&link).await?;
        self.standbys.retain(|l| l.server != link.server);
        self.standbys.push(link);
        self.publish_roster();
        Ok(())
    }

    fn accept(&mut self, entry: &ReplicationEntry) -> Result<(), ReplicationError> {
        if self.role != ServerRole::Standby {
            return Err(ReplicationError::NotStandby { server: self.id });
        }
        self.state.accept(entry).map_err(|err| {
            tracing::warn!(server = %self.id, error = %err, "replication entry refused");
            err
        })
    }

    fn install(&mut self, snapshot: &ReplicaSnapshot) -> Result<(), ReplicationError> {
        if self.role == ServerRole::Active {
            return Err(ReplicationError::NotStandby { server: self.id });
        }
        self.state = snapshot.restore()?;
        self.role = ServerRole::Standby;
        tracing::debug!(
            server = %self.id,
            source = %snapshot.source,
            applied = snapshot.applied_entries,
            "snapshot installed"
        );
        Ok(())
    }

    fn demote(&mut self) {
        if self.role != ServerRole::Standby {
            return;
        }
        self.role = ServerRole::Unsynced;
        tracing::warn!(
            server = %self.id,
            applied = self.state.log().total_entries(),
            "demoted, waiting for resync"
        );
    }

    async fn promote(&mut self, standbys: Vec<StandbyLink>) {
        if self.role != ServerRole::Standby {
            tracing::warn!(server = %self.id, role = %self.role, "promotion refused");
            return;
        }
        self.role = ServerRole::Active;
        tracing::info!(
            server = %self.id,
            applied = self.state.log().total_entries(),
            standbys = standbys.len(),
            "promoted to active"
        );

        self.standbys.clear();
        for link in standbys {
            match self.sync_standby(&link).await {
                Ok(()) => self.standbys.push(link),
                Err(err) => {
                    tracing::warn!(standby = %link.server, error = %err, "standby lost during promotion");
                    Self::send_demote(&link);
                }
            }
        }
        self.publish_roster();
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            server: self.id,
            role: self.role,
            applied_entries: self.state.log().total_entries(),
            namespaces: self.state.tiers().len(),
            locks: self.state.locks().len(),
            standbys: self.standbys.iter().map(|l| l.server).collect(),
        }
    }
}
