//! Cluster control and fault injection.
//!
//! [`ClusterControl`] is what failover tests drive: start every server, wait
//! for an active, wait for standbys to be in sync, kill the active. The
//! [`InProcessCluster`] implements it with one [`ServerNode`] task per
//! server and stands in for the external arbiter: when the active is
//! terminated it promotes the lowest-id running standby that the last
//! active still replicated to, as published in the shared [`InSyncRoster`].

use super::connection::{ClusterDirectory, Connection, ConnectionSettings, Endpoint, RetryPolicy};
use crate::core::error::TrellisResult;
use crate::core::identity::{ClientIdentity, ClusterUri, ServerId};
use crate::entity::configuration::ServerResources;
use crate::server::{
    InSyncRoster, NodeSettings, NodeStatus, ServerHandle, ServerMessage, ServerNode, ServerRole,
    StandbyLink,
};
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

/// Poll interval while waiting on cluster conditions.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Fault-injection interface over a cluster of one active and its standbys.
pub trait ClusterControl {
    /// Start every configured server that is not running.
    fn start_all_servers(&self) -> impl Future<Output = Result<()>> + Send;

    /// Block until an active server is serving. Returns its id.
    fn wait_for_active(&self) -> impl Future<Output = Result<ServerId>> + Send;

    /// Block until every running non-active server is a synced standby.
    fn wait_for_standbys_ready(&self) -> impl Future<Output = Result<()>> + Send;

    /// Kill the current active abruptly. Returns the terminated server's id.
    fn terminate_active(&self) -> impl Future<Output = Result<ServerId>> + Send;
}

/// Shape of an in-process cluster.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    /// Cluster name, used in the cluster URI.
    pub name: String,
    /// Number of servers (one active, the rest standbys).
    pub servers: u32,
    /// Per-server settings.
    pub node: NodeSettings,
    /// How long to wait for promotions and standby sync.
    pub promotion_timeout: Duration,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            name: "trellis".to_string(),
            servers: 2,
            node: NodeSettings::default(),
            promotion_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct Members {
    servers: BTreeMap<ServerId, ServerHandle>,
    active: Option<ServerId>,
}

impl Members {
    fn running_except(&self, except: ServerId) -> impl Iterator<Item = &ServerHandle> {
        self.servers
            .values()
            .filter(move |h| h.id() != except && h.is_running())
    }
}

/// Cluster of server tasks inside the current process.
pub struct InProcessCluster {
    settings: ClusterSettings,
    resources: Arc<ServerResources>,
    directory: Arc<ClusterDirectory>,
    members: Arc<Mutex<Members>>,
    roster: InSyncRoster,
}

impl InProcessCluster {
    /// Create a cluster. No server runs until [`ClusterControl::start_all_servers`].
    pub fn new(settings: ClusterSettings, resources: ServerResources) -> Self {
        Self {
            settings,
            resources: Arc::new(resources),
            directory: Arc::new(ClusterDirectory::new()),
            members: Arc::new(Mutex::new(Members::default())),
            roster: InSyncRoster::new(),
        }
    }

    /// Cluster settings.
    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    /// URI of this cluster, without namespace.
    pub fn uri(&self) -> ClusterUri {
        ClusterUri::new(self.settings.name.clone())
    }

    /// Directory clients resolve the active through.
    pub fn directory(&self) -> Arc<ClusterDirectory> {
        self.directory.clone()
    }

    /// Open a client connection to the current active.
    pub async fn connect(
        &self,
        client: ClientIdentity,
        settings: ConnectionSettings,
        retry: RetryPolicy,
    ) -> TrellisResult<Connection> {
        Connection::connect(self.directory.clone(), client, settings, retry).await
    }

    /// Standbys the active currently replicates to.
    pub fn roster(&self) -> &InSyncRoster {
        &self.roster
    }

    /// Current active server, if any.
    pub async fn active(&self) -> Option<ServerId> {
        self.members.lock().await.active
    }

    /// Status of every running server, ordered by id.
    pub async fn statuses(&self) -> Vec<NodeStatus> {
        let members = self.members.lock().await;
        let mut statuses = Vec::with_capacity(members.servers.len());
        for handle in members.servers.values() {
            if let Some(status) = handle.status().await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Terminate every server.
    pub async fn shutdown(&self) {
        let mut members = self.members.lock().await;
        self.directory.withdraw();
        members.active = None;
        for (_, handle) in std::mem::take(&mut members.servers) {
            handle.terminate();
        }
        tracing::info!(cluster = %self.settings.name, "cluster shut down");
    }

    /// Make the active stop without replying right after it handles the
    /// next request for `operation`. Once the server is gone a standby is
    /// elected, as after [`ClusterControl::terminate_active`].
    pub async fn crash_active_on(&self, operation: &'static str) -> Result<ServerId> {
        let members = self.members.lock().await;
        let Some(id) = members.active else {
            bail!("no active server to crash");
        };
        let handle = members
            .servers
            .get(&id)
            .with_context(|| format!("active {id} has no handle"))?;
        let (ack, rx) = oneshot::channel();
        handle
            .mailbox()
            .send(ServerMessage::CrashOn { operation, ack })
            .await
            .context("active is gone")?;
        rx.await.context("active dropped the crash request")?;
        drop(members);

        tokio::spawn(self.arbiter().elect_after_crash(id));
        tracing::warn!(server = %id, operation, "active will crash");
        Ok(id)
    }

    fn spawn_server(&self, id: ServerId, role: ServerRole) -> ServerHandle {
        ServerNode::spawn_with_roster(
            id,
            role,
            self.resources.clone(),
            self.settings.node.clone(),
            self.roster.clone(),
        )
    }

    fn arbiter(&self) -> Arbiter {
        Arbiter {
            members: self.members.clone(),
            directory: self.directory.clone(),
            roster: self.roster.clone(),
            promotion_timeout: self.settings.promotion_timeout,
        }
    }

    async fn attach(&self, active: &ServerHandle, link: StandbyLink) -> Result<()> {
        let standby = link.server;
        let (ack, rx) = oneshot::channel();
        active
            .mailbox()
            .send(ServerMessage::AttachStandby { link, ack })
            .await
            .context("active is gone")?;
        tokio::time::timeout(self.settings.promotion_timeout, rx)
            .await
            .with_context(|| format!("timed out attaching {standby}"))?
            .context("active dropped the attach request")?
            .with_context(|| format!("failed to sync {standby}"))?;
        Ok(())
    }
}

impl ClusterControl for InProcessCluster {
    async fn start_all_servers(&self) -> Result<()> {
        let mut members = self.members.lock().await;
        members.servers.retain(|_, handle| handle.is_running());

        // Standbys demoted by the active are synced again.
        if let Some(active) = members.active.and_then(|a| members.servers.get(&a)) {
            for handle in members.running_except(active.id()) {
                if let Some(status) = handle.status().await {
                    if status.role == ServerRole::Unsynced {
                        self.attach(active, handle.link()).await?;
                    }
                }
            }
        }

        for n in 1..=self.settings.servers {
            let id = ServerId(n);
            if members.servers.contains_key(&id) {
                continue;
            }
            let role = if members.active.is_none() {
                ServerRole::Active
            } else {
                ServerRole::Unsynced
            };
            let handle = self.spawn_server(id, role);

            if role == ServerRole::Active {
                self.directory.publish(Endpoint {
                    server: id,
                    mailbox: handle.mailbox().clone(),
                });
                members.active = Some(id);
            } else {
                let active = members
                    .active
                    .and_then(|a| members.servers.get(&a))
                    .with_context(|| format!("no active to attach {id} to"))?;
                self.attach(active, handle.link()).await?;
            }
            members.servers.insert(id, handle);
        }

        tracing::info!(
            cluster = %self.settings.name,
            servers = members.servers.len(),
            "all servers started"
        );
        Ok(())
    }

    async fn wait_for_active(&self) -> Result<ServerId> {
        let endpoint = self
            .directory
            .wait_for_active(self.settings.promotion_timeout)
            .await
            .with_context(|| {
                format!(
                    "no active server within {}ms",
                    self.settings.promotion_timeout.as_millis()
                )
            })?;
        Ok(endpoint.server)
    }

    async fn wait_for_standbys_ready(&self) -> Result<()> {
        let wait = async {
            loop {
                if self.standbys_ready().await {
                    return;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(self.settings.promotion_timeout, wait)
            .await
            .context("standbys not ready in time")
    }

    async fn terminate_active(&self) -> Result<ServerId> {
        let mut members = self.members.lock().await;
        let Some(id) = members.active.take() else {
            bail!("no active server to terminate");
        };
        self.directory.withdraw();
        if let Some(handle) = members.servers.remove(&id) {
            handle.terminate();
        }
        drop(members);

        tokio::spawn(self.arbiter().elect());
        Ok(id)
    }
}

impl InProcessCluster {
    async fn standbys_ready(&self) -> bool {
        let members = self.members.lock().await;
        let Some(active) = members.active.and_then(|id| members.servers.get(&id)) else {
            return false;
        };
        let Some(status) = active.status().await else {
            return false;
        };
        if status.role != ServerRole::Active {
            return false;
        }
        for standby in members.running_except(active.id()) {
            if !status.standbys.contains(&standby.id()) {
                return false;
            }
            match standby.status().await {
                Some(s) if s.role == ServerRole::Standby => {}
                _ => return false,
            }
        }
        true
    }
}

/// Promotes a standby after the active was lost.
struct Arbiter {
    members: Arc<Mutex<Members>>,
    directory: Arc<ClusterDirectory>,
    roster: InSyncRoster,
    promotion_timeout: Duration,
}

impl Arbiter {
    /// Wait for `crashed` to stop, then elect its successor.
    async fn elect_after_crash(self, crashed: ServerId) {
        loop {
            let mut members = self.members.lock().await;
            if members.active != Some(crashed) {
                return;
            }
            let gone = members
                .servers
                .get(&crashed)
                .map_or(true, |handle| !handle.is_running());
            if gone {
                members.active = None;
                members.servers.remove(&crashed);
                self.directory.withdraw();
                tracing::warn!(server = %crashed, "active crashed");
                drop(members);
                return self.elect().await;
            }
            drop(members);
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn elect(self) {
        let mut members = self.members.lock().await;
        if members.active.is_some() {
            return;
        }

        let candidates: Vec<ServerId> = members
            .servers
            .values()
            .filter(|h| h.is_running() && self.roster.contains(h.id()))
            .map(ServerHandle::id)
            .collect();
        tracing::debug!(candidates = ?candidates, "electing among in-sync standbys");

        for candidate in candidates {
            let Some(handle) = members.servers.get(&candidate) else {
                continue;
            };
            match handle.status().await {
                Some(status) if status.role == ServerRole::Standby => {}
                _ => continue,
            }

            let standbys: Vec<StandbyLink> =
                members.running_except(candidate).map(ServerHandle::link).collect();
            let (ack, rx) = oneshot::channel();
            if handle
                .mailbox()
                .send(ServerMessage::Promote { standbys, ack })
                .await
                .is_err()
            {
                continue;
            }
            match tokio::time::timeout(self.promotion_timeout, rx).await {
                Ok(Ok(status)) if status.role == ServerRole::Active => {
                    tracing::info!(
                        server = %candidate,
                        standbys = status.standbys.len(),
                        "standby elected as active"
                    );
                    self.directory.publish(Endpoint {
                        server: candidate,
                        mailbox: handle.mailbox().clone(),
                    });
                    members.active = Some(candidate);
                    return;
                }
                _ => {
                    tracing::warn!(server = %candidate, "promotion failed, trying next standby");
                }
            }
        }
        tracing::error!("no standby available for promotion");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(servers: u32) -> InProcessCluster {
        let settings = ClusterSettings {
            servers,
            promotion_timeout: Duration::from_secs(5),
            ..ClusterSettings::default()
        };
        InProcessCluster::new(settings, ServerResources::default())
    }

    #[tokio::test]
    async fn arbiter_skips_standbys_outside_the_roster() {
        let cluster = cluster(3);
        cluster.start_all_servers().await.unwrap();
        cluster.wait_for_standbys_ready().await.unwrap();
        assert_eq!(cluster.roster().members(), vec![ServerId(2), ServerId(3)]);

        // Server 2 still reports itself a standby but missed the last entries.
        cluster.roster().publish([ServerId(3)]);
        cluster.terminate_active().await.unwrap();

        assert_eq!(cluster.wait_for_active().await.unwrap(), ServerId(3));
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn no_election_without_an_in_sync_standby() {
        let cluster = cluster(2);
        cluster.start_all_servers().await.unwrap();
        cluster.wait_for_standbys_ready().await.unwrap();

        cluster.roster().publish(Vec::new());
        cluster.terminate_active().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(cluster.active().await, None);
        cluster.shutdown().await;
    }
}
