//! Replication and server node tests.

mod common;

use std::sync::Arc;
use trellis::cluster::ClusterControl;
use trellis::core::error::{LifecycleError, ReplicationError};
use trellis::core::identity::{ClientIdentity, ConnectionId, ServerId};
use trellis::entity::lock::LockMode;
use trellis::entity::tier_manager::TierOp;
use trellis::entity::{EntityRequest, EntityResponse};
use trellis::replication::{EntityKey, ReplicaSnapshot, ReplicaState, ReplicatedOp, ReplicationEntry};
use trellis::server::{
    InSyncRoster, NodeSettings, ServerHandle, ServerMessage, ServerNode, ServerRole, StandbyLink,
};
use tokio::sync::{mpsc, oneshot};

const NS: &str = "replicated";

fn create_request() -> EntityRequest {
    EntityRequest::Create {
        namespace: NS.to_string(),
        configuration: common::server_config(),
    }
}

async fn invoke(
    server: &ServerHandle,
    client: ClientIdentity,
    request: EntityRequest,
) -> Result<EntityResponse, LifecycleError> {
    let (reply, rx) = oneshot::channel();
    server
        .mailbox()
        .send(ServerMessage::Invoke {
            client,
            connection: ConnectionId(1),
            request,
            reply,
        })
        .await
        .expect("server running");
    rx.await.expect("reply")
}

async fn attach(active: &ServerHandle, standby: &ServerHandle) -> Result<(), ReplicationError> {
    let (ack, rx) = oneshot::channel();
    active
        .mailbox()
        .send(ServerMessage::AttachStandby {
            link: standby.link(),
            ack,
        })
        .await
        .expect("active running");
    rx.await.expect("ack")
}

fn spawn(id: u32, role: ServerRole) -> ServerHandle {
    ServerNode::spawn(
        ServerId(id),
        role,
        Arc::new(common::resources()),
        NodeSettings::default(),
    )
}

// ============================================================================
// Replicated state machine
// ============================================================================

#[test]
fn standby_state_mirrors_active() {
    let resources = common::resources();
    let client = ClientIdentity::generate();
    let mut active = ReplicaState::new();
    let mut standby = ReplicaState::new();

    let requests = [
        create_request(),
        EntityRequest::TryLock {
            name: "L".to_string(),
            mode: LockMode::Read,
            token: trellis::core::identity::HoldToken::new(client, 1),
        },
        EntityRequest::Untrack {
            namespace: NS.to_string(),
        },
    ];
    for request in &requests {
        let plan = active.plan(request, client, ConnectionId(1), &resources).unwrap();
        for op in plan.ops {
            let entry = active.append(op).unwrap();
            standby.accept(&entry).unwrap();
        }
    }

    assert_eq!(standby, active);
    assert_eq!(active.log().total_entries(), 3);
    assert_eq!(
        active.log().last_sequence(&EntityKey::TierManager(NS.to_string())),
        2
    );
    assert_eq!(active.log().last_sequence(&EntityKey::Lock("L".to_string())), 1);
}

#[test]
fn standby_refuses_out_of_order_entries() {
    let resources = common::resources();
    let client = ClientIdentity::generate();
    let mut active = ReplicaState::new();
    let plan = active
        .plan(&create_request(), client, ConnectionId(1), &resources)
        .unwrap();
    let first = active.append(plan.ops[0].clone()).unwrap();
    let second = active
        .append(ReplicatedOp::Tier(TierOp::Untrack {
            namespace: NS.to_string(),
            client,
        }))
        .unwrap();

    let mut standby = ReplicaState::new();
    assert!(matches!(
        standby.accept(&second),
        Err(ReplicationError::Gap {
            expected: 1,
            found: 2,
            ..
        })
    ));
    standby.accept(&first).unwrap();
    standby.accept(&second).unwrap();
    assert_eq!(standby, active);
}

#[test]
fn standby_rejects_entries_that_do_not_fit_its_state() {
    let entry = ReplicationEntry {
        entity: EntityKey::TierManager(NS.to_string()),
        sequence: 1,
        op: ReplicatedOp::Tier(TierOp::Destroy {
            namespace: NS.to_string(),
        }),
    };
    let mut standby = ReplicaState::new();
    assert!(matches!(
        standby.accept(&entry),
        Err(ReplicationError::Rejected { .. })
    ));
}

#[test]
fn snapshot_restores_identical_state() {
    let resources = common::resources();
    let client = ClientIdentity::generate();
    let mut state = ReplicaState::new();
    let plan = state
        .plan(&create_request(), client, ConnectionId(4), &resources)
        .unwrap();
    for op in plan.ops {
        state.append(op).unwrap();
    }

    let snapshot = ReplicaSnapshot::capture(ServerId(1), &state).unwrap();
    assert_eq!(snapshot.applied_entries, 1);
    assert!(snapshot.size_bytes() > 0);
    assert_eq!(snapshot.restore().unwrap(), state);
}

// ============================================================================
// Server nodes
// ============================================================================

#[tokio::test]
async fn standby_refuses_client_requests() {
    let standby = spawn(2, ServerRole::Standby);
    let err = invoke(&standby, ClientIdentity::generate(), create_request())
        .await
        .unwrap_err();
    assert_eq!(err, LifecycleError::NotActive { server: ServerId(2) });
    standby.terminate();
}

#[tokio::test]
async fn active_refuses_replication_traffic() {
    let active = spawn(1, ServerRole::Active);
    let entry = ReplicationEntry {
        entity: EntityKey::Lock("L".to_string()),
        sequence: 1,
        op: ReplicatedOp::Tier(TierOp::Destroy {
            namespace: NS.to_string(),
        }),
    };
    let (ack, rx) = oneshot::channel();
    active
        .mailbox()
        .send(ServerMessage::Replicate { entry, ack })
        .await
        .unwrap();
    assert_eq!(
        rx.await.unwrap(),
        Err(ReplicationError::NotStandby { server: ServerId(1) })
    );
    active.terminate();
}

#[tokio::test]
async fn attached_standby_applies_every_entry() {
    let active = spawn(1, ServerRole::Active);
    let standby = spawn(2, ServerRole::Unsynced);
    attach(&active, &standby).await.unwrap();
    assert_eq!(standby.status().await.unwrap().role, ServerRole::Standby);

    let client = ClientIdentity::generate();
    invoke(&active, client, create_request()).await.unwrap();
    invoke(
        &active,
        client,
        EntityRequest::Untrack {
            namespace: NS.to_string(),
        },
    )
    .await
    .unwrap();

    let active_status = active.status().await.unwrap();
    let standby_status = standby.status().await.unwrap();
    assert_eq!(active_status.standbys, vec![ServerId(2)]);
    assert_eq!(active_status.applied_entries, 2);
    assert_eq!(standby_status.applied_entries, 2);
    assert_eq!(standby_status.namespaces, 1);

    active.terminate();
    standby.terminate();
}

#[tokio::test]
async fn diverged_standby_is_resynced() {
    let active = spawn(1, ServerRole::Active);
    let standby = spawn(2, ServerRole::Unsynced);
    attach(&active, &standby).await.unwrap();

    // Push a stray entry so the active's next entry arrives out of sequence.
    let stray = ReplicationEntry {
        entity: EntityKey::TierManager(NS.to_string()),
        sequence: 1,
        op: ReplicatedOp::Tier(TierOp::Create {
            namespace: NS.to_string(),
            configuration: Default::default(),
            client: ClientIdentity::generate(),
            connection: ConnectionId(99),
        }),
    };
    let (ack, rx) = oneshot::channel();
    standby
        .mailbox()
        .send(ServerMessage::Replicate { entry: stray, ack })
        .await
        .unwrap();
    rx.await.unwrap().unwrap();

    let client = ClientIdentity::generate();
    invoke(&active, client, create_request()).await.unwrap();

    let active_status = active.status().await.unwrap();
    let standby_status = standby.status().await.unwrap();
    assert_eq!(active_status.standbys, vec![ServerId(2)]);
    assert_eq!(standby_status.applied_entries, active_status.applied_entries);
    assert_eq!(standby_status.role, ServerRole::Standby);

    active.terminate();
    standby.terminate();
}

#[tokio::test]
async fn unreachable_standby_leaves_the_replication_set() {
    let active = spawn(1, ServerRole::Active);
    let standby = spawn(2, ServerRole::Unsynced);
    attach(&active, &standby).await.unwrap();
    standby.terminate();

    invoke(&active, ClientIdentity::generate(), create_request())
        .await
        .unwrap();

    let status = active.status().await.unwrap();
    assert!(status.standbys.is_empty());
    assert_eq!(status.applied_entries, 1);
    active.terminate();
}

/// Link to `standby` that loses every replication entry and passes
/// everything else through.
fn lossy_link(standby: &ServerHandle) -> StandbyLink {
    let (tx, mut rx) = mpsc::channel(16);
    let target = standby.mailbox().clone();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if matches!(message, ServerMessage::Replicate { .. }) {
                continue;
            }
            if target.send(message).await.is_err() {
                return;
            }
        }
    });
    StandbyLink {
        server: standby.id(),
        mailbox: tx,
    }
}

#[tokio::test]
async fn dropped_standby_is_demoted_and_refuses_promotion() {
    let roster = InSyncRoster::new();
    let spawn_in = |id, role| {
        ServerNode::spawn_with_roster(
            ServerId(id),
            role,
            Arc::new(common::resources()),
            NodeSettings::default(),
            roster.clone(),
        )
    };
    let active = spawn_in(1, ServerRole::Active);
    let standby = spawn_in(2, ServerRole::Unsynced);

    let (ack, rx) = oneshot::channel();
    active
        .mailbox()
        .send(ServerMessage::AttachStandby {
            link: lossy_link(&standby),
            ack,
        })
        .await
        .unwrap();
    rx.await.unwrap().unwrap();
    assert_eq!(roster.members(), vec![ServerId(2)]);

    let client = ClientIdentity::generate();
    invoke(&active, client, create_request()).await.unwrap();
    assert!(active.status().await.unwrap().standbys.is_empty());
    assert!(!roster.contains(ServerId(2)));

    let mut role = standby.status().await.unwrap().role;
    for _ in 0..50 {
        if role == ServerRole::Unsynced {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        role = standby.status().await.unwrap().role;
    }
    assert_eq!(role, ServerRole::Unsynced);

    // The acknowledged create never reached server 2.
    let (ack, rx) = oneshot::channel();
    standby
        .mailbox()
        .send(ServerMessage::Promote {
            standbys: Vec::new(),
            ack,
        })
        .await
        .unwrap();
    let status = rx.await.unwrap();
    assert_eq!(status.role, ServerRole::Unsynced);
    assert_eq!(status.applied_entries, 0);

    let err = invoke(
        &standby,
        client,
        EntityRequest::Validate {
            namespace: NS.to_string(),
            configuration: None,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, LifecycleError::NotActive { .. }));

    // A resync makes it eligible again.
    attach(&active, &standby).await.unwrap();
    assert_eq!(standby.status().await.unwrap().role, ServerRole::Standby);
    assert_eq!(roster.members(), vec![ServerId(2)]);
    active.terminate();
    standby.terminate();
}

// ============================================================================
// Cluster replication
// ============================================================================

#[tokio::test]
async fn every_server_applies_the_same_entries() {
    let cluster = common::start_cluster(3).await;
    let mut service = common::cache_manager(&cluster, NS);
    service.start().await.unwrap();

    let statuses = cluster.statuses().await;
    assert_eq!(statuses.len(), 3);
    let applied = statuses[0].applied_entries;
    assert!(applied > 0);
    assert!(statuses.iter().all(|s| s.applied_entries == applied));
    assert!(statuses.iter().all(|s| s.namespaces == 1));
    assert_eq!(
        statuses
            .iter()
            .filter(|s| s.role == ServerRole::Active)
            .count(),
        1
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn restarted_server_rejoins_as_synced_standby() {
    let cluster = common::start_cluster(2).await;
    let mut service = common::cache_manager(&cluster, NS);
    service.start().await.unwrap();

    common::fail_over(&cluster).await;
    assert_eq!(cluster.statuses().await.len(), 1);

    cluster.start_all_servers().await.unwrap();
    cluster.wait_for_standbys_ready().await.unwrap();

    let statuses = cluster.statuses().await;
    assert_eq!(statuses.len(), 2);
    let rejoined = statuses
        .iter()
        .find(|s| s.server == ServerId(1))
        .expect("server 1 restarted");
    assert_eq!(rejoined.role, ServerRole::Standby);
    assert_eq!(rejoined.namespaces, 1);
    assert_eq!(rejoined.applied_entries, statuses[1].applied_entries);

    service.stop().await.unwrap();
    cluster.shutdown().await;
}
