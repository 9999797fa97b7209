use crate::actor::{ActorClient, ReplicaActor};
use crate::api::client::RaftClient;
use crate::api::options::{RaftOptions, RaftOptionsValidated};
use crate::commitlog::{DiskLog, InMemoryLog, Log};
use crate::replica::{
    DiskLocalState, ElectionStateChangeListener, Jitter, MembershipTracker, PersistentLocalState, Replica,
    ReplicaConfig, ReplicaId, VolatileLocalState, WriteAheadLogEntry,
};
use crate::snapshot::{DiskSnapshotStore, InMemorySnapshotStore, SnapshotStore};
use crate::transport::{SimulatedNetwork, Transport};
use std::convert::TryFrom;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

pub struct RaftNodeConfig {
    pub my_replica_id: String,
    /// Cluster membership as of this node's creation. A node joining a live cluster lists the
    /// membership from before its own AddMember entry; it learns of itself when that entry
    /// replicates to it.
    pub cluster_members: Vec<String>,
    pub storage: NodeStorage,
    pub logger: slog::Logger,
    pub options: RaftOptions,
}

/// Where a node keeps its log, term/vote record, and snapshots.
pub enum NodeStorage {
    /// Nothing survives the node instance. Suited to simulated clusters, where a crash is
    /// modeled by dropping the node.
    InMemory,
    /// Durable state lives under the directory and is flushed before any RPC is answered. A
    /// node recreated over the same directory resumes from where it crashed.
    OnDisk { directory: PathBuf },
}

#[derive(Debug, thiserror::Error)]
pub enum NodeCreationError {
    #[error("Illegal options for configuring node: {0}")]
    IllegalOptions(String),
    #[error("Cluster config must name at least one member")]
    EmptyCluster,
    #[error("Failed to initialize storage")]
    StorageInitialization(#[source] io::Error),
}

pub struct RaftNode {
    pub client: RaftClient,
    /// Push-based feed of this node's election state changes. Safe to drop if unused.
    pub election_events: ElectionStateChangeListener,
}

/// Creates a replica, spawns its event loop, and attaches it to the network under its replica
/// ID. The returned client is the only handle; dropping the whole `RaftNode` after
/// deregistering it from the network shuts the replica down.
pub async fn try_create_node(
    config: RaftNodeConfig,
    network: &SimulatedNetwork,
) -> Result<RaftNode, NodeCreationError> {
    let options = RaftOptionsValidated::try_from(config.options).map_err(|e| NodeCreationError::IllegalOptions(e.to_string()))?;
    if config.cluster_members.is_empty() {
        return Err(NodeCreationError::EmptyCluster);
    }

    let my_replica_id = ReplicaId::new(config.my_replica_id);
    let members = config.cluster_members.into_iter().map(ReplicaId::new);
    let membership = MembershipTracker::new(my_replica_id, members);

    match config.storage {
        NodeStorage::InMemory => {
            let log = InMemoryLog::create().map_err(NodeCreationError::StorageInitialization)?;
            let local_state = VolatileLocalState::new(membership.my_replica_id().clone());
            let snapshot_store = Box::new(InMemorySnapshotStore::new());
            spawn_node(network, config.logger, membership, log, local_state, snapshot_store, options)
        }
        NodeStorage::OnDisk { directory } => {
            let log = DiskLog::create(config.logger.clone(), &directory.join("log"))
                .map_err(NodeCreationError::StorageInitialization)?;
            let local_state = DiskLocalState::create(config.logger.clone(), &directory, membership.my_replica_id().clone())
                .map_err(NodeCreationError::StorageInitialization)?;
            let snapshot_store = Box::new(
                DiskSnapshotStore::new(config.logger.clone(), &directory.join("snapshot"))
                    .map_err(NodeCreationError::StorageInitialization)?,
            );
            spawn_node(network, config.logger, membership, log, local_state, snapshot_store, options)
        }
    }
}

fn spawn_node<L, S>(
    network: &SimulatedNetwork,
    logger: slog::Logger,
    membership: MembershipTracker,
    log: L,
    local_state: S,
    snapshot_store: Box<dyn SnapshotStore + Send>,
    options: RaftOptionsValidated,
) -> Result<RaftNode, NodeCreationError>
where
    L: Log<WriteAheadLogEntry> + Send + 'static,
    S: PersistentLocalState + Send + 'static,
{
    let my_replica_id = membership.my_replica_id().clone();
    let transport: Arc<dyn Transport> = Arc::new(network.transport_for(my_replica_id.clone()));
    let (actor_client, actor_queue_rx) = ActorClient::new(10);

    let jitter = match options.random_seed {
        Some(seed) => Jitter::seeded(seed),
        None => Jitter::from_entropy(),
    };

    let (replica, election_events) = Replica::new(ReplicaConfig {
        logger: logger.clone(),
        membership,
        log,
        local_state,
        snapshot_store,
        transport,
        actor_client: actor_client.weak(),
        leader_heartbeat_duration: options.leader_heartbeat_duration,
        follower_min_timeout: options.follower_min_timeout,
        follower_max_timeout: options.follower_max_timeout,
        jitter,
        append_entries_timeout: options.leader_append_entries_timeout,
        install_snapshot_timeout: options.leader_install_snapshot_timeout,
        snapshot_after_applied_entries: options.snapshot_after_applied_entries,
    })
    .map_err(NodeCreationError::StorageInitialization)?;

    let replica_actor = ReplicaActor::new(logger, actor_queue_rx, replica);
    tokio::spawn(replica_actor.run_event_loop());

    network.register(my_replica_id.clone(), actor_client.clone());

    let client = RaftClient::new(my_replica_id.into_inner(), actor_client, options.client_request_timeout);

    Ok(RaftNode {
        client,
        election_events,
    })
}
