use crate::api::{
    try_create_node, NodeCreationError, NodeStorage, RaftClient, RaftNode, RaftNodeConfig, RaftOptions,
};
use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot, ReplicaId};
use crate::transport::{NetworkConditions, SimulatedNetwork};
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

/// Conventional replica naming for simulated clusters: "replica-1", "replica-2", ...
pub fn replica_id(index: usize) -> String {
    format!("replica-{}", index + 1)
}

/// A cluster of in-memory replicas wired over a single `SimulatedNetwork`. Same seed, same
/// fault schedule, same winner of every election.
///
/// Killing a replica drops its in-memory storage with it, so a kill models a crash with no
/// recovery. Crash-and-recover behavior is exercised against the on-disk storage types
/// directly rather than through this cluster.
pub struct SimCluster {
    logger: slog::Logger,
    network: SimulatedNetwork,
    nodes: HashMap<String, RaftNode>,
    base_options: RaftOptions,
    seed: u64,
    spawned_count: u64,
}

impl SimCluster {
    pub async fn start(
        logger: slog::Logger,
        num_replicas: usize,
        conditions: NetworkConditions,
        seed: u64,
        options: RaftOptions,
    ) -> Result<Self, NodeCreationError> {
        let network = SimulatedNetwork::new(logger.clone(), conditions, seed);
        let member_ids: Vec<String> = (0..num_replicas).map(replica_id).collect();

        let mut cluster = SimCluster {
            logger,
            network,
            nodes: HashMap::with_capacity(num_replicas),
            base_options: options,
            seed,
            spawned_count: 0,
        };
        for id in &member_ids {
            cluster.spawn_node(id.clone(), member_ids.clone()).await?;
        }

        Ok(cluster)
    }

    /// Creates and attaches one more replica. Used by `start` for the initial members, and by
    /// membership tests growing a live cluster: spawn the newcomer with the membership from
    /// before the change, then submit AddNode to the leader.
    pub async fn spawn_node(
        &mut self,
        new_replica_id: String,
        cluster_members: Vec<String>,
    ) -> Result<(), NodeCreationError> {
        let node_logger = self.logger.new(slog::o!("ReplicaId" => new_replica_id.clone()));

        let mut options = self.base_options.clone();
        // Distinct per-node seeds, or every replica would draw identical election timeouts
        // and split the vote forever.
        self.spawned_count += 1;
        options.random_seed = Some(self.seed.wrapping_add(self.spawned_count.wrapping_mul(7919)));

        let node = try_create_node(
            RaftNodeConfig {
                my_replica_id: new_replica_id.clone(),
                cluster_members,
                storage: NodeStorage::InMemory,
                logger: node_logger,
                options,
            },
            &self.network,
        )
        .await?;

        self.nodes.insert(new_replica_id, node);
        Ok(())
    }

    /// Detaches a replica from the network and drops it. Safe to call twice.
    pub fn kill(&mut self, replica_id: &str) {
        self.network.deregister(&ReplicaId::new(replica_id.to_string()));
        self.nodes.remove(replica_id);
    }

    /// Panics on an unknown or killed replica; in a test that means the test itself is broken.
    pub fn client(&self, replica_id: &str) -> &RaftClient {
        &self
            .nodes
            .get(replica_id)
            .unwrap_or_else(|| panic!("No live replica named '{}'", replica_id))
            .client
    }

    pub fn election_events(&self, replica_id: &str) -> ElectionStateChangeListener {
        self.nodes
            .get(replica_id)
            .unwrap_or_else(|| panic!("No live replica named '{}'", replica_id))
            .election_events
            .clone()
    }

    pub fn live_replica_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    pub fn partition(&self, replica_id: &str) {
        self.network.partition(&ReplicaId::new(replica_id.to_string()));
    }

    pub fn heal(&self, replica_id: &str) {
        self.network.heal(&ReplicaId::new(replica_id.to_string()));
    }

    pub fn partition_between(&self, replica_a: &str, replica_b: &str) {
        self.network.partition_between(
            &ReplicaId::new(replica_a.to_string()),
            &ReplicaId::new(replica_b.to_string()),
        );
    }

    pub fn heal_all(&self) {
        self.network.heal_all();
    }

    /// Polls every live replica until one reports itself leader and returns its ID. When stale
    /// leaders linger across a partition, the highest term wins.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<String, WaitError> {
        let deadline = Instant::now() + timeout;

        loop {
            let mut best: Option<(u64, String)> = None;
            for (id, node) in &self.nodes {
                if let Ok(status) = node.client.status().await {
                    if status.election_state == ElectionStateSnapshot::Leader {
                        let term = status.current_term.as_u64();
                        let is_better = match &best {
                            Some((best_term, _)) => term > *best_term,
                            None => true,
                        };
                        if is_better {
                            best = Some((term, id.clone()));
                        }
                    }
                }
            }
            if let Some((_, leader_id)) = best {
                return Ok(leader_id);
            }

            if Instant::now() >= deadline {
                return Err(WaitError::Deadline("a leader to emerge".to_string()));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Waits until `replica_id` has applied the log through `applied_index`.
    pub async fn wait_for_applied(
        &self,
        replica_id: &str,
        applied_index: u64,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Ok(status) = self.client(replica_id).status().await {
                let applied = status.last_applied_index.map(|index| index.as_u64()).unwrap_or(0);
                if applied >= applied_index {
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                return Err(WaitError::Deadline(format!(
                    "'{}' to apply through index {}",
                    replica_id, applied_index
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("Simulated cluster deadline expired waiting for {0}")]
    Deadline(String),
}
