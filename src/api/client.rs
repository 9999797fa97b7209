use crate::actor::ActorClient;
use crate::commitlog::Index;
use crate::kv::{Command, Operation};
use crate::replica;
use crate::replica::{StatusReport, Term};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Duration;

/// RaftClient is the local handle for a single replica. Writes and reads submitted here are
/// routed to the replica's event loop; they succeed only if this replica is the cluster leader.
/// Callers holding a handle to a non-leader get a redirect hint and should retry against the
/// leader it names.
pub struct RaftClient {
    my_replica_id: String,
    actor_client: ActorClient,
    request_timeout: Duration,
    request_seq: AtomicU64,
}

impl RaftClient {
    pub(super) fn new(my_replica_id: String, actor_client: ActorClient, request_timeout: Duration) -> Self {
        RaftClient {
            my_replica_id,
            actor_client,
            request_timeout,
            request_seq: AtomicU64::new(0),
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.my_replica_id
    }

    /// Sets `key` to `value`. Returns once the entry has committed and applied on the leader.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Result<WriteOutput, RequestError> {
        self.submit(Operation::Set {
            key: key.into(),
            value: value.into(),
        })
        .await
    }

    /// Deletes `key`. Deleting an absent key commits a no-op entry and succeeds.
    pub async fn delete(&self, key: impl Into<String>) -> Result<WriteOutput, RequestError> {
        self.submit(Operation::Delete { key: key.into() }).await
    }

    /// Linearizable read of `key`. The read is sequenced through the replicated log behind a
    /// barrier entry, so it observes every write that committed before this call started and
    /// never observes unreplicated leader state.
    pub async fn read(&self, key: impl Into<String>) -> Result<ReadOutput, RequestError> {
        self.read_impl(key.into(), true).await
    }

    /// Reads `key` from this replica's applied state without a barrier. Still leader-gated,
    /// but a partitioned ex-leader that hasn't noticed its deposal can serve a stale value.
    /// Cheaper than `read` by one log round trip.
    pub async fn read_stale(&self, key: impl Into<String>) -> Result<ReadOutput, RequestError> {
        self.read_impl(key.into(), false).await
    }

    async fn read_impl(&self, key: String, linearizable: bool) -> Result<ReadOutput, RequestError> {
        let input = replica::ReadInput { key, linearizable };

        match tokio::time::timeout(self.request_timeout, self.actor_client.read(input)).await {
            Ok(Ok(output)) => Ok(ReadOutput { value: output.value }),
            Ok(Err(e)) => Err(e.into()),
            Err(_elapsed) => Err(RequestError::Timeout),
        }
    }

    /// Adds a voting member to the cluster. At most one configuration change may be in flight
    /// at a time; a second request fails with `MembershipChangePending` until the first commits.
    pub async fn add_node(&self, member_id: impl Into<String>) -> Result<WriteOutput, RequestError> {
        self.submit(Operation::AddMember {
            member_id: member_id.into(),
        })
        .await
    }

    /// Removes a voting member from the cluster. A leader may remove itself; it steps aside
    /// after the removal commits.
    pub async fn remove_node(&self, member_id: impl Into<String>) -> Result<WriteOutput, RequestError> {
        self.submit(Operation::RemoveMember {
            member_id: member_id.into(),
        })
        .await
    }

    /// Snapshots this replica's state machine and discards the log prefix the snapshot covers.
    /// Acts on the local replica only, leader or not.
    pub async fn take_snapshot(&self) -> Result<SnapshotOutput, SnapshotError> {
        match tokio::time::timeout(self.request_timeout, self.actor_client.take_snapshot()).await {
            Ok(Ok(output)) => {
                let (term, index) = output.snapshot_last_included;
                Ok(SnapshotOutput {
                    last_included: RaftEntryId { term, index },
                })
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_elapsed) => Err(SnapshotError::Timeout),
        }
    }

    /// Point-in-time view of this replica's role, term, log indexes, and cluster membership.
    pub async fn status(&self) -> Result<StatusReport, RequestError> {
        self.actor_client.status().await.map_err(|_| RequestError::ReplicaExited)
    }

    async fn submit(&self, op: Operation) -> Result<WriteOutput, RequestError> {
        let command = Command {
            client_id: self.my_replica_id.clone(),
            request_seq: self.request_seq.fetch_add(1, Ordering::Relaxed) + 1,
            op,
        };
        let input = replica::EnqueueForReplicationInput { command };

        match tokio::time::timeout(self.request_timeout, self.actor_client.enqueue_for_replication(input)).await {
            Ok(Ok(output)) => Ok(WriteOutput {
                entry_id: RaftEntryId {
                    term: output.applied_term,
                    index: output.applied_index,
                },
            }),
            Ok(Err(e)) => Err(e.into()),
            Err(_elapsed) => Err(RequestError::Timeout),
        }
    }
}

/// Position of a committed entry in the replicated log.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RaftEntryId {
    pub term: Term,
    pub index: Index,
}

#[derive(Debug)]
pub struct WriteOutput {
    pub entry_id: RaftEntryId,
}

#[derive(Debug)]
pub struct ReadOutput {
    pub value: Option<String>,
}

#[derive(Debug)]
pub struct SnapshotOutput {
    pub last_included: RaftEntryId,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Leader redirect: {leader_id}")]
    LeaderRedirect { leader_id: String },
    #[error("Cluster has no leader right now")]
    NoLeader,
    #[error("This replica lost leadership before the request committed")]
    LeadershipLost,
    #[error("Another cluster configuration change is still in flight")]
    MembershipChangePending,
    #[error("Invalid request: {0}")]
    InvalidCommand(String),
    #[error("Local IO failure")]
    LocalIoError(#[source] io::Error),
    #[error("Request timed out; it may or may not commit later")]
    Timeout,
    #[error("Replica event loop has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Nothing applied yet, no state to snapshot")]
    NothingApplied,
    #[error("Local IO failure")]
    LocalIoError(#[source] io::Error),
    #[error("Request timed out")]
    Timeout,
    #[error("Replica event loop has exited")]
    ReplicaExited,
}

// ------- Conversions --------

impl From<replica::EnqueueForReplicationError> for RequestError {
    fn from(e: replica::EnqueueForReplicationError) -> Self {
        match e {
            replica::EnqueueForReplicationError::LeaderRedirect(leader_id) => RequestError::LeaderRedirect {
                leader_id: leader_id.into_inner(),
            },
            replica::EnqueueForReplicationError::NoLeader => RequestError::NoLeader,
            replica::EnqueueForReplicationError::LeadershipLost => RequestError::LeadershipLost,
            replica::EnqueueForReplicationError::MembershipChangePending => RequestError::MembershipChangePending,
            replica::EnqueueForReplicationError::InvalidCommand(msg) => RequestError::InvalidCommand(msg),
            replica::EnqueueForReplicationError::LocalIoError(e) => RequestError::LocalIoError(e),
            replica::EnqueueForReplicationError::ActorExited => RequestError::ReplicaExited,
        }
    }
}

impl From<replica::TakeSnapshotError> for SnapshotError {
    fn from(e: replica::TakeSnapshotError) -> Self {
        match e {
            replica::TakeSnapshotError::NothingApplied => SnapshotError::NothingApplied,
            replica::TakeSnapshotError::LocalIoError(e) => SnapshotError::LocalIoError(e),
            replica::TakeSnapshotError::ActorExited => SnapshotError::ReplicaExited,
        }
    }
}
