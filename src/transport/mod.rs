//! Point-to-point RPC delivery between replicas. The consensus core only depends on the
//! [`Transport`] trait; it must stay correct when the implementation loses, duplicates, delays,
//! or reorders messages. [`SimulatedNetwork`] is the deterministic in-process implementation
//! used by the simulation test harness.

mod simulated;

use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, InstallSnapshotError, InstallSnapshotInput,
    InstallSnapshotOutput, ReplicaId, RequestVoteError, RequestVoteInput, RequestVoteOutput,
};
use async_trait::async_trait;

pub use simulated::{MessageDisposition, MessageRecord, NetworkConditions, RpcKind, SimulatedNetwork, SimulatedTransport};

/// Outcome of one RPC exchange. The outer error means the network never produced an answer; the
/// inner result is the peer's own accept/reject decision.
pub type RpcResult<O, E> = Result<Result<O, E>, TransportError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("No route to {0:?}")]
    NoSuchMember(ReplicaId),
    #[error("Network partition between {0:?} and {1:?}")]
    Partitioned(ReplicaId, ReplicaId),
    #[error("Message dropped")]
    Dropped,
    #[error("Transport failure: {0}")]
    Unreachable(String),
}

/// One-request-one-response messaging toward a single peer. Implementations decide how
/// (and whether) a message arrives; callers own all retry logic.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        target: &ReplicaId,
        input: RequestVoteInput,
    ) -> RpcResult<RequestVoteOutput, RequestVoteError>;

    async fn append_entries(
        &self,
        target: &ReplicaId,
        input: AppendEntriesInput,
    ) -> RpcResult<AppendEntriesOutput, AppendEntriesError>;

    async fn install_snapshot(
        &self,
        target: &ReplicaId,
        input: InstallSnapshotInput,
    ) -> RpcResult<InstallSnapshotOutput, InstallSnapshotError>;
}
