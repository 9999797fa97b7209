mod election;
mod local_state;
mod membership;
mod replica;
mod replica_api;
mod write_ahead_log;

pub use election::ElectionStateChangeListener;
pub use election::ElectionStateSnapshot;
pub use local_state::DiskLocalState;
pub use local_state::PersistentLocalState;
pub use local_state::Term;
pub use local_state::VolatileLocalState;
pub use membership::MembershipTracker;
pub use membership::ReplicaId;
pub use replica::Replica;
pub use replica::ReplicaConfig;
pub use replica_api::AppendEntriesError;
pub use replica_api::AppendEntriesInput;
pub use replica_api::AppendEntriesLogEntry;
pub use replica_api::AppendEntriesOutput;
pub use replica_api::InstallSnapshotError;
pub use replica_api::InstallSnapshotInput;
pub use replica_api::InstallSnapshotOutput;
pub use replica_api::RequestVoteError;
pub use replica_api::RequestVoteInput;
pub use replica_api::RequestVoteOutput;
pub use replica_api::StatusReport;
pub use replica_api::TermOutOfDateInfo;
pub use write_ahead_log::WriteAheadLogEntry;

pub(crate) use election::Jitter;
pub(crate) use replica_api::AppendEntriesReplyFromPeer;
pub(crate) use replica_api::EnqueueForReplicationError;
pub(crate) use replica_api::EnqueueForReplicationInput;
pub(crate) use replica_api::EnqueueForReplicationOutput;
pub(crate) use replica_api::InstallSnapshotReplyFromPeer;
pub(crate) use replica_api::LeaderTimerTick;
pub(crate) use replica_api::ReadInput;
pub(crate) use replica_api::ReadOutput;
pub(crate) use replica_api::RequestVoteReplyFromPeer;
pub(crate) use replica_api::TakeSnapshotError;
pub(crate) use replica_api::TakeSnapshotOutput;
