use crate::commitlog::Index;
use crate::kv::Command;
use crate::replica::election::ElectionStateSnapshot;
use crate::replica::local_state::Term;
use crate::replica::membership::ReplicaId;
use bytes::Bytes;
use std::io;

#[derive(Debug)]
pub(crate) struct EnqueueForReplicationInput {
    pub(crate) command: Command,
}

#[derive(Debug)]
pub(crate) struct EnqueueForReplicationOutput {
    pub(crate) applied_term: Term,
    pub(crate) applied_index: Index,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum EnqueueForReplicationError {
    #[error("I'm not leader")]
    LeaderRedirect(ReplicaId),

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,

    #[error("Lost leadership before the command was committed")]
    LeadershipLost,

    #[error("Another membership change is still in flight")]
    MembershipChangePending,

    #[error("Rejected command: {0}")]
    InvalidCommand(String),

    #[error("Failed to persist log")]
    LocalIoError(io::Error),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

/// Leader-gated read. Linearizable reads capture the key when their barrier entry is appended
/// and take the value from the state machine the moment the barrier applies; relaxed reads
/// answer from applied state immediately and may miss writes still in flight.
#[derive(Debug)]
pub(crate) struct ReadInput {
    pub(crate) key: String,
    pub(crate) linearizable: bool,
}

#[derive(Debug)]
pub(crate) struct ReadOutput {
    pub(crate) value: Option<String>,
}

#[derive(Debug)]
pub(crate) struct TakeSnapshotOutput {
    pub(crate) snapshot_last_included: (Term, Index),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum TakeSnapshotError {
    #[error("Nothing has been applied yet, there is nothing to snapshot")]
    NothingApplied,

    #[error("Failed to persist snapshot")]
    LocalIoError(io::Error),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

/// Point-in-time observability report. Values are read from the replica's own view and can be
/// stale by the time the caller looks at them.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub my_replica_id: ReplicaId,
    pub current_term: Term,
    pub commit_index: Option<Index>,
    pub last_applied_index: Option<Index>,
    /// Earliest index still held in the log. Greater than 1 once a snapshot has discarded a
    /// prefix.
    pub first_log_index: Index,
    pub election_state: ElectionStateSnapshot,
    pub cluster_members: Vec<ReplicaId>,
}

#[derive(Debug, Clone)]
pub struct RequestVoteInput {
    pub candidate_term: Term,
    pub candidate_id: ReplicaId,
    pub candidate_last_log_entry: Option<(Term, Index)>,
}

#[derive(Debug)]
pub struct RequestVoteOutput {
    pub vote_granted: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum RequestVoteError {
    #[error("Requesting candidate's term is out of date")]
    RequestTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) failed to persist term/vote: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub struct AppendEntriesInput {
    pub leader_term: Term,
    pub leader_id: ReplicaId,
    // "Previous log entry" is the log entry immediately preceding the new ones in AppendEntriesInput.
    pub leader_previous_log_entry: Option<(Term, Index)>,
    pub leader_commit_index: Option<Index>,
    pub new_entries: Vec<AppendEntriesLogEntry>,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesLogEntry {
    pub term: Term,
    pub data: Bytes,
}

#[derive(Debug)]
pub struct AppendEntriesOutput {
    // Nothing
}

#[derive(thiserror::Error, Debug)]
pub enum AppendEntriesError {
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) are missing previous log entry")]
    ServerMissingPreviousLogEntry {
        // Hint for the leader to rewind its cursor more than one entry at a time. `conflict_term`
        // is None when our log is simply too short, in which case `conflict_index` is our next
        // index. Otherwise it is the term of our conflicting entry and `conflict_index` the first
        // index we hold for that term.
        conflict_index: Index,
        conflict_term: Option<Term>,
    },
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub struct InstallSnapshotInput {
    pub leader_term: Term,
    pub leader_id: ReplicaId,
    pub snapshot_last_included: (Term, Index),
    pub snapshot_data: Bytes,
}

#[derive(Debug)]
pub struct InstallSnapshotOutput {
    // Nothing
}

#[derive(thiserror::Error, Debug)]
pub enum InstallSnapshotError {
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("Snapshot payload was malformed: {0}")]
    MalformedSnapshot(String),
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub struct TermOutOfDateInfo {
    pub current_term: Term,
}

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: RequestVoteResult,
}

#[derive(Debug)]
pub(crate) enum RequestVoteResult {
    VoteGranted,
    VoteNotGranted,
    // Peer's term is ahead of the term we campaigned in.
    StaleTerm { new_term: Term },
    RetryableFailure,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: AppendEntriesReplyFromPeerDescriptor,
    pub(crate) result: Result<(), AppendEntriesReplyFromPeerError>,
}

// This is basically info about the original request
#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeerDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) previous_log_entry_index: Option<Index>,
    pub(crate) num_log_entries: usize,
}

#[derive(Debug)]
pub(crate) enum AppendEntriesReplyFromPeerError {
    PeerMissingPreviousLogEntry {
        conflict_index: Index,
        conflict_term: Option<Term>,
    },
    RetryableFailure(String),
    StaleTerm {
        new_term: Term,
    },
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotReplyFromPeer {
    pub(crate) descriptor: InstallSnapshotReplyFromPeerDescriptor,
    pub(crate) result: Result<(), InstallSnapshotReplyFromPeerError>,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotReplyFromPeerDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) snapshot_last_included_index: Index,
}

#[derive(Debug)]
pub(crate) enum InstallSnapshotReplyFromPeerError {
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

/// LeaderTimerTick contains info for a single tick of a leader's per-peer timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderTimerTick {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
}
