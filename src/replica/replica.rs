use crate::actor::{Callback, WeakActorClient};
use crate::commitlog::{Index, Log};
use crate::kv::{Command, KvStore, Operation};
use crate::replica::election::{
    ElectionConfig, ElectionState, ElectionStateChangeListener, ElectionStateSnapshot, Jitter, PeerStateUpdate,
};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::membership::{MembershipTracker, ReplicaId};
use crate::replica::replica_api::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer,
    AppendEntriesReplyFromPeerDescriptor, AppendEntriesReplyFromPeerError, EnqueueForReplicationError,
    EnqueueForReplicationInput, EnqueueForReplicationOutput, InstallSnapshotError, InstallSnapshotInput,
    InstallSnapshotOutput, InstallSnapshotReplyFromPeer, InstallSnapshotReplyFromPeerDescriptor,
    InstallSnapshotReplyFromPeerError, LeaderTimerTick, ReadInput, ReadOutput, RequestVoteError, RequestVoteInput,
    RequestVoteOutput, RequestVoteReplyFromPeer, RequestVoteResult, StatusReport, TakeSnapshotError,
    TakeSnapshotOutput, TermOutOfDateInfo,
};
use crate::replica::write_ahead_log::{WriteAheadLog, WriteAheadLogEntry};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::transport::{RpcResult, Transport};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::{cmp, io};
use tokio::time::error::Elapsed;
use tokio::time::Duration;

pub struct ReplicaConfig<L, S>
where
    L: Log<WriteAheadLogEntry>,
    S: PersistentLocalState,
{
    pub logger: slog::Logger,
    pub membership: MembershipTracker,
    pub log: L,
    pub local_state: S,
    pub snapshot_store: Box<dyn SnapshotStore + Send>,
    pub transport: Arc<dyn Transport>,
    pub actor_client: WeakActorClient,
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub jitter: Jitter,
    pub append_entries_timeout: Duration,
    pub install_snapshot_timeout: Duration,
    /// Take a snapshot automatically once this many applied entries have accumulated past the
    /// previous snapshot. None disables automatic compaction.
    pub snapshot_after_applied_entries: Option<u64>,
}

pub struct Replica<L, S>
where
    L: Log<WriteAheadLogEntry>,
    S: PersistentLocalState,
{
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    membership: MembershipTracker,
    local_state: S,
    election_state: ElectionState,
    wal: WriteAheadLog<L>,
    state_machine: KvStore,
    snapshot_store: Box<dyn SnapshotStore + Send>,
    transport: Arc<dyn Transport>,
    actor_client: WeakActorClient,
    // Client callbacks parked until the entry at their index applies (or leadership is lost).
    pending_client_ops: HashMap<Index, PendingClientOp>,
    append_entries_timeout: Duration,
    install_snapshot_timeout: Duration,
    snapshot_after_applied_entries: Option<u64>,
    // Set once a durable write fails. From then on, nothing can be safely acknowledged and
    // the event loop shuts the replica down.
    halted: bool,
}

enum PendingClientOp {
    Write(Callback<Result<EnqueueForReplicationOutput, EnqueueForReplicationError>>),
    Read {
        key: String,
        callback: Callback<Result<ReadOutput, EnqueueForReplicationError>>,
    },
}

impl<L, S> Replica<L, S>
where
    L: Log<WriteAheadLogEntry> + 'static,
    S: PersistentLocalState + 'static,
{
    /// Recovers durable state (snapshot, then log) and starts out as a follower with no known
    /// leader.
    pub fn new(config: ReplicaConfig<L, S>) -> Result<(Self, ElectionStateChangeListener), io::Error> {
        let my_replica_id = config.membership.my_replica_id().clone();

        let (state_machine, snapshot_base) = match config.snapshot_store.load()? {
            Some(snapshot) => {
                let restored = KvStore::deserialize(snapshot.data.clone()).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Recovered snapshot does not deserialize: {}", e),
                    )
                })?;
                (restored, Some((snapshot.last_included_term, snapshot.last_included_index)))
            }
            None => (KvStore::new(), None),
        };

        let wal = WriteAheadLog::new(config.logger.clone(), config.log, snapshot_base)?;

        let (election_state, election_state_change_listener) = ElectionState::new_follower(
            ElectionConfig {
                my_replica_id: my_replica_id.clone(),
                leader_heartbeat_duration: config.leader_heartbeat_duration,
                follower_min_timeout: config.follower_min_timeout,
                follower_max_timeout: config.follower_max_timeout,
                jitter: config.jitter,
            },
            config.actor_client.clone(),
        );

        let mut replica = Replica {
            logger: config.logger,
            my_replica_id,
            membership: config.membership,
            local_state: config.local_state,
            election_state,
            wal,
            state_machine,
            snapshot_store: config.snapshot_store,
            transport: config.transport,
            actor_client: config.actor_client,
            pending_client_ops: HashMap::new(),
            append_entries_timeout: config.append_entries_timeout,
            install_snapshot_timeout: config.install_snapshot_timeout,
            snapshot_after_applied_entries: config.snapshot_after_applied_entries,
            halted: false,
        };
        replica.recover_pending_membership_change()?;

        Ok((replica, election_state_change_listener))
    }

    /// A configuration entry that was appended but not applied before a restart still blocks
    /// further configuration changes.
    fn recover_pending_membership_change(&mut self) -> Result<(), io::Error> {
        let latest_index = match self.wal.latest_entry() {
            Some((_, index)) => index,
            None => return Ok(()),
        };

        let mut index = self.wal.first_index();
        while index <= latest_index {
            if let Some(entry) = self.wal.read(index)? {
                if let Ok(command) = Command::decode(Bytes::from(entry.data)) {
                    if command.op.is_config_change() {
                        slog::info!(self.logger, "Recovered in-flight configuration change at {:?}", index);
                        self.membership.mark_change_pending(index);
                    }
                }
            }
            index = index.plus(1);
        }

        Ok(())
    }

    /// True once a durable write has failed. The actor loop checks this after every event and
    /// stops the replica rather than acknowledge state that may not be durable.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn handle_enqueue_for_replication(
        &mut self,
        input: EnqueueForReplicationInput,
        callback: Callback<Result<EnqueueForReplicationOutput, EnqueueForReplicationError>>,
    ) {
        if let Err(e) = self.leader_check() {
            callback.send(Err(e));
            return;
        }
        if let Err(e) = self.validate_command(&input.command) {
            callback.send(Err(e));
            return;
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        let term = self.local_state.current_term();
        let new_entry = WriteAheadLogEntry {
            term,
            data: input.command.encode().to_vec(),
        };
        let appended_index = match self.wal.append(new_entry) {
            Ok(index) => index,
            Err(e) => {
                self.halt("Appending client command", &e);
                callback.send(Err(EnqueueForReplicationError::LocalIoError(e)));
                return;
            }
        };

        if input.command.op.is_config_change() {
            self.membership.mark_change_pending(appended_index);
        }

        self.pending_client_ops.insert(appended_index, PendingClientOp::Write(callback));

        // Majority of one: a single-node cluster commits on append.
        self.leader_advance_commit();
        self.request_eager_replication(term);
    }

    /// Linearizable reads append a noop barrier entry and answer from the state machine at the
    /// moment the barrier applies; every write that committed before the read started is
    /// visible by then. Committing the barrier in our own term doubles as the check that we
    /// are still leader, so a deposed or partitioned ex-leader can't serve a stale value.
    /// Relaxed reads skip the barrier and answer from applied state right away.
    pub fn handle_read(
        &mut self,
        input: ReadInput,
        callback: Callback<Result<ReadOutput, EnqueueForReplicationError>>,
    ) {
        if let Err(e) = self.leader_check() {
            callback.send(Err(e));
            return;
        }

        if !input.linearizable {
            let value = self.state_machine.get(&input.key).map(str::to_string);
            callback.send(Ok(ReadOutput { value }));
            return;
        }

        let term = self.local_state.current_term();
        let barrier = Command::internal_noop(self.my_replica_id.as_str());
        let new_entry = WriteAheadLogEntry {
            term,
            data: barrier.encode().to_vec(),
        };
        let barrier_index = match self.wal.append(new_entry) {
            Ok(index) => index,
            Err(e) => {
                self.halt("Appending read barrier", &e);
                callback.send(Err(EnqueueForReplicationError::LocalIoError(e)));
                return;
            }
        };

        self.pending_client_ops.insert(
            barrier_index,
            PendingClientOp::Read {
                key: input.key,
                callback,
            },
        );

        self.leader_advance_commit();
        self.request_eager_replication(term);
    }

    pub fn handle_request_vote(&mut self, input: RequestVoteInput) -> Result<RequestVoteOutput, RequestVoteError> {
        // Read our local term/vote state as 1 atomic action.
        let (current_term, mut opt_voted_for) = self.local_state.voted_for_current_term();

        // 1. Reply false if term < currentTerm (§5.1)
        if input.candidate_term < current_term {
            slog::info!(self.logger, "Not granting vote. Candidate term is out of date.");
            return Err(RequestVoteError::RequestTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = match self.local_state.store_term_if_increased(input.candidate_term) {
            Ok(increased) => increased,
            Err(e) => {
                self.halt("Persisting term from RequestVote", &e);
                return Err(RequestVoteError::ServerIoError(e));
            }
        };
        if increased {
            self.become_follower(None);
            slog::info!(
                self.logger,
                "Observed increased term in RequestVote call. Transitioning to follower. Election state: {:?}",
                self.election_state
            );
            // If we've increased the term, it means we haven't voted for anyone this term.
            opt_voted_for = None;
        }

        // 2. If votedFor is null or candidateId, and candidate's log is at
        // least as up-to-date as receiver's log, grant vote (§5.2, §5.4).
        if let Some(voted_for) = opt_voted_for {
            if *voted_for != input.candidate_id {
                slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
                return Ok(RequestVoteOutput { vote_granted: false });
            }
        }

        if !self.is_candidate_log_gte_mine(input.candidate_last_log_entry) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return Ok(RequestVoteOutput { vote_granted: false });
        }

        slog::info!(self.logger, "Voting for {:?}.", input.candidate_id);
        let cas_success = match self
            .local_state
            .store_vote_for_term_if_unvoted(input.candidate_term, input.candidate_id.clone())
        {
            Ok(cas_success) => cas_success,
            Err(e) => {
                self.halt("Persisting vote", &e);
                return Err(RequestVoteError::ServerIoError(e));
            }
        };
        if cas_success {
            // Granting a vote means giving the candidate a chance, so hold off on campaigning.
            self.election_state.reset_timeout_if_follower();
            return Ok(RequestVoteOutput { vote_granted: true });
        }

        // We lost a CAS race. Re-read state and return success based on if the previous winner
        // made the same vote as we would've.
        if let (reread_current_term, Some(reread_voted_for)) = self.local_state.voted_for_current_term() {
            if reread_current_term == input.candidate_term && reread_voted_for.as_ref() == &input.candidate_id {
                return Ok(RequestVoteOutput { vote_granted: true });
            }
        }

        // If current state doesn't exactly match this request, for whatever
        // reason, don't grant vote.
        slog::info!(self.logger, "Not granting vote because idk why.");
        Ok(RequestVoteOutput { vote_granted: false })
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: Option<(Term, Index)>) -> bool {
        // > Raft determines which of two logs is more up-to-date
        // > by comparing the index and term of the last entries in the
        // > logs. If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        match (self.wal.latest_entry(), candidate_last_entry) {
            (None, None) => true,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (
                Some((my_last_entry_term, my_last_entry_index)),
                Some((candidate_last_entry_term, candidate_last_entry_index)),
            ) => {
                if candidate_last_entry_term > my_last_entry_term {
                    return true;
                } else if candidate_last_entry_term < my_last_entry_term {
                    return false;
                }

                candidate_last_entry_index >= my_last_entry_index
            }
        }
    }

    pub fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let current_term = self.local_state.current_term();
        if current_term != reply.term {
            slog::info!(
                self.logger,
                "Received vote reply for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }

        match reply.result {
            RequestVoteResult::VoteGranted => {
                let num_votes_received = match self.election_state.add_vote_if_candidate(reply.peer_id) {
                    Some(num_votes) => num_votes,
                    None => {
                        slog::info!(
                            self.logger,
                            "Received vote for term {:?} after leaving candidacy. Election state: {:?}",
                            reply.term,
                            self.election_state,
                        );
                        return;
                    }
                };

                slog::info!(
                    self.logger,
                    "Received {}/{} votes for term {:?}",
                    num_votes_received,
                    self.membership.num_members(),
                    reply.term,
                );
                if num_votes_received >= self.membership.quorum_size() {
                    self.become_leader(reply.term);
                }
            }
            RequestVoteResult::VoteNotGranted => {
                slog::info!(
                    self.logger,
                    "Vote not granted from {:?} for term {:?}",
                    reply.peer_id,
                    reply.term,
                );
            }
            RequestVoteResult::StaleTerm { new_term } => {
                let increased = match self.local_state.store_term_if_increased(new_term) {
                    Ok(increased) => increased,
                    Err(e) => {
                        self.halt("Persisting term learned from vote reply", &e);
                        return;
                    }
                };
                if increased {
                    slog::info!(
                        self.logger,
                        "Abandoning election. {:?} is on newer term {:?}.",
                        reply.peer_id,
                        new_term,
                    );
                    self.become_follower(None);
                }
            }
            RequestVoteResult::RetryableFailure => {
                // No retry. If this election stalls below quorum, the candidate's timeout
                // fires and starts the next one with a fresh term.
                slog::debug!(
                    self.logger,
                    "Vote request to {:?} for term {:?} failed",
                    reply.peer_id,
                    reply.term,
                );
            }
        }
    }

    fn become_leader(&mut self, term: Term) {
        let peer_ids: HashSet<ReplicaId> = self.membership.peer_ids().into_iter().collect();
        let previous_log_entry_index = self.wal.latest_entry().map(|(_, index)| index);
        self.election_state.transition_to_leader(term, peer_ids, previous_log_entry_index);
        slog::info!(
            self.logger,
            "Won election for term {:?}. Election state: {:?}",
            term,
            self.election_state,
        );

        // Entries from previous terms only commit indirectly, behind an entry of our own term
        // (§5.4.2). Append that entry now; it doubles as the barrier for linearizable reads.
        let noop = Command::internal_noop(self.my_replica_id.as_str());
        let new_entry = WriteAheadLogEntry {
            term,
            data: noop.encode().to_vec(),
        };
        if let Err(e) = self.wal.append(new_entry) {
            self.halt("Appending term-opening noop", &e);
            return;
        }

        self.leader_advance_commit();
    }

    pub fn handle_append_entries(&mut self, input: AppendEntriesInput) -> Result<AppendEntriesOutput, AppendEntriesError> {
        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = match self.local_state.store_term_if_increased(input.leader_term) {
            Ok(increased) => increased,
            Err(e) => {
                self.halt("Persisting term from AppendEntries", &e);
                return Err(AppendEntriesError::ServerIoError(e));
            }
        };
        if increased {
            self.become_follower(Some(input.leader_id.clone()));
        } else if matches!(self.election_state.current_state(), ElectionStateSnapshot::Candidate) {
            // Someone else won this term's election.
            self.become_follower(Some(input.leader_id.clone()));
        } else {
            self.election_state.set_leader_if_unknown(&input.leader_id);
        }

        self.election_state.reset_timeout_if_follower();

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        if let Some((leader_previous_term, leader_previous_index)) = input.leader_previous_log_entry {
            match self
                .wal
                .term_at(leader_previous_index)
                .map_err(AppendEntriesError::ServerIoError)?
            {
                Some(my_term) if my_term == leader_previous_term => { /* Check passed. */ }
                Some(conflicting_term) => {
                    // Tell the leader the first index we hold for the conflicting term, so it
                    // can rewind past the whole run of that term in one step.
                    let conflict_index =
                        replication_planner::first_index_of_term(&self.wal, leader_previous_index, conflicting_term)
                            .map_err(AppendEntriesError::ServerIoError)?;
                    return Err(AppendEntriesError::ServerMissingPreviousLogEntry {
                        conflict_index,
                        conflict_term: Some(conflicting_term),
                    });
                }
                None => {
                    // Either our log is too short, or the entry was compacted into our
                    // snapshot. A compacted entry is committed, which means it matched.
                    let covered_by_snapshot =
                        matches!(self.wal.snapshot_base(), Some((_, base_index)) if leader_previous_index < base_index);
                    if !covered_by_snapshot {
                        let conflict_index = self
                            .wal
                            .latest_entry()
                            .map(|(_, index)| index.plus(1))
                            .unwrap_or_else(Index::start_index);
                        return Err(AppendEntriesError::ServerMissingPreviousLogEntry {
                            conflict_index,
                            conflict_term: None,
                        });
                    }
                }
            }
        }

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        let mut next_entry_index = match input.leader_previous_log_entry {
            None => Index::start_index(),
            Some((_, leader_previous_index)) => leader_previous_index.plus(1),
        };
        for new_entry in input.new_entries.iter() {
            // Entries our snapshot covers are committed and immutable; nothing to reconcile.
            if matches!(self.wal.snapshot_base(), Some((_, base_index)) if next_entry_index <= base_index) {
                next_entry_index = next_entry_index.plus(1);
                continue;
            }

            let opt_existing_entry = self
                .wal
                .read(next_entry_index)
                .map_err(AppendEntriesError::ServerIoError)?;

            if let Some(existing_entry) = opt_existing_entry {
                if existing_entry.term == new_entry.term {
                    // 4. (no-op, already have it)
                    next_entry_index = next_entry_index.plus(1);
                    continue;
                }

                // 3. (delete)
                self.wal.truncate(next_entry_index).map_err(|e| {
                    self.halt("Truncating conflicting log suffix", &e);
                    AppendEntriesError::ServerIoError(e)
                })?;
                self.membership.clear_pending_if_truncated(next_entry_index);
            }

            // 4. (append)
            let appended_index = self
                .wal
                .append(WriteAheadLogEntry {
                    term: new_entry.term,
                    data: new_entry.data.to_vec(),
                })
                .map_err(|e| {
                    self.halt("Appending replicated entry", &e);
                    AppendEntriesError::ServerIoError(e)
                })?;
            assert_eq!(
                appended_index, next_entry_index,
                "Appended log entry to unexpected index."
            );

            // A configuration entry blocks further changes from the moment it is in the log.
            if let Ok(command) = Command::decode(new_entry.data.clone()) {
                if command.op.is_config_change() {
                    self.membership.mark_change_pending(appended_index);
                }
            }

            next_entry_index = next_entry_index.plus(1);
        }

        // 5. If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, [own last]).
        // The leader never advertises a commit index past what this request covered.
        if let Some(leader_commit_index) = input.leader_commit_index {
            if let Some((_, my_latest_index)) = self.wal.latest_entry() {
                self.wal
                    .ratchet_fwd_commit_index_if_newer(cmp::min(leader_commit_index, my_latest_index));
            }
        }

        // > If commitIndex > lastApplied: increment lastApplied, apply
        // > log[lastApplied] to state machine (§5.3)
        self.apply_all_committed_entries();

        Ok(AppendEntriesOutput {})
    }

    pub fn handle_append_entries_reply_from_peer(&mut self, reply: AppendEntriesReplyFromPeer) {
        let logger = self.logger.new(slog::o!(
            "peer" => format!("{:?}", reply.descriptor.peer_id),
            "seq_no" => reply.descriptor.seq_no,
        ));
        slog::debug!(logger, "AE reply from peer result: {:?}", reply.result);

        if self.local_state.current_term() != reply.descriptor.term {
            slog::info!(
                logger,
                "Received AE reply for outdated term {:?}, but we're on term {:?}",
                reply.descriptor.term,
                self.local_state.current_term(),
            );
            return;
        }

        // "Responded" means the peer itself answered, even if it rejected us. A responsive
        // peer is worth an immediate follow-up; an unreachable one waits for the next timer.
        let peer_responded = matches!(
            reply.result,
            Ok(()) | Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry { .. })
        );

        let peer_update = match reply.result {
            Err(AppendEntriesReplyFromPeerError::StaleTerm { new_term }) => {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                let increased = match self.local_state.store_term_if_increased(new_term) {
                    Ok(increased) => increased,
                    Err(e) => {
                        self.halt("Persisting term learned from AE reply", &e);
                        return;
                    }
                };
                if increased {
                    self.become_follower(None);
                    slog::info!(logger, "Transitioned to follower.");
                    return;
                }
                slog::warn!(logger, "Peer reported a stale term that isn't newer than ours. Treating as generic failure.");
                PeerStateUpdate::OtherError
            }
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry {
                conflict_index,
                conflict_term,
            }) => {
                let rewind_to = replication_planner::rewind_hint(&self.wal, conflict_index, conflict_term);
                slog::info!(
                    logger,
                    "Peer is missing previous log entry. Conflict hint ({:?}, {:?}), rewinding to {:?}",
                    conflict_index,
                    conflict_term,
                    rewind_to,
                );
                PeerStateUpdate::PeerLogBehind { rewind_to }
            }
            Err(AppendEntriesReplyFromPeerError::RetryableFailure(err_msg)) => {
                slog::debug!(logger, "AE failure: {}", err_msg);
                PeerStateUpdate::OtherError
            }
            Ok(()) => {
                slog::debug!(logger, "Successful AE reply");
                PeerStateUpdate::Success {
                    previous_log_entry: reply.descriptor.previous_log_entry_index,
                    num_entries_replicated: reply.descriptor.num_log_entries,
                }
            }
        };

        let next_index = {
            let leader_state = match self.election_state.leader_state_mut() {
                None => {
                    slog::info!(logger, "No longer leader");
                    return;
                }
                Some(leader_state) => leader_state,
            };
            let peer_state = match leader_state.peer_state_mut(&reply.descriptor.peer_id) {
                None => {
                    slog::warn!(logger, "Peer {:?} not found while handling AE reply", reply.descriptor.peer_id);
                    return;
                }
                Some(peer_state) => peer_state,
            };
            peer_state.handle_peer_reply(&logger, reply.descriptor.seq_no, peer_update);
            let (next_index, _) = peer_state.next_and_previous_log_index();
            next_index
        };

        // Check for majority replication and apply new commits.
        self.leader_advance_commit();

        // > If last log index ≥ nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        let peer_behind = matches!(self.wal.latest_entry(), Some((_, last_log_index)) if last_log_index >= next_index);
        if peer_responded && peer_behind {
            self.nudge_peer(reply.descriptor.peer_id, reply.descriptor.term);
        }
    }

    /// Advances the commit index to the highest entry replicated on a quorum, counting our own
    /// log, then applies everything newly committed.
    fn leader_advance_commit(&mut self) {
        let quorum_size = self.membership.quorum_size();
        let mut matched: Vec<Option<Index>> = match self.election_state.leader_state_mut() {
            Some(leader_state) => leader_state.peers_iter().map(|peer_state| peer_state.matched()).collect(),
            None => return,
        };
        matched.push(self.wal.latest_entry().map(|(_, index)| index));

        let tentative_new_commit_index = match Self::compute_majority_matched_index(matched, quorum_size) {
            Some(index) => index,
            None => return,
        };

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        match self
            .wal
            .ratchet_fwd_commit_index_if_valid(tentative_new_commit_index, self.local_state.current_term())
        {
            Ok(()) => self.apply_all_committed_entries(),
            Err(e) => slog::warn!(
                self.logger,
                "IO failure while confirming new commit index {:?}: {:?}",
                tentative_new_commit_index,
                e,
            ),
        }
    }

    /// Highest index present on at least `quorum_size` of the given members, or None if fewer
    /// than a quorum reported anything. One slot per cluster member, our own slot included.
    fn compute_majority_matched_index(mut matched_indexes: Vec<Option<Index>>, quorum_size: usize) -> Option<Index> {
        if matched_indexes.len() < quorum_size {
            return None;
        }

        matched_indexes.sort_by_key(|matched| match matched {
            None => 0u64,
            Some(index) => index.as_u64(),
        });

        // Sorted ascending, the slot `quorum_size` places from the end is the highest index
        // that a full quorum has reached. When in doubt, read the unit tests.
        let quorum_idx = matched_indexes.len() - quorum_size;
        matched_indexes.remove(quorum_idx)
    }

    pub fn handle_install_snapshot(
        &mut self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Err(InstallSnapshotError::ClientTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        let increased = match self.local_state.store_term_if_increased(input.leader_term) {
            Ok(increased) => increased,
            Err(e) => {
                self.halt("Persisting term from InstallSnapshot", &e);
                return Err(InstallSnapshotError::ServerIoError(e));
            }
        };
        if increased {
            self.become_follower(Some(input.leader_id.clone()));
        } else if matches!(self.election_state.current_state(), ElectionStateSnapshot::Candidate) {
            self.become_follower(Some(input.leader_id.clone()));
        } else {
            self.election_state.set_leader_if_unknown(&input.leader_id);
        }

        self.election_state.reset_timeout_if_follower();

        let (snapshot_term, snapshot_index) = input.snapshot_last_included;

        // Already caught up past the snapshot; never roll the state machine backwards.
        if matches!(self.wal.last_applied_index(), Some(last_applied) if last_applied >= snapshot_index) {
            slog::info!(
                self.logger,
                "Ignoring snapshot through {:?}, already applied through {:?}",
                snapshot_index,
                self.wal.last_applied_index(),
            );
            return Ok(InstallSnapshotOutput {});
        }

        // Validate the payload before touching anything durable.
        let restored = KvStore::deserialize(input.snapshot_data.clone())
            .map_err(|e| InstallSnapshotError::MalformedSnapshot(e.to_string()))?;

        let retains_log_suffix = matches!(
            self.wal.term_at(snapshot_index).map_err(InstallSnapshotError::ServerIoError)?,
            Some(term) if term == snapshot_term
        );

        // Persist before acking; the leader will discard its own copy of our progress.
        self.snapshot_store
            .save(Snapshot {
                last_included_index: snapshot_index,
                last_included_term: snapshot_term,
                data: input.snapshot_data,
            })
            .map_err(InstallSnapshotError::ServerIoError)?;

        self.wal.reset_to_snapshot(snapshot_term, snapshot_index).map_err(|e| {
            self.halt("Rebasing log onto installed snapshot", &e);
            InstallSnapshotError::ServerIoError(e)
        })?;
        self.state_machine = restored;

        if retains_log_suffix {
            self.membership.clear_pending_if_applied(snapshot_index);
        } else {
            // The whole log went with the reset; so did any tracked configuration entry.
            self.membership.clear_pending_if_truncated(Index::start_index());
            self.membership.clear_pending_if_applied(snapshot_index);
        }

        slog::info!(
            self.logger,
            "Installed snapshot through {:?} (term {:?}) from {:?}",
            snapshot_index,
            snapshot_term,
            input.leader_id,
        );

        Ok(InstallSnapshotOutput {})
    }

    pub fn handle_install_snapshot_reply_from_peer(&mut self, reply: InstallSnapshotReplyFromPeer) {
        let logger = self.logger.new(slog::o!(
            "peer" => format!("{:?}", reply.descriptor.peer_id),
            "seq_no" => reply.descriptor.seq_no,
        ));
        slog::debug!(logger, "InstallSnapshot reply from peer result: {:?}", reply.result);

        if self.local_state.current_term() != reply.descriptor.term {
            slog::info!(
                logger,
                "Received InstallSnapshot reply for outdated term {:?}, but we're on term {:?}",
                reply.descriptor.term,
                self.local_state.current_term(),
            );
            return;
        }

        let installed = reply.result.is_ok();
        let peer_update = match reply.result {
            Err(InstallSnapshotReplyFromPeerError::StaleTerm { new_term }) => {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                let increased = match self.local_state.store_term_if_increased(new_term) {
                    Ok(increased) => increased,
                    Err(e) => {
                        self.halt("Persisting term learned from InstallSnapshot reply", &e);
                        return;
                    }
                };
                if increased {
                    self.become_follower(None);
                    return;
                }
                PeerStateUpdate::OtherError
            }
            Err(InstallSnapshotReplyFromPeerError::RetryableFailure(err_msg)) => {
                slog::debug!(logger, "InstallSnapshot failure: {}", err_msg);
                PeerStateUpdate::OtherError
            }
            Ok(()) => PeerStateUpdate::SnapshotInstalled {
                last_included_index: reply.descriptor.snapshot_last_included_index,
            },
        };

        match self.election_state.leader_state_mut() {
            None => {
                slog::info!(logger, "No longer leader");
                return;
            }
            Some(leader_state) => match leader_state.peer_state_mut(&reply.descriptor.peer_id) {
                None => {
                    slog::warn!(
                        logger,
                        "Peer {:?} not found while handling InstallSnapshot reply",
                        reply.descriptor.peer_id,
                    );
                    return;
                }
                Some(peer_state) => {
                    peer_state.handle_peer_reply(&logger, reply.descriptor.seq_no, peer_update);
                }
            },
        }

        if installed {
            // Resume ordinary replication right after the snapshot.
            self.nudge_peer(reply.descriptor.peer_id, reply.descriptor.term);
        }
    }

    pub fn handle_take_snapshot(&mut self) -> Result<TakeSnapshotOutput, TakeSnapshotError> {
        let output = self.take_snapshot_impl()?;
        slog::info!(self.logger, "Took snapshot through {:?}", output.snapshot_last_included);

        Ok(output)
    }

    /// Serializes the state machine at the last applied index, saves it, then discards the now
    /// covered log prefix. Failures leave the previous snapshot and the log intact.
    fn take_snapshot_impl(&mut self) -> Result<TakeSnapshotOutput, TakeSnapshotError> {
        let last_applied = match self.wal.last_applied_index() {
            Some(last_applied) => last_applied,
            None => return Err(TakeSnapshotError::NothingApplied),
        };
        let last_applied_term = match self.wal.term_at(last_applied) {
            Ok(Some(term)) => term,
            Ok(None) => {
                return Err(TakeSnapshotError::LocalIoError(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("No term on record for applied index {:?}", last_applied),
                )))
            }
            Err(e) => return Err(TakeSnapshotError::LocalIoError(e)),
        };

        self.snapshot_store
            .save(Snapshot {
                last_included_index: last_applied,
                last_included_term: last_applied_term,
                data: self.state_machine.serialize(),
            })
            .map_err(TakeSnapshotError::LocalIoError)?;

        self.wal
            .compact_through(last_applied)
            .map_err(TakeSnapshotError::LocalIoError)?;

        Ok(TakeSnapshotOutput {
            snapshot_last_included: (last_applied_term, last_applied),
        })
    }

    fn maybe_take_automatic_snapshot(&mut self) {
        let threshold = match self.snapshot_after_applied_entries {
            Some(threshold) => threshold,
            None => return,
        };
        let last_applied = match self.wal.last_applied_index() {
            Some(last_applied) => last_applied,
            None => return,
        };
        let base = self.wal.snapshot_base().map(|(_, index)| index.as_u64()).unwrap_or(0);
        if last_applied.as_u64() - base < threshold {
            return;
        }

        match self.take_snapshot_impl() {
            Ok(output) => slog::info!(
                self.logger,
                "Took automatic snapshot through {:?}",
                output.snapshot_last_included,
            ),
            Err(e) => slog::warn!(self.logger, "Automatic snapshot attempt failed: {}", e),
        }
    }

    pub fn handle_status(&self) -> StatusReport {
        StatusReport {
            my_replica_id: self.my_replica_id.clone(),
            current_term: self.local_state.current_term(),
            commit_index: self.wal.commit_index(),
            last_applied_index: self.wal.last_applied_index(),
            first_log_index: self.wal.first_index(),
            election_state: self.election_state.current_state(),
            cluster_members: self.membership.member_ids(),
        }
    }

    pub fn handle_leader_timer(&mut self, input: LeaderTimerTick) {
        let current_term = self.local_state.current_term();
        if current_term != input.term {
            slog::warn!(
                self.logger,
                "Received leader timer tick for outdated term {:?}, current term: {:?}",
                input.term,
                current_term,
            );
            return;
        }

        let outbound = {
            let leader_state = match self.election_state.leader_state_mut() {
                Some(leader_state) => leader_state,
                None => {
                    slog::info!(self.logger, "Received leader timer event but no longer leader.");
                    return;
                }
            };
            let peer_state = match leader_state.peer_state_mut(&input.peer_id) {
                Some(peer_state) => peer_state,
                None => {
                    // Peer was removed from the cluster; its timer task winds down on its own.
                    slog::info!(self.logger, "Ignoring timer tick for untracked peer {:?}", input.peer_id);
                    return;
                }
            };

            match replication_planner::plan(
                current_term,
                self.my_replica_id.clone(),
                input.peer_id.clone(),
                peer_state,
                &self.wal,
                self.snapshot_store.as_ref(),
            ) {
                Ok(outbound) => {
                    peer_state.reset_heartbeat_timer();
                    outbound
                }
                Err(replication_planner::PlanError::PeerConcurrencyThrottle) => {
                    slog::debug!(self.logger, "Outstanding request to peer {:?}, skipping tick", input.peer_id);
                    return;
                }
                Err(replication_planner::PlanError::SnapshotMissing) => {
                    slog::error!(
                        self.logger,
                        "Peer {:?} needs a snapshot but none is saved. Wtf!",
                        input.peer_id,
                    );
                    return;
                }
                Err(replication_planner::PlanError::SnapshotRead(e)) => {
                    slog::error!(self.logger, "Failed to load snapshot for peer {:?}: {:?}", input.peer_id, e);
                    return;
                }
                Err(replication_planner::PlanError::DiskRead(index, e)) => {
                    slog::error!(self.logger, "Failed to read log entry at index {:?}: {:?}", index, e);
                    return;
                }
            }
        };

        self.dispatch_outbound_call(outbound);
    }

    fn dispatch_outbound_call(&self, outbound: replication_planner::OutboundCall) {
        match outbound {
            replication_planner::OutboundCall::AppendEntries(request, descriptor) => {
                tokio::task::spawn(Self::call_peer_append_entries(
                    self.logger.clone(),
                    Arc::clone(&self.transport),
                    request,
                    self.append_entries_timeout,
                    self.actor_client.clone(),
                    descriptor,
                ));
            }
            replication_planner::OutboundCall::InstallSnapshot(request, descriptor) => {
                tokio::task::spawn(Self::call_peer_install_snapshot(
                    self.logger.clone(),
                    Arc::clone(&self.transport),
                    request,
                    self.install_snapshot_timeout,
                    self.actor_client.clone(),
                    descriptor,
                ));
            }
        }
    }

    async fn call_peer_append_entries(
        logger: slog::Logger,
        transport: Arc<dyn Transport>,
        request: AppendEntriesInput,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        descriptor: AppendEntriesReplyFromPeerDescriptor,
    ) {
        slog::debug!(logger, "ClientWire - {:?}", request);
        let target = descriptor.peer_id.clone();
        let rpc_reply = tokio::time::timeout(rpc_timeout, transport.append_entries(&target, request)).await;
        slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

        let reply = AppendEntriesReplyFromPeer {
            descriptor,
            result: Self::convert_append_entries_rpc_reply(rpc_reply),
        };
        let _ = callback.append_entries_reply_from_peer(reply).await;
    }

    fn convert_append_entries_rpc_reply(
        rpc_reply: Result<RpcResult<AppendEntriesOutput, AppendEntriesError>, Elapsed>,
    ) -> Result<(), AppendEntriesReplyFromPeerError> {
        match rpc_reply {
            Ok(Ok(Ok(_output))) => Ok(()),
            Ok(Ok(Err(AppendEntriesError::ClientTermOutOfDate(info)))) => {
                Err(AppendEntriesReplyFromPeerError::StaleTerm {
                    new_term: info.current_term,
                })
            }
            Ok(Ok(Err(AppendEntriesError::ServerMissingPreviousLogEntry {
                conflict_index,
                conflict_term,
            }))) => Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry {
                conflict_index,
                conflict_term,
            }),
            Ok(Ok(Err(peer_error))) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(format!(
                "Peer-side failure: {}",
                peer_error
            ))),
            Ok(Err(transport_error)) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(format!(
                "Failed to deliver AppendEntries: {}",
                transport_error
            ))),
            Err(_elapsed) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                "Timed out calling AppendEntries".into(),
            )),
        }
    }

    async fn call_peer_install_snapshot(
        logger: slog::Logger,
        transport: Arc<dyn Transport>,
        request: InstallSnapshotInput,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        descriptor: InstallSnapshotReplyFromPeerDescriptor,
    ) {
        slog::debug!(logger, "ClientWire - InstallSnapshot through {:?}", request.snapshot_last_included);
        let target = descriptor.peer_id.clone();
        let rpc_reply = tokio::time::timeout(rpc_timeout, transport.install_snapshot(&target, request)).await;
        slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

        let reply = InstallSnapshotReplyFromPeer {
            descriptor,
            result: Self::convert_install_snapshot_rpc_reply(rpc_reply),
        };
        let _ = callback.install_snapshot_reply_from_peer(reply).await;
    }

    fn convert_install_snapshot_rpc_reply(
        rpc_reply: Result<RpcResult<InstallSnapshotOutput, InstallSnapshotError>, Elapsed>,
    ) -> Result<(), InstallSnapshotReplyFromPeerError> {
        match rpc_reply {
            Ok(Ok(Ok(_output))) => Ok(()),
            Ok(Ok(Err(InstallSnapshotError::ClientTermOutOfDate(info)))) => {
                Err(InstallSnapshotReplyFromPeerError::StaleTerm {
                    new_term: info.current_term,
                })
            }
            Ok(Ok(Err(peer_error))) => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(format!(
                "Peer-side failure: {}",
                peer_error
            ))),
            Ok(Err(transport_error)) => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(format!(
                "Failed to deliver InstallSnapshot: {}",
                transport_error
            ))),
            Err(_elapsed) => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(
                "Timed out calling InstallSnapshot".into(),
            )),
        }
    }

    pub fn handle_follower_timeout(&mut self) {
        if !self.membership.is_self_member() {
            slog::info!(self.logger, "Ignoring election timeout. We are no longer a cluster member.");
            return;
        }

        // Write-ahead log style: Vote for self on durable state before campaigning.
        let new_term = match self.local_state.increment_term_and_vote_for_self() {
            Ok(new_term) => new_term,
            Err(e) => {
                self.halt("Persisting term/vote to start election", &e);
                return;
            }
        };
        self.election_state.transition_to_candidate_and_vote_for_self();
        slog::info!(
            self.logger,
            "Timed out as follower. Changed to candidate. Election state: {:?}",
            self.election_state,
        );

        if self.membership.quorum_size() <= 1 {
            // Single-node cluster. Our own vote settles it.
            self.become_leader(new_term);
            return;
        }

        let request = self.new_request_vote_request(new_term);
        for peer_id in self.membership.peer_ids() {
            tokio::task::spawn(Self::call_peer_request_vote(
                self.logger.clone(),
                Arc::clone(&self.transport),
                peer_id,
                request.clone(),
                self.actor_client.clone(),
                new_term,
            ));
        }
    }

    fn new_request_vote_request(&self, term: Term) -> RequestVoteInput {
        RequestVoteInput {
            candidate_term: term,
            candidate_id: self.my_replica_id.clone(),
            candidate_last_log_entry: self.wal.latest_entry(),
        }
    }

    async fn call_peer_request_vote(
        logger: slog::Logger,
        transport: Arc<dyn Transport>,
        peer_id: ReplicaId,
        request: RequestVoteInput,
        callback: WeakActorClient,
        term: Term,
    ) {
        slog::debug!(logger, "ClientWire - {:?}", request);
        let rpc_reply = transport.request_vote(&peer_id, request).await;
        slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

        let result = match rpc_reply {
            Ok(Ok(output)) => {
                if output.vote_granted {
                    RequestVoteResult::VoteGranted
                } else {
                    RequestVoteResult::VoteNotGranted
                }
            }
            Ok(Err(RequestVoteError::RequestTermOutOfDate(info))) => RequestVoteResult::StaleTerm {
                new_term: info.current_term,
            },
            Ok(Err(peer_error)) => {
                slog::debug!(logger, "RequestVote to {:?} failed on peer: {}", peer_id, peer_error);
                RequestVoteResult::RetryableFailure
            }
            Err(transport_error) => {
                slog::debug!(logger, "RequestVote to {:?} undeliverable: {}", peer_id, transport_error);
                RequestVoteResult::RetryableFailure
            }
        };

        let reply = RequestVoteReplyFromPeer { peer_id, term, result };
        let _ = callback.request_vote_reply_from_peer(reply).await;
    }

    fn leader_check(&self) -> Result<(), EnqueueForReplicationError> {
        match self.election_state.current_state() {
            ElectionStateSnapshot::Leader => Ok(()),
            ElectionStateSnapshot::Follower(leader_id) => Err(EnqueueForReplicationError::LeaderRedirect(leader_id)),
            ElectionStateSnapshot::Candidate | ElectionStateSnapshot::FollowerNoLeader => {
                Err(EnqueueForReplicationError::NoLeader)
            }
        }
    }

    fn validate_command(&self, command: &Command) -> Result<(), EnqueueForReplicationError> {
        match &command.op {
            Operation::AddMember { member_id } => {
                if self.membership.change_pending() {
                    return Err(EnqueueForReplicationError::MembershipChangePending);
                }
                if self.membership.is_member(&ReplicaId::new(member_id.clone())) {
                    return Err(EnqueueForReplicationError::InvalidCommand(format!(
                        "{} is already a cluster member",
                        member_id
                    )));
                }
                Ok(())
            }
            Operation::RemoveMember { member_id } => {
                if self.membership.change_pending() {
                    return Err(EnqueueForReplicationError::MembershipChangePending);
                }
                if !self.membership.is_member(&ReplicaId::new(member_id.clone())) {
                    return Err(EnqueueForReplicationError::InvalidCommand(format!(
                        "{} is not a cluster member",
                        member_id
                    )));
                }
                if self.membership.num_members() == 1 {
                    return Err(EnqueueForReplicationError::InvalidCommand(
                        "Refusing to remove the last cluster member".to_string(),
                    ));
                }
                Ok(())
            }
            Operation::Noop | Operation::Set { .. } | Operation::Delete { .. } => Ok(()),
        }
    }

    fn apply_all_committed_entries(&mut self) {
        loop {
            if self.halted {
                return;
            }
            match self.wal.next_committed_unapplied() {
                Ok(Some((index, entry))) => self.apply_one_committed_entry(index, entry),
                Ok(None) => break,
                Err(e) => {
                    self.halt("Reading committed entry for apply", &e);
                    return;
                }
            }
        }

        self.maybe_take_automatic_snapshot();
    }

    fn apply_one_committed_entry(&mut self, index: Index, entry: WriteAheadLogEntry) {
        let command = match Command::decode(Bytes::from(entry.data)) {
            Ok(command) => command,
            Err(e) => {
                let ioe = io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Committed entry at {:?} does not decode: {}", index, e),
                );
                self.halt("Applying committed entry", &ioe);
                return;
            }
        };

        match &command.op {
            Operation::Noop => {}
            Operation::Set { .. } | Operation::Delete { .. } => self.state_machine.apply(&command.op),
            Operation::AddMember { member_id } => self.apply_add_member(ReplicaId::new(member_id.clone())),
            Operation::RemoveMember { member_id } => self.apply_remove_member(ReplicaId::new(member_id.clone())),
        }
        self.membership.clear_pending_if_applied(index);

        if let Some(pending_op) = self.pending_client_ops.remove(&index) {
            match pending_op {
                PendingClientOp::Write(callback) => callback.send(Ok(EnqueueForReplicationOutput {
                    applied_term: entry.term,
                    applied_index: index,
                })),
                PendingClientOp::Read { key, callback } => {
                    let value = self.state_machine.get(&key).map(str::to_string);
                    callback.send(Ok(ReadOutput { value }));
                }
            }
        }
    }

    fn apply_add_member(&mut self, new_member: ReplicaId) {
        if !self.membership.apply_add(new_member.clone()) {
            return;
        }
        slog::info!(
            self.logger,
            "Configuration change applied: added {:?}. Quorum is now {} of {}.",
            new_member,
            self.membership.quorum_size(),
            self.membership.num_members(),
        );

        if new_member != self.my_replica_id {
            // As leader, start heartbeating the new peer from our current log end.
            let previous_log_entry_index = self.wal.latest_entry().map(|(_, index)| index);
            self.election_state.start_tracking_peer(new_member, previous_log_entry_index);
        }
    }

    fn apply_remove_member(&mut self, removed_member: ReplicaId) {
        if !self.membership.apply_remove(&removed_member) {
            return;
        }
        slog::info!(
            self.logger,
            "Configuration change applied: removed {:?}. Quorum is now {} of {}.",
            removed_member,
            self.membership.quorum_size(),
            self.membership.num_members(),
        );

        if removed_member == self.my_replica_id {
            // A leader serves until its own removal commits, then steps aside. As a
            // non-member we also never campaign again.
            if matches!(self.election_state.current_state(), ElectionStateSnapshot::Leader) {
                slog::info!(self.logger, "We were removed from the cluster. Stepping aside as leader.");
                self.become_follower(None);
            }
        } else {
            self.election_state.stop_tracking_peer(&removed_member);
        }
    }

    /// Immediately replicate to all peers instead of waiting out their heartbeat timers.
    fn request_eager_replication(&mut self, term: Term) {
        let peer_ids = match self.election_state.leader_state_mut() {
            Some(leader_state) => leader_state.peer_ids(),
            None => return,
        };
        for peer_id in peer_ids {
            self.nudge_peer(peer_id, term);
        }
    }

    fn nudge_peer(&self, peer_id: ReplicaId, term: Term) {
        let actor_client = self.actor_client.clone();
        let tick = LeaderTimerTick { peer_id, term };
        tokio::task::spawn(async move {
            let _ = actor_client.leader_timer(tick).await;
        });
    }

    fn become_follower(&mut self, new_leader: Option<ReplicaId>) {
        self.election_state.transition_to_follower(new_leader);
        self.fail_all_pending_client_ops(|| EnqueueForReplicationError::LeadershipLost);
    }

    fn halt(&mut self, context: &str, error: &io::Error) {
        slog::crit!(
            self.logger,
            "Fatal storage failure, halting replica. Context: {}. Error: {:?}",
            context,
            error,
        );
        self.halted = true;
        self.fail_all_pending_client_ops(|| {
            EnqueueForReplicationError::LocalIoError(io::Error::new(
                io::ErrorKind::Other,
                "Replica halted after storage failure",
            ))
        });
    }

    fn fail_all_pending_client_ops(&mut self, make_error: impl Fn() -> EnqueueForReplicationError) {
        for (_, pending_op) in self.pending_client_ops.drain() {
            match pending_op {
                PendingClientOp::Write(callback) => callback.send(Err(make_error())),
                PendingClientOp::Read { callback, .. } => callback.send(Err(make_error())),
            }
        }
    }
}

/// Decides what a leader sends a peer on its timer tick: the next batch of log entries, or the
/// latest snapshot if the peer's cursor has fallen behind our earliest retained entry.
mod replication_planner {
    use crate::commitlog::{Index, Log};
    use crate::replica::election::PeerState;
    use crate::replica::local_state::Term;
    use crate::replica::membership::ReplicaId;
    use crate::replica::replica_api::{
        AppendEntriesInput, AppendEntriesLogEntry, AppendEntriesReplyFromPeerDescriptor, InstallSnapshotInput,
        InstallSnapshotReplyFromPeerDescriptor,
    };
    use crate::replica::write_ahead_log::{WriteAheadLog, WriteAheadLogEntry};
    use crate::snapshot::SnapshotStore;
    use bytes::Bytes;
    use std::{cmp, io};

    // Upper bound on entries per AppendEntries call. Lagging peers catch up in chunks of this
    // size rather than one giant request.
    const MAX_ENTRIES_PER_APPEND: usize = 100;

    pub(super) enum OutboundCall {
        AppendEntries(AppendEntriesInput, AppendEntriesReplyFromPeerDescriptor),
        InstallSnapshot(InstallSnapshotInput, InstallSnapshotReplyFromPeerDescriptor),
    }

    pub(super) enum PlanError {
        // Simplicity vs throughput tradeoff: 1 outstanding request per peer, no pipelining.
        // Entry batching still keeps catch-up throughput reasonable.
        PeerConcurrencyThrottle,
        SnapshotMissing,
        SnapshotRead(io::Error),
        DiskRead(Index, io::Error),
    }

    pub(super) fn plan<L>(
        current_term: Term,
        my_id: ReplicaId,
        peer_id: ReplicaId,
        peer_state: &mut PeerState,
        wal: &WriteAheadLog<L>,
        snapshot_store: &dyn SnapshotStore,
    ) -> Result<OutboundCall, PlanError>
    where
        L: Log<WriteAheadLogEntry>,
    {
        if peer_state.has_outstanding_request() {
            return Err(PlanError::PeerConcurrencyThrottle);
        }

        let (next_index, opt_previous_index) = peer_state.next_and_previous_log_index();

        // Peer needs entries we no longer hold. Only the snapshot can catch it up.
        if next_index < wal.first_index() {
            let snapshot = match snapshot_store.load() {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => return Err(PlanError::SnapshotMissing),
                Err(e) => return Err(PlanError::SnapshotRead(e)),
            };

            let seq_no = peer_state.next_seq_no();
            let descriptor = InstallSnapshotReplyFromPeerDescriptor {
                peer_id,
                term: current_term,
                seq_no,
                snapshot_last_included_index: snapshot.last_included_index,
            };
            let request = InstallSnapshotInput {
                leader_term: current_term,
                leader_id: my_id,
                snapshot_last_included: (snapshot.last_included_term, snapshot.last_included_index),
                snapshot_data: snapshot.data,
            };
            return Ok(OutboundCall::InstallSnapshot(request, descriptor));
        }

        let previous_log_entry = match opt_previous_index {
            None => None,
            Some(previous_index) => match wal.term_at(previous_index) {
                Ok(Some(term)) => Some((term, previous_index)),
                Ok(None) => {
                    return Err(PlanError::DiskRead(
                        previous_index,
                        io::Error::new(io::ErrorKind::NotFound, "Tracked log entry is missing"),
                    ))
                }
                Err(e) => return Err(PlanError::DiskRead(previous_index, e)),
            },
        };

        let mut new_entries = Vec::new();
        let mut read_index = next_index;
        while new_entries.len() < MAX_ENTRIES_PER_APPEND {
            match wal.read(read_index) {
                Ok(Some(entry)) => {
                    new_entries.push(AppendEntriesLogEntry {
                        term: entry.term,
                        data: Bytes::from(entry.data),
                    });
                    read_index = read_index.plus(1);
                }
                Ok(None) => break,
                Err(e) => return Err(PlanError::DiskRead(read_index, e)),
            }
        }

        // Never advertise a commit index past what this request covers. The peer may hold
        // conflicting uncommitted entries beyond it, and those must not become committed.
        let last_sent_index = match (opt_previous_index, new_entries.len()) {
            (Some(previous_index), n) => Some(previous_index.plus(n as u64)),
            (None, 0) => None,
            (None, n) => Some(Index::new_usize(n)),
        };
        let advertised_commit_index = match (wal.commit_index(), last_sent_index) {
            (Some(commit_index), Some(last_sent)) => Some(cmp::min(commit_index, last_sent)),
            _ => None,
        };

        let seq_no = peer_state.next_seq_no();
        let descriptor = AppendEntriesReplyFromPeerDescriptor {
            peer_id,
            term: current_term,
            seq_no,
            previous_log_entry_index: opt_previous_index,
            num_log_entries: new_entries.len(),
        };
        let request = AppendEntriesInput {
            leader_term: current_term,
            leader_id: my_id,
            leader_previous_log_entry: previous_log_entry,
            leader_commit_index: advertised_commit_index,
            new_entries,
        };

        Ok(OutboundCall::AppendEntries(request, descriptor))
    }

    /// Follower side of accelerated backtracking: the first index of the run of `term` that
    /// ends at `from`. Terms never decrease along the log, so the walk stops at the first
    /// older-term entry (or the snapshot boundary).
    pub(super) fn first_index_of_term<L>(wal: &WriteAheadLog<L>, from: Index, term: Term) -> Result<Index, io::Error>
    where
        L: Log<WriteAheadLogEntry>,
    {
        let mut first = from;
        while let Some(previous) = first.checked_minus(1) {
            match wal.term_at(previous)? {
                Some(t) if t == term => first = previous,
                _ => break,
            }
        }

        Ok(first)
    }

    /// Leader side of accelerated backtracking. If we also hold entries of the peer's
    /// conflicting term, resume right after our last entry of that term; otherwise skip the
    /// peer's whole run of it by jumping to its reported first index.
    pub(super) fn rewind_hint<L>(wal: &WriteAheadLog<L>, conflict_index: Index, conflict_term: Option<Term>) -> Index
    where
        L: Log<WriteAheadLogEntry>,
    {
        let conflict_term = match conflict_term {
            Some(term) => term,
            None => return conflict_index,
        };

        let mut probe = match wal.latest_entry() {
            Some((_, latest_index)) => latest_index,
            None => return conflict_index,
        };
        loop {
            match wal.term_at(probe) {
                Ok(Some(term)) if term == conflict_term => return probe.plus(1),
                Ok(Some(term)) if term > conflict_term => match probe.checked_minus(1) {
                    Some(previous) => probe = previous,
                    None => return conflict_index,
                },
                // Older term reached, compacted away, or unreadable: take the peer's hint.
                _ => return conflict_index,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::replication_planner::{first_index_of_term, plan, rewind_hint, OutboundCall, PlanError};
    use super::*;
    use crate::actor::ActorClient;
    use crate::commitlog::InMemoryLog;
    use crate::replica::VolatileLocalState;
    use crate::snapshot::InMemorySnapshotStore;
    use crate::transport::TransportError;

    type Repl = Replica<InMemoryLog<WriteAheadLogEntry>, VolatileLocalState>;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn opt_index(v: u64) -> Option<Index> {
        if v == 0 {
            None
        } else {
            Some(Index::new(v))
        }
    }

    fn wal_with_terms(terms: &[u64]) -> WriteAheadLog<InMemoryLog<WriteAheadLogEntry>> {
        let mut wal = WriteAheadLog::new(logger(), InMemoryLog::create().unwrap(), None).unwrap();
        for term in terms {
            wal.append(WriteAheadLogEntry {
                term: Term::new(*term),
                data: Vec::new(),
            })
            .unwrap();
        }
        wal
    }

    #[test]
    fn test_commit_checker_logic() {
        fn run(expected: u64, quorum_size: usize, matches: Vec<u64>) {
            let matches = matches.into_iter().map(opt_index).collect();
            let expected = opt_index(expected);

            assert_eq!(expected, Repl::compute_majority_matched_index(matches, quorum_size));
        }

        // 3-cluster (incl. own slot), quorum 2
        run(0, 2, vec![9, 0, 0]);
        run(9, 2, vec![9, 0, 9]);
        run(9, 2, vec![9, 8, 9]);
        run(8, 2, vec![9, 8, 7]);

        // 4-cluster, quorum 3
        run(0, 3, vec![9, 0, 0, 0]);
        run(0, 3, vec![9, 9, 0, 0]);
        run(8, 3, vec![9, 8, 0, 9]);
        run(8, 3, vec![9, 7, 8, 9]);

        // 5-cluster, quorum 3
        run(0, 3, vec![9, 0, 0, 0, 0]);
        run(8, 3, vec![9, 0, 0, 8, 9]);
        run(8, 3, vec![9, 0, 7, 8, 9]);
        run(8, 3, vec![9, 6, 7, 8, 9]);

        // Ordering doesn't matter
        run(8, 3, vec![0, 8, 9, 9, 0]);
        run(7, 4, vec![9, 8, 0, 7, 7, 9, 0]);

        // Shrunk mid-change: fewer reports than quorum
        run(0, 3, vec![9, 9]);
    }

    #[test]
    fn follower_conflict_hint_finds_first_index_of_term() {
        // Indexes:  1  2  3  4  5  6
        let wal = wal_with_terms(&[1, 1, 2, 2, 2, 3]);

        assert_eq!(first_index_of_term(&wal, Index::new(5), Term::new(2)).unwrap(), Index::new(3));
        assert_eq!(first_index_of_term(&wal, Index::new(6), Term::new(3)).unwrap(), Index::new(6));
        assert_eq!(first_index_of_term(&wal, Index::new(2), Term::new(1)).unwrap(), Index::new(1));
    }

    #[test]
    fn leader_rewind_hint_skips_past_conflicting_term() {
        // Leader log:  1  1  4  4
        let wal = wal_with_terms(&[1, 1, 4, 4]);

        // Peer reported conflicting term 4 starting at its index 2: we hold term 4 too, so
        // resume right after our last term-4 entry (clamped by the peer cursor later).
        assert_eq!(rewind_hint(&wal, Index::new(2), Some(Term::new(4))), Index::new(5));

        // Peer reported term 2, which we never had: jump to the peer's first index of it.
        assert_eq!(rewind_hint(&wal, Index::new(2), Some(Term::new(2))), Index::new(2));

        // No term hint means the peer's log was just short.
        assert_eq!(rewind_hint(&wal, Index::new(3), None), Index::new(3));
    }

    /// Builds a leader-role ElectionState tracking a single peer whose cursor starts after
    /// `previous_log_entry_index`.
    async fn leader_tracking_peer(
        actor_client: &ActorClient,
        peer_id: &ReplicaId,
        previous_log_entry_index: Option<Index>,
    ) -> ElectionState {
        let (mut election_state, _listener) = ElectionState::new_follower(
            ElectionConfig {
                my_replica_id: ReplicaId::new("replica-1"),
                leader_heartbeat_duration: Duration::from_secs(60),
                follower_min_timeout: Duration::from_secs(60),
                follower_max_timeout: Duration::from_secs(60),
                jitter: Jitter::seeded(0),
            },
            actor_client.weak(),
        );
        let mut peer_ids = HashSet::new();
        peer_ids.insert(peer_id.clone());
        election_state.transition_to_leader(Term::new(5), peer_ids, previous_log_entry_index);
        election_state
    }

    #[tokio::test]
    async fn planner_batches_entries_from_peer_cursor() {
        let (actor_client, _rx) = ActorClient::new(10);
        let peer_id = ReplicaId::new("replica-2");
        let mut election_state = leader_tracking_peer(&actor_client, &peer_id, Some(Index::new(2))).await;
        let mut wal = wal_with_terms(&[1, 1, 2, 2, 2]);
        wal.ratchet_fwd_commit_index_if_newer(Index::new(5));
        let snapshot_store = InMemorySnapshotStore::new();

        let peer_state = election_state
            .leader_state_mut()
            .unwrap()
            .peer_state_mut(&peer_id)
            .unwrap();
        let outbound = plan(
            Term::new(5),
            ReplicaId::new("replica-1"),
            peer_id.clone(),
            peer_state,
            &wal,
            &snapshot_store,
        );

        match outbound {
            Ok(OutboundCall::AppendEntries(request, descriptor)) => {
                assert_eq!(request.leader_previous_log_entry, Some((Term::new(1), Index::new(2))));
                assert_eq!(request.new_entries.len(), 3);
                assert_eq!(request.leader_commit_index, Some(Index::new(5)));
                assert_eq!(descriptor.peer_id, peer_id);
                assert_eq!(descriptor.seq_no, 1);
                assert_eq!(descriptor.previous_log_entry_index, Some(Index::new(2)));
                assert_eq!(descriptor.num_log_entries, 3);
            }
            _ => panic!("Expected an AppendEntries call"),
        }
    }

    #[tokio::test]
    async fn planner_throttles_while_request_outstanding() {
        let (actor_client, _rx) = ActorClient::new(10);
        let peer_id = ReplicaId::new("replica-2");
        let mut election_state = leader_tracking_peer(&actor_client, &peer_id, None).await;
        let wal = wal_with_terms(&[1]);
        let snapshot_store = InMemorySnapshotStore::new();

        let peer_state = election_state
            .leader_state_mut()
            .unwrap()
            .peer_state_mut(&peer_id)
            .unwrap();
        // First plan succeeds and consumes the seq_no.
        assert!(plan(
            Term::new(5),
            ReplicaId::new("replica-1"),
            peer_id.clone(),
            peer_state,
            &wal,
            &snapshot_store,
        )
        .is_ok());

        let second = plan(
            Term::new(5),
            ReplicaId::new("replica-1"),
            peer_id.clone(),
            peer_state,
            &wal,
            &snapshot_store,
        );
        assert!(matches!(second, Err(PlanError::PeerConcurrencyThrottle)));
    }

    #[tokio::test]
    async fn planner_switches_to_snapshot_for_lagging_peer() {
        let (actor_client, _rx) = ActorClient::new(10);
        let peer_id = ReplicaId::new("replica-2");
        // Peer cursor starts at index 1.
        let mut election_state = leader_tracking_peer(&actor_client, &peer_id, None).await;

        // Log compacted through index 3.
        let mut wal = wal_with_terms(&[1, 1, 2, 2]);
        wal.ratchet_fwd_commit_index_if_newer(Index::new(3));
        while let Some(_) = wal.next_committed_unapplied().unwrap() {}
        wal.compact_through(Index::new(3)).unwrap();

        let mut snapshot_store = InMemorySnapshotStore::new();
        snapshot_store
            .save(Snapshot {
                last_included_index: Index::new(3),
                last_included_term: Term::new(2),
                data: Bytes::from_static(b"state"),
            })
            .unwrap();

        let peer_state = election_state
            .leader_state_mut()
            .unwrap()
            .peer_state_mut(&peer_id)
            .unwrap();
        let outbound = plan(
            Term::new(5),
            ReplicaId::new("replica-1"),
            peer_id.clone(),
            peer_state,
            &wal,
            &snapshot_store,
        );

        match outbound {
            Ok(OutboundCall::InstallSnapshot(request, descriptor)) => {
                assert_eq!(request.snapshot_last_included, (Term::new(2), Index::new(3)));
                assert_eq!(request.snapshot_data, Bytes::from_static(b"state"));
                assert_eq!(descriptor.snapshot_last_included_index, Index::new(3));
                assert_eq!(descriptor.peer_id, peer_id);
            }
            _ => panic!("Expected an InstallSnapshot call"),
        }
    }

    #[test]
    fn convert_append_entries_reply_maps_peer_decisions() {
        let ok: Result<RpcResult<AppendEntriesOutput, AppendEntriesError>, Elapsed> =
            Ok(Ok(Ok(AppendEntriesOutput {})));
        assert!(Repl::convert_append_entries_rpc_reply(ok).is_ok());

        let stale: Result<RpcResult<AppendEntriesOutput, AppendEntriesError>, Elapsed> =
            Ok(Ok(Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo {
                current_term: Term::new(9),
            }))));
        assert!(matches!(
            Repl::convert_append_entries_rpc_reply(stale),
            Err(AppendEntriesReplyFromPeerError::StaleTerm { new_term }) if new_term == Term::new(9)
        ));

        let behind: Result<RpcResult<AppendEntriesOutput, AppendEntriesError>, Elapsed> =
            Ok(Ok(Err(AppendEntriesError::ServerMissingPreviousLogEntry {
                conflict_index: Index::new(4),
                conflict_term: Some(Term::new(2)),
            })));
        assert!(matches!(
            Repl::convert_append_entries_rpc_reply(behind),
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry {
                conflict_index,
                conflict_term: Some(conflict_term),
            }) if conflict_index == Index::new(4) && conflict_term == Term::new(2)
        ));

        let undeliverable: Result<RpcResult<AppendEntriesOutput, AppendEntriesError>, Elapsed> =
            Ok(Err(TransportError::Dropped));
        assert!(matches!(
            Repl::convert_append_entries_rpc_reply(undeliverable),
            Err(AppendEntriesReplyFromPeerError::RetryableFailure(_))
        ));
    }

    #[test]
    fn convert_install_snapshot_reply_maps_peer_decisions() {
        let ok: Result<RpcResult<InstallSnapshotOutput, InstallSnapshotError>, Elapsed> =
            Ok(Ok(Ok(InstallSnapshotOutput {})));
        assert!(Repl::convert_install_snapshot_rpc_reply(ok).is_ok());

        let stale: Result<RpcResult<InstallSnapshotOutput, InstallSnapshotError>, Elapsed> =
            Ok(Ok(Err(InstallSnapshotError::ClientTermOutOfDate(TermOutOfDateInfo {
                current_term: Term::new(3),
            }))));
        assert!(matches!(
            Repl::convert_install_snapshot_rpc_reply(stale),
            Err(InstallSnapshotReplyFromPeerError::StaleTerm { new_term }) if new_term == Term::new(3)
        ));

        let malformed: Result<RpcResult<InstallSnapshotOutput, InstallSnapshotError>, Elapsed> =
            Ok(Ok(Err(InstallSnapshotError::MalformedSnapshot("bad header".to_string()))));
        assert!(matches!(
            Repl::convert_install_snapshot_rpc_reply(malformed),
            Err(InstallSnapshotReplyFromPeerError::RetryableFailure(_))
        ));
    }
}
