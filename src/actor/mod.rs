use crate::commitlog;
use crate::replica;
use tokio::sync::{mpsc, oneshot};

// v1 Design choice: Disk interaction will be synchronous. Future improvement: There should be a
//                   Disk Actor.
#[derive(Debug)]
pub(crate) enum Event {
    // Leader: Write to disk, locally buffer entry to be replicated later. Also stores callback
    //         until the entry is applied.
    // Candidate: Reject request.
    // Follower: Redirect.
    EnqueueForReplication(
        replica::EnqueueForReplicationInput,
        Callback<Result<replica::EnqueueForReplicationOutput, replica::EnqueueForReplicationError>>,
    ),

    // Leader: Append a barrier entry and answer from the state machine once it applies.
    // Candidate: Reject request.
    // Follower: Redirect.
    Read(
        replica::ReadInput,
        Callback<Result<replica::ReadOutput, replica::EnqueueForReplicationError>>,
    ),

    // Leader: Grant vote if applicable (includes write to disk). Transition to follower.
    // Candidate: Grant vote if applicable (includes write to disk). Transition to follower.
    // Follower: Grant vote if applicable (includes write to disk).
    RequestVote(
        replica::RequestVoteInput,
        Callback<Result<replica::RequestVoteOutput, replica::RequestVoteError>>,
    ),

    // Leader: discard
    // Candidate: Update local state. Transition to leader if quorum vote.
    // Follower: discard
    RequestVoteReplyFromPeer(replica::RequestVoteReplyFromPeer),

    // Leader: Transition to follower if applicable. Clean up log. Respond to request.
    // Candidate: Transition to follower if applicable. Clean up log. Respond to request.
    // Follower: Write to disk then respond. Reset timeout.
    AppendEntries(
        replica::AppendEntriesInput,
        Callback<Result<replica::AppendEntriesOutput, replica::AppendEntriesError>>,
    ),

    // Leader: Update local state tracking each peer's replication progress. If quorum, mark
    //         committed, apply to state machine, and answer parked client callbacks.
    // Candidate: discard
    // Follower: discard
    AppendEntriesReplyFromPeer(replica::AppendEntriesReplyFromPeer),

    // Leader: Transition to follower if applicable. Otherwise discard.
    // Candidate: Transition to follower if applicable. Otherwise discard.
    // Follower: Replace log and state machine with the snapshot. Reset timeout.
    InstallSnapshot(
        replica::InstallSnapshotInput,
        Callback<Result<replica::InstallSnapshotOutput, replica::InstallSnapshotError>>,
    ),

    // Leader: Fast forward the peer's replication cursor past the snapshot.
    // Candidate: discard
    // Follower: discard
    InstallSnapshotReplyFromPeer(replica::InstallSnapshotReplyFromPeer),

    // Any state: Serialize the state machine at the last applied entry, persist it, and discard
    //            the covered log prefix.
    TakeSnapshot(Callback<Result<replica::TakeSnapshotOutput, replica::TakeSnapshotError>>),

    // Any state: Report current term, election state, commit/applied indexes, and membership.
    Status(Callback<replica::StatusReport>),

    // Leader: Send AppendEntries (or InstallSnapshot, for a peer lagging behind our first
    //         retained entry) to the peer named in the tick.
    // Candidate: NOT POSSIBLE - discard
    // Follower: NOT POSSIBLE - discard
    LeaderTimer(replica::LeaderTimerTick),

    // Leader: NOT POSSIBLE - discard
    // Candidate: Transition to candidate. Trigger new election.
    // Follower: Transition to candidate. Trigger new election.
    FollowerTimeout,
}

#[derive(Debug)]
pub(crate) struct Callback<T>(oneshot::Sender<T>);

impl<T> Callback<T> {
    pub(crate) fn send(self, message: T) {
        let _ = self.0.send(message);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Replica actor has terminated")]
pub(crate) struct ActorTerminated;

/// ActorClient is the strong handle for the replica event loop. When the last strong handle
/// goes away, the event loop drains and exits. Timer tasks and in-flight RPC tasks hold the
/// weak flavor so they never keep a removed or shut-down replica alive.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);

        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn enqueue_for_replication(
        &self,
        input: replica::EnqueueForReplicationInput,
    ) -> Result<replica::EnqueueForReplicationOutput, replica::EnqueueForReplicationError> {
        let (tx, rx) = oneshot::channel();
        if self.send(Event::EnqueueForReplication(input, Callback(tx))).await.is_err() {
            return Err(replica::EnqueueForReplicationError::ActorExited);
        }

        match rx.await {
            Ok(result) => result,
            // Actor halted with our callback still parked.
            Err(_) => Err(replica::EnqueueForReplicationError::ActorExited),
        }
    }

    pub(crate) async fn read(
        &self,
        input: replica::ReadInput,
    ) -> Result<replica::ReadOutput, replica::EnqueueForReplicationError> {
        let (tx, rx) = oneshot::channel();
        if self.send(Event::Read(input, Callback(tx))).await.is_err() {
            return Err(replica::EnqueueForReplicationError::ActorExited);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(replica::EnqueueForReplicationError::ActorExited),
        }
    }

    pub(crate) async fn request_vote(
        &self,
        input: replica::RequestVoteInput,
    ) -> Result<replica::RequestVoteOutput, replica::RequestVoteError> {
        let (tx, rx) = oneshot::channel();
        if self.send(Event::RequestVote(input, Callback(tx))).await.is_err() {
            return Err(replica::RequestVoteError::ActorExited);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(replica::RequestVoteError::ActorExited),
        }
    }

    pub(crate) async fn append_entries(
        &self,
        input: replica::AppendEntriesInput,
    ) -> Result<replica::AppendEntriesOutput, replica::AppendEntriesError> {
        let (tx, rx) = oneshot::channel();
        if self.send(Event::AppendEntries(input, Callback(tx))).await.is_err() {
            return Err(replica::AppendEntriesError::ActorExited);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(replica::AppendEntriesError::ActorExited),
        }
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: replica::InstallSnapshotInput,
    ) -> Result<replica::InstallSnapshotOutput, replica::InstallSnapshotError> {
        let (tx, rx) = oneshot::channel();
        if self.send(Event::InstallSnapshot(input, Callback(tx))).await.is_err() {
            return Err(replica::InstallSnapshotError::ActorExited);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(replica::InstallSnapshotError::ActorExited),
        }
    }

    pub(crate) async fn take_snapshot(
        &self,
    ) -> Result<replica::TakeSnapshotOutput, replica::TakeSnapshotError> {
        let (tx, rx) = oneshot::channel();
        if self.send(Event::TakeSnapshot(Callback(tx))).await.is_err() {
            return Err(replica::TakeSnapshotError::ActorExited);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(replica::TakeSnapshotError::ActorExited),
        }
    }

    pub(crate) async fn status(&self) -> Result<replica::StatusReport, ActorTerminated> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Status(Callback(tx))).await?;

        rx.await.map_err(|_| ActorTerminated)
    }

    async fn send(&self, event: Event) -> Result<(), ActorTerminated> {
        self.sender.send(event).await.map_err(|_| ActorTerminated)
    }
}

impl WeakActorClient {
    pub(crate) async fn follower_timeout(&self) -> Result<(), ActorTerminated> {
        self.send(Event::FollowerTimeout).await
    }

    pub(crate) async fn leader_timer(&self, event: replica::LeaderTimerTick) -> Result<(), ActorTerminated> {
        self.send(Event::LeaderTimer(event)).await
    }

    pub(crate) async fn request_vote_reply_from_peer(
        &self,
        reply: replica::RequestVoteReplyFromPeer,
    ) -> Result<(), ActorTerminated> {
        self.send(Event::RequestVoteReplyFromPeer(reply)).await
    }

    pub(crate) async fn append_entries_reply_from_peer(
        &self,
        reply: replica::AppendEntriesReplyFromPeer,
    ) -> Result<(), ActorTerminated> {
        self.send(Event::AppendEntriesReplyFromPeer(reply)).await
    }

    pub(crate) async fn install_snapshot_reply_from_peer(
        &self,
        reply: replica::InstallSnapshotReplyFromPeer,
    ) -> Result<(), ActorTerminated> {
        self.send(Event::InstallSnapshotReplyFromPeer(reply)).await
    }

    async fn send(&self, event: Event) -> Result<(), ActorTerminated> {
        let sender = self.sender.upgrade().ok_or(ActorTerminated)?;

        sender.send(event).await.map_err(|_| ActorTerminated)
    }
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor<L, S>
where
    L: commitlog::Log<replica::WriteAheadLogEntry> + 'static,
    S: replica::PersistentLocalState + 'static,
{
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: replica::Replica<L, S>,
}

impl<L, S> ReplicaActor<L, S>
where
    L: commitlog::Log<replica::WriteAheadLogEntry> + 'static,
    S: replica::PersistentLocalState + 'static,
{
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: replica::Replica<L, S>) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);

            // A failed storage write leaves no safe way to answer future RPCs; acknowledging
            // anything that isn't durable can un-win elections and un-commit entries.
            if self.replica.is_halted() {
                slog::crit!(self.logger, "Replica hit a fatal storage failure. Halting event loop.");
                return;
            }
        }

        slog::info!(self.logger, "All replica handles dropped. Event loop exiting.");
    }

    // This must NOT be async. Any long running work must be spawned on another actor
    // and/or come as a callback to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::EnqueueForReplication(input, callback) => {
                self.replica.handle_enqueue_for_replication(input, callback);
            }
            Event::Read(input, callback) => {
                self.replica.handle_read(input, callback);
            }
            Event::RequestVote(input, callback) => {
                let result = self.replica.handle_request_vote(input);
                callback.send(result);
            }
            Event::RequestVoteReplyFromPeer(reply) => {
                self.replica.handle_request_vote_reply_from_peer(reply);
            }
            Event::AppendEntries(input, callback) => {
                let result = self.replica.handle_append_entries(input);
                callback.send(result);
            }
            Event::AppendEntriesReplyFromPeer(reply) => {
                self.replica.handle_append_entries_reply_from_peer(reply);
            }
            Event::InstallSnapshot(input, callback) => {
                let result = self.replica.handle_install_snapshot(input);
                callback.send(result);
            }
            Event::InstallSnapshotReplyFromPeer(reply) => {
                self.replica.handle_install_snapshot_reply_from_peer(reply);
            }
            Event::TakeSnapshot(callback) => {
                let result = self.replica.handle_take_snapshot();
                callback.send(result);
            }
            Event::Status(callback) => {
                callback.send(self.replica.handle_status());
            }
            Event::LeaderTimer(tick) => {
                self.replica.handle_leader_timer(tick);
            }
            Event::FollowerTimeout => {
                self.replica.handle_follower_timeout();
            }
        }
    }
}
