use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::replica::election::state_change_listener::ElectionStateChangeNotifier;
use crate::replica::election::timers::{FollowerTimerHandle, Jitter, LeaderTimerHandle};
use crate::replica::election::{state_change_listener, LeaderStateTracker, PeerState};
use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot, ReplicaId, Term};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_replica_id: ReplicaId,
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub jitter: Jitter,
}

/// ElectionState is responsible for holding state specific to the stage in an election. Its
/// methods are responsible for "what" to do. It is NOT responsible for validating anything
/// specific to logs, terms, peers, etc. or knowing "when" to do something.
pub(crate) struct ElectionState {
    state: State,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    state_change_notifier: ElectionStateChangeNotifier,
}

impl ElectionState {
    /// `new_follower()` creates a new ElectionState instance that starts out as a follower.
    pub(crate) fn new_follower(
        config: ElectionConfig,
        actor_client: WeakActorClient,
    ) -> (Self, ElectionStateChangeListener) {
        let initial_state = State::Follower(FollowerState::new(
            config.follower_min_timeout,
            config.follower_max_timeout,
            config.jitter.clone(),
            actor_client.clone(),
        ));
        let (notifier, listener) = state_change_listener::new(Self::current_state_impl(&initial_state));

        let election_state = Self {
            state: initial_state,
            config,
            actor_client,
            state_change_notifier: notifier,
        };

        (election_state, listener)
    }

    pub(crate) fn transition_to_follower(&mut self, new_leader: Option<ReplicaId>) {
        self.state = State::Follower(FollowerState::with_leader_info(
            new_leader,
            self.config.follower_min_timeout,
            self.config.follower_max_timeout,
            self.config.jitter.clone(),
            self.actor_client.clone(),
        ));
        self.notify_new_state();
    }

    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self) {
        let mut cs = CandidateState::new(
            self.config.follower_min_timeout,
            self.config.follower_max_timeout,
            self.config.jitter.clone(),
            self.actor_client.clone(),
        );

        // Vote for self
        cs.add_received_vote(self.config.my_replica_id.clone());

        self.state = State::Candidate(cs);
        self.notify_new_state();
    }

    pub(crate) fn transition_to_leader(
        &mut self,
        term: Term,
        peer_ids: HashSet<ReplicaId>,
        previous_log_entry_index: Option<Index>,
    ) {
        self.state = State::Leader(LeaderState::new(
            term,
            peer_ids,
            previous_log_entry_index,
            self.config.leader_heartbeat_duration,
            self.actor_client.clone(),
        ));
        self.notify_new_state();
    }

    pub(crate) fn current_state(&self) -> ElectionStateSnapshot {
        Self::current_state_impl(&self.state)
    }

    fn current_state_impl(state: &State) -> ElectionStateSnapshot {
        match state {
            State::Leader(_) => ElectionStateSnapshot::Leader,
            State::Candidate(_) => ElectionStateSnapshot::Candidate,
            State::Follower(FollowerState { leader: None, .. }) => ElectionStateSnapshot::FollowerNoLeader,
            State::Follower(FollowerState {
                leader: Some(leader_id),
                ..
            }) => ElectionStateSnapshot::Follower(leader_id.clone()),
        }
    }

    fn notify_new_state(&self) {
        self.state_change_notifier
            .notify_new_state(Self::current_state_impl(&self.state));
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.reset_timeout();
        }
    }

    pub(crate) fn set_leader_if_unknown(&mut self, leader: &ReplicaId) {
        if let State::Follower(fs) = &mut self.state {
            if fs.leader.is_none() {
                fs.leader.replace(leader.clone());
                self.notify_new_state();
            }
        }
    }

    /// Return number of votes received if candidate, or None if no longer Candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: ReplicaId) -> Option<usize> {
        if let State::Candidate(cs) = &mut self.state {
            Some(cs.add_received_vote(vote_from))
        } else {
            None
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(ls) = &mut self.state {
            Some(&mut ls.tracker)
        } else {
            None
        }
    }

    /// Starts heartbeating and tracking replication state for a peer that was added to the
    /// cluster while we are leader. No-op if not leader or already tracking.
    pub(crate) fn start_tracking_peer(&mut self, peer_id: ReplicaId, previous_log_entry_index: Option<Index>) {
        let heartbeat_duration = self.config.leader_heartbeat_duration;
        let actor_client = self.actor_client.clone();
        if let State::Leader(ls) = &mut self.state {
            if ls.tracker.is_tracked(&peer_id) {
                return;
            }
            let leader_timer_handle =
                LeaderTimerHandle::spawn_timer_task(heartbeat_duration, actor_client, peer_id.clone(), ls.term);
            ls.tracker
                .add_peer(peer_id, PeerState::new(leader_timer_handle, previous_log_entry_index));
        }
    }

    /// Stops heartbeating a peer that was removed from the cluster. No-op if not leader.
    pub(crate) fn stop_tracking_peer(&mut self, peer_id: &ReplicaId) {
        if let State::Leader(ls) = &mut self.state {
            ls.tracker.remove_peer(peer_id);
        }
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader"),
            State::Candidate(_) => write!(f, "Candidate"),
            State::Follower(FollowerState {
                leader: Some(leader_id),
                ..
            }) => write!(f, "Follower(Leader={:?})", leader_id),
            State::Follower(FollowerState { leader: None, .. }) => write!(f, "Follower(Leader=None)"),
        }
    }
}

enum State {
    Leader(LeaderState),
    Candidate(CandidateState),
    Follower(FollowerState),
}

struct LeaderState {
    term: Term,
    tracker: LeaderStateTracker,
}

struct CandidateState {
    received_votes_from: HashSet<ReplicaId>,
    _follower_timeout_tracker: FollowerTimerHandle,
}

struct FollowerState {
    leader: Option<ReplicaId>,
    follower_timeout_tracker: FollowerTimerHandle,
}

impl LeaderState {
    fn new(
        term: Term,
        peer_ids: HashSet<ReplicaId>,
        previous_log_entry_index: Option<Index>,
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
    ) -> Self {
        let mut peer_state = HashMap::with_capacity(peer_ids.len());
        for peer_id in peer_ids {
            let leader_timer_handle =
                LeaderTimerHandle::spawn_timer_task(heartbeat_duration, actor_client.clone(), peer_id.clone(), term);
            peer_state.insert(peer_id, PeerState::new(leader_timer_handle, previous_log_entry_index));
        }

        Self {
            term,
            tracker: LeaderStateTracker::new(peer_state),
        }
    }
}

impl CandidateState {
    fn new(min_timeout: Duration, max_timeout: Duration, jitter: Jitter, actor_client: WeakActorClient) -> Self {
        Self {
            received_votes_from: HashSet::with_capacity(3),
            _follower_timeout_tracker: FollowerTimerHandle::spawn_timer_task(
                min_timeout,
                max_timeout,
                jitter,
                actor_client,
            ),
        }
    }

    /// `add_received_vote()` returns the number of unique votes we've received after adding the
    /// provided `vote_from`
    fn add_received_vote(&mut self, vote_from: ReplicaId) -> usize {
        self.received_votes_from.insert(vote_from);
        self.received_votes_from.len()
    }
}

impl FollowerState {
    fn new(min_timeout: Duration, max_timeout: Duration, jitter: Jitter, actor_client: WeakActorClient) -> Self {
        Self::with_leader_info(None, min_timeout, max_timeout, jitter, actor_client)
    }

    fn with_leader_info(
        leader: Option<ReplicaId>,
        min_timeout: Duration,
        max_timeout: Duration,
        jitter: Jitter,
        actor_client: WeakActorClient,
    ) -> Self {
        Self {
            leader,
            follower_timeout_tracker: FollowerTimerHandle::spawn_timer_task(min_timeout, max_timeout, jitter, actor_client),
        }
    }

    fn reset_timeout(&self) {
        self.follower_timeout_tracker.reset_timeout();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;

    fn config() -> ElectionConfig {
        ElectionConfig {
            my_replica_id: ReplicaId::new("replica-1"),
            leader_heartbeat_duration: Duration::from_secs(60),
            follower_min_timeout: Duration::from_secs(60),
            follower_max_timeout: Duration::from_secs(60),
            jitter: Jitter::seeded(0),
        }
    }

    #[tokio::test]
    async fn initial_state_is_follower_without_leader() {
        let (actor_client, _rx) = ActorClient::new(10);

        let (election_state, _listener) = ElectionState::new_follower(config(), actor_client.weak());

        assert!(matches!(
            election_state.current_state(),
            ElectionStateSnapshot::FollowerNoLeader
        ));
    }

    #[tokio::test]
    async fn candidate_votes_are_deduped() {
        let (actor_client, _rx) = ActorClient::new(10);
        let (mut election_state, _listener) = ElectionState::new_follower(config(), actor_client.weak());

        election_state.transition_to_candidate_and_vote_for_self();

        assert_eq!(election_state.add_vote_if_candidate(ReplicaId::new("replica-2")), Some(2));
        assert_eq!(election_state.add_vote_if_candidate(ReplicaId::new("replica-2")), Some(2));
        // Self vote was counted at transition.
        assert_eq!(election_state.add_vote_if_candidate(ReplicaId::new("replica-1")), Some(2));
        assert_eq!(election_state.add_vote_if_candidate(ReplicaId::new("replica-3")), Some(3));
    }

    #[tokio::test]
    async fn leader_tracks_peers_through_membership_change() {
        let (actor_client, _rx) = ActorClient::new(10);
        let (mut election_state, _listener) = ElectionState::new_follower(config(), actor_client.weak());

        let mut peer_ids = HashSet::new();
        peer_ids.insert(ReplicaId::new("replica-2"));
        election_state.transition_to_leader(Term::new(2), peer_ids, Some(Index::new(3)));

        let tracker = election_state.leader_state_mut().unwrap();
        assert!(tracker.is_tracked(&ReplicaId::new("replica-2")));
        assert!(!tracker.is_tracked(&ReplicaId::new("replica-3")));

        election_state.start_tracking_peer(ReplicaId::new("replica-3"), Some(Index::new(3)));
        assert!(election_state.leader_state_mut().unwrap().is_tracked(&ReplicaId::new("replica-3")));

        election_state.stop_tracking_peer(&ReplicaId::new("replica-2"));
        assert!(!election_state.leader_state_mut().unwrap().is_tracked(&ReplicaId::new("replica-2")));
    }
}
