use crate::replica::ReplicaId;
use tokio::sync::watch;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ElectionStateSnapshot {
    Leader,
    Candidate,
    Follower(ReplicaId),
    FollowerNoLeader,
}

pub(super) fn new(initial_state: ElectionStateSnapshot) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (snd, rcv) = watch::channel(initial_state);

    (ElectionStateChangeNotifier { snd }, ElectionStateChangeListener { rcv })
}

pub(super) struct ElectionStateChangeNotifier {
    snd: watch::Sender<ElectionStateSnapshot>,
}

impl ElectionStateChangeNotifier {
    pub(super) fn notify_new_state(&self, new_state: ElectionStateSnapshot) {
        let _ = self.snd.send(new_state);
    }
}

/// Push-based view of one replica's election state, fed from a watch channel. Intermediate
/// states are skipped if the listener polls slower than states change; only the latest state
/// is retained.
#[derive(Clone)]
pub struct ElectionStateChangeListener {
    rcv: watch::Receiver<ElectionStateSnapshot>,
}

impl ElectionStateChangeListener {
    /// Awaits the next state change. None once the replica is gone.
    pub async fn next(&mut self) -> Option<ElectionStateSnapshot> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }
}
