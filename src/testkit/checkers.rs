use crate::replica::{ElectionStateSnapshot, StatusReport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

/// Accumulates replica status samples over a test run and checks safety properties across
/// them:
///
/// - at most one leader per term
/// - a replica's current term never goes backwards
/// - a replica's commit index never goes backwards, including across snapshot installs
/// - a replica never applies past its commit index
///
/// Feed it every sample the test takes, then call `assert_clean` at the end.
pub struct InvariantChecker {
    leader_by_term: HashMap<u64, String>,
    term_watermarks: HashMap<String, u64>,
    commit_watermarks: HashMap<String, u64>,
    violations: Vec<String>,
}

impl InvariantChecker {
    pub fn new() -> Self {
        InvariantChecker {
            leader_by_term: HashMap::new(),
            term_watermarks: HashMap::new(),
            commit_watermarks: HashMap::new(),
            violations: Vec::new(),
        }
    }

    pub fn observe(&mut self, report: &StatusReport) {
        let replica = report.my_replica_id.as_str().to_string();
        let term = report.current_term.as_u64();
        let commit = report.commit_index.map(|index| index.as_u64()).unwrap_or(0);
        let applied = report.last_applied_index.map(|index| index.as_u64()).unwrap_or(0);

        if report.election_state == ElectionStateSnapshot::Leader {
            match self.leader_by_term.get(&term) {
                Some(existing) if existing != &replica => {
                    self.violations.push(format!(
                        "Two leaders observed in term {}: '{}' and '{}'",
                        term, existing, replica
                    ));
                }
                Some(_) => {}
                None => {
                    self.leader_by_term.insert(term, replica.clone());
                }
            }
        }

        let term_watermark = self.term_watermarks.entry(replica.clone()).or_insert(0);
        if term < *term_watermark {
            self.violations.push(format!(
                "Term went backwards on '{}': {} observed after {}",
                replica, term, term_watermark
            ));
        } else {
            *term_watermark = term;
        }

        let commit_watermark = self.commit_watermarks.entry(replica.clone()).or_insert(0);
        if commit < *commit_watermark {
            self.violations.push(format!(
                "Commit index went backwards on '{}': {} observed after {}",
                replica, commit, commit_watermark
            ));
        } else {
            *commit_watermark = commit;
        }

        if applied > commit {
            self.violations.push(format!(
                "'{}' applied through index {} past its commit index {}",
                replica, applied, commit
            ));
        }
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    pub fn assert_clean(&self) {
        assert!(
            self.violations.is_empty(),
            "Safety violations observed:\n{}",
            self.violations.join("\n")
        );
    }
}

impl Default for InvariantChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub enum HistoryAction {
    Set { key: String, value: String },
    Delete { key: String },
    Read { key: String },
}

/// Records the real-time interval of every client operation a test issues, plus the value
/// each read returned, then checks the reads for linearizability: a read must be explainable
/// by some write that started before the read finished, with no other completed write falling
/// entirely between the two.
///
/// Writes that fail with an ambiguous outcome (timeout, lost leadership) keep an open-ended
/// interval; they may have taken effect and may legitimately surface in a later read. Writes
/// rejected before entering the log are discarded.
///
/// The check is sound but not complete: every violation it reports is real, but some
/// interleavings can escape it.
#[derive(Clone)]
pub struct HistoryChecker {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    epoch: Instant,
    // Strictly increasing, so that events recorded one after another are ordered even when
    // the clock hasn't visibly advanced between them.
    clock: Duration,
    next_token: u64,
    in_flight: HashMap<u64, (Duration, HistoryAction)>,
    reads: Vec<ReadRecord>,
    writes: Vec<WriteRecord>,
}

struct ReadRecord {
    key: String,
    observed: Option<String>,
    start: Duration,
    end: Duration,
}

struct WriteRecord {
    key: String,
    // None is a delete; reads observing an absent key match it.
    value: Option<String>,
    start: Duration,
    // None while the outcome is ambiguous.
    end: Option<Duration>,
}

impl HistoryChecker {
    pub fn new() -> Self {
        HistoryChecker {
            inner: Arc::new(Mutex::new(Inner {
                epoch: Instant::now(),
                clock: Duration::from_nanos(0),
                next_token: 0,
                in_flight: HashMap::new(),
                reads: Vec::new(),
                writes: Vec::new(),
            })),
        }
    }

    /// Call immediately before issuing the client operation. The token ties the completion
    /// back to this invocation.
    pub fn invoke(&self, action: HistoryAction) -> u64 {
        let mut inner = self.lock();
        let token = inner.next_token;
        inner.next_token += 1;
        let start = inner.tick();
        inner.in_flight.insert(token, (start, action));
        token
    }

    pub fn write_succeeded(&self, token: u64) {
        let mut inner = self.lock();
        let end = inner.tick();
        let (start, action) = inner.take(token);
        let (key, value) = match action {
            HistoryAction::Set { key, value } => (key, Some(value)),
            HistoryAction::Delete { key } => (key, None),
            HistoryAction::Read { .. } => panic!("write_succeeded() called for a read token"),
        };
        inner.writes.push(WriteRecord {
            key,
            value,
            start,
            end: Some(end),
        });
    }

    pub fn read_returned(&self, token: u64, observed: Option<String>) {
        let mut inner = self.lock();
        let end = inner.tick();
        let (start, action) = inner.take(token);
        let key = match action {
            HistoryAction::Read { key } => key,
            other => panic!("read_returned() called for a write token: {:?}", other),
        };
        inner.reads.push(ReadRecord {
            key,
            observed,
            start,
            end,
        });
    }

    /// The operation failed with an ambiguous outcome. A failed write stays in the history
    /// with no completion time; a failed read is dropped.
    pub fn failed(&self, token: u64) {
        let mut inner = self.lock();
        let (start, action) = inner.take(token);
        let (key, value) = match action {
            HistoryAction::Set { key, value } => (key, Some(value)),
            HistoryAction::Delete { key } => (key, None),
            HistoryAction::Read { .. } => return,
        };
        inner.writes.push(WriteRecord {
            key,
            value,
            start,
            end: None,
        });
    }

    /// The operation was rejected without entering the log (redirect, validation failure).
    pub fn rejected(&self, token: u64) {
        let mut inner = self.lock();
        let _ = inner.take(token);
    }

    pub fn check(&self) -> Result<(), Vec<String>> {
        let inner = self.lock();
        let mut violations = Vec::new();

        for read in &inner.reads {
            if !Self::read_is_explainable(read, &inner.writes) {
                violations.push(format!(
                    "Read of '{}' over [{:?}..{:?}] returned {:?}, which no write order explains",
                    read.key, read.start, read.end, read.observed
                ));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    pub fn assert_linearizable(&self) {
        if let Err(violations) = self.check() {
            panic!("History violations:\n{}", violations.join("\n"));
        }
    }

    fn read_is_explainable(read: &ReadRecord, writes: &[WriteRecord]) -> bool {
        // The initial absent state explains a None read unless some write to the key
        // completed strictly before the read began.
        if read.observed.is_none() {
            let initial_overwritten = writes
                .iter()
                .any(|w| w.key == read.key && matches!(w.end, Some(end) if end <= read.start));
            if !initial_overwritten {
                return true;
            }
        }

        writes.iter().enumerate().any(|(index, candidate)| {
            candidate.key == read.key
                && candidate.value == read.observed
                && candidate.start <= read.end
                && !Self::definitely_intervenes_between(index, candidate, read, writes)
        })
    }

    /// True if some other write to the key provably sits between the candidate write and the
    /// read in real time, which would make the candidate's value stale by the read.
    fn definitely_intervenes_between(
        candidate_index: usize,
        candidate: &WriteRecord,
        read: &ReadRecord,
        writes: &[WriteRecord],
    ) -> bool {
        let candidate_end = match candidate.end {
            Some(end) => end,
            // An ambiguous write has no point it provably completed by, so nothing can
            // provably follow it.
            None => return false,
        };

        writes.iter().enumerate().any(|(index, other)| {
            index != candidate_index
                && other.key == read.key
                && other.start >= candidate_end
                && matches!(other.end, Some(end) if end <= read.start)
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("HistoryChecker mutex guard poison")
    }
}

impl Default for HistoryChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn tick(&mut self) -> Duration {
        let now = std::cmp::max(self.epoch.elapsed(), self.clock + Duration::from_nanos(1));
        self.clock = now;
        now
    }

    fn take(&mut self, token: u64) -> (Duration, HistoryAction) {
        self.in_flight
            .remove(&token)
            .unwrap_or_else(|| panic!("Unknown or already-completed history token: {}", token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::Index;
    use crate::replica::{ReplicaId, Term};

    fn report(replica: &str, term: u64, commit: Option<u64>, applied: Option<u64>, leader: bool) -> StatusReport {
        StatusReport {
            my_replica_id: ReplicaId::new(replica.to_string()),
            current_term: Term::new(term),
            commit_index: commit.map(Index::new),
            last_applied_index: applied.map(Index::new),
            first_log_index: Index::start_index(),
            election_state: if leader {
                ElectionStateSnapshot::Leader
            } else {
                ElectionStateSnapshot::FollowerNoLeader
            },
            cluster_members: vec![],
        }
    }

    #[test]
    fn invariant_checker_accepts_clean_run() {
        let mut checker = InvariantChecker::new();
        checker.observe(&report("r1", 1, None, None, false));
        checker.observe(&report("r1", 2, Some(1), Some(1), true));
        checker.observe(&report("r2", 2, Some(1), Some(1), false));
        checker.observe(&report("r1", 2, Some(5), Some(4), true));

        assert!(checker.violations().is_empty());
        checker.assert_clean();
    }

    #[test]
    fn invariant_checker_flags_two_leaders_in_one_term() {
        let mut checker = InvariantChecker::new();
        checker.observe(&report("r1", 3, None, None, true));
        checker.observe(&report("r2", 3, None, None, true));

        assert_eq!(1, checker.violations().len());
    }

    #[test]
    fn invariant_checker_allows_new_leader_in_new_term() {
        let mut checker = InvariantChecker::new();
        checker.observe(&report("r1", 3, None, None, true));
        checker.observe(&report("r2", 4, None, None, true));

        assert!(checker.violations().is_empty());
    }

    #[test]
    fn invariant_checker_flags_commit_regression() {
        let mut checker = InvariantChecker::new();
        checker.observe(&report("r1", 2, Some(7), Some(7), false));
        checker.observe(&report("r1", 3, Some(4), Some(4), false));

        assert_eq!(1, checker.violations().len());
    }

    #[test]
    fn invariant_checker_flags_applying_past_commit() {
        let mut checker = InvariantChecker::new();
        checker.observe(&report("r1", 2, Some(3), Some(5), false));

        assert_eq!(1, checker.violations().len());
    }

    #[test]
    fn history_checker_accepts_sequential_run() {
        let history = HistoryChecker::new();

        let t = history.invoke(HistoryAction::Set {
            key: "k".to_string(),
            value: "v1".to_string(),
        });
        history.write_succeeded(t);

        let t = history.invoke(HistoryAction::Read { key: "k".to_string() });
        history.read_returned(t, Some("v1".to_string()));

        let t = history.invoke(HistoryAction::Delete { key: "k".to_string() });
        history.write_succeeded(t);

        let t = history.invoke(HistoryAction::Read { key: "k".to_string() });
        history.read_returned(t, None);

        history.assert_linearizable();
    }

    #[test]
    fn history_checker_flags_stale_read() {
        let history = HistoryChecker::new();

        let t = history.invoke(HistoryAction::Set {
            key: "k".to_string(),
            value: "old".to_string(),
        });
        history.write_succeeded(t);

        let t = history.invoke(HistoryAction::Set {
            key: "k".to_string(),
            value: "new".to_string(),
        });
        history.write_succeeded(t);

        // Sequenced strictly after both writes, so "old" is stale.
        let t = history.invoke(HistoryAction::Read { key: "k".to_string() });
        history.read_returned(t, Some("old".to_string()));

        assert!(history.check().is_err());
    }

    #[test]
    fn history_checker_flags_value_never_written() {
        let history = HistoryChecker::new();

        let t = history.invoke(HistoryAction::Read { key: "k".to_string() });
        history.read_returned(t, Some("ghost".to_string()));

        assert!(history.check().is_err());
    }

    #[test]
    fn history_checker_accepts_ambiguous_write_surfacing_later() {
        let history = HistoryChecker::new();

        // Timed out, outcome unknown.
        let t = history.invoke(HistoryAction::Set {
            key: "k".to_string(),
            value: "maybe".to_string(),
        });
        history.failed(t);

        // It committed after all.
        let t = history.invoke(HistoryAction::Read { key: "k".to_string() });
        history.read_returned(t, Some("maybe".to_string()));

        history.assert_linearizable();
    }

    #[test]
    fn history_checker_accepts_fresh_read_of_absent_key() {
        let history = HistoryChecker::new();

        let t = history.invoke(HistoryAction::Read { key: "k".to_string() });
        history.read_returned(t, None);

        history.assert_linearizable();
    }

    #[test]
    fn history_checker_discards_rejected_writes() {
        let history = HistoryChecker::new();

        // Redirected by a non-leader, never entered the log.
        let t = history.invoke(HistoryAction::Set {
            key: "k".to_string(),
            value: "v".to_string(),
        });
        history.rejected(t);

        let t = history.invoke(HistoryAction::Read { key: "k".to_string() });
        history.read_returned(t, None);

        history.assert_linearizable();
    }
}
