use crate::commitlog;
use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::write_ahead_log::log_entry::WriteAheadLogEntry;
use std::io;

/// WriteAheadLog is the consensus-specific log facade.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written to disk, not yet replicated to majority
/// 2. Committed - written to disk, replicated to majority
/// 3. Applied - a committed entry that has also been applied to the state machine
///
/// A log entry's state has no global truth. Each replica will have their own local view of what
/// state the log entry is in.
///
/// Once a snapshot is taken, entries at and below the snapshot's last included index are gone
/// from the underlying log. The snapshot base `(term, index)` stands in for them wherever the
/// consistency check or latest-entry metadata would otherwise read a discarded entry.
pub(in crate::replica) struct WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    // Application's info/debug log.
    logger: slog::Logger,

    // This is the log that we're replicating.
    log: L,
    // Metadata about the highest log entry that we've locally written. Falls back to the snapshot
    // base when the log holds no entries. It must be updated atomically.
    latest_entry_metadata: Option<(Term, Index)>,

    // `(term, index)` of the last entry covered by the most recent snapshot. None until the first
    // snapshot is taken or installed.
    snapshot_base: Option<(Term, Index)>,

    // Index of highest log entry known to be committed. None if nothing is committed.
    commit_index: Option<Index>,
    // Index of highest log entry applied to state machine. None if nothing is applied.
    last_applied_index: Option<Index>,
}

impl<L> WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    /// Creates the facade over a (possibly non-empty) log recovered from disk together with the
    /// base of the most recently saved snapshot, if any.
    pub(in crate::replica) fn new(
        logger: slog::Logger,
        mut log: L,
        snapshot_base: Option<(Term, Index)>,
    ) -> Result<Self, io::Error> {
        if let Some((_, base_index)) = snapshot_base {
            if log.first_index() <= base_index {
                // A crash between saving the snapshot and compacting the log leaves entries the
                // snapshot already covers. Finish the compaction now.
                slog::info!(
                    logger,
                    "Discarding log prefix through {:?} covered by recovered snapshot",
                    base_index
                );
                log.discard_prefix(base_index)?;
            } else if log.first_index() > base_index.plus(1) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "Log starts at {:?} but snapshot only covers through {:?}",
                        log.first_index(),
                        base_index
                    ),
                ));
            }
        } else if log.first_index() != Index::start_index() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Log starts at {:?} but there is no snapshot", log.first_index()),
            ));
        }

        let base_index = snapshot_base.map(|(_, index)| index);
        let mut wal = WriteAheadLog {
            logger,
            log,
            latest_entry_metadata: None,
            snapshot_base,
            commit_index: base_index,
            last_applied_index: base_index,
        };
        wal.latest_entry_metadata = wal.recover_latest_entry_metadata()?;

        Ok(wal)
    }

    fn recover_latest_entry_metadata(&self) -> Result<Option<(Term, Index)>, io::Error> {
        if let Some(last_index) = self.log.next_index().checked_minus(1) {
            if last_index >= self.log.first_index() {
                let entry = self.read_required(last_index)?;
                return Ok(Some((entry.term, last_index)));
            }
        }

        Ok(self.snapshot_base)
    }

    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.latest_entry_metadata
    }

    pub(crate) fn snapshot_base(&self) -> Option<(Term, Index)> {
        self.snapshot_base
    }

    /// Index of the earliest entry still present in the log.
    pub(crate) fn first_index(&self) -> Index {
        self.log.first_index()
    }

    pub(crate) fn read(&self, index: Index) -> Result<Option<WriteAheadLogEntry>, io::Error> {
        self.log.read(index)
    }

    /// Term of the entry at `index`, answering from the snapshot base for the entry the log no
    /// longer holds. None if `index` is compacted away below the base or not yet written.
    pub(crate) fn term_at(&self, index: Index) -> Result<Option<Term>, io::Error> {
        if let Some(entry) = self.log.read(index)? {
            return Ok(Some(entry.term));
        }
        match self.snapshot_base {
            Some((base_term, base_index)) if base_index == index => Ok(Some(base_term)),
            _ => Ok(None),
        }
    }

    fn read_required(&self, index: Index) -> Result<WriteAheadLogEntry, io::Error> {
        match self.read(index) {
            Ok(Some(entry)) => Ok(entry),
            Ok(None) => panic!("read_required() found no log entry for index {:?}", index),
            Err(ioe) => Err(ioe),
        }
    }

    /// Remove anything starting at `index` and later.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        // Committed entries and entries under the snapshot base must never be truncated.
        if let Some(commit_index) = self.commit_index {
            assert!(
                index > commit_index,
                "Can't truncate committed entries. Requested {:?}, commit index {:?}",
                index,
                commit_index,
            );
        }

        let mut new_latest_entry_metadata = None;
        if let Some(new_latest_entry_index) = index.checked_minus(1) {
            new_latest_entry_metadata = self
                .term_at(new_latest_entry_index)?
                .map(|term| (term, new_latest_entry_index));
        }

        // Only update log after we've successfully read what new state will be.
        self.log.truncate(index)?;

        self.latest_entry_metadata = new_latest_entry_metadata;
        Ok(())
    }

    pub(crate) fn append(&mut self, entry: WriteAheadLogEntry) -> Result<Index, io::Error> {
        let appended_term = entry.term;
        let appended_index = self.log.append(entry)?;
        // Only update state after log action completes.
        self.latest_entry_metadata = Some((appended_term, appended_index));

        Ok(appended_index)
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    pub(crate) fn last_applied_index(&self) -> Option<Index> {
        self.last_applied_index
    }

    /// Leader path. Only advances the commit index if the entry at `tentative_new_commit_index`
    /// was written in the current term.
    ///
    /// > If there exists an N such that N > commitIndex, a majority
    /// > of matchIndex[i] >= N, and log[N].term == currentTerm:
    /// > set commitIndex = N
    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<(), io::Error> {
        // A membership change that removes well-replicated peers can shrink the majority-matched
        // index below a previously advanced commit index. Never move backwards.
        if matches!(self.commit_index, Some(ci) if tentative_new_commit_index <= ci) {
            return Ok(());
        }

        match self.term_at(tentative_new_commit_index)? {
            Some(term) if term == current_term => {
                self.ratchet_fwd_commit_index(tentative_new_commit_index);
            }
            _ => {}
        }

        Ok(())
    }

    /// Follower path. Advances the commit index to what the leader told us, ignoring stale
    /// (out of order) values.
    pub(crate) fn ratchet_fwd_commit_index_if_newer(&mut self, new_commit_index: Index) {
        if matches!(self.commit_index, Some(ci) if new_commit_index <= ci) {
            return;
        }

        self.ratchet_fwd_commit_index(new_commit_index);
    }

    fn ratchet_fwd_commit_index(&mut self, new_commit_index: Index) {
        // Assert we only mark as committed if we have the entry locally.
        let latest_locally_written_index = self
            .latest_entry_metadata
            .expect("Can't ratchet commit index forward if we don't have any local logs")
            .1;
        assert!(
            latest_locally_written_index >= new_commit_index,
            "Can't ratchet commit index forwards past our local log. Expected [latest log] {:?} >= {:?} [input]",
            latest_locally_written_index,
            new_commit_index,
        );

        self.commit_index.replace(new_commit_index);
    }

    /// Returns the next committed entry that has not been applied yet and marks it applied, or
    /// None once applied has caught up with committed. Callers drain this in a loop and feed each
    /// entry to the state machine.
    pub(crate) fn next_committed_unapplied(&mut self) -> Result<Option<(Index, WriteAheadLogEntry)>, io::Error> {
        let commit_index = match self.commit_index {
            Some(commit_index) => commit_index,
            None => return Ok(None),
        };

        let next_to_apply = match self.last_applied_index {
            Some(last_applied) if last_applied >= commit_index => return Ok(None),
            Some(last_applied) => last_applied.plus(1),
            None => Index::start_index(),
        };

        let entry = self.read_required(next_to_apply)?;
        self.last_applied_index.replace(next_to_apply);

        Ok(Some((next_to_apply, entry)))
    }

    /// Discards applied entries at and below `index` after a snapshot covering them was saved.
    /// Returns the new snapshot base, or None if there was nothing to compact.
    pub(crate) fn compact_through(&mut self, index: Index) -> Result<Option<(Term, Index)>, io::Error> {
        assert!(
            matches!(self.last_applied_index, Some(la) if la >= index),
            "Can't compact entries that have not been applied. Requested {:?}, applied {:?}",
            index,
            self.last_applied_index,
        );

        if matches!(self.snapshot_base, Some((_, base_index)) if base_index >= index) {
            return Ok(None);
        }

        let term = match self.term_at(index)? {
            Some(term) => term,
            None => return Ok(None),
        };

        self.log.discard_prefix(index)?;
        self.snapshot_base = Some((term, index));
        self.latest_entry_metadata = self.recover_latest_entry_metadata()?;

        Ok(Some((term, index)))
    }

    /// Rebases the log onto an installed snapshot. If our log has an entry matching the
    /// snapshot's last included `(term, index)`, entries after it are retained; otherwise the
    /// entire log is replaced by the snapshot.
    pub(crate) fn reset_to_snapshot(&mut self, term: Term, index: Index) -> Result<(), io::Error> {
        match self.term_at(index)? {
            Some(existing_term) if existing_term == term => {
                self.log.discard_prefix(index)?;
            }
            _ => {
                let first_index = self.log.first_index();
                self.log.truncate(first_index)?;
                self.log.discard_prefix(index)?;
            }
        }

        self.snapshot_base = Some((term, index));
        self.latest_entry_metadata = self.recover_latest_entry_metadata()?;

        // The snapshot only contains committed, applied data.
        if self.commit_index.map_or(true, |ci| ci < index) {
            self.commit_index = Some(index);
        }
        if self.last_applied_index.map_or(true, |la| la < index) {
            self.last_applied_index = Some(index);
        }

        slog::info!(
            self.logger,
            "Log rebased onto snapshot through {:?} (term {:?}). First retained index: {:?}",
            index,
            term,
            self.log.first_index(),
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::InMemoryLog;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn entry(term: u64, data: &str) -> WriteAheadLogEntry {
        WriteAheadLogEntry {
            term: Term::new(term),
            data: data.as_bytes().to_vec(),
        }
    }

    fn new_wal() -> WriteAheadLog<InMemoryLog<WriteAheadLogEntry>> {
        WriteAheadLog::new(logger(), InMemoryLog::create().unwrap(), None).unwrap()
    }

    #[test]
    fn append_tracks_latest_entry() {
        let mut wal = new_wal();
        assert_eq!(wal.latest_entry(), None);

        wal.append(entry(1, "a")).unwrap();
        let index2 = wal.append(entry(2, "b")).unwrap();

        assert_eq!(wal.latest_entry(), Some((Term::new(2), index2)));
    }

    #[test]
    fn truncate_rolls_back_latest_entry() {
        let mut wal = new_wal();
        let index1 = wal.append(entry(1, "a")).unwrap();
        wal.append(entry(2, "b")).unwrap();

        wal.truncate(index1.plus(1)).unwrap();
        assert_eq!(wal.latest_entry(), Some((Term::new(1), index1)));

        wal.truncate(index1).unwrap();
        assert_eq!(wal.latest_entry(), None);
    }

    #[test]
    fn commit_and_drain_applies_in_order() {
        let mut wal = new_wal();
        wal.append(entry(1, "a")).unwrap();
        let index2 = wal.append(entry(1, "b")).unwrap();

        assert_eq!(wal.next_committed_unapplied().unwrap(), None);

        wal.ratchet_fwd_commit_index_if_newer(index2);

        let (applied1, entry1) = wal.next_committed_unapplied().unwrap().unwrap();
        assert_eq!(applied1, Index::new(1));
        assert_eq!(entry1.data, b"a".to_vec());

        let (applied2, entry2) = wal.next_committed_unapplied().unwrap().unwrap();
        assert_eq!(applied2, index2);
        assert_eq!(entry2.data, b"b".to_vec());

        assert_eq!(wal.next_committed_unapplied().unwrap(), None);
        assert_eq!(wal.last_applied_index(), Some(index2));
    }

    #[test]
    fn leader_commit_requires_current_term_entry() {
        let mut wal = new_wal();
        let index1 = wal.append(entry(1, "a")).unwrap();

        // Entry from an older term can't advance commit index by counting replicas.
        wal.ratchet_fwd_commit_index_if_valid(index1, Term::new(2)).unwrap();
        assert_eq!(wal.commit_index(), None);

        // Once a current-term entry covers it, commit advances over both.
        let index2 = wal.append(entry(2, "b")).unwrap();
        wal.ratchet_fwd_commit_index_if_valid(index2, Term::new(2)).unwrap();
        assert_eq!(wal.commit_index(), Some(index2));
    }

    #[test]
    fn stale_commit_values_are_ignored() {
        let mut wal = new_wal();
        wal.append(entry(1, "a")).unwrap();
        let index2 = wal.append(entry(1, "b")).unwrap();

        wal.ratchet_fwd_commit_index_if_newer(index2);
        // Delayed message carrying an older commit index.
        wal.ratchet_fwd_commit_index_if_newer(Index::new(1));

        assert_eq!(wal.commit_index(), Some(index2));
    }

    #[test]
    fn compaction_moves_base_and_preserves_latest() {
        let mut wal = new_wal();
        wal.append(entry(1, "a")).unwrap();
        let index2 = wal.append(entry(1, "b")).unwrap();
        let index3 = wal.append(entry(2, "c")).unwrap();
        wal.ratchet_fwd_commit_index_if_newer(index2);
        while wal.next_committed_unapplied().unwrap().is_some() {}

        let base = wal.compact_through(index2).unwrap();
        assert_eq!(base, Some((Term::new(1), index2)));
        assert_eq!(wal.snapshot_base(), Some((Term::new(1), index2)));
        assert_eq!(wal.first_index(), index3);
        assert_eq!(wal.latest_entry(), Some((Term::new(2), index3)));

        // The discarded entry's term is still answerable for the consistency check.
        assert_eq!(wal.term_at(index2).unwrap(), Some(Term::new(1)));
        assert_eq!(wal.term_at(Index::new(1)).unwrap(), None);
    }

    #[test]
    fn compaction_of_whole_log_falls_back_to_base_metadata() {
        let mut wal = new_wal();
        wal.append(entry(1, "a")).unwrap();
        let index2 = wal.append(entry(3, "b")).unwrap();
        wal.ratchet_fwd_commit_index_if_newer(index2);
        while wal.next_committed_unapplied().unwrap().is_some() {}

        wal.compact_through(index2).unwrap();

        assert_eq!(wal.latest_entry(), Some((Term::new(3), index2)));
        assert_eq!(wal.read(index2).unwrap(), None);
    }

    #[test]
    fn snapshot_install_discards_conflicting_log() {
        let mut wal = new_wal();
        wal.append(entry(1, "a")).unwrap();
        wal.append(entry(1, "stale")).unwrap();

        wal.reset_to_snapshot(Term::new(2), Index::new(5)).unwrap();

        assert_eq!(wal.latest_entry(), Some((Term::new(2), Index::new(5))));
        assert_eq!(wal.commit_index(), Some(Index::new(5)));
        assert_eq!(wal.last_applied_index(), Some(Index::new(5)));
        assert_eq!(wal.read(Index::new(1)).unwrap(), None);
        assert_eq!(wal.first_index(), Index::new(6));
    }

    #[test]
    fn snapshot_install_retains_matching_suffix() {
        let mut wal = new_wal();
        wal.append(entry(1, "a")).unwrap();
        wal.append(entry(2, "b")).unwrap();
        let index3 = wal.append(entry(2, "c")).unwrap();

        wal.reset_to_snapshot(Term::new(2), Index::new(2)).unwrap();

        assert_eq!(wal.latest_entry(), Some((Term::new(2), index3)));
        assert_eq!(wal.read(index3).unwrap(), Some(entry(2, "c")));
        assert_eq!(wal.commit_index(), Some(Index::new(2)));
    }

    #[test]
    fn recovers_from_non_empty_log() {
        let mut log = InMemoryLog::create().unwrap();
        commitlog::Log::append(&mut log, entry(1, "a")).unwrap();
        commitlog::Log::append(&mut log, entry(4, "b")).unwrap();

        let wal = WriteAheadLog::new(logger(), log, None).unwrap();

        assert_eq!(wal.latest_entry(), Some((Term::new(4), Index::new(2))));
        assert_eq!(wal.commit_index(), None);
    }

    #[test]
    fn recovers_interrupted_compaction() {
        let mut log = InMemoryLog::create().unwrap();
        commitlog::Log::append(&mut log, entry(1, "covered")).unwrap();
        commitlog::Log::append(&mut log, entry(1, "covered")).unwrap();
        commitlog::Log::append(&mut log, entry(2, "live")).unwrap();

        // Snapshot was saved through index 2 but the crash happened before the log was compacted.
        let wal = WriteAheadLog::new(logger(), log, Some((Term::new(1), Index::new(2)))).unwrap();

        assert_eq!(wal.first_index(), Index::new(3));
        assert_eq!(wal.latest_entry(), Some((Term::new(2), Index::new(3))));
        assert_eq!(wal.commit_index(), Some(Index::new(2)));
        assert_eq!(wal.last_applied_index(), Some(Index::new(2)));
    }
}
