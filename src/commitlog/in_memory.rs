use crate::commitlog::{Entry, Index, Log};
use std::io;
use std::marker::PhantomData;

/// InMemoryLog models the log API without any durability. Simulated clusters and unit tests
/// use it; processes that must survive a restart use DiskLog.
pub struct InMemoryLog<E: Entry> {
    // We don't *need* to convert these to bytes. We could just hold the original entry in memory,
    // but we want to exercise the conversion logic.
    log: Vec<Vec<u8>>,
    // Number of entries discarded by compaction. first_index = discarded + 1.
    discarded: u64,
    _pd: PhantomData<E>,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create() -> Result<Self, io::Error> {
        Ok(InMemoryLog {
            log: vec![],
            discarded: 0,
            _pd: PhantomData::default(),
        })
    }

    fn vec_index(&self, index: Index) -> Option<usize> {
        // Log API states that Index starts from 1.
        index.as_u64().checked_sub(self.discarded + 1).map(|i| i as usize)
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        self.log.push(entry.into());

        Ok(self.next_index().minus(1))
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        let opt_entry = self
            .vec_index(index)
            .and_then(|i| self.log.get(i))
            .cloned()
            .map(E::from);

        Ok(opt_entry)
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        if let Some(vec_index) = self.vec_index(index) {
            self.log.truncate(vec_index);
        }

        Ok(())
    }

    fn discard_prefix(&mut self, up_to_inclusive: Index) -> Result<(), io::Error> {
        if up_to_inclusive.as_u64() <= self.discarded {
            // Already discarded.
            return Ok(());
        }

        // Discarding past the end empties the log and advances the index space, so a
        // snapshot that is ahead of the local log still leaves the log dense at
        // `last_included + 1`.
        let num_removed = ((up_to_inclusive.as_u64() - self.discarded) as usize).min(self.log.len());
        self.log.drain(..num_removed);
        self.discarded = up_to_inclusive.as_u64();

        Ok(())
    }

    fn first_index(&self) -> Index {
        Index::new(self.discarded + 1)
    }

    fn next_index(&self) -> Index {
        Index::new(self.discarded + self.log.len() as u64 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, Debug)]
    struct TestEntry(Vec<u8>);

    impl Entry for TestEntry {}

    impl From<Vec<u8>> for TestEntry {
        fn from(bytes: Vec<u8>) -> Self {
            TestEntry(bytes)
        }
    }

    impl From<TestEntry> for Vec<u8> {
        fn from(entry: TestEntry) -> Self {
            entry.0
        }
    }

    fn entry(byte: u8) -> TestEntry {
        TestEntry(vec![byte])
    }

    #[test]
    fn append_then_read() {
        let mut log = InMemoryLog::<TestEntry>::create().unwrap();

        assert_eq!(log.append(entry(10)).unwrap(), Index::new(1));
        assert_eq!(log.append(entry(11)).unwrap(), Index::new(2));

        assert_eq!(log.read(Index::new(1)).unwrap(), Some(entry(10)));
        assert_eq!(log.read(Index::new(2)).unwrap(), Some(entry(11)));
        assert_eq!(log.read(Index::new(3)).unwrap(), None);
        assert_eq!(log.next_index(), Index::new(3));
    }

    #[test]
    fn truncate_removes_suffix() {
        let mut log = InMemoryLog::<TestEntry>::create().unwrap();
        for b in 0..5 {
            log.append(entry(b)).unwrap();
        }

        log.truncate(Index::new(3)).unwrap();

        assert_eq!(log.read(Index::new(2)).unwrap(), Some(entry(1)));
        assert_eq!(log.read(Index::new(3)).unwrap(), None);
        assert_eq!(log.next_index(), Index::new(3));
    }

    #[test]
    fn discard_prefix_keeps_log_dense() {
        let mut log = InMemoryLog::<TestEntry>::create().unwrap();
        for b in 0..6 {
            log.append(entry(b)).unwrap();
        }

        log.discard_prefix(Index::new(4)).unwrap();

        assert_eq!(log.first_index(), Index::new(5));
        assert_eq!(log.next_index(), Index::new(7));
        assert_eq!(log.read(Index::new(4)).unwrap(), None);
        assert_eq!(log.read(Index::new(5)).unwrap(), Some(entry(4)));
        assert_eq!(log.read(Index::new(6)).unwrap(), Some(entry(5)));

        // Appends continue from the same index space.
        assert_eq!(log.append(entry(6)).unwrap(), Index::new(7));
    }

    #[test]
    fn discard_entire_log() {
        let mut log = InMemoryLog::<TestEntry>::create().unwrap();
        for b in 0..3 {
            log.append(entry(b)).unwrap();
        }

        log.discard_prefix(Index::new(3)).unwrap();

        assert_eq!(log.first_index(), Index::new(4));
        assert_eq!(log.next_index(), Index::new(4));
        assert_eq!(log.append(entry(9)).unwrap(), Index::new(4));
    }

    #[test]
    fn discard_past_end_advances_index_space() {
        let mut log = InMemoryLog::<TestEntry>::create().unwrap();
        for b in 0..3 {
            log.append(entry(b)).unwrap();
        }

        log.discard_prefix(Index::new(10)).unwrap();

        assert_eq!(log.first_index(), Index::new(11));
        assert_eq!(log.next_index(), Index::new(11));
        assert_eq!(log.append(entry(9)).unwrap(), Index::new(11));
    }

    #[test]
    fn discard_prefix_is_idempotent() {
        let mut log = InMemoryLog::<TestEntry>::create().unwrap();
        for b in 0..4 {
            log.append(entry(b)).unwrap();
        }

        log.discard_prefix(Index::new(2)).unwrap();
        log.discard_prefix(Index::new(2)).unwrap();
        log.discard_prefix(Index::new(1)).unwrap();

        assert_eq!(log.first_index(), Index::new(3));
        assert_eq!(log.read(Index::new(3)).unwrap(), Some(entry(2)));
    }
}
