use std::{fmt, io};

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
struct U64NonZero(u64);

impl U64NonZero {
    fn new(val: u64) -> Self {
        assert_ne!(val, 0);
        U64NonZero(val)
    }
}

/// Index is an index of an entry in the log; i.e. a log entry's index.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(U64NonZero);

impl Index {
    pub fn new(index: u64) -> Self {
        Index(U64NonZero::new(index))
    }

    pub fn new_usize(index: usize) -> Self {
        Self::new(index as u64)
    }

    pub fn start_index() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0 .0
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index::new(self.as_u64() + delta)
    }

    pub fn minus(&self, delta: u64) -> Index {
        Index::new(self.as_u64() - delta)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        let new_value = self.as_u64() - delta;
        if new_value > 0 {
            Some(Index::new(new_value))
        } else {
            None
        }
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 .0)
    }
}

/// Log is an append only log intended for use as a replicated commit log in a database.
///
/// Log indexes entries starting from 1. There will be no entry existing at index 0. The first
/// entry is written at index 1. After a prefix has been discarded (compaction), the log remains
/// dense starting at `first_index()`.
pub trait Log<E: Entry> {
    /// append() appends a log entry to the log at the next log entry index, then returns
    /// the log entry index that was just used to append the entry.
    fn append(&mut self, entry: E) -> Result<Index, io::Error>;

    /// Read log entry at specified index. Returns None for indexes below `first_index()`
    /// (compacted away) or at/after `next_index()`.
    fn read(&self, index: Index) -> Result<Option<E>, io::Error>;

    /// Deletes anything starting at `index` and later. Durable impls must not acknowledge
    /// until the removal is persisted.
    fn truncate(&mut self, index: Index) -> Result<(), io::Error>;

    /// Deletes all entries at and below `up_to_inclusive`, making `up_to_inclusive + 1` the
    /// new `first_index()`. No-op for indexes already discarded.
    fn discard_prefix(&mut self, up_to_inclusive: Index) -> Result<(), io::Error>;

    /// first_index returns the index of the earliest retained entry. If the log is empty,
    /// this is the index the next appended entry will receive.
    fn first_index(&self) -> Index;

    /// next_index returns the next index that will be used to append an entry.
    fn next_index(&self) -> Index;
}

// Choice of Vec<u8> vs Bytes will depend on whats easier for disk to use.
pub trait Entry: Clone + From<Vec<u8>> + Into<Vec<u8>> {}
