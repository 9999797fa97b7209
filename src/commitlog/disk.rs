use crate::commitlog::{Entry, Index, Log};
use bytes::{Buf, BufMut};
use std::convert::TryFrom;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

const SEGMENT_FILE_NAME: &str = "segment.log";
const SEGMENT_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 /* version */ + 8 /* discarded count */;

/// DiskLog is a durable Log backed by a single segment file. Appends extend the file;
/// truncation and compaction rewrite it. Every mutation is fsync'd before returning, so a
/// caller that has seen `Ok` may acknowledge the entry to a peer.
///
/// Layout: `[version u8][discarded u64]` followed by one `[len u32][payload]` record per
/// retained entry. Entries are also mirrored in memory; reads never touch the file.
pub struct DiskLog<E: Entry> {
    logger: slog::Logger,
    path: PathBuf,
    file: File,
    log: Vec<Vec<u8>>,
    // Number of entries discarded by compaction. first_index = discarded + 1.
    discarded: u64,
    _pd: PhantomData<E>,
}

impl<E: Entry> DiskLog<E> {
    pub fn create(logger: slog::Logger, directory: &Path) -> Result<Self, io::Error> {
        fs::create_dir_all(directory)?;
        let path = directory.join(SEGMENT_FILE_NAME);

        let (file, log, discarded) = if path.exists() {
            Self::open_existing(&path)?
        } else {
            Self::init_fresh(&path)?
        };

        slog::info!(
            logger, "Opened log segment";
            "path" => %path.display(),
            "recovered_entries" => log.len(),
            "discarded" => discarded,
        );

        Ok(DiskLog {
            logger,
            path,
            file,
            log,
            discarded,
            _pd: PhantomData,
        })
    }

    fn init_fresh(path: &Path) -> Result<(File, Vec<Vec<u8>>, u64), io::Error> {
        let mut file = OpenOptions::new().create_new(true).append(true).open(path)?;
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.put_u8(SEGMENT_VERSION);
        header.put_u64(0);
        file.write_all(&header)?;
        file.sync_all()?;

        Ok((file, Vec::new(), 0))
    }

    fn open_existing(path: &Path) -> Result<(File, Vec<Vec<u8>>, u64), io::Error> {
        let mut contents = Vec::new();
        File::open(path)?.read_to_end(&mut contents)?;
        let (log, discarded) = Self::parse(&contents)?;

        let file = OpenOptions::new().append(true).open(path)?;

        Ok((file, log, discarded))
    }

    fn parse(mut buf: &[u8]) -> Result<(Vec<Vec<u8>>, u64), io::Error> {
        if buf.remaining() < HEADER_LEN {
            return Err(corrupt("segment header missing"));
        }
        let version = buf.get_u8();
        if version != SEGMENT_VERSION {
            return Err(corrupt(format!("unknown segment version {}", version)));
        }
        let discarded = buf.get_u64();

        let mut log = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < 4 {
                return Err(corrupt("record length missing"));
            }
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return Err(corrupt("record payload shorter than declared length"));
            }
            log.push(buf.copy_to_bytes(len).to_vec());
        }

        Ok((log, discarded))
    }

    fn encode_record(payload: &[u8]) -> Result<Vec<u8>, io::Error> {
        let len = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "entry exceeds record size limit"))?;

        let mut record = Vec::with_capacity(4 + payload.len());
        record.put_u32(len);
        record.put_slice(payload);

        Ok(record)
    }

    /// Rewrites the entire segment. Used by the suffix/prefix removal paths, which can't be
    /// expressed as appends.
    fn rewrite(&mut self) -> Result<(), io::Error> {
        let mut contents = Vec::with_capacity(HEADER_LEN);
        contents.put_u8(SEGMENT_VERSION);
        contents.put_u64(self.discarded);
        for payload in &self.log {
            contents.extend_from_slice(&Self::encode_record(payload)?);
        }

        let mut file = OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        file.write_all(&contents)?;
        file.sync_all()?;

        // Reopen in append mode so subsequent appends land past the rewritten contents.
        self.file = OpenOptions::new().append(true).open(&self.path)?;

        Ok(())
    }

    fn vec_index(&self, index: Index) -> Option<usize> {
        index.as_u64().checked_sub(self.discarded + 1).map(|i| i as usize)
    }
}

impl<E: Entry> Log<E> for DiskLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let payload: Vec<u8> = entry.into();
        let record = Self::encode_record(&payload)?;

        self.file.write_all(&record)?;
        self.file.sync_data()?;
        self.log.push(payload);

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
        let vec_index = match self.vec_index(index) {
            Some(i) if i < self.log.len() => i,
            _ => return Ok(()),
        };

        slog::debug!(self.logger, "Truncating log"; "from_index" => index.as_u64());
        self.log.truncate(vec_index);
        self.rewrite()
    }

    fn discard_prefix(&mut self, up_to_inclusive: Index) -> Result<(), io::Error> {
        if up_to_inclusive.as_u64() <= self.discarded {
            return Ok(());
        }

        let num_removed = ((up_to_inclusive.as_u64() - self.discarded) as usize).min(self.log.len());
        self.log.drain(..num_removed);
        self.discarded = up_to_inclusive.as_u64();
        self.rewrite()
    }

    fn first_index(&self) -> Index {
        Index::new(self.discarded + 1)
    }

    fn next_index(&self) -> Index {
        Index::new(self.discarded + self.log.len() as u64 + 1)
    }
}

fn corrupt(msg: impl Into<String>) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

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

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn scratch_dir(test_name: &str) -> PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        std::env::temp_dir().join(format!("raft-kv-{}-{}", test_name, nanos))
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = scratch_dir("reopen");

        {
            let mut log = DiskLog::<TestEntry>::create(test_logger(), &dir).unwrap();
            log.append(TestEntry(vec![1, 2, 3])).unwrap();
            log.append(TestEntry(vec![4])).unwrap();
        }

        let log = DiskLog::<TestEntry>::create(test_logger(), &dir).unwrap();
        assert_eq!(log.read(Index::new(1)).unwrap(), Some(TestEntry(vec![1, 2, 3])));
        assert_eq!(log.read(Index::new(2)).unwrap(), Some(TestEntry(vec![4])));
        assert_eq!(log.next_index(), Index::new(3));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn truncation_survives_reopen() {
        let dir = scratch_dir("truncate");

        {
            let mut log = DiskLog::<TestEntry>::create(test_logger(), &dir).unwrap();
            for b in 0..5u8 {
                log.append(TestEntry(vec![b])).unwrap();
            }
            log.truncate(Index::new(3)).unwrap();
            log.append(TestEntry(vec![42])).unwrap();
        }

        let log = DiskLog::<TestEntry>::create(test_logger(), &dir).unwrap();
        assert_eq!(log.read(Index::new(2)).unwrap(), Some(TestEntry(vec![1])));
        assert_eq!(log.read(Index::new(3)).unwrap(), Some(TestEntry(vec![42])));
        assert_eq!(log.next_index(), Index::new(4));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn compaction_survives_reopen() {
        let dir = scratch_dir("compaction");

        {
            let mut log = DiskLog::<TestEntry>::create(test_logger(), &dir).unwrap();
            for b in 0..6u8 {
                log.append(TestEntry(vec![b])).unwrap();
            }
            log.discard_prefix(Index::new(4)).unwrap();
        }

        let log = DiskLog::<TestEntry>::create(test_logger(), &dir).unwrap();
        assert_eq!(log.first_index(), Index::new(5));
        assert_eq!(log.read(Index::new(4)).unwrap(), None);
        assert_eq!(log.read(Index::new(5)).unwrap(), Some(TestEntry(vec![4])));
        assert_eq!(log.next_index(), Index::new(7));

        fs::remove_dir_all(&dir).unwrap();
    }
}
