use crate::commitlog::Index;
use crate::replica::Term;
use bytes::{Buf, BufMut, Bytes};
use std::convert::TryFrom;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

const SNAPSHOT_FILE_NAME: &str = "snapshot.blob";
const SNAPSHOT_TEMP_FILE_NAME: &str = "snapshot.blob.tmp";
const SNAPSHOT_VERSION: u8 = 1;

/// Snapshot is a compacted representation of all applied state up to (and including)
/// `last_included_index`. It supersedes every log entry at or below that index.
#[derive(Clone, PartialEq, Debug)]
pub struct Snapshot {
    pub last_included_index: Index,
    pub last_included_term: Term,
    pub data: Bytes,
}

/// SnapshotStore holds at most one snapshot, the latest. Saving must be durable before it
/// returns; the caller truncates the log (or acknowledges an RPC) based on the result.
pub trait SnapshotStore {
    fn save(&mut self, snapshot: Snapshot) -> Result<(), io::Error>;

    fn load(&self) -> Result<Option<Snapshot>, io::Error>;
}

pub struct InMemorySnapshotStore {
    current: Option<Snapshot>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        InMemorySnapshotStore { current: None }
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(&mut self, snapshot: Snapshot) -> Result<(), io::Error> {
        self.current = Some(snapshot);
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>, io::Error> {
        Ok(self.current.clone())
    }
}

/// DiskSnapshotStore persists the snapshot as a single blob file, replaced atomically via a
/// temp-file rename so a crash mid-save leaves the previous snapshot intact.
///
/// Layout: `[version u8][last_included_index u64][last_included_term u64][len u32][payload]`.
pub struct DiskSnapshotStore {
    logger: slog::Logger,
    path: PathBuf,
    temp_path: PathBuf,
}

impl DiskSnapshotStore {
    pub fn new(logger: slog::Logger, directory: &Path) -> Result<Self, io::Error> {
        fs::create_dir_all(directory)?;

        Ok(DiskSnapshotStore {
            logger,
            path: directory.join(SNAPSHOT_FILE_NAME),
            temp_path: directory.join(SNAPSHOT_TEMP_FILE_NAME),
        })
    }

    fn encode(snapshot: &Snapshot) -> Result<Vec<u8>, io::Error> {
        let len = u32::try_from(snapshot.data.len())
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "snapshot exceeds blob size limit"))?;

        let mut buf = Vec::with_capacity(1 + 8 + 8 + 4 + snapshot.data.len());
        buf.put_u8(SNAPSHOT_VERSION);
        buf.put_u64(snapshot.last_included_index.as_u64());
        buf.put_u64(snapshot.last_included_term.as_u64());
        buf.put_u32(len);
        buf.put_slice(&snapshot.data);

        Ok(buf)
    }

    fn decode(mut buf: &[u8]) -> Result<Snapshot, io::Error> {
        if buf.remaining() < 1 + 8 + 8 + 4 {
            return Err(corrupt("snapshot header missing"));
        }
        let version = buf.get_u8();
        if version != SNAPSHOT_VERSION {
            return Err(corrupt(format!("unknown snapshot version {}", version)));
        }
        let last_included_index = buf.get_u64();
        if last_included_index == 0 {
            return Err(corrupt("snapshot with index 0"));
        }
        let last_included_term = buf.get_u64();
        let len = buf.get_u32() as usize;
        if buf.remaining() != len {
            return Err(corrupt("snapshot payload length mismatch"));
        }

        Ok(Snapshot {
            last_included_index: Index::new(last_included_index),
            last_included_term: Term::new(last_included_term),
            data: Bytes::from(buf.to_vec()),
        })
    }
}

impl SnapshotStore for DiskSnapshotStore {
    fn save(&mut self, snapshot: Snapshot) -> Result<(), io::Error> {
        let contents = Self::encode(&snapshot)?;

        let mut temp_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.temp_path)?;
        temp_file.write_all(&contents)?;
        temp_file.sync_all()?;
        drop(temp_file);

        fs::rename(&self.temp_path, &self.path)?;

        slog::info!(
            self.logger, "Saved snapshot";
            "last_included_index" => snapshot.last_included_index.as_u64(),
            "last_included_term" => snapshot.last_included_term.as_u64(),
            "payload_bytes" => snapshot.data.len(),
        );

        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>, io::Error> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        Self::decode(&contents).map(Some)
    }
}

fn corrupt(msg: impl Into<String>) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn scratch_dir(test_name: &str) -> PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        std::env::temp_dir().join(format!("raft-kv-snap-{}-{}", test_name, nanos))
    }

    fn snapshot(index: u64, term: u64, data: &[u8]) -> Snapshot {
        Snapshot {
            last_included_index: Index::new(index),
            last_included_term: Term::new(term),
            data: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn empty_store_loads_none() {
        let dir = scratch_dir("empty");
        let store = DiskSnapshotStore::new(test_logger(), &dir).unwrap();

        assert_eq!(store.load().unwrap(), None);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn save_then_load() {
        let dir = scratch_dir("roundtrip");
        let mut store = DiskSnapshotStore::new(test_logger(), &dir).unwrap();

        store.save(snapshot(7, 3, b"kv-state")).unwrap();

        // A store re-created over the same directory sees the same snapshot.
        let reopened = DiskSnapshotStore::new(test_logger(), &dir).unwrap();
        assert_eq!(reopened.load().unwrap(), Some(snapshot(7, 3, b"kv-state")));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn newer_save_replaces_older() {
        let dir = scratch_dir("replace");
        let mut store = DiskSnapshotStore::new(test_logger(), &dir).unwrap();

        store.save(snapshot(5, 2, b"old")).unwrap();
        store.save(snapshot(9, 4, b"new")).unwrap();

        assert_eq!(store.load().unwrap(), Some(snapshot(9, 4, b"new")));

        fs::remove_dir_all(&dir).unwrap();
    }
}
