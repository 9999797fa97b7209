use crate::replica::membership::ReplicaId;
use bytes::{Buf, BufMut};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Copy, Clone, PartialOrd, PartialEq)]
pub struct Term(u64);

impl Term {
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentLocalState is used whenever the algorithm requires that something is persisted to a
/// durable store to guarantee safety. Not everything that uses disk has to go through this, only
/// correctness-critical values: the current term and this term's vote.
///
/// Store methods should be implemented atomically via a CAS like operation. Similar to most CAS
/// method signatures, the CAS store methods return true if we have mutated state. An `Err` means
/// the durable write failed; the caller must treat the replica as unable to continue rather than
/// acknowledge state it can't guarantee.
pub trait PersistentLocalState {
    /// Set current term to `new_term` atomically, iff it is larger than current term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error>;

    /// Store our vote for the latest term iff the latest term (internal state) is the same term as
    /// the one provided, and we have not stored a vote for the latest term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: ReplicaId)
        -> Result<bool, io::Error>;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error>;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>);
}

/// In-memory impl for simulated clusters and unit tests, where a "replica crash" is dropping
/// the whole instance anyway.
pub struct VolatileLocalState {
    current_term: Term,
    voted_for_this_term: Option<Arc<ReplicaId>>,
    my_replica_id: Arc<ReplicaId>,
}

impl VolatileLocalState {
    pub fn new(my_replica_id: ReplicaId) -> Self {
        VolatileLocalState {
            current_term: Term::new(0),
            voted_for_this_term: None,
            my_replica_id: Arc::new(my_replica_id),
        }
    }
}

impl PersistentLocalState for VolatileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error> {
        if new_term <= self.current_term {
            return Ok(false);
        }

        self.current_term = new_term;
        self.voted_for_this_term = None;
        Ok(true)
    }

    fn store_vote_for_term_if_unvoted(
        &mut self,
        expected_term: Term,
        vote: ReplicaId,
    ) -> Result<bool, io::Error> {
        if expected_term == self.current_term && self.voted_for_this_term.is_none() {
            self.voted_for_this_term.replace(Arc::new(vote));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error> {
        self.current_term.incr();
        self.voted_for_this_term.replace(self.my_replica_id.clone());

        Ok(self.current_term)
    }

    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        (self.current_term, self.voted_for_this_term.clone())
    }
}

const RECORD_FILE_NAME: &str = "local_state.rec";
const RECORD_VERSION: u8 = 1;

/// Durable impl: a single small record file, rewritten and fsync'd on every mutation, before
/// the mutation is visible to callers. Layout: `[version u8][term u64][vote len u32][vote]`
/// where a zero-length vote means no vote this term.
pub struct DiskLocalState {
    logger: slog::Logger,
    path: PathBuf,
    current_term: Term,
    voted_for_this_term: Option<Arc<ReplicaId>>,
    my_replica_id: Arc<ReplicaId>,
}

impl DiskLocalState {
    pub fn create(logger: slog::Logger, directory: &Path, my_replica_id: ReplicaId) -> Result<Self, io::Error> {
        std::fs::create_dir_all(directory)?;
        let path = directory.join(RECORD_FILE_NAME);

        let (current_term, voted_for_this_term) = match File::open(&path) {
            Ok(mut file) => {
                let mut contents = Vec::new();
                file.read_to_end(&mut contents)?;
                Self::parse(&contents)?
            }
            Err(e) if e.kind() == ErrorKind::NotFound => (Term::new(0), None),
            Err(e) => return Err(e),
        };

        slog::info!(
            logger, "Loaded local state record";
            "term" => current_term.as_u64(),
            "voted_for" => ?voted_for_this_term,
        );

        Ok(DiskLocalState {
            logger,
            path,
            current_term,
            voted_for_this_term: voted_for_this_term.map(Arc::new),
            my_replica_id: Arc::new(my_replica_id),
        })
    }

    fn parse(mut buf: &[u8]) -> Result<(Term, Option<ReplicaId>), io::Error> {
        if buf.remaining() < 1 + 8 + 4 {
            return Err(io::Error::new(ErrorKind::InvalidData, "local state record too short"));
        }
        let version = buf.get_u8();
        if version != RECORD_VERSION {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("unknown local state record version {}", version),
            ));
        }
        let term = Term::new(buf.get_u64());
        let vote_len = buf.get_u32() as usize;
        if buf.remaining() < vote_len {
            return Err(io::Error::new(ErrorKind::InvalidData, "vote field truncated"));
        }
        let vote = if vote_len == 0 {
            None
        } else {
            let vote_bytes = buf.copy_to_bytes(vote_len).to_vec();
            let vote_str = String::from_utf8(vote_bytes)
                .map_err(|_| io::Error::new(ErrorKind::InvalidData, "vote field is not valid UTF-8"))?;
            Some(ReplicaId::new(vote_str))
        };

        Ok((term, vote))
    }

    fn persist(&self) -> Result<(), io::Error> {
        let vote_bytes = self
            .voted_for_this_term
            .as_ref()
            .map(|id| id.as_str().as_bytes().to_vec())
            .unwrap_or_default();

        let mut contents = Vec::with_capacity(1 + 8 + 4 + vote_bytes.len());
        contents.put_u8(RECORD_VERSION);
        contents.put_u64(self.current_term.as_u64());
        contents.put_u32(vote_bytes.len() as u32);
        contents.put_slice(&vote_bytes);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(&contents)?;
        file.sync_all()?;

        slog::debug!(
            self.logger, "Persisted local state record";
            "term" => self.current_term.as_u64(),
            "voted_for" => ?self.voted_for_this_term,
        );

        Ok(())
    }
}

impl PersistentLocalState for DiskLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error> {
        if new_term <= self.current_term {
            return Ok(false);
        }

        let (previous_term, previous_vote) = (self.current_term, self.voted_for_this_term.take());
        self.current_term = new_term;
        if let Err(e) = self.persist() {
            self.current_term = previous_term;
            self.voted_for_this_term = previous_vote;
            return Err(e);
        }

        Ok(true)
    }

    fn store_vote_for_term_if_unvoted(
        &mut self,
        expected_term: Term,
        vote: ReplicaId,
    ) -> Result<bool, io::Error> {
        if expected_term != self.current_term || self.voted_for_this_term.is_some() {
            return Ok(false);
        }

        self.voted_for_this_term.replace(Arc::new(vote));
        if let Err(e) = self.persist() {
            self.voted_for_this_term = None;
            return Err(e);
        }

        Ok(true)
    }

    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error> {
        let (previous_term, previous_vote) = (self.current_term, self.voted_for_this_term.clone());
        self.current_term.incr();
        self.voted_for_this_term.replace(self.my_replica_id.clone());
        if let Err(e) = self.persist() {
            self.current_term = previous_term;
            self.voted_for_this_term = previous_vote;
            return Err(e);
        }

        Ok(self.current_term)
    }

    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        (self.current_term, self.voted_for_this_term.clone())
    }
}
