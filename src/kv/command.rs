use bytes::{Buf, BufMut, Bytes, BytesMut};

const COMMAND_VERSION: u8 = 1;

const TAG_NOOP: u8 = 0;
const TAG_SET: u8 = 1;
const TAG_DELETE: u8 = 2;
const TAG_ADD_MEMBER: u8 = 3;
const TAG_REMOVE_MEMBER: u8 = 4;

/// Command is the unit of replication: what a log entry's payload decodes to. `client_id`
/// and `request_seq` identify the originating request so histories can be audited after a
/// run; the engine itself doesn't interpret them.
#[derive(Clone, PartialEq, Debug)]
pub struct Command {
    pub client_id: String,
    pub request_seq: u64,
    pub op: Operation,
}

#[derive(Clone, PartialEq, Debug)]
pub enum Operation {
    /// Appended by a new leader to establish commit authority in its term, and used as the
    /// barrier entry for linearizable reads. No effect on KV data.
    Noop,
    Set { key: String, value: String },
    Delete { key: String },
    /// Cluster configuration changes ride the same log as data commands; the membership
    /// effect happens where the entry is applied, not here.
    AddMember { member_id: String },
    RemoveMember { member_id: String },
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Unknown version: {0}")]
    UnknownVersion(u8),

    #[error("Unknown operation tag: {0}")]
    UnknownTag(u8),

    #[error("Payload ended before declared length")]
    Truncated,

    #[error("String field is not valid UTF-8")]
    InvalidUtf8,
}

impl Command {
    /// A leader's own housekeeping entries (election noop, read barrier) originate from the
    /// replica itself rather than an external client.
    pub fn internal_noop(replica_id: impl Into<String>) -> Self {
        Command {
            client_id: replica_id.into(),
            request_seq: 0,
            op: Operation::Noop,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(COMMAND_VERSION);
        buf.put_u8(self.op.tag());
        put_string(&mut buf, &self.client_id);
        buf.put_u64(self.request_seq);

        match &self.op {
            Operation::Noop => {}
            Operation::Set { key, value } => {
                put_string(&mut buf, key);
                put_string(&mut buf, value);
            }
            Operation::Delete { key } => {
                put_string(&mut buf, key);
            }
            Operation::AddMember { member_id } | Operation::RemoveMember { member_id } => {
                put_string(&mut buf, member_id);
            }
        }

        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Command, DecodeError> {
        if buf.remaining() < 2 {
            return Err(DecodeError::Truncated);
        }
        let version = buf.get_u8();
        if version != COMMAND_VERSION {
            return Err(DecodeError::UnknownVersion(version));
        }
        let tag = buf.get_u8();
        let client_id = get_string(&mut buf)?;
        if buf.remaining() < 8 {
            return Err(DecodeError::Truncated);
        }
        let request_seq = buf.get_u64();

        let op = match tag {
            TAG_NOOP => Operation::Noop,
            TAG_SET => Operation::Set {
                key: get_string(&mut buf)?,
                value: get_string(&mut buf)?,
            },
            TAG_DELETE => Operation::Delete {
                key: get_string(&mut buf)?,
            },
            TAG_ADD_MEMBER => Operation::AddMember {
                member_id: get_string(&mut buf)?,
            },
            TAG_REMOVE_MEMBER => Operation::RemoveMember {
                member_id: get_string(&mut buf)?,
            },
            unknown => return Err(DecodeError::UnknownTag(unknown)),
        };

        Ok(Command {
            client_id,
            request_seq,
            op,
        })
    }
}

impl Operation {
    fn tag(&self) -> u8 {
        match self {
            Operation::Noop => TAG_NOOP,
            Operation::Set { .. } => TAG_SET,
            Operation::Delete { .. } => TAG_DELETE,
            Operation::AddMember { .. } => TAG_ADD_MEMBER,
            Operation::RemoveMember { .. } => TAG_REMOVE_MEMBER,
        }
    }

    pub fn is_config_change(&self) -> bool {
        matches!(self, Operation::AddMember { .. } | Operation::RemoveMember { .. })
    }
}

pub(crate) fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn get_string(buf: &mut Bytes) -> Result<String, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::Truncated);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(DecodeError::Truncated);
    }
    String::from_utf8(buf.copy_to_bytes(len).to_vec()).map_err(|_| DecodeError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_round_trips() {
        let command = Command {
            client_id: "client-7".to_string(),
            request_seq: 42,
            op: Operation::Set {
                key: "color".to_string(),
                value: "green".to_string(),
            },
        };

        assert_eq!(Command::decode(command.encode()), Ok(command));
    }

    #[test]
    fn noop_round_trips() {
        let command = Command::internal_noop("replica-1");

        assert_eq!(Command::decode(command.encode()), Ok(command));
    }

    #[test]
    fn config_change_round_trips() {
        let command = Command {
            client_id: "admin".to_string(),
            request_seq: 1,
            op: Operation::AddMember {
                member_id: "replica-4".to_string(),
            },
        };

        let decoded = Command::decode(command.encode()).unwrap();
        assert!(decoded.op.is_config_change());
        assert_eq!(decoded, command);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let command = Command {
            client_id: "c".to_string(),
            request_seq: 9,
            op: Operation::Delete { key: "k".to_string() },
        };
        let mut encoded = command.encode().to_vec();
        encoded.truncate(encoded.len() - 1);

        assert_eq!(Command::decode(Bytes::from(encoded)), Err(DecodeError::Truncated));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut encoded = Command::internal_noop("r").encode().to_vec();
        encoded[1] = 99;

        assert_eq!(Command::decode(Bytes::from(encoded)), Err(DecodeError::UnknownTag(99)));
    }
}
