use crate::commitlog;
use crate::replica::Term;
use bytes::{Buf, BufMut};

/// Byte representation:
///
/// ```text
/// |                                         1                           |
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 0 | 1 | 2 | 3 | 4 | 5 | ... |
/// +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+-...-+
/// |Vrs|       Term (8 bytes)          |   Data (variable size)      ... |
/// +---+-------------------------------+-----------------------------...-+
/// ```
///
/// * `Vrs` - version of the serialized payload
/// * `Term` - leadership term when this entry was created
/// * `Data` - app specific data payload
///
/// Not needed:
///
/// * Checksum is not needed, it's guaranteed by underlying commitlog.
/// * Size/length of `Data` is not needed; the underlying commitlog will give us the correctly allocated array.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteAheadLogEntry {
    pub term: Term,
    pub data: Vec<u8>,
}

const LOG_ENTRY_FORMAT_VERSION: u8 = 1;

impl commitlog::Entry for WriteAheadLogEntry {}

impl From<Vec<u8>> for WriteAheadLogEntry {
    fn from(bytes: Vec<u8>) -> Self {
        // TODO:2.5 use TryFrom so corrupt disk data surfaces as an error instead of a panic.
        assert!(bytes.len() >= 9, "Log entry missing header");
        let mut buf = bytes.as_slice();
        let version = buf.get_u8();
        assert_eq!(version, LOG_ENTRY_FORMAT_VERSION, "Unsupported log entry format version");

        let term = Term::new(buf.get_u64());
        WriteAheadLogEntry {
            term,
            data: buf.to_vec(),
        }
    }
}

impl From<WriteAheadLogEntry> for Vec<u8> {
    fn from(entry: WriteAheadLogEntry) -> Self {
        let mut bytes = Vec::with_capacity(1 + 8 + entry.data.len());
        bytes.put_u8(LOG_ENTRY_FORMAT_VERSION);
        bytes.put_u64(entry.term.as_u64());
        bytes.put_slice(&entry.data);

        bytes
    }
}
