use crate::kv::command::{get_string, put_string, DecodeError, Operation};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

const STATE_VERSION: u8 = 1;

/// KvStore is the replicated state machine: a string-keyed map mutated only by applying
/// committed operations, in log order. It carries no Raft bookkeeping; callers track which
/// index was applied last.
#[derive(Clone, PartialEq, Debug)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        KvStore { data: BTreeMap::new() }
    }

    pub fn apply(&mut self, op: &Operation) {
        match op {
            Operation::Set { key, value } => {
                self.data.insert(key.clone(), value.clone());
            }
            Operation::Delete { key } => {
                self.data.remove(key);
            }
            // Noop and membership operations carry no data effect.
            Operation::Noop | Operation::AddMember { .. } | Operation::RemoveMember { .. } => {}
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Serializes the full map for a snapshot payload. BTreeMap ordering makes the bytes
    /// deterministic for a given state, so equal states produce equal payloads.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(STATE_VERSION);
        buf.put_u32(self.data.len() as u32);
        for (key, value) in &self.data {
            put_string(&mut buf, key);
            put_string(&mut buf, value);
        }

        buf.freeze()
    }

    pub fn deserialize(mut payload: Bytes) -> Result<Self, DecodeError> {
        if payload.remaining() < 5 {
            return Err(DecodeError::Truncated);
        }
        let version = payload.get_u8();
        if version != STATE_VERSION {
            return Err(DecodeError::UnknownVersion(version));
        }
        let num_pairs = payload.get_u32();

        let mut data = BTreeMap::new();
        for _ in 0..num_pairs {
            let key = get_string(&mut payload)?;
            let value = get_string(&mut payload)?;
            data.insert(key, value);
        }

        Ok(KvStore { data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str, value: &str) -> Operation {
        Operation::Set {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn apply_set_and_delete() {
        let mut store = KvStore::new();

        store.apply(&set("a", "1"));
        store.apply(&set("b", "2"));
        store.apply(&set("a", "3"));
        assert_eq!(store.get("a"), Some("3"));
        assert_eq!(store.get("b"), Some("2"));

        store.apply(&Operation::Delete { key: "a".to_string() });
        assert_eq!(store.get("a"), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn noop_and_membership_leave_data_untouched() {
        let mut store = KvStore::new();
        store.apply(&set("k", "v"));

        store.apply(&Operation::Noop);
        store.apply(&Operation::AddMember {
            member_id: "replica-9".to_string(),
        });

        assert_eq!(store.get("k"), Some("v"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn serialize_restores_identical_state() {
        let mut store = KvStore::new();
        store.apply(&set("x", "10"));
        store.apply(&set("y", "20"));
        store.apply(&Operation::Delete { key: "x".to_string() });

        let restored = KvStore::deserialize(store.serialize()).unwrap();

        assert_eq!(restored, store);
        assert_eq!(restored.get("y"), Some("20"));
        assert_eq!(restored.get("x"), None);
    }

    #[test]
    fn equal_states_serialize_identically() {
        let mut a = KvStore::new();
        a.apply(&set("k1", "v1"));
        a.apply(&set("k2", "v2"));

        let mut b = KvStore::new();
        b.apply(&set("k2", "v2"));
        b.apply(&set("k1", "v1"));

        assert_eq!(a.serialize(), b.serialize());
    }

    #[test]
    fn empty_store_round_trips() {
        let store = KvStore::new();

        let restored = KvStore::deserialize(store.serialize()).unwrap();

        assert!(restored.is_empty());
    }
}
