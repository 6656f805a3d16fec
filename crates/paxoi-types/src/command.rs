//! Commands and the replicated key-value application.
//!
//! The protocol treats command payloads as opaque; this module is the
//! minimal application the servers replicate: puts and gets over an
//! in-memory key-value store. Conflict detection only needs the key
//! and whether the command writes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// Keys and Values
// ============================================================================

/// Application key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(u64);

impl Key {
    pub const fn new(k: u64) -> Self {
        Self(k)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Application value: opaque bytes.
///
/// The empty value doubles as the reply for a missing key and for
/// writes when execution is disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value(Vec<u8>);

impl Value {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Kind of operation a command performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Put,
    Get,
}

/// One client command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub op: OpKind,
    pub key: Key,
    pub value: Value,
}

impl Command {
    pub fn put(key: Key, value: Value) -> Self {
        Self {
            op: OpKind::Put,
            key,
            value,
        }
    }

    pub fn get(key: Key) -> Self {
        Self {
            op: OpKind::Get,
            key,
            value: Value::empty(),
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self.op, OpKind::Put)
    }

    pub fn is_read(&self) -> bool {
        matches!(self.op, OpKind::Get)
    }

    /// Key-level conflict: same key and at least one side writes.
    pub fn conflicts_with(&self, other: &Command) -> bool {
        self.key == other.key && (self.is_write() || other.is_write())
    }
}

// ============================================================================
// Key-Value Store
// ============================================================================

/// The replicated application state machine.
///
/// Commutative commands may execute in different orders on different
/// replicas; the dependency tracking in the protocol layer guarantees
/// conflicting commands do not.
#[derive(Debug, Clone, Default)]
pub struct KvStore {
    data: HashMap<Key, Value>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executes one command, returning the reply value.
    ///
    /// Puts reply with the stored value, gets with the current value
    /// (empty when absent).
    pub fn execute(&mut self, cmd: &Command) -> Value {
        match cmd.op {
            OpKind::Put => {
                self.data.insert(cmd.key, cmd.value.clone());
                cmd.value.clone()
            }
            OpKind::Get => self.data.get(&cmd.key).cloned().unwrap_or_default(),
        }
    }

    /// Read-only lookup for the local-read fast path.
    pub fn read(&self, key: Key) -> Value {
        self.data.get(&key).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get() {
        let mut store = KvStore::new();
        let put = Command::put(Key::new(7), Value::from("x"));
        assert_eq!(store.execute(&put), Value::from("x"));
        assert_eq!(store.execute(&Command::get(Key::new(7))), Value::from("x"));
    }

    #[test]
    fn get_of_missing_key_is_empty() {
        let mut store = KvStore::new();
        assert!(store.execute(&Command::get(Key::new(1))).is_empty());
    }

    #[test]
    fn conflicts_require_shared_key_and_a_write() {
        let put7 = Command::put(Key::new(7), Value::from("x"));
        let get7 = Command::get(Key::new(7));
        let get7b = Command::get(Key::new(7));
        let put8 = Command::put(Key::new(8), Value::from("y"));

        assert!(put7.conflicts_with(&get7));
        assert!(get7.conflicts_with(&put7));
        assert!(!get7.conflicts_with(&get7b));
        assert!(!put7.conflicts_with(&put8));
    }
}
