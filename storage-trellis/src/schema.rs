//! Key layout of the backing store.
//!
//! Every key family is prefix-partitioned by a single tag byte so that
//! per-family iteration is a plain prefix scan. Versions are encoded
//! big-endian so numeric order matches key order.

use crate::errors::{DbError, DbResult};
use crate::node::{Namespace, TypedHash};

/// Node data: `0x00 ‖ typed-hash`. Value is the created-version followed by
/// the canonical node encoding.
pub const NODE_PREFIX: u8 = 0x00;
/// Write logs: `0x01 ‖ version ‖ new-root ‖ old-root`.
pub const WRITELOG_PREFIX: u8 = 0x01;
/// Roots metadata: `0x02 ‖ version`.
pub const ROOTS_PREFIX: u8 = 0x02;
/// Updated-node lists for pending roots: `0x03 ‖ version ‖ root`.
pub const UPDATED_NODES_PREFIX: u8 = 0x03;
/// Global metadata: `0x04`.
pub const METADATA_PREFIX: u8 = 0x04;
/// Multipart restore log: `0x05 ‖ typed-hash`. Value is empty.
pub const MULTIPART_PREFIX: u8 = 0x05;
/// Persisted sync cursor: `0x06 ‖ namespace`.
pub const SYNC_CURSOR_PREFIX: u8 = 0x06;

pub fn node_key(hash: &TypedHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(34);
    key.push(NODE_PREFIX);
    key.extend_from_slice(&hash.to_bytes());
    key
}

pub fn writelog_key(version: u64, new_root: &TypedHash, old_root: &TypedHash) -> Vec<u8> {
    let mut key = writelog_root_prefix(version, new_root);
    key.extend_from_slice(&old_root.to_bytes());
    key
}

/// Prefix covering every write log that produces `new_root` at `version`.
pub fn writelog_root_prefix(version: u64, new_root: &TypedHash) -> Vec<u8> {
    let mut key = writelog_version_prefix(version);
    key.extend_from_slice(&new_root.to_bytes());
    key
}

/// Prefix covering every write log at `version`.
pub fn writelog_version_prefix(version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(WRITELOG_PREFIX);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

/// Decode the old-root component of a full write-log key.
pub fn writelog_key_old_root(key: &[u8]) -> DbResult<TypedHash> {
    if key.len() != 1 + 8 + 33 + 33 {
        return Err(DbError::Corrupt("bad write log key length".into()));
    }
    TypedHash::from_bytes(&key[1 + 8 + 33..])
}

pub fn roots_key(version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(ROOTS_PREFIX);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

pub fn updated_nodes_key(version: u64, root: &TypedHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(42);
    key.push(UPDATED_NODES_PREFIX);
    key.extend_from_slice(&version.to_be_bytes());
    key.extend_from_slice(&root.to_bytes());
    key
}

pub fn metadata_key() -> Vec<u8> {
    vec![METADATA_PREFIX]
}

pub fn multipart_key(hash: &TypedHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(34);
    key.push(MULTIPART_PREFIX);
    key.extend_from_slice(&hash.to_bytes());
    key
}

pub fn multipart_prefix() -> Vec<u8> {
    vec![MULTIPART_PREFIX]
}

/// Decode the typed hash component of a multipart log key.
pub fn multipart_key_hash(key: &[u8]) -> DbResult<TypedHash> {
    if key.len() != 34 {
        return Err(DbError::Corrupt("bad multipart log key length".into()));
    }
    TypedHash::from_bytes(&key[1..])
}

pub fn sync_cursor_key(namespace: &Namespace) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(SYNC_CURSOR_PREFIX);
    key.extend_from_slice(namespace);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::RootType;

    #[test]
    fn writelog_key_components_round_trip() {
        let new_root = TypedHash::new(RootType::State, [1u8; 32]);
        let old_root = TypedHash::new(RootType::State, [2u8; 32]);
        let key = writelog_key(7, &new_root, &old_root);
        assert!(key.starts_with(&writelog_version_prefix(7)));
        assert!(key.starts_with(&writelog_root_prefix(7, &new_root)));
        assert_eq!(writelog_key_old_root(&key).expect("old root"), old_root);
    }

    #[test]
    fn version_prefixes_sort_numerically() {
        assert!(writelog_version_prefix(9) < writelog_version_prefix(10));
        assert!(roots_key(255) < roots_key(256));
    }

    #[test]
    fn multipart_key_round_trips() {
        let th = TypedHash::new(RootType::Io, [9u8; 32]);
        let key = multipart_key(&th);
        assert_eq!(multipart_key_hash(&key).expect("hash"), th);
    }
}
