use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::DbError;

/// 32-byte hash output used throughout the store.
pub type Hash = [u8; 32];

/// 32-byte identifier of the runtime a store belongs to.
pub type Namespace = [u8; 32];

/// Bit depth within a key; labels and branch positions are measured in bits.
pub type Depth = u16;

/// Hash of the empty byte string. An empty subtree hashes to this value by
/// convention, so the constant doubles as the "no subtree here" marker.
pub const EMPTY_HASH: Hash = [
    0xaf, 0x13, 0x49, 0xb9, 0xf5, 0xf9, 0xa1, 0xa6, 0xa0, 0x40, 0x4d, 0xee, 0x36, 0xdc, 0xc9,
    0x49, 0x9b, 0xcb, 0x25, 0xc9, 0xad, 0xc1, 0x12, 0xb7, 0xcc, 0x9a, 0x93, 0xca, 0xe4, 0x1f,
    0x32, 0x62,
];

const LEAF_TAG: u8 = 0x01;
const INTERNAL_TAG: u8 = 0x02;

/// Kind of a storage root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RootType {
    /// Per-round input/output log root; not chained across rounds.
    Io = 1,
    /// Runtime key-value state root; chained across rounds.
    State = 2,
}

impl RootType {
    pub fn from_byte(value: u8) -> Result<Self, DbError> {
        match value {
            1 => Ok(RootType::Io),
            2 => Ok(RootType::State),
            other => Err(DbError::Codec(format!("unknown root type {other}"))),
        }
    }
}

impl fmt::Display for RootType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RootType::Io => write!(f, "io"),
            RootType::State => write!(f, "state"),
        }
    }
}

/// A storage root: one version of one tree within a namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Root {
    pub namespace: Namespace,
    pub version: u64,
    pub root_type: RootType,
    pub hash: Hash,
}

impl Root {
    pub fn new(namespace: Namespace, version: u64, root_type: RootType, hash: Hash) -> Self {
        Self {
            namespace,
            version,
            root_type,
            hash,
        }
    }

    /// An empty root of the given type at the given version.
    pub fn empty(namespace: Namespace, version: u64, root_type: RootType) -> Self {
        Self::new(namespace, version, root_type, EMPTY_HASH)
    }

    pub fn is_empty(&self) -> bool {
        self.hash == EMPTY_HASH
    }

    /// Whether this root can legally be derived from `old`: same namespace
    /// and a version that does not go backwards.
    pub fn follows(&self, old: &Root) -> bool {
        self.namespace == old.namespace && self.version >= old.version
    }

    pub fn typed_hash(&self) -> TypedHash {
        TypedHash {
            root_type: self.root_type,
            hash: self.hash,
        }
    }
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.root_type,
            self.version,
            &hex::encode(self.hash)[..8]
        )
    }
}

/// A root-type-qualified node or root hash, as used in storage keys. The
/// same content hash is stored separately per tree kind.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TypedHash {
    pub root_type: RootType,
    pub hash: Hash,
}

impl TypedHash {
    pub fn new(root_type: RootType, hash: Hash) -> Self {
        Self { root_type, hash }
    }

    pub fn to_bytes(&self) -> [u8; 33] {
        let mut out = [0u8; 33];
        out[0] = self.root_type as u8;
        out[1..].copy_from_slice(&self.hash);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DbError> {
        if bytes.len() != 33 {
            return Err(DbError::Codec("typed hash must be 33 bytes".into()));
        }
        let root_type = RootType::from_byte(bytes[0])?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[1..]);
        Ok(Self { root_type, hash })
    }
}

/// Reference to a node. Clean pointers denote persisted nodes and may carry
/// an attached in-memory copy; dirty pointers have a stale hash until the
/// owning tree is committed.
#[derive(Clone, Debug)]
pub struct Pointer {
    pub clean: bool,
    pub hash: Hash,
    pub node: Option<Box<Node>>,
}

impl Pointer {
    /// Pointer to the empty subtree.
    pub fn null() -> Self {
        Pointer {
            clean: true,
            hash: EMPTY_HASH,
            node: None,
        }
    }

    /// Clean pointer to a persisted node known only by hash.
    pub fn from_hash(hash: Hash) -> Self {
        Pointer {
            clean: true,
            hash,
            node: None,
        }
    }

    /// Dirty pointer holding a freshly built node.
    pub fn from_node(node: Node) -> Self {
        Pointer {
            clean: false,
            hash: EMPTY_HASH,
            node: Some(Box::new(node)),
        }
    }

    pub fn is_null(&self) -> bool {
        self.node.is_none() && self.hash == EMPTY_HASH
    }
}

/// A leaf holds a full key together with its value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafNode {
    pub hash: Hash,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl LeafNode {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        let mut leaf = LeafNode {
            hash: EMPTY_HASH,
            key,
            value,
        };
        leaf.hash = blake3::hash(&leaf.encode()).into();
        leaf
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.key.len() + self.value.len());
        out.push(LEAF_TAG);
        out.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.value);
        out
    }
}

/// An internal node compresses the shared bit prefix of its subtree into
/// `label`. The optional leaf slot holds the key that terminates exactly at
/// the end of the label; left and right cover the next bit being 0 or 1.
#[derive(Clone, Debug)]
pub struct InternalNode {
    pub hash: Hash,
    pub label: Vec<u8>,
    pub label_bit_length: Depth,
    pub leaf: Pointer,
    pub left: Pointer,
    pub right: Pointer,
}

impl InternalNode {
    pub fn encode(&self) -> Vec<u8> {
        let label_bytes = bit_bytes(self.label_bit_length);
        let mut out = Vec::with_capacity(4 + label_bytes + 33 + 64);
        out.push(INTERNAL_TAG);
        out.extend_from_slice(&self.label_bit_length.to_le_bytes());
        out.extend_from_slice(&self.label[..label_bytes]);
        if self.leaf.is_null() {
            out.push(0x00);
        } else {
            out.push(0x01);
            out.extend_from_slice(&self.leaf.hash);
        }
        out.extend_from_slice(&self.left.hash);
        out.extend_from_slice(&self.right.hash);
        out
    }
}

/// A node of the authenticated trie.
#[derive(Clone, Debug)]
pub enum Node {
    Internal(InternalNode),
    Leaf(LeafNode),
}

impl Node {
    /// Canonical binary serialization; the node hash is defined over these
    /// exact bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Node::Internal(n) => n.encode(),
            Node::Leaf(n) => n.encode(),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Node, DbError> {
        let mut node = Self::decode_inner(data)?;
        let hash: Hash = blake3::hash(data).into();
        match &mut node {
            Node::Internal(n) => n.hash = hash,
            Node::Leaf(n) => n.hash = hash,
        }
        Ok(node)
    }

    fn decode_inner(data: &[u8]) -> Result<Node, DbError> {
        let corrupt = || DbError::Codec("truncated node encoding".into());
        let (&tag, rest) = data.split_first().ok_or_else(corrupt)?;
        match tag {
            LEAF_TAG => {
                let (key, rest) = take_prefixed(rest).ok_or_else(corrupt)?;
                let (value, rest) = take_prefixed(rest).ok_or_else(corrupt)?;
                if !rest.is_empty() {
                    return Err(DbError::Codec("trailing bytes after leaf".into()));
                }
                Ok(Node::Leaf(LeafNode {
                    hash: EMPTY_HASH,
                    key: key.to_vec(),
                    value: value.to_vec(),
                }))
            }
            INTERNAL_TAG => {
                if rest.len() < 2 {
                    return Err(corrupt());
                }
                let label_bit_length = Depth::from_le_bytes([rest[0], rest[1]]);
                let rest = &rest[2..];
                let label_bytes = bit_bytes(label_bit_length);
                if rest.len() < label_bytes + 1 {
                    return Err(corrupt());
                }
                let label = rest[..label_bytes].to_vec();
                let mut rest = &rest[label_bytes..];
                let leaf = match rest[0] {
                    0x00 => {
                        rest = &rest[1..];
                        Pointer::null()
                    }
                    0x01 => {
                        if rest.len() < 33 {
                            return Err(corrupt());
                        }
                        let mut h = [0u8; 32];
                        h.copy_from_slice(&rest[1..33]);
                        rest = &rest[33..];
                        Pointer::from_hash(h)
                    }
                    _ => return Err(DbError::Codec("bad leaf marker".into())),
                };
                if rest.len() != 64 {
                    return Err(corrupt());
                }
                let mut left = [0u8; 32];
                left.copy_from_slice(&rest[..32]);
                let mut right = [0u8; 32];
                right.copy_from_slice(&rest[32..]);
                Ok(Node::Internal(InternalNode {
                    hash: EMPTY_HASH,
                    label,
                    label_bit_length,
                    leaf,
                    left: Pointer::from_hash(left),
                    right: Pointer::from_hash(right),
                }))
            }
            other => Err(DbError::Codec(format!("unknown node tag {other}"))),
        }
    }

    /// Recompute and store the canonical hash.
    pub fn update_hash(&mut self) {
        let hash: Hash = blake3::hash(&self.encode()).into();
        match self {
            Node::Internal(n) => n.hash = hash,
            Node::Leaf(n) => n.hash = hash,
        }
    }

    pub fn hash(&self) -> Hash {
        match self {
            Node::Internal(n) => n.hash,
            Node::Leaf(n) => n.hash,
        }
    }

    /// A clean copy with hash-only child pointers and buffers independent
    /// of this node.
    pub fn extract(&self) -> Node {
        match self {
            Node::Leaf(n) => Node::Leaf(LeafNode {
                hash: n.hash,
                key: n.key.clone(),
                value: n.value.clone(),
            }),
            Node::Internal(n) => Node::Internal(InternalNode {
                hash: n.hash,
                label: n.label.clone(),
                label_bit_length: n.label_bit_length,
                leaf: Pointer::from_hash(n.leaf.hash),
                left: Pointer::from_hash(n.left.hash),
                right: Pointer::from_hash(n.right.hash),
            }),
        }
    }
}

/// Split a 4-byte little-endian length prefix and that many bytes off the
/// front of `data`.
fn take_prefixed(data: &[u8]) -> Option<(&[u8], &[u8])> {
    if data.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let rest = &data[4..];
    if rest.len() < len {
        return None;
    }
    Some((&rest[..len], &rest[len..]))
}

/// Number of bytes needed to store `bits` bits.
pub fn bit_bytes(bits: Depth) -> usize {
    (bits as usize + 7) / 8
}

/// Bit at position `pos` (most significant bit first).
pub fn bit_at(bytes: &[u8], pos: Depth) -> bool {
    let byte = pos as usize / 8;
    let bit = 7 - (pos as usize % 8);
    (bytes[byte] >> bit) & 1 == 1
}

/// Set bit `pos` in `bytes` (most significant bit first).
pub fn set_bit(bytes: &mut [u8], pos: Depth, value: bool) {
    let byte = pos as usize / 8;
    let bit = 7 - (pos as usize % 8);
    if value {
        bytes[byte] |= 1 << bit;
    } else {
        bytes[byte] &= !(1 << bit);
    }
}

/// Copy `len` bits of `key` starting at bit `start` into a fresh packed
/// buffer starting at bit 0.
pub fn extract_bits(key: &[u8], start: Depth, len: Depth) -> Vec<u8> {
    let mut out = vec![0u8; bit_bytes(len)];
    for i in 0..len {
        if bit_at(key, start + i) {
            set_bit(&mut out, i, true);
        }
    }
    out
}

/// Length of the common prefix, in bits, between `key` starting at
/// `key_start` (with `key_bits` total bits) and `label` of `label_bits` bits.
pub fn common_prefix_len(
    key: &[u8],
    key_start: Depth,
    key_bits: Depth,
    label: &[u8],
    label_bits: Depth,
) -> Depth {
    let max = label_bits.min(key_bits.saturating_sub(key_start));
    let mut i = 0;
    while i < max && bit_at(key, key_start + i) == bit_at(label, i) {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_hash_matches_blake3_of_nothing() {
        let expected: Hash = blake3::hash(b"").into();
        assert_eq!(EMPTY_HASH, expected);
    }

    #[test]
    fn leaf_encoding_round_trips() {
        let leaf = LeafNode::new(b"a golden key".to_vec(), b"value".to_vec());
        let encoded = leaf.encode();
        let decoded = Node::decode(&encoded).expect("decode leaf");
        match &decoded {
            Node::Leaf(n) => {
                assert_eq!(n.key, leaf.key);
                assert_eq!(n.value, leaf.value);
                assert_eq!(n.hash, leaf.hash);
            }
            other => panic!("unexpected node: {other:?}"),
        }
        assert_eq!(decoded.encode(), encoded);
    }

    #[test]
    fn internal_encoding_round_trips() {
        let leaf = LeafNode::new(b"abc".to_vec(), b"v".to_vec());
        let mut node = Node::Internal(InternalNode {
            hash: EMPTY_HASH,
            label: vec![0b1010_1010, 0b1100_0000],
            label_bit_length: 10,
            leaf: Pointer::from_hash(leaf.hash),
            left: Pointer::from_hash([1u8; 32]),
            right: Pointer::from_hash([2u8; 32]),
        });
        node.update_hash();
        let encoded = node.encode();
        let decoded = Node::decode(&encoded).expect("decode internal");
        match &decoded {
            Node::Internal(n) => {
                assert_eq!(n.label_bit_length, 10);
                assert_eq!(n.label, vec![0b1010_1010, 0b1100_0000]);
                assert_eq!(n.leaf.hash, leaf.hash);
                assert_eq!(n.left.hash, [1u8; 32]);
                assert_eq!(n.right.hash, [2u8; 32]);
                assert!(n.left.clean && n.right.clean && n.leaf.clean);
                assert!(n.left.node.is_none());
            }
            other => panic!("unexpected node: {other:?}"),
        }
        assert_eq!(decoded.hash(), node.hash());
        assert_eq!(decoded.encode(), encoded);
    }

    #[test]
    fn internal_without_leaf_round_trips() {
        let mut node = Node::Internal(InternalNode {
            hash: EMPTY_HASH,
            label: Vec::new(),
            label_bit_length: 0,
            leaf: Pointer::null(),
            left: Pointer::from_hash([3u8; 32]),
            right: Pointer::from_hash([4u8; 32]),
        });
        node.update_hash();
        let decoded = Node::decode(&node.encode()).expect("decode");
        match decoded {
            Node::Internal(n) => assert!(n.leaf.is_null()),
            other => panic!("unexpected node: {other:?}"),
        }
    }

    #[test]
    fn extract_is_independent_of_source() {
        let leaf = Node::Leaf(LeafNode::new(b"k".to_vec(), b"v".to_vec()));
        let extracted = leaf.extract();
        assert_eq!(extracted.hash(), leaf.hash());
        match (leaf, extracted) {
            (Node::Leaf(a), Node::Leaf(b)) => {
                assert_eq!(a.value, b.value);
                assert_ne!(a.value.as_ptr(), b.value.as_ptr());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn bit_helpers_agree() {
        let key = [0b1011_0001u8, 0b0100_0000];
        assert!(bit_at(&key, 0));
        assert!(!bit_at(&key, 1));
        assert!(bit_at(&key, 2));
        assert!(bit_at(&key, 9));
        let bits = extract_bits(&key, 2, 8);
        assert!(bit_at(&bits, 0));
        assert_eq!(common_prefix_len(&key, 2, 16, &bits, 8), 8);
    }

    #[test]
    fn typed_hash_round_trips() {
        let th = TypedHash::new(RootType::State, [7u8; 32]);
        let decoded = TypedHash::from_bytes(&th.to_bytes()).expect("decode");
        assert_eq!(th, decoded);
    }
}
