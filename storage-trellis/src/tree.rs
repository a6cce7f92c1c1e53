use std::collections::HashSet;
use std::sync::Arc;

use crate::batch::Batch;
use crate::db::NodeDb;
use crate::errors::{DbError, DbResult};
use crate::node::{
    bit_at, common_prefix_len, extract_bits, set_bit, Depth, Hash, InternalNode, LeafNode, Node,
    Pointer, Root, EMPTY_HASH,
};

/// Keys are addressed by bit position, which bounds their length.
const MAX_KEY_BYTES: usize = 8191;

fn key_bits(key: &[u8]) -> DbResult<Depth> {
    if key.len() > MAX_KEY_BYTES {
        return Err(DbError::InvalidArgument(format!(
            "key length {} exceeds the maximum of {MAX_KEY_BYTES} bytes",
            key.len()
        )));
    }
    Ok((key.len() * 8) as Depth)
}

/// In-memory view over one tree in the node database. Nodes are faulted in
/// lazily through clean pointers; mutations dirty the touched path and
/// nothing reaches the store until [`Tree::commit`].
pub struct Tree {
    db: Arc<NodeDb>,
    root: Root,
    pointer: Pointer,
    removed: Vec<Hash>,
}

impl Tree {
    /// Open a tree at `root`. A non-empty root must be registered in the
    /// store.
    pub fn new(db: Arc<NodeDb>, root: Root) -> DbResult<Tree> {
        if !root.is_empty() && !db.has_root(root) {
            return Err(DbError::RootNotFound);
        }
        let pointer = if root.is_empty() {
            Pointer::null()
        } else {
            Pointer::from_hash(root.hash)
        };
        Ok(Tree {
            db,
            root,
            pointer,
            removed: Vec::new(),
        })
    }

    pub fn get(&mut self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let bits = key_bits(key)?;
        get_at(&self.db, &self.root, &mut self.pointer, 0, key, bits)
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> DbResult<()> {
        let bits = key_bits(key)?;
        insert_at(
            &self.db,
            &self.root,
            &mut self.pointer,
            0,
            key,
            bits,
            value,
            &mut self.removed,
        )
    }

    /// Remove a key, returning whether it was present.
    pub fn remove(&mut self, key: &[u8]) -> DbResult<bool> {
        let bits = key_bits(key)?;
        remove_at(
            &self.db,
            &self.root,
            &mut self.pointer,
            0,
            key,
            bits,
            &mut self.removed,
        )
    }

    /// Hash the dirty subtree bottom-up, staging every fresh node and every
    /// displaced hash into `batch`, and return the new root hash.
    pub fn commit(&mut self, batch: &mut Batch) -> DbResult<Hash> {
        let root_hash = commit_ptr(&mut self.pointer, batch)?;
        let mut seen = HashSet::new();
        for hash in self.removed.drain(..) {
            if seen.insert(hash) {
                batch.remove_node(hash)?;
            }
        }
        Ok(root_hash)
    }
}

fn fault(db: &NodeDb, base: &Root, ptr: &mut Pointer) -> DbResult<()> {
    if ptr.node.is_some() || ptr.hash == EMPTY_HASH {
        return Ok(());
    }
    let node = db.get_node(*base, ptr)?;
    ptr.node = Some(Box::new(node));
    Ok(())
}

/// Record a persisted node that is being displaced and mark the pointer
/// dirty.
fn mark_dirty(ptr: &mut Pointer, removed: &mut Vec<Hash>) {
    if ptr.clean {
        if ptr.hash != EMPTY_HASH {
            removed.push(ptr.hash);
        }
        ptr.clean = false;
    }
}

fn get_at(
    db: &NodeDb,
    base: &Root,
    ptr: &mut Pointer,
    depth: Depth,
    key: &[u8],
    key_len: Depth,
) -> DbResult<Option<Vec<u8>>> {
    if ptr.is_null() {
        return Ok(None);
    }
    fault(db, base, ptr)?;
    let Some(node) = ptr.node.as_deref_mut() else {
        return Ok(None);
    };
    match node {
        Node::Leaf(leaf) => Ok((leaf.key == key).then(|| leaf.value.clone())),
        Node::Internal(internal) => {
            let cp = common_prefix_len(key, depth, key_len, &internal.label, internal.label_bit_length);
            if cp < internal.label_bit_length {
                return Ok(None);
            }
            let at = depth + internal.label_bit_length;
            if key_len == at {
                if internal.leaf.is_null() {
                    return Ok(None);
                }
                fault(db, base, &mut internal.leaf)?;
                match internal.leaf.node.as_deref() {
                    Some(Node::Leaf(leaf)) if leaf.key == key => Ok(Some(leaf.value.clone())),
                    _ => Ok(None),
                }
            } else {
                let child = if bit_at(key, at) {
                    &mut internal.right
                } else {
                    &mut internal.left
                };
                get_at(db, base, child, at + 1, key, key_len)
            }
        }
    }
}

/// Length of the common bit prefix of two keys starting at `start`.
fn common_key_prefix(a: &[u8], a_len: Depth, b: &[u8], b_len: Depth, start: Depth) -> Depth {
    let max = a_len.min(b_len).saturating_sub(start);
    let mut i = 0;
    while i < max && bit_at(a, start + i) == bit_at(b, start + i) {
        i += 1;
    }
    i
}

#[allow(clippy::too_many_arguments)]
fn insert_at(
    db: &NodeDb,
    base: &Root,
    ptr: &mut Pointer,
    depth: Depth,
    key: &[u8],
    key_len: Depth,
    value: &[u8],
    removed: &mut Vec<Hash>,
) -> DbResult<()> {
    if ptr.is_null() {
        *ptr = Pointer::from_node(Node::Leaf(LeafNode::new(key.to_vec(), value.to_vec())));
        return Ok(());
    }
    fault(db, base, ptr)?;
    let node = ptr
        .node
        .as_deref_mut()
        .ok_or_else(|| DbError::Corrupt("unresolvable pointer".into()))?;

    match node {
        Node::Leaf(leaf) => {
            if leaf.key == key {
                mark_dirty(ptr, removed);
                if let Some(Node::Leaf(leaf)) = ptr.node.as_deref_mut() {
                    leaf.value = value.to_vec();
                }
                return Ok(());
            }

            let existing_len = key_bits(&leaf.key)?;
            let existing_key = leaf.key.clone();
            let cp = common_key_prefix(key, key_len, &existing_key, existing_len, depth);
            let label = extract_bits(key, depth, cp);
            let at = depth + cp;

            // The existing leaf keeps its identity; only its position in
            // the tree changes.
            let old_leaf = Pointer {
                clean: ptr.clean,
                hash: ptr.hash,
                node: ptr.node.take(),
            };
            let new_leaf =
                Pointer::from_node(Node::Leaf(LeafNode::new(key.to_vec(), value.to_vec())));

            let mut internal = InternalNode {
                hash: EMPTY_HASH,
                label,
                label_bit_length: cp,
                leaf: Pointer::null(),
                left: Pointer::null(),
                right: Pointer::null(),
            };
            if key_len == at {
                internal.leaf = new_leaf;
                if bit_at(&existing_key, at) {
                    internal.right = old_leaf;
                } else {
                    internal.left = old_leaf;
                }
            } else if existing_len == at {
                internal.leaf = old_leaf;
                if bit_at(key, at) {
                    internal.right = new_leaf;
                } else {
                    internal.left = new_leaf;
                }
            } else if bit_at(key, at) {
                internal.right = new_leaf;
                internal.left = old_leaf;
            } else {
                internal.left = new_leaf;
                internal.right = old_leaf;
            }
            *ptr = Pointer::from_node(Node::Internal(internal));
            Ok(())
        }
        Node::Internal(internal) => {
            let cp =
                common_prefix_len(key, depth, key_len, &internal.label, internal.label_bit_length);

            if cp == internal.label_bit_length {
                mark_dirty(ptr, removed);
                let Some(Node::Internal(internal)) = ptr.node.as_deref_mut() else {
                    return Err(DbError::Corrupt("internal node vanished".into()));
                };
                let at = depth + internal.label_bit_length;
                if key_len == at {
                    if internal.leaf.is_null() {
                        internal.leaf = Pointer::from_node(Node::Leaf(LeafNode::new(
                            key.to_vec(),
                            value.to_vec(),
                        )));
                    } else {
                        mark_dirty(&mut internal.leaf, removed);
                        internal.leaf = Pointer::from_node(Node::Leaf(LeafNode::new(
                            key.to_vec(),
                            value.to_vec(),
                        )));
                    }
                    return Ok(());
                }
                let child = if bit_at(key, at) {
                    &mut internal.right
                } else {
                    &mut internal.left
                };
                return insert_at(db, base, child, at + 1, key, key_len, value, removed);
            }

            // Partial label match: split the node at the divergence point.
            mark_dirty(ptr, removed);
            let Some(node) = ptr.node.take() else {
                return Err(DbError::Corrupt("internal node vanished".into()));
            };
            let Node::Internal(mut old) = *node else {
                return Err(DbError::Corrupt("internal node changed kind".into()));
            };

            let at = depth + cp;
            let old_bit = bit_at(&old.label, cp);
            let parent_label = extract_bits(&old.label, 0, cp);
            old.label = extract_bits(&old.label, cp + 1, old.label_bit_length - cp - 1);
            old.label_bit_length -= cp + 1;
            let old_ptr = Pointer::from_node(Node::Internal(old));

            let mut parent = InternalNode {
                hash: EMPTY_HASH,
                label: parent_label,
                label_bit_length: cp,
                leaf: Pointer::null(),
                left: Pointer::null(),
                right: Pointer::null(),
            };
            let new_leaf =
                Pointer::from_node(Node::Leaf(LeafNode::new(key.to_vec(), value.to_vec())));
            if key_len == at {
                parent.leaf = new_leaf;
                if old_bit {
                    parent.right = old_ptr;
                } else {
                    parent.left = old_ptr;
                }
            } else if old_bit {
                parent.right = old_ptr;
                parent.left = new_leaf;
            } else {
                parent.left = old_ptr;
                parent.right = new_leaf;
            }
            *ptr = Pointer::from_node(Node::Internal(parent));
            Ok(())
        }
    }
}

fn remove_at(
    db: &NodeDb,
    base: &Root,
    ptr: &mut Pointer,
    depth: Depth,
    key: &[u8],
    key_len: Depth,
    removed: &mut Vec<Hash>,
) -> DbResult<bool> {
    if ptr.is_null() {
        return Ok(false);
    }
    fault(db, base, ptr)?;
    let Some(node) = ptr.node.as_deref_mut() else {
        return Ok(false);
    };

    match node {
        Node::Leaf(leaf) => {
            if leaf.key != key {
                return Ok(false);
            }
            mark_dirty(ptr, removed);
            *ptr = Pointer::null();
            Ok(true)
        }
        Node::Internal(internal) => {
            let cp =
                common_prefix_len(key, depth, key_len, &internal.label, internal.label_bit_length);
            if cp < internal.label_bit_length {
                return Ok(false);
            }
            let at = depth + internal.label_bit_length;

            let found = if key_len == at {
                if internal.leaf.is_null() {
                    false
                } else {
                    fault(db, base, &mut internal.leaf)?;
                    match internal.leaf.node.as_deref() {
                        Some(Node::Leaf(leaf)) if leaf.key == key => {
                            if internal.leaf.clean && internal.leaf.hash != EMPTY_HASH {
                                removed.push(internal.leaf.hash);
                            }
                            internal.leaf = Pointer::null();
                            true
                        }
                        _ => false,
                    }
                }
            } else {
                let child = if bit_at(key, at) {
                    &mut internal.right
                } else {
                    &mut internal.left
                };
                remove_at(db, base, child, at + 1, key, key_len, removed)?
            };

            if !found {
                return Ok(false);
            }
            mark_dirty(ptr, removed);
            canonicalize(db, base, ptr, removed)?;
            Ok(true)
        }
    }
}

/// Restore the minimal form after a removal: an internal node left with a
/// single occupant collapses into it, merging labels across the branch bit
/// where the occupant is itself internal.
fn canonicalize(
    db: &NodeDb,
    base: &Root,
    ptr: &mut Pointer,
    removed: &mut Vec<Hash>,
) -> DbResult<()> {
    let Some(Node::Internal(internal)) = ptr.node.as_deref_mut() else {
        return Ok(());
    };

    let has_leaf = !internal.leaf.is_null();
    let has_left = !internal.left.is_null();
    let has_right = !internal.right.is_null();

    match (has_leaf, has_left, has_right) {
        (false, false, false) => {
            *ptr = Pointer::null();
        }
        (true, false, false) => {
            let leaf = std::mem::replace(&mut internal.leaf, Pointer::null());
            *ptr = leaf;
        }
        (false, true, false) | (false, false, true) => {
            let branch_bit = has_right;
            let label = internal.label.clone();
            let label_len = internal.label_bit_length;
            let child_slot = if has_right {
                &mut internal.right
            } else {
                &mut internal.left
            };
            fault(db, base, child_slot)?;
            let mut child = std::mem::replace(child_slot, Pointer::null());

            // A lone leaf carries its full key; only internal children need
            // their label extended across the branch bit.
            let child_is_internal = matches!(child.node.as_deref(), Some(Node::Internal(_)));
            if child_is_internal {
                mark_dirty(&mut child, removed);
                if let Some(Node::Internal(grand)) = child.node.as_deref_mut() {
                    let merged_len = label_len + 1 + grand.label_bit_length;
                    let mut merged = vec![0u8; crate::node::bit_bytes(merged_len)];
                    for i in 0..label_len {
                        set_bit(&mut merged, i, bit_at(&label, i));
                    }
                    set_bit(&mut merged, label_len, branch_bit);
                    for i in 0..grand.label_bit_length {
                        set_bit(&mut merged, label_len + 1 + i, bit_at(&grand.label, i));
                    }
                    grand.label = merged;
                    grand.label_bit_length = merged_len;
                }
            }
            *ptr = child;
        }
        _ => {}
    }
    Ok(())
}

fn commit_ptr(ptr: &mut Pointer, batch: &mut Batch) -> DbResult<Hash> {
    if ptr.clean {
        return Ok(ptr.hash);
    }
    let node = ptr
        .node
        .as_deref_mut()
        .ok_or_else(|| DbError::Corrupt("dirty pointer without a node".into()))?;
    if let Node::Internal(internal) = node {
        commit_ptr(&mut internal.leaf, batch)?;
        commit_ptr(&mut internal.left, batch)?;
        commit_ptr(&mut internal.right, batch)?;
    }
    node.update_hash();
    batch.put_node(node)?;
    ptr.hash = node.hash();
    ptr.clean = true;
    Ok(ptr.hash)
}
