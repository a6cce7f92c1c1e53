use std::sync::Arc;

use crate::backend::WriteOp;
use crate::db::NodeDb;
use crate::errors::{DbError, DbResult};
use crate::meta::{RootsMetadata, UpdatedNode, MULTIPART_VERSION_NONE};
use crate::node::{Hash, Node, Root, TypedHash};
use crate::schema;
use crate::writelog::{self, WriteLog};

/// Staging area for node writes under a pending (old-root → new-root)
/// transition. Nothing touches the store until [`Batch::commit`], which
/// flushes node data first and seals the metadata transaction last, so a
/// crash in between leaves only orphan nodes behind.
pub struct Batch {
    db: Arc<NodeDb>,
    old_root: Root,
    version: u64,
    chunk: bool,
    multipart: bool,

    node_ops: Vec<WriteOp>,
    multipart_ops: Vec<WriteOp>,
    updated: Vec<UpdatedNode>,
    write_log: Option<(WriteLog, Vec<Option<Hash>>)>,
}

impl Batch {
    pub(crate) fn new(
        db: Arc<NodeDb>,
        old_root: Root,
        version: u64,
        chunk: bool,
        multipart: bool,
    ) -> Self {
        Batch {
            db,
            old_root,
            version,
            chunk,
            multipart,
            node_ops: Vec::new(),
            multipart_ops: Vec::new(),
            updated: Vec::new(),
            write_log: None,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Stage a node insert. The node record carries the batch version as
    /// its created-version; during a multipart restore, nodes new to the
    /// store are also indexed in the restore log.
    pub fn put_node(&mut self, node: &Node) -> DbResult<()> {
        let typed = TypedHash::new(self.old_root.root_type, node.hash());
        self.updated.push(UpdatedNode {
            hash: typed,
            removed: false,
        });

        let key = schema::node_key(&typed);
        if self.multipart && !self.db.backend.contains(&key) {
            self.multipart_ops
                .push(WriteOp::put(schema::multipart_key(&typed), Vec::new()));
        }

        let encoded = node.encode();
        let mut value = Vec::with_capacity(8 + encoded.len());
        value.extend_from_slice(&self.version.to_le_bytes());
        value.extend_from_slice(&encoded);
        self.node_ops.push(WriteOp::put(key, value));
        Ok(())
    }

    /// Record that a previously persisted node was displaced by this
    /// transition. Not available when importing checkpoint chunks.
    pub fn remove_node(&mut self, hash: Hash) -> DbResult<()> {
        if self.chunk {
            return Err(DbError::InvalidArgument(
                "cannot remove nodes in chunk mode".into(),
            ));
        }
        self.updated.push(UpdatedNode {
            hash: TypedHash::new(self.old_root.root_type, hash),
            removed: true,
        });
        Ok(())
    }

    /// Attach the write log for this transition, together with the leaf
    /// annotations produced by the tree commit.
    pub fn put_write_log(
        &mut self,
        write_log: WriteLog,
        annotations: Vec<Option<Hash>>,
    ) -> DbResult<()> {
        if self.chunk {
            return Err(DbError::InvalidArgument(
                "cannot store a write log in chunk mode".into(),
            ));
        }
        if self.db.config.discard_write_logs {
            return Ok(());
        }
        if write_log.len() != annotations.len() {
            return Err(DbError::InvalidArgument(
                "write log and annotations must have the same length".into(),
            ));
        }
        self.write_log = Some((write_log, annotations));
        Ok(())
    }

    /// Atomically commit the staged writes as `root`.
    pub fn commit(mut self, root: Root) -> DbResult<()> {
        let mut meta = self.db.meta.lock();

        let multipart = meta.multipart_version;
        if multipart != MULTIPART_VERSION_NONE && multipart != root.version {
            return Err(DbError::InvalidMultipartVersion);
        }
        if root.namespace != self.db.config.namespace {
            return Err(DbError::BadNamespace);
        }
        if !root.follows(&self.old_root) {
            return Err(DbError::RootMustFollowOld);
        }
        if root.version != self.version {
            return Err(DbError::InvalidArgument(
                "committed root version does not match the batch version".into(),
            ));
        }
        if let Some(last) = meta.last_finalized_version {
            if last >= root.version {
                return Err(DbError::AlreadyFinalized);
            }
        }

        let mut roots_meta = RootsMetadata::load(&self.db.backend, root.version)?;
        let root_hash = root.typed_hash();
        let mut meta_ops: Vec<WriteOp> = Vec::new();

        let mut roots_changed = false;
        if roots_meta.roots.contains_key(&root_hash) {
            // The root already exists; the contents are identical by
            // construction, so there is nothing to do. Chunk imports may
            // legitimately commit the same root more than once.
            if !self.chunk {
                return Ok(());
            }
        } else {
            roots_meta.roots.insert(root_hash, Vec::new());
            roots_changed = true;
        }

        if self.chunk {
            let empty: Vec<UpdatedNode> = Vec::new();
            meta_ops.push(WriteOp::put(
                schema::updated_nodes_key(root.version, &root_hash),
                bincode::serialize(&empty)?,
            ));
        } else {
            let old_hash = self.old_root.typed_hash();
            if !self.old_root.is_empty() {
                if self.old_root.version < meta.earliest_version
                    && self.old_root.version != root.version
                {
                    return Err(DbError::PreviousVersionMismatch);
                }
                if self.old_root.version == root.version {
                    let derived = roots_meta
                        .roots
                        .get_mut(&old_hash)
                        .ok_or(DbError::RootNotFound)?;
                    if !derived.contains(&root_hash) {
                        derived.push(root_hash);
                        roots_changed = true;
                    }
                } else {
                    let mut old_meta =
                        RootsMetadata::load(&self.db.backend, self.old_root.version)?;
                    let derived = old_meta
                        .roots
                        .get_mut(&old_hash)
                        .ok_or(DbError::RootNotFound)?;
                    if !derived.contains(&root_hash) {
                        derived.push(root_hash);
                    }
                    meta_ops.push(WriteOp::put(
                        schema::roots_key(self.old_root.version),
                        old_meta.encode()?,
                    ));
                }
            }

            meta_ops.push(WriteOp::put(
                schema::updated_nodes_key(root.version, &root_hash),
                bincode::serialize(&self.updated)?,
            ));

            if let Some((write_log, annotations)) = self.write_log.take() {
                let hashed = writelog::into_hashed(&write_log, &annotations);
                self.node_ops.push(WriteOp::put(
                    schema::writelog_key(root.version, &root_hash, &old_hash),
                    bincode::serialize(&hashed)?,
                ));
            }
        }

        if roots_changed {
            meta_ops.push(WriteOp::put(
                schema::roots_key(root.version),
                roots_meta.encode()?,
            ));
        }

        // Flush order matters for crash recovery: restore log first, then
        // node data, metadata seal last.
        self.db.backend.apply(std::mem::take(&mut self.multipart_ops))?;
        self.db.backend.apply(std::mem::take(&mut self.node_ops))?;
        self.db.backend.apply(meta_ops)?;
        drop(meta);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DbConfig, NodeDb};
    use crate::node::{LeafNode, Namespace, RootType};

    const NS: Namespace = [0x33; 32];

    fn state_root(version: u64, hash: Hash) -> Root {
        Root::new(NS, version, RootType::State, hash)
    }

    #[test]
    fn commit_registers_root_and_derived_link() {
        let db = NodeDb::open(DbConfig::memory(NS)).expect("open");
        let leaf = Node::Leaf(LeafNode::new(b"k".to_vec(), b"v".to_vec()));

        let old = Root::empty(NS, 0, RootType::State);
        let mut batch = db.new_batch(old, 0, false).expect("batch");
        batch.put_node(&leaf).expect("put node");
        let root = state_root(0, leaf.hash());
        batch.commit(root).expect("commit");
        assert!(db.has_root(root));

        // Derive a child at the next version.
        let leaf2 = Node::Leaf(LeafNode::new(b"k".to_vec(), b"w".to_vec()));
        let mut batch = db.new_batch(root, 1, false).expect("batch");
        batch.put_node(&leaf2).expect("put node");
        let child = state_root(1, leaf2.hash());
        batch.commit(child).expect("commit child");

        let roots = db.get_roots_for_version(1).expect("roots");
        assert_eq!(roots, vec![child]);
    }

    #[test]
    fn commit_rejects_unknown_old_root() {
        let db = NodeDb::open(DbConfig::memory(NS)).expect("open");
        let ghost = state_root(0, [0xaa; 32]);
        let leaf = Node::Leaf(LeafNode::new(b"k".to_vec(), b"v".to_vec()));
        let mut batch = db.new_batch(ghost, 1, false).expect("batch");
        batch.put_node(&leaf).expect("put node");
        let err = batch
            .commit(state_root(1, leaf.hash()))
            .expect_err("old root is not registered");
        assert!(matches!(err, DbError::RootNotFound));
    }

    #[test]
    fn commit_rejects_finalized_version() {
        let db = NodeDb::open(DbConfig::memory(NS)).expect("open");
        let leaf = Node::Leaf(LeafNode::new(b"k".to_vec(), b"v".to_vec()));
        let old = Root::empty(NS, 0, RootType::State);
        let mut batch = db.new_batch(old, 0, false).expect("batch");
        batch.put_node(&leaf).expect("put node");
        let root = state_root(0, leaf.hash());
        batch.commit(root).expect("commit");
        db.finalize(0, &[root]).expect("finalize");

        let mut batch = db.new_batch(old, 0, false).expect("batch");
        let leaf2 = Node::Leaf(LeafNode::new(b"x".to_vec(), b"y".to_vec()));
        batch.put_node(&leaf2).expect("put node");
        let err = batch
            .commit(state_root(0, leaf2.hash()))
            .expect_err("version already finalized");
        assert!(matches!(err, DbError::AlreadyFinalized));
    }

    #[test]
    fn duplicate_commit_is_a_no_op() {
        let db = NodeDb::open(DbConfig::memory(NS)).expect("open");
        let leaf = Node::Leaf(LeafNode::new(b"k".to_vec(), b"v".to_vec()));
        let old = Root::empty(NS, 0, RootType::State);
        let root = state_root(0, leaf.hash());
        for _ in 0..2 {
            let mut batch = db.new_batch(old, 0, false).expect("batch");
            batch.put_node(&leaf).expect("put node");
            batch.commit(root).expect("commit");
        }
        assert_eq!(db.get_roots_for_version(0).expect("roots"), vec![root]);
    }

    #[test]
    fn chunk_mode_requires_multipart() {
        let db = NodeDb::open(DbConfig::memory(NS)).expect("open");
        let old = Root::empty(NS, 3, RootType::State);
        assert!(matches!(
            db.new_batch(old, 3, true),
            Err(DbError::MultipartInProgress)
        ));

        db.start_multipart_insert(3).expect("start multipart");
        assert!(matches!(
            db.new_batch(old, 3, false),
            Err(DbError::MultipartInProgress)
        ));
        let mut batch = db.new_batch(old, 3, true).expect("chunk batch");
        assert!(batch.remove_node([1u8; 32]).is_err());
        assert!(batch.put_write_log(Vec::new(), Vec::new()).is_err());
    }
}
