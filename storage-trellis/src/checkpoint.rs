use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::NodeDb;
use crate::errors::{DbError, DbResult};
use crate::node::{Node, Root, TypedHash, EMPTY_HASH};

/// Manifest describing a checkpoint of one root: the chunking parameters
/// and a digest per chunk. Serialized as JSON so operators can inspect it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u64,
    pub root: Root,
    pub chunk_size: usize,
    pub chunks: Vec<String>,
}

impl CheckpointManifest {
    pub fn to_json(&self) -> DbResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|err| DbError::Codec(format!("manifest encoding: {err}")))
    }

    pub fn from_json(data: &[u8]) -> DbResult<Self> {
        serde_json::from_slice(data)
            .map_err(|err| DbError::Codec(format!("manifest decoding: {err}")))
    }
}

fn chunk_digest(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// Enumerate every node reachable from `root` into chunks of at most
/// `chunk_size` encoded bytes (never splitting a node). The walk is a
/// depth-first pre-order traversal, so chunking is deterministic for a
/// given (version, root, chunk-size) triple and reads nothing but
/// finalized data.
pub fn create_checkpoint(
    db: &Arc<NodeDb>,
    root: Root,
    chunk_size: usize,
) -> DbResult<(CheckpointManifest, Vec<Vec<u8>>)> {
    if chunk_size == 0 {
        return Err(DbError::InvalidArgument(
            "checkpoint chunk size must be positive".into(),
        ));
    }
    if !db.has_root(root) {
        return Err(DbError::RootNotFound);
    }

    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut current: Vec<Vec<u8>> = Vec::new();
    let mut current_size = 0usize;
    let mut visited: HashSet<TypedHash> = HashSet::new();
    let mut stack = vec![root.hash];

    while let Some(hash) = stack.pop() {
        if hash == EMPTY_HASH {
            continue;
        }
        let typed = TypedHash::new(root.root_type, hash);
        if !visited.insert(typed) {
            continue;
        }
        let (node, _) = db.fetch_node(&typed)?;
        let encoded = node.encode();
        if !current.is_empty() && current_size + encoded.len() > chunk_size {
            chunks.push(seal_chunk(std::mem::take(&mut current))?);
            current_size = 0;
        }
        current_size += encoded.len();
        current.push(encoded);

        if let Node::Internal(internal) = node {
            // Pushed in reverse so the walk visits leaf, left, right.
            stack.push(internal.right.hash);
            stack.push(internal.left.hash);
            stack.push(internal.leaf.hash);
        }
    }
    if !current.is_empty() {
        chunks.push(seal_chunk(current)?);
    }

    let manifest = CheckpointManifest {
        version: root.version,
        root,
        chunk_size,
        chunks: chunks.iter().map(|chunk| chunk_digest(chunk)).collect(),
    };
    info!(root = %root, chunks = manifest.chunks.len(), "checkpoint created");
    Ok((manifest, chunks))
}

fn seal_chunk(nodes: Vec<Vec<u8>>) -> DbResult<Vec<u8>> {
    Ok(bincode::serialize(&nodes)?)
}

/// Ingest checkpoint chunks under a multipart restore for the manifest's
/// version. On any failure the restore is aborted, deleting every node it
/// inserted. The caller closes the restore by finalizing the version.
pub fn restore_checkpoint(
    db: &Arc<NodeDb>,
    manifest: &CheckpointManifest,
    chunks: &[Vec<u8>],
) -> DbResult<()> {
    if chunks.len() != manifest.chunks.len() {
        return Err(DbError::InvalidArgument(
            "chunk count does not match the manifest".into(),
        ));
    }
    db.start_multipart_insert(manifest.version)?;

    let result = restore_chunks(db, manifest, chunks);
    if let Err(err) = &result {
        warn!(error = %err, root = %manifest.root, "checkpoint restore failed, aborting");
        db.abort_multipart_insert()?;
    }
    result
}

fn restore_chunks(
    db: &Arc<NodeDb>,
    manifest: &CheckpointManifest,
    chunks: &[Vec<u8>],
) -> DbResult<()> {
    for (index, chunk) in chunks.iter().enumerate() {
        if chunk_digest(chunk) != manifest.chunks[index] {
            return Err(DbError::ChunkCorrupted { index });
        }
        let nodes: Vec<Vec<u8>> = bincode::deserialize(chunk)?;
        let old_root = Root::empty(
            manifest.root.namespace,
            manifest.version,
            manifest.root.root_type,
        );
        let mut batch = db.new_batch(old_root, manifest.version, true)?;
        for encoded in &nodes {
            let node = Node::decode(encoded)?;
            batch.put_node(&node)?;
        }
        batch.commit(manifest.root)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DbConfig, NodeDb};
    use crate::node::{Namespace, Pointer, RootType};
    use crate::tree::Tree;

    const NS: Namespace = [0x99; 32];

    fn build_finalized_tree(db: &Arc<NodeDb>, entries: usize) -> Root {
        let empty = Root::empty(NS, 0, RootType::State);
        let mut tree = Tree::new(db.clone(), empty).expect("tree");
        for i in 0..entries {
            tree.insert(format!("key-{i:03}").as_bytes(), format!("value-{i}").as_bytes())
                .expect("insert");
        }
        let mut batch = db.new_batch(empty, 0, false).expect("batch");
        let hash = tree.commit(&mut batch).expect("commit tree");
        let root = Root::new(NS, 0, RootType::State, hash);
        batch.commit(root).expect("commit batch");
        db.finalize(0, &[root]).expect("finalize");
        root
    }

    #[test]
    fn chunk_enumeration_is_deterministic() {
        let db = NodeDb::open(DbConfig::memory(NS)).expect("open");
        let root = build_finalized_tree(&db, 24);

        let (manifest_a, chunks_a) = create_checkpoint(&db, root, 512).expect("checkpoint");
        let (manifest_b, chunks_b) = create_checkpoint(&db, root, 512).expect("checkpoint");
        assert_eq!(manifest_a.chunks, manifest_b.chunks);
        assert_eq!(chunks_a, chunks_b);
        assert!(manifest_a.chunks.len() > 1);
    }

    #[test]
    fn restore_round_trips_through_a_fresh_store() {
        let source = NodeDb::open(DbConfig::memory(NS)).expect("open source");
        let root = build_finalized_tree(&source, 16);
        let (manifest, chunks) = create_checkpoint(&source, root, 1024).expect("checkpoint");

        let target = NodeDb::open(DbConfig::memory(NS)).expect("open target");
        restore_checkpoint(&target, &manifest, &chunks).expect("restore");
        target.finalize(0, &[root]).expect("finalize restore");

        let mut tree = Tree::new(target.clone(), root).expect("tree");
        assert_eq!(
            tree.get(b"key-007").expect("get"),
            Some(b"value-7".to_vec())
        );
    }

    #[test]
    fn corrupt_chunk_aborts_the_restore() {
        let source = NodeDb::open(DbConfig::memory(NS)).expect("open source");
        let root = build_finalized_tree(&source, 16);
        let (manifest, mut chunks) = create_checkpoint(&source, root, 256).expect("checkpoint");
        assert!(chunks.len() >= 2);

        // Let the earlier chunks land, then fail on the last one.
        let last = chunks.len() - 1;
        chunks[last][0] ^= 0xff;

        let target = NodeDb::open(DbConfig::memory(NS)).expect("open target");
        let err = restore_checkpoint(&target, &manifest, &chunks).expect_err("corrupt chunk");
        assert!(matches!(err, DbError::ChunkCorrupted { index } if index == last));

        // The abort removed every node the earlier chunks had inserted.
        assert!(target
            .get_node(root, &Pointer::from_hash(root.hash))
            .is_err());
        assert_eq!(target.get_earliest_version(), 0);
    }

    #[test]
    fn manifest_survives_json_round_trip() {
        let db = NodeDb::open(DbConfig::memory(NS)).expect("open");
        let root = build_finalized_tree(&db, 4);
        let (manifest, _) = create_checkpoint(&db, root, 4096).expect("checkpoint");
        let decoded =
            CheckpointManifest::from_json(&manifest.to_json().expect("encode")).expect("decode");
        assert_eq!(decoded.root, manifest.root);
        assert_eq!(decoded.chunks, manifest.chunks);
    }
}
