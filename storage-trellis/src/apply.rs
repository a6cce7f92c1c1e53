use std::sync::Arc;

use tracing::debug;

use crate::db::NodeDb;
use crate::errors::{DbError, DbResult};
use crate::node::{Hash, Namespace, Root, RootType};
use crate::tree::Tree;
use crate::writelog::{self, WriteLog};

/// A request to apply a write log, turning `src_root` into `dst_root`.
#[derive(Clone, Debug)]
pub struct ApplyRequest<'a> {
    pub namespace: Namespace,
    pub root_type: RootType,
    pub src_version: u64,
    pub src_root: Hash,
    pub dst_version: u64,
    pub dst_root: Hash,
    pub write_log: &'a WriteLog,
}

/// Apply a write log on top of the source root and commit the result. The
/// computed root must match the expected destination root; a destination
/// root that is already present makes the whole call a no-op, which also
/// covers empty epoch-transition diffs.
pub fn apply(db: &Arc<NodeDb>, request: &ApplyRequest<'_>) -> DbResult<Root> {
    let dst = Root::new(
        request.namespace,
        request.dst_version,
        request.root_type,
        request.dst_root,
    );
    if db.has_root(dst) {
        debug!(root = %dst, "destination root already present, skipping apply");
        return Ok(dst);
    }

    let src = Root::new(
        request.namespace,
        request.src_version,
        request.root_type,
        request.src_root,
    );
    let mut tree = Tree::new(db.clone(), src)?;
    for entry in request.write_log {
        match &entry.value {
            Some(value) => tree.insert(&entry.key, value)?,
            None => {
                tree.remove(&entry.key)?;
            }
        }
    }

    let mut batch = db.new_batch(src, request.dst_version, false)?;
    let computed = tree.commit(&mut batch)?;
    if computed != request.dst_root {
        return Err(DbError::RootMismatch {
            expected: hex::encode(request.dst_root),
            computed: hex::encode(computed),
        });
    }
    batch.put_write_log(request.write_log.clone(), writelog::annotate(request.write_log))?;
    batch.commit(dst)?;
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DbConfig, NodeDb};
    use crate::node::EMPTY_HASH;
    use crate::writelog::LogEntry;

    const NS: Namespace = [0x77; 32];

    fn expected_root(db: &Arc<NodeDb>, src: Root, log: &WriteLog, version: u64) -> Hash {
        // Dry-run the tree to learn the root hash without committing.
        let mut tree = Tree::new(db.clone(), src).expect("tree");
        for entry in log {
            match &entry.value {
                Some(value) => tree.insert(&entry.key, value).expect("insert"),
                None => {
                    tree.remove(&entry.key).expect("remove");
                }
            }
        }
        let mut batch = db.new_batch(src, version, false).expect("batch");
        tree.commit(&mut batch).expect("commit")
    }

    #[test]
    fn apply_commits_and_registers_the_destination() {
        let db = NodeDb::open(DbConfig::memory(NS)).expect("open");
        let log = vec![LogEntry::insert(b"k".to_vec(), b"v".to_vec())];
        let src = Root::empty(NS, 0, RootType::State);
        let dst_hash = expected_root(&db, src, &log, 1);

        let dst = apply(
            &db,
            &ApplyRequest {
                namespace: NS,
                root_type: RootType::State,
                src_version: 0,
                src_root: EMPTY_HASH,
                dst_version: 1,
                dst_root: dst_hash,
                write_log: &log,
            },
        )
        .expect("apply");
        assert!(db.has_root(dst));
    }

    #[test]
    fn apply_rejects_a_wrong_destination_root() {
        let db = NodeDb::open(DbConfig::memory(NS)).expect("open");
        let log = vec![LogEntry::insert(b"k".to_vec(), b"v".to_vec())];
        let err = apply(
            &db,
            &ApplyRequest {
                namespace: NS,
                root_type: RootType::State,
                src_version: 0,
                src_root: EMPTY_HASH,
                dst_version: 1,
                dst_root: [0xde; 32],
                write_log: &log,
            },
        )
        .expect_err("mismatched root");
        assert!(matches!(err, DbError::RootMismatch { .. }));
    }

    #[test]
    fn empty_log_onto_the_empty_root_creates_nothing() {
        let db = NodeDb::open(DbConfig::memory(NS)).expect("open");
        let log = WriteLog::new();
        apply(
            &db,
            &ApplyRequest {
                namespace: NS,
                root_type: RootType::State,
                src_version: 0,
                src_root: EMPTY_HASH,
                dst_version: 0,
                dst_root: EMPTY_HASH,
                write_log: &log,
            },
        )
        .expect("apply");
        assert!(db.get_roots_for_version(0).expect("roots").is_empty());
    }
}
