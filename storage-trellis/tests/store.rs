//! End-to-end store behavior: commit, finalize, prune, write-log
//! reconstruction and multipart crash recovery.

use std::sync::Arc;

use storage_trellis::apply::{apply, ApplyRequest};
use storage_trellis::db::{DbConfig, NodeDb};
use storage_trellis::errors::DbError;
use storage_trellis::node::{Hash, Namespace, Pointer, Root, RootType, EMPTY_HASH};
use storage_trellis::tree::Tree;
use storage_trellis::writelog::{LogEntry, WriteLog};

const NS: Namespace = [0xab; 32];

fn state_root(version: u64, hash: Hash) -> Root {
    Root::new(NS, version, RootType::State, hash)
}

/// Compute the root hash a write log produces without committing anything.
fn dry_run(db: &Arc<NodeDb>, src: Root, log: &WriteLog, version: u64) -> Hash {
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

fn apply_log(db: &Arc<NodeDb>, src: Root, log: &WriteLog, version: u64) -> Root {
    let dst_hash = dry_run(db, src, log, version);
    apply(
        db,
        &ApplyRequest {
            namespace: NS,
            root_type: RootType::State,
            src_version: src.version,
            src_root: src.hash,
            dst_version: version,
            dst_root: dst_hash,
            write_log: log,
        },
    )
    .expect("apply")
}

#[test]
fn fresh_start_with_empty_genesis() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = NodeDb::open(DbConfig::new(dir.path().to_path_buf(), NS)).expect("open");

    // Apply genesis with an empty write log at round zero.
    apply(
        &db,
        &ApplyRequest {
            namespace: NS,
            root_type: RootType::State,
            src_version: 0,
            src_root: EMPTY_HASH,
            dst_version: 0,
            dst_root: EMPTY_HASH,
            write_log: &WriteLog::new(),
        },
    )
    .expect("apply genesis");
    db.finalize(0, &[Root::empty(NS, 0, RootType::State)])
        .expect("finalize genesis");

    assert_eq!(db.get_earliest_version(), 0);
    assert_eq!(db.get_latest_version(), 0);
    assert!(db.has_root(Root::empty(NS, 0, RootType::State)));
}

#[test]
fn single_apply_then_read_back() {
    let db = NodeDb::open(DbConfig::memory(NS)).expect("open");
    let genesis = Root::empty(NS, 0, RootType::State);
    db.finalize(0, &[genesis]).expect("finalize genesis");

    let log = vec![LogEntry::insert(b"k".to_vec(), b"v".to_vec())];
    let rs1 = apply_log(&db, genesis, &log, 1);
    db.finalize(1, &[rs1]).expect("finalize round 1");

    // The committed leaf is readable through the store.
    let mut tree = Tree::new(db.clone(), rs1).expect("tree");
    assert_eq!(tree.get(b"k").expect("get"), Some(b"v".to_vec()));

    // And the write log reconstructs exactly.
    let recovered = db.get_write_log(genesis, rs1).expect("write log");
    assert_eq!(recovered, log);
}

#[test]
fn non_finalized_sibling_is_discarded() {
    let db = NodeDb::open(DbConfig::memory(NS)).expect("open");
    let genesis = Root::empty(NS, 0, RootType::State);
    db.finalize(0, &[genesis]).expect("finalize genesis");

    let base = apply_log(
        &db,
        genesis,
        &vec![LogEntry::insert(b"base".to_vec(), b"b".to_vec())],
        1,
    );
    db.finalize(1, &[base]).expect("finalize round 1");

    // Two children of the same parent at round 2.
    let log_a = vec![LogEntry::insert(b"fork".to_vec(), b"a".to_vec())];
    let log_b = vec![LogEntry::insert(b"fork".to_vec(), b"b".to_vec())];
    let a = apply_log(&db, base, &log_a, 2);
    let b = apply_log(&db, base, &log_b, 2);
    assert_ne!(a.hash, b.hash);

    db.finalize(2, &[a]).expect("finalize a");

    assert!(db.has_root(a));
    assert!(!db.has_root(b));

    // Nodes unique to the losing fork are gone; the winner still reads.
    let fork_b_leaf =
        storage_trellis::node::LeafNode::new(b"fork".to_vec(), b"b".to_vec()).hash;
    assert!(matches!(
        db.get_node(state_root(2, b.hash), &Pointer::from_hash(fork_b_leaf)),
        Err(DbError::NodeNotFound)
    ));
    let mut tree = Tree::new(db.clone(), a).expect("tree");
    assert_eq!(tree.get(b"fork").expect("get"), Some(b"a".to_vec()));

    // The losing fork's write log went with it.
    assert!(matches!(
        db.get_write_log(base, b),
        Err(DbError::WriteLogNotFound)
    ));
}

#[test]
fn prune_earliest_keeps_later_state_readable() {
    let db = NodeDb::open(DbConfig::memory(NS)).expect("open");
    let genesis = Root::empty(NS, 0, RootType::State);
    db.finalize(0, &[genesis]).expect("finalize genesis");

    let r1 = apply_log(
        &db,
        genesis,
        &vec![LogEntry::insert(b"one".to_vec(), b"1".to_vec())],
        1,
    );
    db.finalize(1, &[r1]).expect("finalize 1");
    let r2 = apply_log(
        &db,
        r1,
        &vec![LogEntry::insert(b"two".to_vec(), b"2".to_vec())],
        2,
    );
    db.finalize(2, &[r2]).expect("finalize 2");

    db.prune(0).expect("prune 0");
    db.prune(1).expect("prune 1");
    assert_eq!(db.get_earliest_version(), 2);

    // Only the empty-hash fast path keeps answering for pruned versions.
    assert!(db.has_root(genesis));
    assert!(!db.has_root(r1));
    assert!(db.get_roots_for_version(0).expect("roots").is_empty());
    assert!(db.get_roots_for_version(1).expect("roots").is_empty());

    // Nodes shared into round 2 survive; state remains fully readable.
    let mut tree = Tree::new(db.clone(), r2).expect("tree");
    assert_eq!(tree.get(b"one").expect("get"), Some(b"1".to_vec()));
    assert_eq!(tree.get(b"two").expect("get"), Some(b"2".to_vec()));

    // Reads against pruned versions fail.
    assert!(matches!(
        db.get_node(r1, &Pointer::from_hash(r1.hash)),
        Err(DbError::NodeNotFound)
    ));
}

#[test]
fn prune_refuses_the_last_finalized_version() {
    let db = NodeDb::open(DbConfig::memory(NS)).expect("open");
    let genesis = Root::empty(NS, 0, RootType::State);
    db.finalize(0, &[genesis]).expect("finalize genesis");
    assert!(matches!(db.prune(0), Err(DbError::NotFinalized)));

    let r1 = apply_log(
        &db,
        genesis,
        &vec![LogEntry::insert(b"k".to_vec(), b"v".to_vec())],
        1,
    );
    db.finalize(1, &[r1]).expect("finalize 1");
    let r2 = apply_log(
        &db,
        r1,
        &vec![LogEntry::insert(b"k2".to_vec(), b"v2".to_vec())],
        2,
    );
    db.finalize(2, &[r2]).expect("finalize 2");

    // Out-of-order pruning is refused, and the last finalized round stays.
    assert!(matches!(db.prune(1), Err(DbError::NotEarliest)));
    db.prune(0).expect("prune 0");
    db.prune(1).expect("prune 1");
    assert!(matches!(db.prune(2), Err(DbError::NotFinalized)));
    assert_eq!(db.get_earliest_version(), 2);
}

#[test]
fn finalization_is_monotonic_and_idempotent_failures_are_typed() {
    let db = NodeDb::open(DbConfig::memory(NS)).expect("open");
    let genesis = Root::empty(NS, 0, RootType::State);

    // Finalizing round 2 before round 1 is refused.
    let r1 = apply_log(
        &db,
        genesis,
        &vec![LogEntry::insert(b"a".to_vec(), b"1".to_vec())],
        1,
    );
    let r2 = apply_log(
        &db,
        r1,
        &vec![LogEntry::insert(b"b".to_vec(), b"2".to_vec())],
        2,
    );
    db.finalize(0, &[genesis]).expect("finalize 0");
    assert!(matches!(db.finalize(2, &[r2]), Err(DbError::NotFinalized)));

    db.finalize(1, &[r1]).expect("finalize 1");
    assert!(matches!(db.finalize(1, &[r1]), Err(DbError::AlreadyFinalized)));
    db.finalize(2, &[r2]).expect("finalize 2");
    assert_eq!(db.get_latest_version(), 2);
}

#[test]
fn write_log_reconstruction_respects_the_hop_cap() {
    let db = NodeDb::open(DbConfig::memory(NS)).expect("open");
    let genesis = Root::empty(NS, 0, RootType::State);
    db.finalize(0, &[genesis]).expect("finalize genesis");

    // Three chained commits inside one version: four roots, three hops.
    let mut prev = genesis;
    let mut logs = Vec::new();
    for i in 0..3u8 {
        let log = vec![LogEntry::insert(vec![b'k', i], vec![b'v', i])];
        let next = apply_log(&db, prev, &log, 1);
        logs.push((prev, next, log));
        prev = next;
    }

    // One hop and two hops resolve.
    let (src, dst, log) = &logs[2];
    assert_eq!(db.get_write_log(*src, *dst).expect("one hop"), log.clone());
    let two_hops = db.get_write_log(logs[1].0, logs[2].1).expect("two hops");
    let expected: WriteLog = logs[1]
        .2
        .iter()
        .cloned()
        .chain(logs[2].2.iter().cloned())
        .collect();
    assert_eq!(two_hops, expected);

    // Three hops exceed the cap.
    assert!(matches!(
        db.get_write_log(genesis, logs[2].1),
        Err(DbError::WriteLogNotFound)
    ));

    // Identical start and end yield an empty log.
    assert!(db
        .get_write_log(logs[2].1, logs[2].1)
        .expect("empty")
        .is_empty());
}

#[test]
fn write_log_round_trips_tombstones() {
    let db = NodeDb::open(DbConfig::memory(NS)).expect("open");
    let genesis = Root::empty(NS, 0, RootType::State);
    db.finalize(0, &[genesis]).expect("finalize genesis");

    let r1 = apply_log(
        &db,
        genesis,
        &vec![
            LogEntry::insert(b"keep".to_vec(), b"1".to_vec()),
            LogEntry::insert(b"drop".to_vec(), b"2".to_vec()),
        ],
        1,
    );
    let log = vec![
        LogEntry::tombstone(b"drop".to_vec()),
        LogEntry::insert(b"keep".to_vec(), b"3".to_vec()),
    ];
    let r2 = apply_log(&db, r1, &log, 2);

    let recovered = db.get_write_log(r1, r2).expect("write log");
    assert_eq!(recovered, log);
}

#[test]
fn multipart_crash_is_cleaned_on_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let node_hashes: Vec<Hash>;
    {
        let db = NodeDb::open(DbConfig::new(dir.path().to_path_buf(), NS)).expect("open");
        db.start_multipart_insert(5).expect("start multipart");

        // Insert chunk nodes without ever finalizing the restore.
        let leaf_a = storage_trellis::node::Node::Leaf(
            storage_trellis::node::LeafNode::new(b"a".to_vec(), b"1".to_vec()),
        );
        let leaf_b = storage_trellis::node::Node::Leaf(
            storage_trellis::node::LeafNode::new(b"b".to_vec(), b"2".to_vec()),
        );
        node_hashes = vec![leaf_a.hash(), leaf_b.hash()];

        let old = Root::empty(NS, 5, RootType::State);
        let mut batch = db.new_batch(old, 5, true).expect("chunk batch");
        batch.put_node(&leaf_a).expect("put a");
        batch.put_node(&leaf_b).expect("put b");
        batch.commit(state_root(5, leaf_a.hash())).expect("commit chunk");

        // Simulated crash: the store is dropped with the restore open.
        db.close();
    }

    let db = NodeDb::open(DbConfig::new(dir.path().to_path_buf(), NS)).expect("reopen");
    for hash in node_hashes {
        assert!(matches!(
            db.get_node(state_root(5, hash), &Pointer::from_hash(hash)),
            Err(DbError::NodeNotFound)
        ));
    }
    // The marker is cleared, so ordinary batches work again.
    db.start_multipart_insert(6).expect("fresh multipart");
    db.abort_multipart_insert().expect("abort");
}

#[test]
fn lone_nodes_of_discarded_roots_are_collected() {
    let db = NodeDb::open(DbConfig::memory(NS)).expect("open");
    let genesis = Root::empty(NS, 0, RootType::State);
    db.finalize(0, &[genesis]).expect("finalize genesis");

    // A surviving chain and a doomed sibling sharing the parent.
    let winner_log = vec![LogEntry::insert(b"w".to_vec(), b"1".to_vec())];
    let loser_log = vec![LogEntry::insert(b"l".to_vec(), b"2".to_vec())];
    let winner = apply_log(&db, genesis, &winner_log, 1);
    let loser = apply_log(&db, genesis, &loser_log, 1);

    db.finalize(1, &[winner]).expect("finalize winner");

    let loser_leaf = storage_trellis::node::LeafNode::new(b"l".to_vec(), b"2".to_vec()).hash;
    assert!(matches!(
        db.get_node(state_root(1, loser.hash), &Pointer::from_hash(loser_leaf)),
        Err(DbError::NodeNotFound)
    ));
    let winner_leaf = storage_trellis::node::LeafNode::new(b"w".to_vec(), b"1".to_vec()).hash;
    assert!(db
        .get_node(state_root(1, winner.hash), &Pointer::from_hash(winner_leaf))
        .is_ok());
}

#[test]
fn store_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let r1;
    {
        let db = NodeDb::open(DbConfig::new(dir.path().to_path_buf(), NS)).expect("open");
        let genesis = Root::empty(NS, 0, RootType::State);
        db.finalize(0, &[genesis]).expect("finalize genesis");
        r1 = apply_log(
            &db,
            genesis,
            &vec![LogEntry::insert(b"persist".to_vec(), b"yes".to_vec())],
            1,
        );
        db.finalize(1, &[r1]).expect("finalize 1");
        db.set_sync_cursor(b"cursor-blob".to_vec()).expect("cursor");
        db.close();
    }
    let db = NodeDb::open(DbConfig::new(dir.path().to_path_buf(), NS)).expect("reopen");
    assert_eq!(db.get_latest_version(), 1);
    assert!(db.has_root(r1));
    assert_eq!(db.get_sync_cursor(), Some(b"cursor-blob".to_vec()));
    let mut tree = Tree::new(db.clone(), r1).expect("tree");
    assert_eq!(tree.get(b"persist").expect("get"), Some(b"yes".to_vec()));
}
