use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendOptions, WriteOp};
use crate::batch::Batch;
use crate::errors::{DbError, DbResult};
use crate::meta::{Metadata, RootsMetadata, UpdatedNode, DB_SCHEMA_VERSION, MULTIPART_VERSION_NONE};
use crate::node::{Namespace, Node, Pointer, Root, TypedHash, EMPTY_HASH};
use crate::schema;
use crate::writelog::{HashedLogEntry, LogEntry, WriteLog};

/// Configuration of a node database instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbConfig {
    /// Directory holding the backing log. May be omitted in memory-only
    /// mode.
    pub path: Option<PathBuf>,
    /// Namespace this store belongs to; opening a store created for a
    /// different namespace fails.
    pub namespace: Namespace,
    #[serde(default = "default_cache_size")]
    pub max_cache_size: u64,
    #[serde(default = "default_true")]
    pub sync_on_write: bool,
    #[serde(default)]
    pub memory_only: bool,
    /// Drop the write-log family entirely; write-log reads then fail.
    #[serde(default)]
    pub discard_write_logs: bool,
    #[serde(default)]
    pub read_only: bool,
    /// Maximum number of hops when reconstructing a write log across
    /// intermediate roots.
    #[serde(default = "default_hop_cap")]
    pub writelog_hop_cap: usize,
}

fn default_cache_size() -> u64 {
    64 << 20
}

fn default_true() -> bool {
    true
}

fn default_hop_cap() -> usize {
    2
}

impl DbConfig {
    pub fn new(path: PathBuf, namespace: Namespace) -> Self {
        DbConfig {
            path: Some(path),
            namespace,
            max_cache_size: default_cache_size(),
            sync_on_write: true,
            memory_only: false,
            discard_write_logs: false,
            read_only: false,
            writelog_hop_cap: default_hop_cap(),
        }
    }

    /// An in-memory store, mostly useful in tests.
    pub fn memory(namespace: Namespace) -> Self {
        DbConfig {
            path: None,
            namespace,
            max_cache_size: default_cache_size(),
            sync_on_write: false,
            memory_only: true,
            discard_write_logs: false,
            read_only: false,
            writelog_hop_cap: default_hop_cap(),
        }
    }
}

enum MaintenanceMessage {
    Compact,
    Shutdown,
}

/// Background maintenance worker owning log compaction. Lives on its own
/// named thread; the database joins it on close.
struct MaintenanceWorker {
    sender: mpsc::Sender<MaintenanceMessage>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MaintenanceWorker {
    fn spawn(backend: Arc<Backend>) -> DbResult<Self> {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("trellis-maintenance".into())
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        MaintenanceMessage::Compact => {
                            if let Err(err) = backend.compact() {
                                warn!(error = %err, "log compaction failed");
                            }
                        }
                        MaintenanceMessage::Shutdown => break,
                    }
                }
            })
            .map_err(DbError::Io)?;
        Ok(MaintenanceWorker {
            sender,
            handle: Some(handle),
        })
    }

    fn nudge(&self) {
        let _ = self.sender.send(MaintenanceMessage::Compact);
    }

    fn shutdown(mut self) {
        let _ = self.sender.send(MaintenanceMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Versioned node database over the backing log. Stores trie nodes keyed by
/// (root type, hash), per-version write logs and root registries, global
/// metadata and the multipart-restore log, and enforces the finalization
/// and pruning rules.
pub struct NodeDb {
    pub(crate) config: DbConfig,
    pub(crate) backend: Arc<Backend>,
    /// Guards every metadata read-modify-write, including the multipart
    /// marker. Node reads do not take this lock.
    pub(crate) meta: Mutex<Metadata>,
    maintenance: Mutex<Option<MaintenanceWorker>>,
    closed: AtomicBool,
}

impl NodeDb {
    /// Open (or create) a store. Fails when the on-disk namespace or schema
    /// version does not match, and cleans up any interrupted multipart
    /// restore before returning.
    pub fn open(config: DbConfig) -> DbResult<Arc<NodeDb>> {
        let backend = Arc::new(Backend::open(
            config.path.as_deref(),
            BackendOptions {
                sync_on_write: config.sync_on_write,
                memory_only: config.memory_only,
                read_only: config.read_only,
                max_cache_size: config.max_cache_size,
            },
        )?);

        let meta = match Metadata::load(&backend)? {
            Some(meta) => {
                if meta.schema_version != DB_SCHEMA_VERSION {
                    return Err(DbError::IncompatibleVersion);
                }
                if meta.namespace != config.namespace {
                    return Err(DbError::IncompatibleNamespace);
                }
                meta
            }
            None => {
                let meta = Metadata::new(config.namespace);
                if !config.read_only {
                    backend.apply(vec![WriteOp::put(schema::metadata_key(), meta.encode()?)])?;
                }
                meta
            }
        };

        let db = Arc::new(NodeDb {
            config,
            backend,
            meta: Mutex::new(meta),
            maintenance: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        if !db.config.read_only {
            let mut guard = db.meta.lock();
            if guard.multipart_version != MULTIPART_VERSION_NONE {
                info!(
                    version = guard.multipart_version,
                    "removing leftovers of an interrupted multipart restore"
                );
                db.clean_multipart_locked(&mut guard, true)?;
            }
        }

        *db.maintenance.lock() = Some(MaintenanceWorker::spawn(db.backend.clone())?);
        Ok(db)
    }

    pub fn namespace(&self) -> Namespace {
        self.config.namespace
    }

    fn check_namespace(&self, namespace: &Namespace) -> DbResult<()> {
        if *namespace != self.config.namespace {
            return Err(DbError::BadNamespace);
        }
        Ok(())
    }

    fn check_writable(&self) -> DbResult<()> {
        if self.config.read_only {
            return Err(DbError::ReadOnly);
        }
        Ok(())
    }

    fn persist_meta(&self, meta: &Metadata) -> DbResult<()> {
        self.backend
            .apply(vec![WriteOp::put(schema::metadata_key(), meta.encode()?)])
    }

    /// Fetch and decode a node record, returning the node and the version
    /// it was created at.
    pub(crate) fn fetch_node(&self, hash: &TypedHash) -> DbResult<(Node, u64)> {
        let raw = self
            .backend
            .get(&schema::node_key(hash))
            .ok_or(DbError::NodeNotFound)?;
        if raw.len() < 8 {
            return Err(DbError::Corrupt("short node record".into()));
        }
        let mut version_bytes = [0u8; 8];
        version_bytes.copy_from_slice(&raw[..8]);
        let node = Node::decode(&raw[8..])?;
        Ok((node, u64::from_le_bytes(version_bytes)))
    }

    /// Look up the node a clean pointer refers to, at the given root's
    /// version.
    pub fn get_node(&self, root: Root, ptr: &Pointer) -> DbResult<Node> {
        if !ptr.clean {
            return Err(DbError::InvalidArgument(
                "node lookups require a clean pointer".into(),
            ));
        }
        self.check_namespace(&root.namespace)?;
        if root.version < self.meta.lock().earliest_version {
            return Err(DbError::NodeNotFound);
        }
        let (node, _) = self.fetch_node(&TypedHash::new(root.root_type, ptr.hash))?;
        Ok(node)
    }

    /// Whether the given root is present. The empty root is implicitly
    /// present at every version.
    pub fn has_root(&self, root: Root) -> bool {
        if root.namespace != self.config.namespace {
            return false;
        }
        if root.hash == EMPTY_HASH {
            return true;
        }
        if root.version < self.meta.lock().earliest_version {
            return false;
        }
        match RootsMetadata::load(&self.backend, root.version) {
            Ok(meta) => meta.roots.contains_key(&root.typed_hash()),
            Err(_) => false,
        }
    }

    pub fn get_earliest_version(&self) -> u64 {
        self.meta.lock().earliest_version
    }

    /// Last finalized version, or zero when nothing has been finalized.
    pub fn get_latest_version(&self) -> u64 {
        self.meta.lock().last_finalized_version.unwrap_or(0)
    }

    pub fn get_roots_for_version(&self, version: u64) -> DbResult<Vec<Root>> {
        if version < self.meta.lock().earliest_version {
            return Ok(Vec::new());
        }
        let meta = RootsMetadata::load(&self.backend, version)?;
        Ok(meta
            .roots
            .keys()
            .map(|typed| Root::new(self.config.namespace, version, typed.root_type, typed.hash))
            .collect())
    }

    /// Reconstruct the write log leading from `start_root` to `end_root`
    /// by searching backwards through persisted write-log records. The
    /// search is capped at `writelog_hop_cap` hops.
    pub fn get_write_log(&self, start_root: Root, end_root: Root) -> DbResult<WriteLog> {
        if self.config.discard_write_logs {
            return Err(DbError::WriteLogNotFound);
        }
        if !end_root.follows(&start_root) {
            return Err(DbError::RootMustFollowOld);
        }
        self.check_namespace(&start_root.namespace)?;
        if end_root.version < self.meta.lock().earliest_version {
            return Err(DbError::WriteLogNotFound);
        }

        let start_hash = start_root.typed_hash();
        let end_hash = end_root.typed_hash();
        if start_hash == end_hash {
            return Ok(Vec::new());
        }

        struct PathItem {
            depth: usize,
            end_hash: TypedHash,
            log_keys: Vec<Vec<u8>>,
            log_roots: Vec<TypedHash>,
        }

        let mut queue = VecDeque::new();
        queue.push_back(PathItem {
            depth: 0,
            end_hash,
            log_keys: Vec::new(),
            log_roots: Vec::new(),
        });

        while let Some(item) = queue.pop_front() {
            let prefix = schema::writelog_root_prefix(end_root.version, &item.end_hash);
            for (key, _) in self.backend.scan_prefix(&prefix) {
                let old_root = schema::writelog_key_old_root(&key)?;
                let mut log_keys = item.log_keys.clone();
                log_keys.push(key);
                let mut log_roots = item.log_roots.clone();
                log_roots.push(item.end_hash);

                if old_root == start_hash {
                    return self.revive_write_log(&end_root, &log_keys, &log_roots);
                }
                if item.depth + 1 < self.config.writelog_hop_cap {
                    queue.push_back(PathItem {
                        depth: item.depth + 1,
                        end_hash: old_root,
                        log_keys,
                        log_roots,
                    });
                }
            }
        }

        Err(DbError::WriteLogNotFound)
    }

    /// Turn a chain of persisted hashed write logs back into a write log,
    /// resolving inserted values through their leaf nodes. The chain is
    /// ordered end-to-start and replayed in reverse.
    fn revive_write_log(
        &self,
        end_root: &Root,
        log_keys: &[Vec<u8>],
        log_roots: &[TypedHash],
    ) -> DbResult<WriteLog> {
        let mut out = WriteLog::new();
        for (key, hop_root) in log_keys.iter().zip(log_roots.iter()).rev() {
            let raw = self
                .backend
                .get(key)
                .ok_or(DbError::WriteLogNotFound)?;
            let hashed: Vec<HashedLogEntry> = bincode::deserialize(&raw)?;
            let lookup_root = Root::new(
                end_root.namespace,
                end_root.version,
                hop_root.root_type,
                hop_root.hash,
            );
            for entry in hashed {
                let value = match entry.leaf_hash {
                    Some(hash) => {
                        match self.get_node(lookup_root, &Pointer::from_hash(hash))? {
                            Node::Leaf(leaf) => Some(leaf.value),
                            Node::Internal(_) => {
                                return Err(DbError::Corrupt(
                                    "write log references a non-leaf node".into(),
                                ))
                            }
                        }
                    }
                    None => None,
                };
                out.push(LogEntry {
                    key: entry.key,
                    value,
                });
            }
        }
        Ok(out)
    }

    /// Finalize the given roots at `version`. Finalization is transitive
    /// along derived-root edges; every other root at the version is
    /// discarded together with its write logs, and nodes no longer
    /// reachable from the finalized set are deleted.
    pub fn finalize(&self, version: u64, roots: &[Root]) -> DbResult<()> {
        self.check_writable()?;
        if roots.is_empty() {
            return Err(DbError::InvalidArgument(
                "need at least one root to finalize".into(),
            ));
        }
        for root in roots {
            self.check_namespace(&root.namespace)?;
            if root.version != version {
                return Err(DbError::InvalidArgument(
                    "roots to finalize must share the finalized version".into(),
                ));
            }
        }

        let mut meta = self.meta.lock();
        let multipart = meta.multipart_version;
        if multipart != MULTIPART_VERSION_NONE && multipart != version {
            return Err(DbError::InvalidMultipartVersion);
        }
        if let Some(last) = meta.last_finalized_version {
            if version <= last {
                return Err(DbError::AlreadyFinalized);
            }
            if multipart == MULTIPART_VERSION_NONE && version > 0 && last < version - 1 {
                return Err(DbError::NotFinalized);
            }
        }

        let mut roots_meta = RootsMetadata::load(&self.backend, version)?;

        // Transitive closure: a root is finalized if any root derived from
        // it is finalized.
        let mut finalized: HashSet<TypedHash> = roots.iter().map(|r| r.typed_hash()).collect();
        let mut changed = true;
        while changed {
            changed = false;
            for (root_hash, derived) in &roots_meta.roots {
                if !finalized.contains(root_hash)
                    && derived.iter().any(|d| finalized.contains(d))
                {
                    finalized.insert(*root_hash);
                    changed = true;
                }
            }
        }

        let mut maybe_lone: HashSet<TypedHash> = HashSet::new();
        let mut not_lone: HashSet<TypedHash> = HashSet::new();
        let mut version_ops: Vec<WriteOp> = Vec::new();
        let mut meta_ops: Vec<WriteOp> = Vec::new();
        let mut roots_changed = false;

        for root_hash in roots_meta.roots.keys().cloned().collect::<Vec<_>>() {
            let updated_key = schema::updated_nodes_key(version, &root_hash);
            let updated: Vec<UpdatedNode> = match self.backend.get(&updated_key) {
                Some(raw) => bincode::deserialize(&raw)
                    .map_err(|err| DbError::Corrupt(format!("updated-nodes index: {err}")))?,
                None => {
                    return Err(DbError::Corrupt(
                        "missing updated-nodes index for pending root".into(),
                    ))
                }
            };

            if finalized.contains(&root_hash) {
                for node in updated {
                    if node.removed {
                        maybe_lone.insert(node.hash);
                    } else {
                        not_lone.insert(node.hash);
                    }
                }
            } else {
                // Non-finalized roots are dropped whole: their fresh nodes
                // become GC candidates and their write logs disappear.
                for node in updated {
                    if !node.removed {
                        maybe_lone.insert(node.hash);
                    }
                }
                roots_meta.roots.remove(&root_hash);
                roots_changed = true;

                if !self.config.discard_write_logs {
                    let prefix = schema::writelog_root_prefix(version, &root_hash);
                    for (key, _) in self.backend.scan_prefix(&prefix) {
                        version_ops.push(WriteOp::delete(key));
                    }
                }
            }

            meta_ops.push(WriteOp::delete(updated_key));
        }

        for hash in &maybe_lone {
            if !not_lone.contains(hash) {
                version_ops.push(WriteOp::delete(schema::node_key(hash)));
            }
        }
        self.backend.apply(version_ops)?;

        if roots_changed {
            meta_ops.push(WriteOp::put(schema::roots_key(version), roots_meta.encode()?));
        }
        let mut new_meta = meta.clone();
        new_meta.last_finalized_version = Some(version);
        meta_ops.push(WriteOp::put(schema::metadata_key(), new_meta.encode()?));
        self.backend.apply(meta_ops)?;
        *meta = new_meta;

        debug!(version, "version finalized");

        if multipart != MULTIPART_VERSION_NONE {
            self.clean_multipart_locked(&mut meta, false)?;
        }
        Ok(())
    }

    /// Prune the earliest version. Only lone roots are traversed; nodes
    /// created at the pruned version and owned solely by it are deleted.
    pub fn prune(&self, version: u64) -> DbResult<()> {
        self.check_writable()?;

        let mut meta = self.meta.lock();
        if meta.multipart_version != MULTIPART_VERSION_NONE {
            return Err(DbError::MultipartInProgress);
        }
        // The earliest retained version must stay finalized, so the last
        // finalized version itself is not prunable.
        match meta.last_finalized_version {
            Some(last) if version < last => {}
            _ => return Err(DbError::NotFinalized),
        }
        if version != meta.earliest_version {
            return Err(DbError::NotEarliest);
        }

        let roots_meta = RootsMetadata::load(&self.backend, version)?;
        let mut ops: Vec<WriteOp> = Vec::new();
        let mut visited: HashSet<TypedHash> = HashSet::new();

        for (root_hash, derived) in &roots_meta.roots {
            if !derived.is_empty() {
                continue;
            }
            // Created-at-version nodes can only live beneath other
            // created-at-version nodes, so the walk stops at older ones.
            let mut stack = vec![root_hash.hash];
            while let Some(hash) = stack.pop() {
                if hash == EMPTY_HASH {
                    continue;
                }
                let typed = TypedHash::new(root_hash.root_type, hash);
                if !visited.insert(typed) {
                    continue;
                }
                let (node, created) = match self.fetch_node(&typed) {
                    Ok(found) => found,
                    Err(DbError::NodeNotFound) => continue,
                    Err(err) => return Err(err),
                };
                if created != version {
                    continue;
                }
                ops.push(WriteOp::delete(schema::node_key(&typed)));
                if let Node::Internal(internal) = node {
                    stack.push(internal.leaf.hash);
                    stack.push(internal.left.hash);
                    stack.push(internal.right.hash);
                }
            }
        }

        if !self.config.discard_write_logs {
            let prefix = schema::writelog_version_prefix(version);
            for (key, _) in self.backend.scan_prefix(&prefix) {
                ops.push(WriteOp::delete(key));
            }
        }
        self.backend.apply(ops)?;

        let mut new_meta = meta.clone();
        new_meta.earliest_version = version + 1;
        self.backend.apply(vec![
            WriteOp::delete(schema::roots_key(version)),
            WriteOp::put(schema::metadata_key(), new_meta.encode()?),
        ])?;
        *meta = new_meta;
        drop(meta);

        debug!(version, "version pruned");
        if let Some(worker) = self.maintenance.lock().as_ref() {
            worker.nudge();
        }
        Ok(())
    }

    /// Mark the beginning of a multipart restore into `version`. Calling
    /// again for the same version is a no-op.
    pub fn start_multipart_insert(&self, version: u64) -> DbResult<()> {
        self.check_writable()?;
        let mut meta = self.meta.lock();
        if version == MULTIPART_VERSION_NONE {
            return Err(DbError::InvalidMultipartVersion);
        }
        if meta.multipart_version != MULTIPART_VERSION_NONE {
            if meta.multipart_version != version {
                return Err(DbError::MultipartInProgress);
            }
            return Ok(());
        }
        let mut new_meta = meta.clone();
        new_meta.multipart_version = version;
        self.persist_meta(&new_meta)?;
        *meta = new_meta;
        Ok(())
    }

    /// Abort an in-progress multipart restore, deleting every node it
    /// inserted. A no-op when no restore is active.
    pub fn abort_multipart_insert(&self) -> DbResult<()> {
        self.check_writable()?;
        let mut meta = self.meta.lock();
        self.clean_multipart_locked(&mut meta, true)
    }

    /// Remove the multipart log, optionally together with the nodes it
    /// references, and clear the marker. Assumes the metadata lock is held.
    fn clean_multipart_locked(
        &self,
        meta: &mut MutexGuard<'_, Metadata>,
        remove_nodes: bool,
    ) -> DbResult<()> {
        if meta.multipart_version == MULTIPART_VERSION_NONE {
            return Ok(());
        }
        let mut ops: Vec<WriteOp> = Vec::new();
        for (key, _) in self.backend.scan_prefix(&schema::multipart_prefix()) {
            if remove_nodes {
                let hash = schema::multipart_key_hash(&key)?;
                ops.push(WriteOp::delete(schema::node_key(&hash)));
            }
            ops.push(WriteOp::delete(key));
        }
        self.backend.apply(ops)?;

        let mut new_meta = (**meta).clone();
        new_meta.multipart_version = MULTIPART_VERSION_NONE;
        self.persist_meta(&new_meta)?;
        **meta = new_meta;
        Ok(())
    }

    /// Start a batch of node writes under the given pending transition.
    /// `chunk` must agree with whether a multipart restore is in progress.
    pub fn new_batch(self: &Arc<Self>, old_root: Root, version: u64, chunk: bool) -> DbResult<Batch> {
        self.check_writable()?;
        let meta = self.meta.lock();
        let multipart = meta.multipart_version;
        if multipart != MULTIPART_VERSION_NONE && multipart != version {
            return Err(DbError::InvalidMultipartVersion);
        }
        if chunk != (multipart != MULTIPART_VERSION_NONE) {
            return Err(DbError::MultipartInProgress);
        }
        drop(meta);
        Ok(Batch::new(
            self.clone(),
            old_root,
            version,
            chunk,
            multipart != MULTIPART_VERSION_NONE,
        ))
    }

    /// Persisted sync cursor for this store's namespace, an opaque blob
    /// owned by the sync worker.
    pub fn get_sync_cursor(&self) -> Option<Vec<u8>> {
        self.backend
            .get(&schema::sync_cursor_key(&self.config.namespace))
    }

    pub fn set_sync_cursor(&self, data: Vec<u8>) -> DbResult<()> {
        self.check_writable()?;
        self.backend.apply(vec![WriteOp::put(
            schema::sync_cursor_key(&self.config.namespace),
            data,
        )])
    }

    /// Approximate on-disk size in bytes.
    pub fn size(&self) -> u64 {
        self.backend.size()
    }

    /// Flush buffered writes to durable storage.
    pub fn sync(&self) -> DbResult<()> {
        self.backend.sync()
    }

    /// Stop the maintenance worker and release the store. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(worker) = self.maintenance.lock().take() {
            worker.shutdown();
        }
    }
}

impl Drop for NodeDb {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for NodeDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDb")
            .field("namespace", &hex::encode(self.config.namespace))
            .field("path", &self.config.path)
            .finish_non_exhaustive()
    }
}
