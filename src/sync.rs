//! Per-runtime storage synchronization worker.
//!
//! The worker keeps the local node database current with the stream of
//! finalized consensus rounds: for every new block it fetches the I/O and
//! state write-log diffs from peers (in parallel, through a bounded fetch
//! pool), applies them strictly in round order, and finalizes completed
//! rounds sequentially. The persisted sync cursor only advances after a
//! successful finalize, so a crash at any point re-enters the
//! apply-then-finalize path and tolerates already-finalized rounds.

use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use storage_trellis::{
    apply, restore_checkpoint, ApplyRequest, DbError, NodeDb, Namespace, Root, RootType, WriteLog,
    EMPTY_HASH,
};

use crate::client::{CheckpointProvider, DiffClient};
use crate::config::WorkerConfig;
use crate::errors::{SyncError, SyncResult};
use crate::interfaces::{BlockHistory, CheckpointHook, ConsensusClient, RoleProvider, RuntimeDescriptor};
use crate::metrics;
use crate::types::{Block, BlockSummary, RoundMask, ROUND_LATEST};

/// Everything the worker needs from its host.
pub struct SyncWorkerParams {
    pub db: Arc<NodeDb>,
    pub history: Arc<dyn BlockHistory>,
    pub consensus: Arc<dyn ConsensusClient>,
    pub role_provider: Arc<dyn RoleProvider>,
    pub diff_client: Arc<dyn DiffClient>,
    pub checkpoint_hook: Option<Arc<dyn CheckpointHook>>,
    pub checkpoint_provider: Option<Arc<dyn CheckpointProvider>>,
    pub config: WorkerConfig,
}

struct Inner {
    db: Arc<NodeDb>,
    namespace: Namespace,
    history: Arc<dyn BlockHistory>,
    consensus: Arc<dyn ConsensusClient>,
    role_provider: Arc<dyn RoleProvider>,
    diff_client: Arc<dyn DiffClient>,
    checkpoint_hook: Option<Arc<dyn CheckpointHook>>,
    checkpoint_provider: Option<Arc<dyn CheckpointProvider>>,
    config: WorkerConfig,
    /// The only mutable state observable from outside the loop.
    synced_state: RwLock<Option<BlockSummary>>,
}

/// One fetched (or locally satisfied) diff, keyed into the apply heap by
/// round.
struct FetchedDiff {
    mask: RoundMask,
    fetched: bool,
    round: u64,
    prev_root: Root,
    this_root: Root,
    write_log: WriteLog,
}

struct FetchFailure {
    round: u64,
    mask: RoundMask,
    error: SyncError,
}

type FetchOutcome = Result<FetchedDiff, FetchFailure>;

/// Outstanding work for one round.
#[derive(Default)]
struct InFlight {
    outstanding: RoundMask,
    awaiting_retry: RoundMask,
}

/// Min-heap adapter: `BinaryHeap` is a max-heap, so the ordering is
/// reversed on round.
struct MinRound<T> {
    round: u64,
    item: T,
}

impl<T> MinRound<T> {
    fn new(round: u64, item: T) -> Self {
        MinRound { round, item }
    }
}

impl<T> PartialEq for MinRound<T> {
    fn eq(&self, other: &Self) -> bool {
        self.round == other.round
    }
}

impl<T> Eq for MinRound<T> {}

impl<T> PartialOrd for MinRound<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for MinRound<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.round.cmp(&self.round)
    }
}

/// Handle to a running worker.
pub struct SyncWorkerHandle {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<SyncResult<()>>,
}

impl SyncWorkerHandle {
    /// Summary of the last block whose roots were both applied and
    /// finalized locally.
    pub fn last_synced(&self) -> Option<BlockSummary> {
        *self.inner.synced_state.read()
    }

    /// Handler enforcing that pruning never outruns the sync cursor.
    pub fn prune_handler(&self) -> PruneHandler {
        PruneHandler {
            inner: self.inner.clone(),
        }
    }

    /// Force a storage finalization for the given round (or the latest
    /// one), bypassing the loop. Intended for operator tooling.
    pub fn force_finalize(&self, round: u64) -> SyncResult<()> {
        debug!(round, "forcing round finalization");
        let block = if round == ROUND_LATEST {
            self.inner.consensus.get_latest_block(self.inner.namespace)?
        } else {
            self.inner.history.get_block(round)?
        };
        let summary = block.summary();
        self.inner
            .db
            .finalize(summary.round, &[summary.io_root, summary.state_root])?;
        Ok(())
    }

    /// Signal shutdown; in-flight fetches are abandoned.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn join(self) -> SyncResult<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(SyncError::Config(format!("worker task panicked: {err}"))),
        }
    }
}

pub struct SyncWorker;

impl SyncWorker {
    /// Spawn the worker over a block subscription.
    pub fn start(
        params: SyncWorkerParams,
        blocks: mpsc::UnboundedReceiver<Block>,
    ) -> SyncResult<SyncWorkerHandle> {
        params.config.validate()?;
        let namespace = params.db.namespace();
        let inner = Arc::new(Inner {
            namespace,
            synced_state: RwLock::new(
                params
                    .db
                    .get_sync_cursor()
                    .and_then(|raw| BlockSummary::decode(&raw).ok()),
            ),
            db: params.db,
            history: params.history,
            consensus: params.consensus,
            role_provider: params.role_provider,
            diff_client: params.diff_client,
            checkpoint_hook: params.checkpoint_hook,
            checkpoint_provider: params.checkpoint_provider,
            config: params.config,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run_inner = inner.clone();
        let handle = tokio::spawn(run(run_inner, blocks, shutdown_rx));
        Ok(SyncWorkerHandle {
            inner,
            shutdown: shutdown_tx,
            handle,
        })
    }
}

async fn run(
    inner: Arc<Inner>,
    mut blocks: mpsc::UnboundedReceiver<Block>,
    mut shutdown: watch::Receiver<bool>,
) -> SyncResult<()> {
    let namespace = inner.namespace;
    let runtime_label = metrics::runtime_label(&namespace);

    // Wait until consensus exposes the runtime's genesis block.
    let genesis = loop {
        match inner.consensus.get_genesis_block(namespace) {
            Ok(block) => break block,
            Err(err) => {
                debug!(error = %err, "genesis block not yet available");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                    _ = shutdown.changed() => return Ok(()),
                }
            }
        }
    };
    let genesis_round = genesis.header.round;
    let undefined_round = genesis_round.wrapping_sub(1);

    // Restore the persisted cursor; anything below genesis is treated as
    // the undefined sentinel.
    let cursor_round = (*inner.synced_state.read()).map(|summary| summary.round);
    let mut cached_last_round = cursor_round
        .filter(|round| *round >= genesis_round)
        .unwrap_or(undefined_round);

    if cached_last_round == undefined_round {
        let descriptor = inner.consensus.runtime_descriptor(namespace)?;
        init_genesis(&inner, &descriptor)?;
    }

    info!(
        genesis_round,
        last_synced = cached_last_round,
        "storage worker initialized"
    );

    // Publish availability and hold back outbound requests until the
    // registration has gone through.
    let (registered_tx, registered_rx) = oneshot::channel::<()>();
    inner.role_provider.set_available(Box::new(move || {
        let _ = registered_tx.send(());
    }));
    debug!("waiting for node registration to finish");
    tokio::select! {
        _ = registered_rx => {}
        _ = shutdown.changed() => return Ok(()),
    }

    let mut last_applied_round = cached_last_round;

    // Initial sync from peer checkpoints, with one retry to cover the
    // window where a peer prunes a checkpoint between listing and fetch.
    if inner.config.checkpoint_sync_enabled {
        if let Some(provider) = inner.checkpoint_provider.clone() {
            let mut outcome = sync_checkpoint(&inner, &provider).await;
            if outcome.is_err() {
                info!("first checkpoint sync failed, trying once more");
                let _ = inner.db.abort_multipart_insert();
                outcome = sync_checkpoint(&inner, &provider).await;
            }
            match outcome {
                Ok(Some(summary)) => {
                    flush_synced_state(&inner, &summary);
                    cached_last_round = summary.round;
                    last_applied_round = summary.round;
                    info!(round = summary.round, "checkpoint sync succeeded");
                }
                Ok(None) => {}
                Err(err) => {
                    let _ = inner.db.abort_multipart_insert();
                    info!(error = %err, "checkpoint sync failed, falling back to diffs");
                }
            }
        }
    }

    // Main loop state.
    let mut pending_diffs: BinaryHeap<MinRound<FetchedDiff>> = BinaryHeap::new();
    let mut pending_applieds: BinaryHeap<MinRound<BlockSummary>> = BinaryHeap::new();
    let mut in_flight: HashMap<u64, InFlight> = HashMap::new();
    let mut summary_cache: HashMap<u64, BlockSummary> = HashMap::new();
    let (diff_tx, mut diff_rx) = mpsc::unbounded_channel::<FetchOutcome>();
    let (finalize_tx, mut finalize_rx) = mpsc::channel::<(BlockSummary, bool)>(1);
    let fetch_pool = Arc::new(Semaphore::new(inner.config.fetch_pool_size));
    let mut finalize_in_flight = false;
    let mut last_block_round: Option<u64> = None;

    loop {
        // Drain applies first: the smallest fetched diff is applied only
        // when it belongs to the round right after the last fully applied
        // one.
        let apply_ready = pending_diffs
            .peek()
            .is_some_and(|top| top.round == last_applied_round.wrapping_add(1));
        if apply_ready {
            if let Some(entry) = pending_diffs.pop() {
                let diff = entry.item;
                if apply_diff(&inner, &diff).is_ok() {
                    if let Some(inflight) = in_flight.get_mut(&diff.round) {
                        inflight.outstanding.remove(diff.mask);
                        if inflight.outstanding.is_empty() && inflight.awaiting_retry.is_empty() {
                            in_flight.remove(&diff.round);
                            match summary_cache.get(&diff.round).copied() {
                                Some(summary) => {
                                    summary_cache.remove(&diff.round.wrapping_sub(1));
                                    metrics::set_synced_round(&runtime_label, diff.round);
                                    debug!(round = diff.round, "finished syncing round");
                                    last_applied_round = diff.round;
                                    pending_applieds.push(MinRound::new(diff.round, summary));
                                }
                                None => error!(round = diff.round, "missing cached summary"),
                            }
                        }
                    }
                } else if let Some(inflight) = in_flight.get_mut(&diff.round) {
                    // Leave the round unapplied; the next block re-arms
                    // the fetch.
                    inflight.outstanding.remove(diff.mask);
                    inflight.awaiting_retry.insert(diff.mask);
                }
            }
            continue;
        }

        // Then finalizations, serialized: at most one in flight, and only
        // for the round right after the last finalized one.
        if !finalize_in_flight {
            let finalize_ready = pending_applieds
                .peek()
                .is_some_and(|top| top.round == cached_last_round.wrapping_add(1));
            if finalize_ready {
                if let Some(entry) = pending_applieds.pop() {
                    finalize_in_flight = true;
                    spawn_finalize(inner.clone(), entry.item, finalize_tx.clone());
                }
                continue;
            }
        }

        tokio::select! {
            maybe_block = blocks.recv() => {
                let Some(block) = maybe_block else { break };
                let round = block.header.round;
                // Subscriptions replay the latest block; drop anything we
                // have already seen.
                if last_block_round.is_some_and(|last| round <= last) {
                    continue;
                }
                last_block_round = Some(round);
                debug!(
                    round,
                    last_applied = last_applied_round,
                    last_finalized = cached_last_round,
                    "incoming block"
                );

                handle_block(
                    &inner,
                    &runtime_label,
                    &block,
                    undefined_round,
                    genesis_round,
                    last_applied_round,
                    &mut in_flight,
                    &mut summary_cache,
                    &fetch_pool,
                    &diff_tx,
                    &shutdown,
                );
            }
            Some(outcome) = diff_rx.recv() => {
                match outcome {
                    Ok(diff) => pending_diffs.push(MinRound::new(diff.round, diff)),
                    Err(failure) => {
                        warn!(
                            round = failure.round,
                            mask = %failure.mask,
                            error = %failure.error,
                            "diff fetch failed, will retry"
                        );
                        if let Some(inflight) = in_flight.get_mut(&failure.round) {
                            inflight.outstanding.remove(failure.mask);
                            inflight.awaiting_retry.insert(failure.mask);
                        }
                    }
                }
            }
            Some((summary, finalized)) = finalize_rx.recv() => {
                finalize_in_flight = false;
                if finalized {
                    flush_synced_state(&inner, &summary);
                    cached_last_round = summary.round;
                    metrics::set_finalized_round(&runtime_label, summary.round);
                    if let Some(hook) = &inner.checkpoint_hook {
                        hook.notify_new_version(summary.round);
                    }
                } else {
                    // Put the round back; the gate retries it.
                    pending_applieds.push(MinRound::new(summary.round, summary));
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    debug!("storage worker exiting");
    Ok(())
}

/// Apply the runtime's registered genesis state, if any.
fn init_genesis(inner: &Arc<Inner>, descriptor: &RuntimeDescriptor) -> SyncResult<()> {
    info!("initializing storage at genesis");
    match &descriptor.genesis_state {
        Some(write_log) => {
            info!(
                state_root = %hex::encode(descriptor.genesis_state_root),
                "applying genesis state"
            );
            apply(
                &inner.db,
                &ApplyRequest {
                    namespace: inner.namespace,
                    root_type: RootType::State,
                    src_version: descriptor.genesis_round,
                    src_root: EMPTY_HASH,
                    dst_version: descriptor.genesis_round,
                    dst_root: descriptor.genesis_state_root,
                    write_log,
                },
            )?;
        }
        None => {
            let root = Root::new(
                inner.namespace,
                descriptor.genesis_round,
                RootType::State,
                descriptor.genesis_state_root,
            );
            if descriptor.genesis_state_root != EMPTY_HASH && !inner.db.has_root(root) {
                // The state is expected to arrive via checkpoint sync.
                warn!(
                    state_root = %hex::encode(descriptor.genesis_state_root),
                    "non-empty genesis state root without a write log, assuming replication"
                );
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn handle_block(
    inner: &Arc<Inner>,
    runtime_label: &str,
    block: &Block,
    undefined_round: u64,
    genesis_round: u64,
    last_applied_round: u64,
    in_flight: &mut HashMap<u64, InFlight>,
    summary_cache: &mut HashMap<u64, BlockSummary>,
    fetch_pool: &Arc<Semaphore>,
    diff_tx: &mpsc::UnboundedSender<FetchOutcome>,
    shutdown: &watch::Receiver<bool>,
) {
    let round = block.header.round;

    // Before anything was applied, the previous-round slot is a sentinel
    // with empty roots at the genesis round.
    if last_applied_round == undefined_round && !summary_cache.contains_key(&last_applied_round) {
        summary_cache.insert(
            last_applied_round,
            BlockSummary::sentinel(inner.namespace, genesis_round),
        );
    }

    // Synthesize summaries for any rounds between the last applied one and
    // this block from the history accessor.
    let mut cursor = if last_applied_round == undefined_round {
        genesis_round
    } else {
        last_applied_round
    };
    while cursor < round {
        if !summary_cache.contains_key(&cursor) {
            match inner.history.get_block(cursor) {
                Ok(old_block) => {
                    summary_cache.insert(cursor, old_block.summary());
                }
                Err(err) => {
                    error!(
                        round = cursor,
                        current_round = round,
                        error = %err,
                        "failed to load block history, deferring sync"
                    );
                    return;
                }
            }
        }
        cursor += 1;
    }
    summary_cache.entry(round).or_insert_with(|| block.summary());

    // Arm fetches for every round that still has bits awaiting retry.
    let mut i = last_applied_round.wrapping_add(1);
    while i <= round {
        let newly_tracked = !in_flight.contains_key(&i);
        let inflight = in_flight.entry(i).or_insert_with(|| InFlight {
            outstanding: RoundMask::NONE,
            awaiting_retry: RoundMask::ALL,
        });
        if newly_tracked && i == round {
            metrics::set_pending_round(runtime_label, i);
        }
        if inflight.outstanding == RoundMask::ALL {
            i += 1;
            continue;
        }

        let (Some(prev), Some(this)) = (
            summary_cache.get(&i.wrapping_sub(1)).copied(),
            summary_cache.get(&i).copied(),
        ) else {
            error!(round = i, "missing summaries for round, deferring sync");
            return;
        };
        debug!(
            round = i,
            outstanding = %inflight.outstanding,
            awaiting_retry = %inflight.awaiting_retry,
            "preparing round sync"
        );

        // I/O roots are not chained: the start root is always empty.
        let prev_io_root = Root::empty(inner.namespace, i, RootType::Io);

        if !inflight.outstanding.contains(RoundMask::IO)
            && inflight.awaiting_retry.contains(RoundMask::IO)
        {
            inflight.outstanding.insert(RoundMask::IO);
            inflight.awaiting_retry.remove(RoundMask::IO);
            spawn_fetch(
                inner.clone(),
                fetch_pool.clone(),
                diff_tx.clone(),
                shutdown.clone(),
                i,
                prev_io_root,
                this.io_root,
                RoundMask::IO,
            );
        }
        if !inflight.outstanding.contains(RoundMask::STATE)
            && inflight.awaiting_retry.contains(RoundMask::STATE)
        {
            inflight.outstanding.insert(RoundMask::STATE);
            inflight.awaiting_retry.remove(RoundMask::STATE);
            spawn_fetch(
                inner.clone(),
                fetch_pool.clone(),
                diff_tx.clone(),
                shutdown.clone(),
                i,
                prev.state_root,
                this.state_root,
                RoundMask::STATE,
            );
        }
        i += 1;
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_fetch(
    inner: Arc<Inner>,
    fetch_pool: Arc<Semaphore>,
    diff_tx: mpsc::UnboundedSender<FetchOutcome>,
    mut shutdown: watch::Receiver<bool>,
    round: u64,
    prev_root: Root,
    this_root: Root,
    mask: RoundMask,
) {
    tokio::spawn(async move {
        let _permit = tokio::select! {
            permit = fetch_pool.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = shutdown.changed() => return,
        };
        let outcome = fetch_diff(&inner, round, prev_root, this_root, mask).await;
        let _ = diff_tx.send(outcome);
    });
}

async fn fetch_diff(
    inner: &Arc<Inner>,
    round: u64,
    prev_root: Root,
    this_root: Root,
    mask: RoundMask,
) -> FetchOutcome {
    let mut diff = FetchedDiff {
        mask,
        fetched: false,
        round,
        prev_root,
        this_root,
        write_log: WriteLog::new(),
    };
    if inner.db.has_root(this_root) {
        return Ok(diff);
    }
    diff.fetched = true;

    if this_root.hash == prev_root.hash {
        // Roots emitted unchanged by consensus (epoch transitions) carry
        // an empty write log.
        return Ok(diff);
    }

    debug!(round, prev = %prev_root, this = %this_root, "requesting diff");
    let mut stream = match inner.diff_client.get_diff(prev_root, this_root).await {
        Ok(stream) => stream,
        Err(error) => return Err(FetchFailure { round, mask, error }),
    };
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(mut entries) => diff.write_log.append(&mut entries),
            Err(error) => return Err(FetchFailure { round, mask, error }),
        }
    }
    Ok(diff)
}

/// Apply one diff into the node database. Roots that already exist locally
/// were never fetched and need no work.
fn apply_diff(inner: &Arc<Inner>, diff: &FetchedDiff) -> SyncResult<()> {
    if !diff.fetched {
        return Ok(());
    }
    let request = ApplyRequest {
        namespace: diff.this_root.namespace,
        root_type: diff.this_root.root_type,
        src_version: diff.prev_root.version,
        src_root: diff.prev_root.hash,
        dst_version: diff.this_root.version,
        dst_root: diff.this_root.hash,
        write_log: &diff.write_log,
    };
    if let Err(err) = apply(&inner.db, &request) {
        error!(
            round = diff.round,
            prev = %diff.prev_root,
            this = %diff.this_root,
            error = %err,
            "failed to apply write log"
        );
        return Err(err.into());
    }
    Ok(())
}

fn spawn_finalize(
    inner: Arc<Inner>,
    summary: BlockSummary,
    finalize_tx: mpsc::Sender<(BlockSummary, bool)>,
) {
    tokio::spawn(async move {
        let task_inner = inner.clone();
        let finalized = tokio::task::spawn_blocking(move || finalize_round(&task_inner, &summary))
            .await
            .unwrap_or(false);
        let _ = finalize_tx.send((summary, finalized)).await;
    });
}

fn finalize_round(inner: &Arc<Inner>, summary: &BlockSummary) -> bool {
    match inner
        .db
        .finalize(summary.round, &[summary.io_root, summary.state_root])
    {
        Ok(()) => {
            debug!(round = summary.round, "storage round finalized");
            true
        }
        Err(DbError::AlreadyFinalized) => {
            // Crash recovery: nodes were flushed before the cursor update.
            warn!(round = summary.round, "storage round already finalized");
            true
        }
        Err(err) => {
            error!(round = summary.round, error = %err, "failed to finalize storage round");
            false
        }
    }
}

/// Persist the cursor; it only ever moves forward because finalizations
/// are serialized in round order.
fn flush_synced_state(inner: &Arc<Inner>, summary: &BlockSummary) {
    *inner.synced_state.write() = Some(*summary);
    match summary.encode() {
        Ok(encoded) => {
            if let Err(err) = inner.db.set_sync_cursor(encoded) {
                error!(error = %err, "failed to persist sync cursor");
            }
        }
        Err(err) => error!(error = %err, "failed to encode sync cursor"),
    }
}

/// Restore the latest peer checkpoint, finalizing all restored roots at
/// the checkpoint's round.
async fn sync_checkpoint(
    inner: &Arc<Inner>,
    provider: &Arc<dyn CheckpointProvider>,
) -> SyncResult<Option<BlockSummary>> {
    let Some(offer) = provider.latest_checkpoint().await? else {
        debug!("no peer checkpoint available");
        return Ok(None);
    };
    info!(round = offer.summary.round, "restoring peer checkpoint");

    for manifest in &offer.manifests {
        let mut chunks = Vec::with_capacity(manifest.chunks.len());
        for index in 0..manifest.chunks.len() {
            chunks.push(provider.fetch_chunk(manifest, index).await?);
        }
        restore_checkpoint(&inner.db, manifest, &chunks)?;
    }

    let roots: Vec<Root> = offer.manifests.iter().map(|m| m.root).collect();
    inner.db.finalize(offer.summary.round, &roots)?;
    Ok(Some(offer.summary))
}

/// Prune handler bridging the consensus history pruner to the NDB. Rounds
/// at or past the persisted cursor are refused; rounds the NDB considers
/// non-earliest are skipped.
pub struct PruneHandler {
    inner: Arc<Inner>,
}

impl PruneHandler {
    pub fn prune(&self, rounds: &[u64]) -> SyncResult<()> {
        let last_synced =
            (*self.inner.synced_state.read()).map(|summary| summary.round).unwrap_or(u64::MAX);

        let mut sorted = rounds.to_vec();
        sorted.sort_unstable();
        for round in sorted {
            if round >= last_synced {
                return Err(SyncError::Config(format!(
                    "tried to prune past the last synced round ({last_synced})"
                )));
            }
            match self.inner.db.prune(round) {
                Ok(()) => debug!(round, "pruned storage round"),
                Err(DbError::NotEarliest) => {
                    debug!(round, "skipping non-earliest round");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}
