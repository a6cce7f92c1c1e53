//! Contracts the storage worker requires from its collaborators. The
//! worker never reaches into consensus or registration machinery directly;
//! everything arrives through these traits.

use storage_trellis::{Hash, Namespace, WriteLog};

use crate::errors::SyncResult;
use crate::types::Block;

/// Access to the consensus-anchored block history of one runtime. Blocks
/// below the history pruning horizon may no longer be available.
pub trait BlockHistory: Send + Sync {
    fn get_block(&self, round: u64) -> SyncResult<Block>;
}

/// Genesis description of a runtime as registered with consensus. The
/// genesis state may be absent even when the state root is not empty, in
/// which case the state is expected to be replicated from peers.
#[derive(Clone, Debug)]
pub struct RuntimeDescriptor {
    pub namespace: Namespace,
    pub genesis_round: u64,
    pub genesis_state_root: Hash,
    pub genesis_state: Option<WriteLog>,
}

/// Thin view of the consensus client.
pub trait ConsensusClient: Send + Sync {
    fn get_genesis_block(&self, namespace: Namespace) -> SyncResult<Block>;
    fn get_latest_block(&self, namespace: Namespace) -> SyncResult<Block>;
    fn runtime_descriptor(&self, namespace: Namespace) -> SyncResult<RuntimeDescriptor>;
}

/// Publishes this node's availability for peer traffic. The provided
/// callback must be invoked exactly once, after registration has
/// completed; the worker holds back outbound sync requests until then.
pub trait RoleProvider: Send + Sync {
    fn set_available(&self, registered: Box<dyn FnOnce() + Send>);
}

/// Receives finalized-round notifications for interval-based snapshotting.
pub trait CheckpointHook: Send + Sync {
    fn notify_new_version(&self, round: u64);
}
