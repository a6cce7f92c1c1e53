//! Storage node worker for the trellis authenticated store.
//!
//! The crate keeps a local replica of a runtime's versioned trie state in
//! sync with the consensus-anchored stream of finalized rounds. The
//! [`sync::SyncWorker`] drives the pipeline — fetch per-round write-log
//! diffs from peers, apply them in strict round order through
//! [`storage_trellis`], finalize completed rounds and persist the sync
//! cursor — while [`broker::BlockBroker`] fans consensus blocks out to
//! workers and [`interfaces`] defines the thin contracts expected from
//! consensus, block history, registration and checkpointing collaborators.

pub mod broker;
pub mod client;
pub mod config;
pub mod errors;
pub mod interfaces;
pub mod metrics;
pub mod sync;
pub mod types;

pub use broker::BlockBroker;
pub use client::{CheckpointOffer, CheckpointProvider, DiffClient, DiffStream};
pub use config::WorkerConfig;
pub use errors::{SyncError, SyncResult};
pub use interfaces::{
    BlockHistory, CheckpointHook, ConsensusClient, RoleProvider, RuntimeDescriptor,
};
pub use sync::{PruneHandler, SyncWorker, SyncWorkerHandle, SyncWorkerParams};
pub use types::{Block, BlockHeader, BlockSummary, RoundMask, ROUND_LATEST};
