//! Versioned authenticated key-value store.
//!
//! The crate is organised around [`db::NodeDb`], a node database over an
//! append-only backing log. Trie nodes are content-addressed and shared
//! across versions; every committed root is tracked per version until the
//! version is finalized, at which point losing roots and their nodes are
//! discarded. [`tree::Tree`] provides the mutable trie view used by
//! [`apply::apply`] to replay write logs, and [`checkpoint`] packs
//! finalized roots into restorable chunk sets.

pub mod apply;
pub mod backend;
pub mod batch;
pub mod checkpoint;
pub mod db;
pub mod errors;
pub mod meta;
pub mod node;
pub mod schema;
pub mod tree;
pub mod writelog;

pub use apply::{apply, ApplyRequest};
pub use batch::Batch;
pub use checkpoint::{create_checkpoint, restore_checkpoint, CheckpointManifest};
pub use db::{DbConfig, NodeDb};
pub use errors::{DbError, DbResult};
pub use node::{Hash, Namespace, Node, Pointer, Root, RootType, EMPTY_HASH};
pub use tree::Tree;
pub use writelog::{LogEntry, WriteLog};
