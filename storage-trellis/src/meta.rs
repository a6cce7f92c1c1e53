use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::errors::{DbError, DbResult};
use crate::node::{Namespace, TypedHash};
use crate::schema;

/// Schema version of the on-disk layout. Bumped whenever a key family or a
/// persisted record changes shape.
pub const DB_SCHEMA_VERSION: u32 = 1;

/// Sentinel meaning no multipart restore is in progress.
pub const MULTIPART_VERSION_NONE: u64 = 0;

/// Global store metadata, a single record per store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Metadata {
    pub schema_version: u32,
    pub namespace: Namespace,
    pub earliest_version: u64,
    pub last_finalized_version: Option<u64>,
    pub multipart_version: u64,
}

impl Metadata {
    pub fn new(namespace: Namespace) -> Self {
        Metadata {
            schema_version: DB_SCHEMA_VERSION,
            namespace,
            earliest_version: 0,
            last_finalized_version: None,
            multipart_version: MULTIPART_VERSION_NONE,
        }
    }

    pub fn load(backend: &Backend) -> DbResult<Option<Metadata>> {
        match backend.get(&schema::metadata_key()) {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn encode(&self) -> DbResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// Per-version root registry: every root committed at a version, mapped to
/// the roots that have been derived from it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RootsMetadata {
    pub roots: BTreeMap<TypedHash, Vec<TypedHash>>,
}

impl RootsMetadata {
    /// Load the registry for `version`, or an empty one if none exists yet.
    pub fn load(backend: &Backend, version: u64) -> DbResult<RootsMetadata> {
        match backend.get(&schema::roots_key(version)) {
            Some(raw) => {
                bincode::deserialize(&raw).map_err(|err| DbError::Corrupt(err.to_string()))
            }
            None => Ok(RootsMetadata::default()),
        }
    }

    pub fn encode(&self) -> DbResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// One entry of a pending root's updated-nodes list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdatedNode {
    pub hash: TypedHash,
    pub removed: bool,
}
