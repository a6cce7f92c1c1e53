use std::fmt;

use serde::{Deserialize, Serialize};

use storage_trellis::{Hash, Namespace, Root, RootType};

use crate::errors::SyncResult;

/// Magic round value meaning "the latest round".
pub const ROUND_LATEST: u64 = u64::MAX;

/// Consensus block header fields the storage worker consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub namespace: Namespace,
    pub round: u64,
    pub io_root: Hash,
    pub state_root: Hash,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
}

impl Block {
    pub fn summary(&self) -> BlockSummary {
        BlockSummary::from_header(&self.header)
    }
}

/// Short summary of a block: the round and its two storage roots. Also the
/// persisted sync-cursor record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub namespace: Namespace,
    pub round: u64,
    pub io_root: Root,
    pub state_root: Root,
}

impl BlockSummary {
    pub fn from_header(header: &BlockHeader) -> Self {
        BlockSummary {
            namespace: header.namespace,
            round: header.round,
            io_root: Root::new(header.namespace, header.round, RootType::Io, header.io_root),
            state_root: Root::new(
                header.namespace,
                header.round,
                RootType::State,
                header.state_root,
            ),
        }
    }

    /// Placeholder summary with empty roots, used before the first real
    /// round has been applied.
    pub fn sentinel(namespace: Namespace, round: u64) -> Self {
        BlockSummary {
            namespace,
            round,
            io_root: Root::empty(namespace, round, RootType::Io),
            state_root: Root::empty(namespace, round, RootType::State),
        }
    }

    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> SyncResult<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Which storage roots of a round still need attention.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoundMask(u8);

impl RoundMask {
    pub const NONE: RoundMask = RoundMask(0);
    pub const IO: RoundMask = RoundMask(0b01);
    pub const STATE: RoundMask = RoundMask(0b10);
    pub const ALL: RoundMask = RoundMask(0b11);

    pub fn contains(self, other: RoundMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: RoundMask) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: RoundMask) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RoundMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(RoundMask::IO) {
            parts.push("io");
        }
        if self.contains(RoundMask::STATE) {
            parts.push("state");
        }
        write!(f, "mask{{{}}}", parts.join(", "))
    }
}
