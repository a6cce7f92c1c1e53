use async_trait::async_trait;
use tokio::sync::mpsc;

use storage_trellis::{CheckpointManifest, Root, WriteLog};

use crate::errors::SyncResult;
use crate::types::BlockSummary;

/// A finite, non-restartable sequence of write-log chunks. The stream may
/// fail mid-way; consumers treat any failure as transient and re-request
/// the whole diff.
pub struct DiffStream {
    receiver: mpsc::Receiver<SyncResult<WriteLog>>,
}

impl DiffStream {
    pub fn new(receiver: mpsc::Receiver<SyncResult<WriteLog>>) -> Self {
        DiffStream { receiver }
    }

    /// A pre-buffered stream, for in-memory transports and tests.
    pub fn from_chunks(chunks: Vec<WriteLog>) -> Self {
        let (sender, receiver) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            // Capacity matches the chunk count, so this cannot block.
            let _ = sender.try_send(Ok(chunk));
        }
        DiffStream { receiver }
    }

    pub async fn next(&mut self) -> Option<SyncResult<WriteLog>> {
        self.receiver.recv().await
    }

    /// Drain the stream, concatenating all chunks.
    pub async fn collect(mut self) -> SyncResult<WriteLog> {
        let mut out = WriteLog::new();
        while let Some(chunk) = self.next().await {
            out.extend(chunk?);
        }
        Ok(out)
    }
}

/// Remote access to per-round write-log diffs. A request whose start and
/// end roots are equal yields an empty stream.
#[async_trait]
pub trait DiffClient: Send + Sync {
    async fn get_diff(&self, start_root: Root, end_root: Root) -> SyncResult<DiffStream>;
}

/// A checkpoint advertised by a peer: the block summary it corresponds to
/// and one manifest per storage root.
#[derive(Clone, Debug)]
pub struct CheckpointOffer {
    pub summary: BlockSummary,
    pub manifests: Vec<CheckpointManifest>,
}

/// Remote access to full checkpoints for initial sync.
#[async_trait]
pub trait CheckpointProvider: Send + Sync {
    async fn latest_checkpoint(&self) -> SyncResult<Option<CheckpointOffer>>;
    async fn fetch_chunk(
        &self,
        manifest: &CheckpointManifest,
        index: usize,
    ) -> SyncResult<Vec<u8>>;
}
