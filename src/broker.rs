use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::types::Block;

/// Block fan-out with replay-latest semantics: a new subscriber receives
/// the most recent block exactly once, delivered under the broker's lock,
/// followed by every later publication. Consumers deduplicate the replay
/// by remembering the last round they processed.
#[derive(Default)]
pub struct BlockBroker {
    inner: Mutex<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    latest: Option<Block>,
    subscribers: Vec<mpsc::UnboundedSender<Block>>,
}

impl BlockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a block to all live subscribers and remember it for replay.
    pub fn publish(&self, block: Block) {
        let mut inner = self.inner.lock();
        inner.latest = Some(block);
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(block).is_ok());
    }

    /// Subscribe; the current latest block, if any, is replayed first.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Block> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        if let Some(latest) = inner.latest {
            let _ = sender.send(latest);
        }
        inner.subscribers.push(sender);
        receiver
    }

    pub fn latest(&self) -> Option<Block> {
        self.inner.lock().latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockHeader;

    fn block(round: u64) -> Block {
        Block {
            header: BlockHeader {
                namespace: [1u8; 32],
                round,
                io_root: [0u8; 32],
                state_root: [0u8; 32],
            },
        }
    }

    #[tokio::test]
    async fn late_subscriber_sees_the_latest_block_once() {
        let broker = BlockBroker::new();
        broker.publish(block(1));
        broker.publish(block(2));

        let mut sub = broker.subscribe();
        let replay = sub.recv().await.expect("replay");
        assert_eq!(replay.header.round, 2);

        broker.publish(block(3));
        assert_eq!(sub.recv().await.expect("live").header.round, 3);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let broker = BlockBroker::new();
        let sub = broker.subscribe();
        drop(sub);
        broker.publish(block(1));
        assert_eq!(broker.inner.lock().subscribers.len(), 0);
    }
}
