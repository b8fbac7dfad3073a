use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::Result;
use storage::{NodeId, StorageEngine, UpdateStamp};

/// Logical clock issuing update stamps for one node.
///
/// The counter never goes backwards: it is persisted before a stamp is
/// handed out, and it jumps forward whenever a replicated write carries a
/// higher foreign counter, so the next local stamp beats everything this
/// node has seen.
pub struct UpdateClock {
    node: NodeId,
    counter: Mutex<u64>,
    storage: Arc<StorageEngine>,
}

impl UpdateClock {
    /// Restores the counter persisted by a previous run.
    pub async fn restore(node: NodeId, storage: Arc<StorageEngine>) -> Result<Self> {
        let counter = storage.load_clock().await?;
        info!(node = %node, counter, "Restored update clock");
        Ok(Self {
            node,
            counter: Mutex::new(counter),
            storage,
        })
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub async fn stamp(&self) -> Result<UpdateStamp> {
        let mut counter = self.counter.lock().await;
        let next = *counter + 1;
        self.storage.store_clock(next).await?;
        *counter = next;
        Ok(UpdateStamp::new(next, self.node.clone()))
    }

    /// Advances past `stamp` if it is ahead of the local counter.
    pub async fn observe(&self, stamp: &UpdateStamp) -> Result<()> {
        let mut counter = self.counter.lock().await;
        if stamp.counter > *counter {
            self.storage.store_clock(stamp.counter).await?;
            debug!(from = *counter, to = stamp.counter, origin = %stamp.origin, "Clock advanced");
            *counter = stamp.counter;
        }
        Ok(())
    }

    pub async fn current(&self) -> u64 {
        *self.counter.lock().await
    }
}
