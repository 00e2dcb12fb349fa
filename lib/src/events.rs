use std::sync::Arc;
use std::path::PathBuf;

use tokio::sync::broadcast;

/// A pipeline finished a run that changed files on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub pipeline: Arc<str>,
    /// Changed files: the pipeline's output directory joined with each
    /// written asset's path.
    pub changed: Vec<PathBuf>,
}

/// Fan-out channel from pipelines to whoever listens, usually the dev
/// server. Publishing never blocks and never fails: with no subscribers
/// the message is dropped, and slow subscribers see a lag instead of
/// holding the publisher up.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Completion>,
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 64;

    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventBus { tx }
    }

    pub fn emit(&self, completion: Completion) {
        let changed = completion.changed.len();
        match self.tx.send(completion) {
            Ok(receivers) => tracing::debug!(changed, receivers, "published completion"),
            Err(_) => tracing::trace!(changed, "completion had no subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Completion> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(Self::DEFAULT_CAPACITY)
    }
}
