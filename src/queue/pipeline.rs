//! FIFO work pipeline with completion acknowledgment.
//!
//! Dequeueing and acknowledging are separate steps: an item counts as
//! unfinished from `put` until the matching `task_done`, so a submitter can
//! wait on [`WorkPipeline::join`] for workers to finish rather than for the
//! queue to merely empty.

use super::types::ProcessId;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct PipelineState {
    items: VecDeque<ProcessId>,
    unfinished: usize,
}

#[derive(Default)]
pub struct WorkPipeline {
    state: Mutex<PipelineState>,
    drained: Notify,
}

impl WorkPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, process_id: ProcessId) {
        let mut state = self.state.lock();
        state.items.push_back(process_id);
        state.unfinished += 1;
    }

    /// Non-blocking dequeue. `None` means the queue is empty right now.
    pub fn try_get(&self) -> Option<ProcessId> {
        self.state.lock().items.pop_front()
    }

    /// Acknowledges one dequeued item.
    ///
    /// Fails when called more times than items were put.
    pub fn task_done(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.unfinished == 0 {
            return Err(anyhow::anyhow!("task_done() called too many times"));
        }
        state.unfinished -= 1;
        if state.unfinished == 0 {
            self.drained.notify_waiters();
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn unfinished(&self) -> usize {
        self.state.lock().unfinished
    }

    /// Waits until every item put so far has been acknowledged.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn join(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.unfinished() == 0 {
                return true;
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.unfinished() == 0;
                    }
                }
                None => notified.await,
            }
        }
    }
}
