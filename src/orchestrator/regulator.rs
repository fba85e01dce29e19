//! Turn Regulator
//!
//! A single token circulates between the stages of a pipeline in declared
//! order. Only the holder drains and processes; when done it passes the
//! token to the next stage that has not retired, wrapping to the first.

use parking_lot::Mutex;
use tokio::sync::watch;

pub struct TurnRegulator {
    holder: watch::Sender<usize>,
    retired: Mutex<Vec<bool>>,
}

impl TurnRegulator {
    /// Creates a regulator for `stages` participants with the token on stage 0.
    pub fn new(stages: usize) -> Self {
        let (holder, _) = watch::channel(0);
        Self {
            holder,
            retired: Mutex::new(vec![false; stages]),
        }
    }

    /// Index of the stage currently holding the token.
    pub fn holder(&self) -> usize {
        *self.holder.borrow()
    }

    /// Waits until `stage` holds the token.
    pub async fn wait_turn(&self, stage: usize) {
        let mut rx = self.holder.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|holder| *holder == stage).await;
    }

    /// Hands the token from `stage` to the next stage still taking turns.
    /// Keeps it on `stage` when it is the only one left.
    pub fn pass(&self, stage: usize) {
        let retired = self.retired.lock();
        if let Some(next) = next_active(&retired, stage) {
            self.holder.send_replace(next);
        }
    }

    /// Removes `stage` from the rotation. A retiring holder passes the token on.
    pub fn retire(&self, stage: usize) {
        let mut retired = self.retired.lock();
        if let Some(slot) = retired.get_mut(stage) {
            *slot = true;
        }
        if *self.holder.borrow() == stage
            && let Some(next) = next_active(&retired, stage)
        {
            self.holder.send_replace(next);
        }
    }

    pub fn is_retired(&self, stage: usize) -> bool {
        self.retired.lock().get(stage).copied().unwrap_or(true)
    }
}

/// First non-retired stage after `from`, wrapping around and ending with
/// `from` itself.
fn next_active(retired: &[bool], from: usize) -> Option<usize> {
    let n = retired.len();
    (1..=n)
        .map(|offset| (from + offset) % n)
        .find(|candidate| !retired[*candidate])
}
