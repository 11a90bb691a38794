//! Ordered stage gate
//!
//! Admits runs into a stage one at a time, strictly in sequence order. Run
//! `n` enters only after every run before it has left the stage or given up
//! its place.

use std::collections::BTreeSet;
use std::sync::Mutex;
use tokio::sync::watch;

pub struct StageGate {
    /// Sequence number allowed to enter next
    serving: watch::Sender<u64>,
    /// Sequences released ahead of their turn
    released: Mutex<BTreeSet<u64>>,
}

impl Default for StageGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StageGate {
    pub fn new() -> Self {
        let (serving, _) = watch::channel(0);
        Self {
            serving,
            released: Mutex::new(BTreeSet::new()),
        }
    }

    /// Waits until `sequence` may enter and occupies the stage
    ///
    /// The stage is freed when the returned pass is dropped.
    pub async fn enter(&self, sequence: u64) -> GatePass<'_> {
        let mut turn = self.serving.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = turn.wait_for(|serving| *serving >= sequence).await;
        GatePass {
            gate: self,
            sequence,
        }
    }

    /// Gives up the place of `sequence`
    ///
    /// Releasing a sequence that already passed, or releasing twice, has no
    /// effect.
    pub fn release(&self, sequence: u64) {
        let mut released = self
            .released
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if sequence < *self.serving.borrow() {
            return;
        }
        released.insert(sequence);

        self.serving.send_modify(|serving| {
            while released.remove(&*serving) {
                *serving += 1;
            }
        });
    }

    /// Sequence allowed to enter next
    pub fn serving(&self) -> u64 {
        *self.serving.borrow()
    }
}

/// Occupancy of a stage by one run
#[must_use = "the stage is released when the pass is dropped"]
pub struct GatePass<'a> {
    gate: &'a StageGate,
    sequence: u64,
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        self.gate.release(self.sequence);
    }
}
