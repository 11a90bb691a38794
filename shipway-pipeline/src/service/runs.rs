//! Run registry
//!
//! Keeps every run the pipeline has seen and publishes a [`RunEvent`] after
//! each change so monitors can follow progress.

use shipway_core::domain::run::Run;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Capacity of the event channel; slow subscribers see `Lagged`
const EVENT_CAPACITY: usize = 256;

/// Snapshot of a run after a change
#[derive(Debug, Clone)]
pub struct RunEvent {
    pub run: Run,
}

pub struct RunRegistry {
    runs: RwLock<HashMap<Uuid, Run>>,
    events: broadcast::Sender<RunEvent>,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            runs: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn insert(&self, run: Run) {
        self.runs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(run.id, run.clone());
        self.publish(run);
    }

    pub fn get(&self, id: Uuid) -> Option<Run> {
        self.runs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    /// All runs in admission order
    pub fn list(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .runs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.sequence);
        runs
    }

    /// Applies a change to a run and publishes the result
    ///
    /// Returns the updated run, or `None` if the run is unknown.
    pub fn update<F>(&self, id: Uuid, change: F) -> Option<Run>
    where
        F: FnOnce(&mut Run),
    {
        let updated = {
            let mut runs = self
                .runs
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let run = runs.get_mut(&id)?;
            change(run);
            run.clone()
        };

        self.publish(updated.clone());
        Some(updated)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    fn publish(&self, run: Run) {
        // No subscribers is fine
        let _ = self.events.send(RunEvent { run });
    }
}
