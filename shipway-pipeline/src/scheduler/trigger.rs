//! Trigger listener
//!
//! Turns "new commit" notifications into runs. Every accepted commit gets
//! its own run; nothing is debounced or coalesced, so a burst of commits
//! queues one run per commit in the order they arrived.

use anyhow::Result;
use shipway_core::domain::run::{CommitRef, Run, TriggerSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::collaborator::source::CommitWatcher;
use crate::scheduler::engine::Pipeline;

/// Commits buffered between the poller and the listener
const EVENT_BUFFER: usize = 64;

pub struct TriggerListener {
    pipeline: Arc<Pipeline>,
    branch: String,
}

impl TriggerListener {
    /// Creates a listener for one branch of the pipeline's repository
    pub fn new(pipeline: Arc<Pipeline>, branch: impl Into<String>) -> Self {
        Self {
            pipeline,
            branch: branch.into(),
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Submits a run for a commit on the watched branch
    ///
    /// Returns `None` for commits on other branches.
    pub fn accept(&self, commit: CommitRef, trigger: TriggerSource) -> Option<Run> {
        if commit.branch != self.branch {
            debug!("Ignoring {} (watching {})", commit, self.branch);
            return None;
        }

        let (run, _handle) = self.pipeline.submit(commit, trigger);
        info!(run_id = %run.id, "Triggered run #{} for {}", run.sequence, run.commit);
        Some(run)
    }

    /// Submits one run per commit, in order
    pub fn accept_all(&self, commits: Vec<CommitRef>, trigger: TriggerSource) -> Vec<Run> {
        commits
            .into_iter()
            .filter_map(|commit| self.accept(commit, trigger))
            .collect()
    }

    /// Consumes commit events from a channel until it closes or shutdown
    ///
    /// Every run created here is attributed to `trigger`.
    pub async fn listen(
        &self,
        mut events: mpsc::Receiver<CommitRef>,
        trigger: TriggerSource,
        shutdown: CancellationToken,
    ) {
        info!("Listening for commits on {}", self.branch);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(commit) => {
                        self.accept(commit, trigger);
                    }
                    None => break,
                },
            }
        }

        info!("Commit listener stopped");
    }

    /// Polls a watcher for new commits until shutdown
    ///
    /// The poller feeds a channel that [`listen`](Self::listen) consumes, so
    /// polled commits go through the same path as any other event source.
    pub async fn watch<W: CommitWatcher>(
        &self,
        watcher: W,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let (events, receiver) = mpsc::channel(EVENT_BUFFER);
        let poller = poll_commits(watcher, &self.branch, interval, events, shutdown.clone());
        let (polled, ()) = tokio::join!(poller, self.listen(receiver, TriggerSource::Poller, shutdown));
        polled
    }
}

/// Sends every commit a watcher reports into `events` until shutdown or
/// until nobody listens any more
async fn poll_commits<W: CommitWatcher>(
    mut watcher: W,
    branch: &str,
    interval: Duration,
    events: mpsc::Sender<CommitRef>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(
        "Starting commit poller for {} (interval: {:?})",
        branch, interval
    );

    let mut ticker = tokio::time::interval(interval);

    'poll: loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        debug!("Polling for new commits");

        match watcher.poll().await {
            Ok(commits) if commits.is_empty() => debug!("No new commits"),
            Ok(commits) => {
                info!("Polled {} new commit(s) on {}", commits.len(), branch);
                for commit in commits {
                    if events.send(commit).await.is_err() {
                        break 'poll;
                    }
                }
            }
            Err(e) => error!("Error during poll cycle: {:#}", e),
        }
    }

    info!("Commit poller stopped");
    Ok(())
}
