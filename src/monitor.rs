//! The event loop tying the log source to the registry.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::classifier::{Attempt, ClassifierContext};
use crate::clock::Clock;
use crate::committer::Committer;
use crate::error::{MonitorError, Result, RotationError};
use crate::log_source::{LogSource, ReopenFrom, ReopenPolicy};
use crate::registry::{HostRegistry, TrackedHost, UpdateAction};
use crate::watch::{FileWatcher, WatchSignal, WatcherKind};

/// Classifier state plus the host registry.
#[derive(Debug, Default)]
pub struct Tracker {
    context: ClassifierContext,
    registry: HostRegistry,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one log line. Returns what the registry did, if the line counted.
    pub fn record_line(
        &mut self,
        line: &str,
        now: DateTime<Utc>,
        committer: &mut dyn Committer,
    ) -> Option<UpdateAction> {
        let attempt = self.observe(line)?;
        Some(self.record_attempt(&attempt, now, committer))
    }

    /// Classify `line` against the previous one without touching the registry.
    pub fn observe(&mut self, line: &str) -> Option<Attempt> {
        self.context.observe(line)
    }

    pub fn record_attempt(
        &mut self,
        attempt: &Attempt,
        now: DateTime<Utc>,
        committer: &mut dyn Committer,
    ) -> UpdateAction {
        let action = self.registry.update(&attempt.address, attempt.count, now);
        match action {
            UpdateAction::Commit => committer.commit(&attempt.address),
            UpdateAction::InsertRequired => {
                let host = self.registry.insert(&attempt.address, attempt.count, now);
                // Committed here without setting the flag
                if host.over_threshold() {
                    committer.commit(&attempt.address);
                }
            }
            UpdateAction::Updated => {}
        }
        action
    }

    pub fn evict(&mut self, now: DateTime<Utc>) -> Vec<TrackedHost> {
        self.registry.evict_expired(now)
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    pub fn context(&self) -> &ClassifierContext {
        &self.context
    }
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Watching,
    Recovering,
}

enum Step {
    Shutdown,
    Signal(WatchSignal),
    WatchClosed,
    Expiry,
}

/// Follows the auth log and drives the tracker.
pub struct Monitor<C: Committer> {
    source: LogSource,
    watcher: FileWatcher,
    tracker: Tracker,
    committer: C,
    clock: Arc<dyn Clock>,
    reopen: ReopenPolicy,
    state: LoopState,
}

impl<C: Committer> Monitor<C> {
    /// Open `path` at its end and start watching it.
    pub fn open(
        path: &Path,
        kind: WatcherKind,
        reopen: ReopenPolicy,
        committer: C,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let source = LogSource::open(path).map_err(|source| MonitorError::OpenLog {
            path: path.to_path_buf(),
            source,
        })?;

        let mut watcher = FileWatcher::new(path, kind)?;
        watcher.watch()?;

        info!("Monitoring {} from offset {}", path.display(), source.position());

        Ok(Self {
            source,
            watcher,
            tracker: Tracker::new(),
            committer,
            clock,
            reopen,
            state: LoopState::Watching,
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn committer(&self) -> &C {
        &self.committer
    }

    pub fn committer_mut(&mut self) -> &mut C {
        &mut self.committer
    }

    /// Run until `shutdown` resolves or a fatal error occurs.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        self.drain();

        loop {
            let wait = self.tracker.registry().time_to_soonest(self.clock.now());

            let step = tokio::select! {
                _ = &mut shutdown => Step::Shutdown,
                signal = self.watcher.next_signal() => match signal {
                    Some(signal) => Step::Signal(signal),
                    None => Step::WatchClosed,
                },
                _ = expiry(wait) => Step::Expiry,
            };

            match step {
                Step::Shutdown => {
                    info!("Shutdown requested, leaving monitor loop");
                    return Ok(());
                }
                Step::WatchClosed => {
                    error!(
                        fatal = true,
                        "File watcher for {} went away",
                        self.source.path().display()
                    );
                    return Err(MonitorError::WatchClosed);
                }
                Step::Signal(WatchSignal::Error(e)) => {
                    warn!("File watcher error: {}", e);
                }
                Step::Signal(WatchSignal::Changed) => {
                    self.drain();
                    // A missed rotation surfaces as a write to the new file
                    if self.source.is_rotated()
                        && self
                            .recover_or_shutdown(&mut shutdown, ReopenFrom::Start)
                            .await?
                    {
                        return Ok(());
                    }
                }
                Step::Signal(WatchSignal::Rotated) => {
                    if self
                        .recover_or_shutdown(&mut shutdown, ReopenFrom::End)
                        .await?
                    {
                        return Ok(());
                    }
                }
                Step::Expiry => {}
            }

            self.evict();
        }
    }

    /// Recovery may wait for a long time; a shutdown request still wins.
    /// Returns true when shutdown was requested.
    async fn recover_or_shutdown<F>(
        &mut self,
        shutdown: &mut std::pin::Pin<&mut F>,
        from: ReopenFrom,
    ) -> Result<bool>
    where
        F: Future<Output = ()>,
    {
        let outcome = tokio::select! {
            _ = shutdown.as_mut() => None,
            res = self.recover(from) => Some(res),
        };

        match outcome {
            None => {
                info!("Shutdown requested during log recovery");
                Ok(true)
            }
            Some(Ok(())) => Ok(false),
            Some(Err(e)) => {
                error!(fatal = true, "Lost {}: {}", self.source.path().display(), e);
                Err(MonitorError::from(e))
            }
        }
    }

    /// Classify every complete line currently available.
    fn drain(&mut self) -> usize {
        if let Err(e) = self.source.check_truncation() {
            warn!("Could not stat {}: {}", self.source.path().display(), e);
        }

        let mut lines = 0;
        loop {
            match self.source.next_line() {
                Ok(Some(line)) => {
                    let now = self.clock.now();
                    self.tracker.record_line(&line, now, &mut self.committer);
                    lines += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Error reading {}: {}", self.source.path().display(), e);
                    break;
                }
            }
        }

        if lines > 0 {
            debug!(
                "processed {} line(s), {} host(s) tracked",
                lines,
                self.tracker.registry().len()
            );
        }
        lines
    }

    fn evict(&mut self) {
        for host in self.tracker.evict(self.clock.now()) {
            debug!(
                "forgetting {} after {} attempt(s), first seen {}",
                host.address, host.attempts, host.first_seen
            );
        }
        self.committer.reap();
    }

    /// Finish the rotated file, then follow the new one at the same path.
    async fn recover(&mut self, from: ReopenFrom) -> std::result::Result<(), RotationError> {
        self.state = LoopState::Recovering;
        info!("{} was rotated, reopening", self.source.path().display());

        self.drain();
        self.watcher.unwatch();
        self.source.reopen(self.reopen, from).await?;
        self.watcher.watch().map_err(|source| RotationError::Rewatch {
            path: self.source.path().to_path_buf(),
            source,
        })?;

        let dropped = self.watcher.discard_pending();
        if dropped > 0 {
            debug!("discarded {} stale watch event(s)", dropped);
        }

        self.state = LoopState::Watching;
        // Lines written between reopen and rewatch
        self.drain();
        Ok(())
    }
}

async fn expiry(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending::<()>().await,
    }
}
