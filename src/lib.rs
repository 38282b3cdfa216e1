pub mod classifier;
pub mod clock;
pub mod committer;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod log_source;
pub mod logging;
pub mod monitor;
pub mod notifier;
pub mod registry;
pub mod scan;
pub mod watch;

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use clock::SystemClock;
use committer::DenyCommitter;
use config::Config;
use lifecycle::ShutdownSignals;
use monitor::Monitor;

/// How long shutdown waits for deny entries still being written.
const COMMIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The long-running monitor process.
pub struct Daemon {
    config: Config,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until SIGTERM, SIGINT or SIGQUIT.
    pub async fn run(self) -> Result<()> {
        let mut signals = ShutdownSignals::install().context("Failed to install signal handlers")?;
        self.run_until(async move { signals.wait().await }).await
    }

    /// Run until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Daemon starting up");

        let monitor_config = &self.config.monitor;
        let notifier = notifier::from_config(&self.config.notify)
            .context("Failed to set up notifications")?;
        let committer = DenyCommitter::new(
            monitor_config.deny_file.clone(),
            notifier,
            self.config.notify.resolve_names,
        );

        if !monitor_config.deny_file.is_file() {
            warn!(
                "Deny file {} does not exist; blocks will fail until it is created",
                monitor_config.deny_file.display()
            );
        }

        let mut monitor = Monitor::open(
            &monitor_config.auth_log,
            monitor_config.watcher_kind()?,
            monitor_config.reopen_policy(),
            committer,
            Arc::new(SystemClock),
        )?;

        let result = monitor.run(shutdown).await;

        let committer = monitor.committer_mut();
        if committer.in_flight() > 0 {
            info!("Waiting for {} pending block(s)", committer.in_flight());
            if tokio::time::timeout(COMMIT_DRAIN_TIMEOUT, committer.wait_all())
                .await
                .is_err()
            {
                warn!("Gave up waiting for pending blocks");
            }
        }

        info!("Daemon shutting down");
        result.map_err(Into::into)
    }
}
