//! Writing blocked addresses to the deny list.
//!
//! [`DenyCommitter::commit`] returns at once. The append, reverse lookup and
//! operator report run in a task on a [`JoinSet`] that the event loop reaps
//! between lines, so a slow mail server or a full disk never holds up log
//! processing.

use std::fs::OpenOptions;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::CommitError;
use crate::notifier::{BlockReport, Notifier};

/// Daemon name written in front of each deny entry.
pub const DENY_TAG: &str = "sshd";

/// Host name reported when reverse lookup fails or is disabled.
pub const UNKNOWN_HOST: &str = "Unknown";

/// Receives addresses that crossed the threshold.
pub trait Committer: Send {
    fn commit(&mut self, address: &str);

    /// Collect finished background work, if any.
    fn reap(&mut self) {}
}

/// Format one deny list line for `address`.
pub fn deny_entry(tag: &str, address: &str) -> String {
    if cfg!(feature = "ipv4") && !address.contains(':') {
        format!("{}: {}", tag, address)
    } else {
        format!("{}: [{}]", tag, address)
    }
}

/// Append `entry` and a newline to an existing file, then sync it.
pub fn append_entry(path: &Path, entry: &str) -> Result<(), CommitError> {
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|source| CommitError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    let line = format!("{}\n", entry);
    let written = file.write(line.as_bytes()).map_err(|source| CommitError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    if written != line.len() {
        warn!(
            "assertion failed: short write to {} ({} of {} bytes)",
            path.display(),
            written,
            line.len()
        );
    }

    file.sync_all().map_err(|source| CommitError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Best-effort reverse DNS for the block report.
pub async fn resolve_name(address: &str) -> String {
    let Ok(ip) = address.parse::<IpAddr>() else {
        return UNKNOWN_HOST.to_string();
    };

    let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
        debug!("system resolver config unavailable ({}), using defaults", e);
        TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
    });

    match resolver.reverse_lookup(ip).await {
        Ok(response) => response
            .iter()
            .next()
            .map(|name| name.to_string().trim_end_matches('.').to_string())
            .unwrap_or_else(|| UNKNOWN_HOST.to_string()),
        Err(e) => {
            debug!("reverse lookup of {} failed: {}", address, e);
            UNKNOWN_HOST.to_string()
        }
    }
}

/// Commits to a hosts.deny style file and reports each block.
pub struct DenyCommitter {
    deny_path: PathBuf,
    notifier: Arc<dyn Notifier>,
    resolve_names: bool,
    tasks: JoinSet<Result<(), CommitError>>,
}

impl DenyCommitter {
    pub fn new(deny_path: PathBuf, notifier: Arc<dyn Notifier>, resolve_names: bool) -> Self {
        Self {
            deny_path,
            notifier,
            resolve_names,
            tasks: JoinSet::new(),
        }
    }

    pub fn deny_path(&self) -> &Path {
        &self.deny_path
    }

    /// Commit tasks not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every outstanding commit task.
    pub async fn wait_all(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            log_outcome(joined);
        }
    }
}

impl Committer for DenyCommitter {
    fn commit(&mut self, address: &str) {
        let address = address.to_string();
        let deny_path = self.deny_path.clone();
        let notifier = Arc::clone(&self.notifier);
        let resolve_names = self.resolve_names;

        self.tasks.spawn(async move {
            let entry = deny_entry(DENY_TAG, &address);
            let path = deny_path.clone();
            tokio::task::spawn_blocking(move || append_entry(&path, &entry)).await??;
            info!("Blocked {} in {}", address, deny_path.display());

            let name = if resolve_names {
                resolve_name(&address).await
            } else {
                UNKNOWN_HOST.to_string()
            };

            let report = BlockReport {
                address,
                name,
                deny_path,
            };
            if let Err(e) = notifier.notify_blocked(&report).await {
                warn!("Could not report block of {}: {}", report.address, e);
            }
            Ok::<(), CommitError>(())
        });
    }

    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            log_outcome(joined);
        }
    }
}

fn log_outcome(joined: Result<Result<(), CommitError>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Commit failed: {}", e),
        Err(e) if e.is_panic() => error!("Commit task panicked: {}", e),
        Err(e) => debug!("Commit task cancelled: {}", e),
    }
}

/// Remembers committed addresses instead of writing them anywhere.
#[derive(Debug, Default, Clone)]
pub struct RecordingCommitter {
    pub committed: Vec<String>,
}

impl Committer for RecordingCommitter {
    fn commit(&mut self, address: &str) {
        self.committed.push(address.to_string());
    }
}
