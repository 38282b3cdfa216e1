//! Offline replay of a log file through the tracker.
//!
//! All lines are treated as arriving at the same instant, so nothing expires
//! during the replay and counts accumulate across the whole file.

use chrono::{DateTime, Utc};
use std::io;
use std::path::Path;

use crate::classifier::{classify, Attempt, LineEvent};
use crate::committer::RecordingCommitter;
use crate::log_source::LogSource;
use crate::monitor::Tracker;
use crate::registry::{TrackedHost, UpdateAction};

/// One line that counted as a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEvent {
    pub line_number: usize,
    pub attempt: Attempt,
    pub action: UpdateAction,
    /// Line came from a "last message repeated" continuation
    pub continuation: bool,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub lines: usize,
    pub events: Vec<ScanEvent>,
    /// Addresses in commit order; may repeat
    pub blocked: Vec<String>,
    /// Final registry contents, soonest expiry first
    pub hosts: Vec<TrackedHost>,
}

/// Replay `path` from its first byte as of `now`.
pub fn scan_file(path: &Path, now: DateTime<Utc>) -> io::Result<ScanReport> {
    let mut source = LogSource::open_from_start(path)?;
    let mut tracker = Tracker::new();
    let mut committer = RecordingCommitter::default();
    let mut report = ScanReport::default();

    while let Some(line) = source.next_line()? {
        report.lines += 1;

        let continuation = matches!(classify(&line), LineEvent::Continuation { .. });
        let Some(attempt) = tracker.observe(&line) else {
            continue;
        };
        let action = tracker.record_attempt(&attempt, now, &mut committer);

        report.events.push(ScanEvent {
            line_number: report.lines,
            attempt,
            action,
            continuation,
        });
    }

    report.blocked = committer.committed;
    report.hosts = tracker.registry().iter_by_expiry().cloned().collect();
    Ok(report)
}
