//! Process lifecycle: termination signals and crash reporting.

use std::backtrace::Backtrace;
use std::io;
use std::panic::PanicHookInfo;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, info};

use crate::config::NotifyConfig;
use crate::notifier;

/// SIGTERM, SIGINT and SIGQUIT, any of which ends the daemon cleanly.
pub struct ShutdownSignals {
    term: Signal,
    int: Signal,
    quit: Signal,
}

impl ShutdownSignals {
    /// Register the handlers. Must be called inside a tokio runtime.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    /// Resolve once one of the signals arrives.
    pub async fn wait(&mut self) {
        tokio::select! {
            _ = self.term.recv() => info!("Received SIGTERM"),
            _ = self.int.recv() => info!("Received SIGINT"),
            _ = self.quit.recv() => info!("Received SIGQUIT"),
        }
    }
}

static ALREADY_CRASHED: AtomicBool = AtomicBool::new(false);

/// Report panics to syslog and the operator before the default hook runs.
///
/// Call from the thread that drives the daemon. Panics on other threads
/// belong to spawned tasks, which the runtime isolates, so they are not
/// reported. Only the first panic is reported; a panic while reporting is
/// left to the default hook alone.
pub fn install_crash_hook(notify: NotifyConfig) {
    let default_hook = std::panic::take_hook();
    let owner = thread::current().id();

    std::panic::set_hook(Box::new(move |info| {
        if claims_report(owner) {
            report_crash(&notify, info);
        }
        default_hook(info);
    }));
}

fn claims_report(owner: ThreadId) -> bool {
    thread::current().id() == owner && !ALREADY_CRASHED.swap(true, Ordering::SeqCst)
}

fn report_crash(notify: &NotifyConfig, info: &PanicHookInfo<'_>) {
    let backtrace = Backtrace::force_capture().to_string();
    let summary = crash_summary(info);

    error!(fatal = true, "{}", summary);
    for frame in backtrace.lines() {
        error!("{}", frame);
    }

    let body = format!("{}\n\n{}", summary, backtrace);
    if let Err(e) = notifier::send_crash_report(notify, &body) {
        error!("Could not mail crash report: {}", e);
    }
}

fn crash_summary(info: &PanicHookInfo<'_>) -> String {
    let payload = info.payload();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());

    match info.location() {
        Some(location) => format!(
            "Crashed at {}:{}: {}",
            location.file(),
            location.line(),
            message
        ),
        None => format!("Crashed: {}", message),
    }
}
