//! Subscriber setup: stderr in the foreground, syslog when detached.
//!
//! Events carrying `fatal = true` go to syslog at `crit`; everything else
//! maps onto the matching syslog severity.

use std::fmt;
use std::sync::Mutex;

use syslog::{Facility, Formatter3164, Logger, LoggerBackend};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::{fmt as tracing_fmt, prelude::*, EnvFilter};

use crate::notifier::PROGRAM_NAME;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level`; `debug` forces the debug level.
pub fn init_logging(level: &str, debug: bool, use_syslog: bool) -> anyhow::Result<()> {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    if use_syslog {
        let layer = SyslogLayer::connect()?;
        tracing_subscriber::registry().with(layer).with(filter).try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(tracing_fmt::layer().with_target(false))
            .with(filter)
            .try_init()?;
    }

    Ok(())
}

/// Syslog severity used for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Crit,
    Err,
    Warning,
    Info,
    Debug,
}

pub fn severity_for(level: &Level, fatal: bool) -> Severity {
    if fatal {
        return Severity::Crit;
    }

    match *level {
        Level::ERROR => Severity::Err,
        Level::WARN => Severity::Warning,
        Level::INFO => Severity::Info,
        Level::DEBUG | Level::TRACE => Severity::Debug,
    }
}

/// Forwards tracing events to the local syslog daemon.
pub struct SyslogLayer {
    logger: Mutex<Logger<LoggerBackend, Formatter3164>>,
}

impl SyslogLayer {
    pub fn connect() -> anyhow::Result<Self> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: PROGRAM_NAME.to_string(),
            pid: std::process::id(),
        };

        let logger = syslog::unix(formatter)
            .map_err(|e| anyhow::anyhow!("could not connect to syslog: {}", e))?;

        Ok(Self {
            logger: Mutex::new(logger),
        })
    }
}

impl<S: Subscriber> Layer<S> for SyslogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let message = visitor.render();
        let severity = severity_for(event.metadata().level(), visitor.fatal);

        let Ok(mut logger) = self.logger.lock() else {
            return;
        };

        let result = match severity {
            Severity::Crit => logger.crit(message),
            Severity::Err => logger.err(message),
            Severity::Warning => logger.warning(message),
            Severity::Info => logger.info(message),
            Severity::Debug => logger.debug(message),
        };

        if let Err(e) = result {
            eprintln!("Failed to send to syslog: {}", e);
        }
    }
}

/// Collects the message and the `fatal` flag from an event.
#[derive(Debug, Default)]
pub struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
    fatal: bool,
}

impl MessageVisitor {
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// Message followed by any extra fields as `key=value`.
    pub fn render(&self) -> String {
        let mut out = self.message.clone();
        for (name, value) in &self.fields {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(name);
            out.push('=');
            out.push_str(value);
        }
        out
    }
}

impl Visit for MessageVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "fatal" {
            self.fatal = value;
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push((field.name().to_string(), format!("{:?}", value)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tracing::subscriber::with_default;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(severity_for(&Level::ERROR, true), Severity::Crit);
        assert_eq!(severity_for(&Level::INFO, true), Severity::Crit);
        assert_eq!(severity_for(&Level::ERROR, false), Severity::Err);
        assert_eq!(severity_for(&Level::WARN, false), Severity::Warning);
        assert_eq!(severity_for(&Level::INFO, false), Severity::Info);
        assert_eq!(severity_for(&Level::TRACE, false), Severity::Debug);
    }

    /// Records what the visitor extracted from each event.
    struct CaptureLayer {
        seen: Arc<Mutex<Vec<(String, bool)>>>,
    }

    impl<S: Subscriber> Layer<S> for CaptureLayer {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut visitor = MessageVisitor::default();
            event.record(&mut visitor);
            self.seen
                .lock()
                .unwrap()
                .push((visitor.render(), visitor.is_fatal()));
        }
    }

    #[test]
    fn test_visitor_extracts_message_and_fatal_flag() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(CaptureLayer {
            seen: Arc::clone(&seen),
        });

        with_default(subscriber, || {
            tracing::error!(fatal = true, "lost {}", "/var/log/auth.log");
            tracing::info!(address = "2001:db8::1", "blocked");
            tracing::warn!("plain");
        });

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("lost /var/log/auth.log".to_string(), true),
                ("blocked address=2001:db8::1".to_string(), false),
                ("plain".to_string(), false),
            ]
        );
    }
}
