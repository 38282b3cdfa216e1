//! Operator notifications.
//!
//! Block reports go out asynchronously from the commit task; crash reports
//! are sent synchronously from the panic hook. Without a working transport
//! both degrade to a logged warning.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::NotifyConfig;
use crate::error::NotifyError;

/// Name used in mail subjects and syslog.
pub const PROGRAM_NAME: &str = "hostwarden";

/// A host that was just written to the deny list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReport {
    pub address: String,
    /// Reverse DNS name, or "Unknown"
    pub name: String,
    pub deny_path: PathBuf,
}

/// Delivery of block reports.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_blocked(&self, report: &BlockReport) -> Result<(), NotifyError>;
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify_blocked(&self, report: &BlockReport) -> Result<(), NotifyError> {
        debug!("notifications disabled, not reporting {}", report.address);
        Ok(())
    }
}

pub fn block_subject(hostname: &str) -> String {
    format!("{} - {} Report", hostname, PROGRAM_NAME)
}

pub fn crash_subject(hostname: &str) -> String {
    format!("{} - {} Crash", hostname, PROGRAM_NAME)
}

pub fn block_body(report: &BlockReport) -> String {
    format!(
        "Added the following hosts to {}:\n\n{} ({})\n\n{}",
        report.deny_path.display(),
        report.address,
        report.name,
        "-".repeat(69)
    )
}

/// Local host name for subjects.
pub fn local_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Build the notifier described by `config`.
pub fn from_config(config: &NotifyConfig) -> Result<Arc<dyn Notifier>, NotifyError> {
    if !config.enabled || config.transport == "none" {
        info!("Operator notifications are disabled");
        return Ok(Arc::new(NullNotifier));
    }
    mail_notifier(config)
}

#[cfg(feature = "mail")]
fn mail_notifier(config: &NotifyConfig) -> Result<Arc<dyn Notifier>, NotifyError> {
    let notifier = mail::MailNotifier::new(config)?;
    info!(
        "Reporting blocks to {} via {}",
        config.recipient, config.transport
    );
    Ok(Arc::new(notifier))
}

#[cfg(not(feature = "mail"))]
fn mail_notifier(_config: &NotifyConfig) -> Result<Arc<dyn Notifier>, NotifyError> {
    tracing::warn!("Built without mail support, notifications are disabled");
    Ok(Arc::new(NullNotifier))
}

/// Send a crash report, blocking. Used from the panic hook.
pub fn send_crash_report(config: &NotifyConfig, body: &str) -> Result<(), NotifyError> {
    if !config.enabled || config.transport == "none" {
        return Err(NotifyError::Transport("notifications disabled".to_string()));
    }
    send_crash_mail(config, body)
}

#[cfg(feature = "mail")]
fn send_crash_mail(config: &NotifyConfig, body: &str) -> Result<(), NotifyError> {
    mail::send_blocking(config, &crash_subject(&local_hostname()), body)
}

#[cfg(not(feature = "mail"))]
fn send_crash_mail(_config: &NotifyConfig, _body: &str) -> Result<(), NotifyError> {
    Err(NotifyError::Transport("built without mail support".to_string()))
}

#[cfg(feature = "mail")]
mod mail {
    use async_trait::async_trait;
    use lettre::message::header::ContentType;
    use lettre::message::Mailbox;
    use lettre::transport::smtp::authentication::Credentials;
    use lettre::transport::smtp::client::{Tls, TlsParameters};
    use lettre::{
        AsyncSendmailTransport, AsyncSmtpTransport, AsyncTransport, Message, SendmailTransport,
        SmtpTransport, Tokio1Executor, Transport,
    };

    use super::{block_body, block_subject, local_hostname, BlockReport, Notifier};
    use crate::config::{NotifyConfig, SmtpConfig};
    use crate::error::NotifyError;

    enum AsyncMailer {
        Sendmail(AsyncSendmailTransport<Tokio1Executor>),
        Smtp(AsyncSmtpTransport<Tokio1Executor>),
    }

    /// Mails block reports to the operator.
    pub struct MailNotifier {
        mailer: AsyncMailer,
        from: Mailbox,
        to: Mailbox,
        hostname: String,
    }

    impl MailNotifier {
        pub fn new(config: &NotifyConfig) -> Result<Self, NotifyError> {
            let mailer = match config.transport.as_str() {
                "sendmail" => {
                    AsyncMailer::Sendmail(AsyncSendmailTransport::<Tokio1Executor>::new())
                }
                "smtp" => AsyncMailer::Smtp(async_smtp(&config.smtp)?),
                other => {
                    return Err(NotifyError::Transport(format!(
                        "unknown mail transport: {}",
                        other
                    )))
                }
            };

            Ok(Self {
                mailer,
                from: parse_mailbox(&config.from)?,
                to: parse_mailbox(&config.recipient)?,
                hostname: local_hostname(),
            })
        }
    }

    #[async_trait]
    impl Notifier for MailNotifier {
        async fn notify_blocked(&self, report: &BlockReport) -> Result<(), NotifyError> {
            let message = build_message(
                &self.from,
                &self.to,
                &block_subject(&self.hostname),
                block_body(report),
            )?;

            match &self.mailer {
                AsyncMailer::Sendmail(transport) => transport
                    .send(message)
                    .await
                    .map(|_| ())
                    .map_err(|e| NotifyError::Transport(e.to_string())),
                AsyncMailer::Smtp(transport) => transport
                    .send(message)
                    .await
                    .map(|_| ())
                    .map_err(|e| NotifyError::Transport(e.to_string())),
            }
        }
    }

    pub fn send_blocking(
        config: &NotifyConfig,
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        let message = build_message(
            &parse_mailbox(&config.from)?,
            &parse_mailbox(&config.recipient)?,
            subject,
            body.to_string(),
        )?;

        match config.transport.as_str() {
            "sendmail" => SendmailTransport::new()
                .send(&message)
                .map(|_| ())
                .map_err(|e| NotifyError::Transport(e.to_string())),
            "smtp" => blocking_smtp(&config.smtp)?
                .send(&message)
                .map(|_| ())
                .map_err(|e| NotifyError::Transport(e.to_string())),
            other => Err(NotifyError::Transport(format!(
                "unknown mail transport: {}",
                other
            ))),
        }
    }

    fn parse_mailbox(text: &str) -> Result<Mailbox, NotifyError> {
        text.parse()
            .map_err(|e: lettre::address::AddressError| {
                NotifyError::Address(format!("{}: {}", text, e))
            })
    }

    fn build_message(
        from: &Mailbox,
        to: &Mailbox,
        subject: &str,
        body: String,
    ) -> Result<Message, NotifyError> {
        Message::builder()
            .from(from.clone())
            .to(to.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| NotifyError::Message(e.to_string()))
    }

    fn tls_mode(smtp: &SmtpConfig) -> Result<Tls, NotifyError> {
        let params = || {
            TlsParameters::new(smtp.host.clone()).map_err(|e| NotifyError::Transport(e.to_string()))
        };

        Ok(match smtp.tls.as_str() {
            "tls" => Tls::Wrapper(params()?),
            "starttls" => Tls::Required(params()?),
            _ => Tls::None,
        })
    }

    fn async_smtp(smtp: &SmtpConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>, NotifyError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
            .port(smtp.port)
            .tls(tls_mode(smtp)?);

        if let (Some(user), Some(pass)) = (&smtp.username, &smtp.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(builder.build())
    }

    fn blocking_smtp(smtp: &SmtpConfig) -> Result<SmtpTransport, NotifyError> {
        let mut builder = SmtpTransport::builder_dangerous(&smtp.host)
            .port(smtp.port)
            .tls(tls_mode(smtp)?);

        if let (Some(user), Some(pass)) = (&smtp.username, &smtp.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(builder.build())
    }

}

#[cfg(feature = "mail")]
pub use mail::MailNotifier;
