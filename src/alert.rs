//! Alert sinks for failed deliveries and virus-flagged mail.
//!
//! Alerts are best-effort: the pipeline logs a failed alert and moves on.
//! Two real strategies exist, picked by `[alert] kind`:
//! - `smtp`: a plain-text email through the local relay
//! - `script`: an external notifier fed the body on stdin

use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::Message;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::AlertConfig;
use crate::error::{AlertError, RelayError};
use crate::relay::MailTransport;

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertCategory {
    /// A message failed somewhere in the pipeline, or the pass could not start.
    Error,
    /// A message flagged by the upstream virus scan was delivered.
    Virus,
}

impl AlertCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Virus => "virus",
        }
    }

    pub fn subject(self) -> &'static str {
        match self {
            Self::Error => "fetchses delivery error",
            Self::Virus => "fetchses virus alert",
        }
    }
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub category: AlertCategory,
    pub body: String,
}

impl Alert {
    pub fn new(category: AlertCategory, body: impl Into<String>) -> Self {
        Self {
            category,
            body: body.into(),
        }
    }
}

/// Destination for alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Short name for log lines.
    fn name(&self) -> &str;

    async fn notify(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Build the sink selected by configuration. SMTP alerts share `transport`
/// with message delivery.
pub fn build_alert_sink(config: &AlertConfig, transport: Arc<dyn MailTransport>) -> Arc<dyn AlertSink> {
    match config {
        AlertConfig::Disabled => Arc::new(DisabledAlert),
        AlertConfig::Smtp { from, to } => Arc::new(SmtpAlert::new(transport, from.clone(), to.clone())),
        AlertConfig::Script {
            program,
            args,
            timeout_secs,
        } => Arc::new(
            ScriptAlert::new(program.clone())
                .with_args(args.clone())
                .with_timeout(Duration::from_secs(*timeout_secs)),
        ),
    }
}

/// Sink for failures that happen before the SMTP relay exists, such as
/// the relay itself failing to build. `None` when the configured sink
/// needs that relay.
pub fn standalone_alert_sink(config: &AlertConfig) -> Option<Arc<dyn AlertSink>> {
    match config {
        AlertConfig::Smtp { .. } => None,
        AlertConfig::Disabled | AlertConfig::Script { .. } => {
            Some(build_alert_sink(config, Arc::new(NoTransport)))
        }
    }
}

/// Placeholder transport for sinks that never send mail.
struct NoTransport;

#[async_trait]
impl MailTransport for NoTransport {
    async fn send(&self, _: &str, _: &[String], _: &[u8]) -> Result<(), RelayError> {
        Err(RelayError::Transport {
            host: "none".into(),
            reason: "no SMTP relay available".into(),
        })
    }
}

// ── Disabled ────────────────────────────────────────────────────────

/// Drops alerts. Used when no alert channel is configured.
#[derive(Debug, Default)]
pub struct DisabledAlert;

#[async_trait]
impl AlertSink for DisabledAlert {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn notify(&self, alert: &Alert) -> Result<(), AlertError> {
        debug!(category = %alert.category, "Alerting disabled, dropping alert");
        Ok(())
    }
}

// ── SMTP ────────────────────────────────────────────────────────────

/// Emails alerts to a fixed recipient list.
pub struct SmtpAlert {
    transport: Arc<dyn MailTransport>,
    from: String,
    to: Vec<String>,
}

impl SmtpAlert {
    /// Create an SMTP sink that sends through `transport`.
    pub fn new(transport: Arc<dyn MailTransport>, from: String, to: Vec<String>) -> Self {
        Self { transport, from, to }
    }

    fn build(&self, alert: &Alert) -> Result<(String, Vec<String>, Vec<u8>), AlertError> {
        let parse = |s: &str| {
            s.parse::<Mailbox>()
                .map_err(|e| AlertError::Build(format!("invalid address {s}: {e}")))
        };

        let from = parse(&self.from)?;
        let envelope_from = from.email.to_string();
        let mut builder = Message::builder().from(from);
        let mut recipients = Vec::with_capacity(self.to.len());
        for to in &self.to {
            let mailbox = parse(to)?;
            recipients.push(mailbox.email.to_string());
            builder = builder.to(mailbox);
        }

        let message = builder
            .subject(alert.category.subject())
            .header(ContentType::TEXT_PLAIN)
            .body(alert.body.clone())
            .map_err(|e| AlertError::Build(e.to_string()))?;

        Ok((envelope_from, recipients, message.formatted()))
    }
}

#[async_trait]
impl AlertSink for SmtpAlert {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn notify(&self, alert: &Alert) -> Result<(), AlertError> {
        let (from, recipients, raw) = self.build(alert)?;
        self.transport.send(&from, &recipients, &raw).await?;
        info!(category = %alert.category, to = %recipients.join(","), "Alert emailed");
        Ok(())
    }
}

// ── Script ──────────────────────────────────────────────────────────

/// Default notifier timeout.
const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs `program [args...] <category>` with the alert body on stdin.
#[derive(Debug, Clone)]
pub struct ScriptAlert {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ScriptAlert {
    /// Create a script sink with no extra arguments and the default timeout.
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_SCRIPT_TIMEOUT,
        }
    }

    /// Arguments passed before the category.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Kill the script if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

#[async_trait]
impl AlertSink for ScriptAlert {
    fn name(&self) -> &str {
        "script"
    }

    async fn notify(&self, alert: &Alert) -> Result<(), AlertError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(alert.category.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AlertError::Spawn {
                program: self.program_name(),
                source,
            })?;

        // Feed stdin from its own task and close it, while wait_with_output
        // drains stdout/stderr. Neither pipe can fill up and stall the other.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("alert script stdin not captured"))?;
        let body = alert.body.clone().into_bytes();
        let writer = tokio::spawn(async move {
            let written = stdin.write_all(&body).await;
            drop(stdin);
            written
        });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| AlertError::Timeout {
                program: self.program_name(),
                timeout: self.timeout,
            })??;

        match writer.await.map_err(std::io::Error::other)? {
            Ok(()) => {}
            // The script exited without reading everything; its exit status decides.
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                debug!(program = %self.program_name(), "Alert script closed stdin early");
            }
            Err(e) => return Err(AlertError::Io(e)),
        }

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!(program = %self.program_name(), "{line}");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(program = %self.program_name(), status = %output.status, "Alert script failed");
            return Err(AlertError::ScriptFailed {
                program: self.program_name(),
                status: output.status.to_string(),
                stderr,
            });
        }

        info!(category = %alert.category, program = %self.program_name(), "Alert script notified");
        Ok(())
    }
}
