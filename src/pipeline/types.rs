//! Shared types for the message processing pipeline.

use std::path::PathBuf;

use crate::error::{MailboxError, MessageError};
use crate::pipeline::headers::{ExtractedHeaders, VirusVerdict};

/// Line added to error reports for messages the upstream scan flagged.
pub const VIRUS_MARKER: &str = "THIS EMAIL FAILED SES VIRUS SCAN";

/// Exit code when the mailbox could not be listed at all.
pub const EXIT_SETUP_FAILED: u8 = 2;

/// Exit code when at least one message was not handled cleanly.
pub const EXIT_MESSAGES_FAILED: u8 = 3;

// ── Selection ───────────────────────────────────────────────────────

/// Which objects a pass processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Everything currently under the new-mail prefix.
    All,
    /// One explicitly named object key.
    Key(String),
}

// ── Disposition ─────────────────────────────────────────────────────

/// Result of handing a message to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    /// Header extraction or the transport failed.
    Failed,
}

/// Result of the local quarantine fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineStatus {
    NotAttempted,
    Written,
    Failed,
}

/// What happens to the source object once a message has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Delete,
    Retain,
}

impl Disposition {
    /// Delete once a durable copy exists elsewhere; otherwise the encrypted
    /// source object is the only copy left and must stay.
    pub fn decide(delivery: DeliveryStatus, quarantine: QuarantineStatus) -> Self {
        match (delivery, quarantine) {
            (DeliveryStatus::Delivered, _) => Self::Delete,
            (DeliveryStatus::Failed, QuarantineStatus::Written) => Self::Delete,
            (DeliveryStatus::Failed, _) => Self::Retain,
        }
    }
}

// ── Per-message report ──────────────────────────────────────────────

/// Terminal state of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Handed to the local relay.
    Delivered,
    /// Relay refused (or headers unusable); a local copy was written.
    LocallyQuarantined,
    /// Neither delivery nor the local copy worked.
    BothFailed,
    /// Could not be decrypted; moved to the error prefix in the store.
    RemoteQuarantined,
}

impl MessageState {
    /// Terminal state for a delivered or quarantined message.
    pub fn from_statuses(delivery: DeliveryStatus, quarantine: QuarantineStatus) -> Self {
        match (delivery, quarantine) {
            (DeliveryStatus::Delivered, _) => Self::Delivered,
            (DeliveryStatus::Failed, QuarantineStatus::Written) => Self::LocallyQuarantined,
            (DeliveryStatus::Failed, _) => Self::BothFailed,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::LocallyQuarantined => "locally_quarantined",
            Self::BothFailed => "both_failed",
            Self::RemoteQuarantined => "remote_quarantined",
        }
    }
}

/// Everything that happened to one object during a pass.
#[derive(Debug)]
pub struct MessageReport {
    pub key: String,
    pub state: MessageState,
    /// Whether the object is gone from the new-mail prefix.
    pub source_removed: bool,
    pub verdict: VirusVerdict,
    pub headers: Option<ExtractedHeaders>,
    /// Local quarantine file, when one was written.
    pub quarantine_path: Option<PathBuf>,
    /// Error-prefix key the object was (or should have been) moved to.
    pub remote_key: Option<String>,
    pub errors: Vec<MessageError>,
}

impl MessageReport {
    /// Create an empty report for `key`.
    pub fn new(key: &str, state: MessageState) -> Self {
        Self {
            key: key.to_string(),
            state,
            source_removed: false,
            verdict: VirusVerdict::Absent,
            headers: None,
            quarantine_path: None,
            remote_key: None,
            errors: Vec::new(),
        }
    }

    /// Handled without data loss and without leftovers in the new-mail prefix.
    pub fn handled(&self) -> bool {
        matches!(
            self.state,
            MessageState::Delivered | MessageState::LocallyQuarantined
        ) && self.source_removed
    }

    /// Something went wrong and warrants an error alert.
    pub fn failed(&self) -> bool {
        !self.errors.is_empty()
    }

    /// A scan-flagged message reached the relay.
    pub fn virus_delivered(&self) -> bool {
        self.state == MessageState::Delivered && self.verdict.is_fail()
    }

    /// Multi-line failure description; one cause per line.
    pub fn error_text(&self) -> String {
        let mut lines = vec![format!("object {}:", self.key)];
        lines.extend(self.errors.iter().map(|e| e.to_string()));
        if self.verdict.is_fail() && self.state != MessageState::Delivered {
            lines.push(VIRUS_MARKER.to_string());
        }
        if let Some(path) = &self.quarantine_path {
            lines.push(format!("wrote decrypted data to {}", path.display()));
        }
        if let Some(remote) = &self.remote_key
            && self.source_removed
        {
            lines.push(format!("moved to {remote}"));
        }
        if !self.source_removed {
            lines.push(format!("source object {} retained", self.key));
        }
        lines.join("\n")
    }
}

// ── Pass report ─────────────────────────────────────────────────────

/// Outcome of one pipeline invocation.
#[derive(Debug, Default)]
pub struct PassReport {
    /// Set when the pass could not start (mailbox unreachable).
    pub setup_error: Option<MailboxError>,
    pub messages: Vec<MessageReport>,
}

impl PassReport {
    /// Report for a pass that never got past listing.
    pub fn setup_failed(error: MailboxError) -> Self {
        Self {
            setup_error: Some(error),
            messages: Vec::new(),
        }
    }

    /// True only when every message was delivered or locally quarantined.
    pub fn succeeded(&self) -> bool {
        self.setup_error.is_none() && self.messages.iter().all(MessageReport::handled)
    }

    /// Messages that ended without data loss or leftovers.
    pub fn handled_count(&self) -> usize {
        self.messages.iter().filter(|m| m.handled()).count()
    }

    /// Process exit code: 0, or 2 for setup failure, or 3 for message failures.
    pub fn exit_code(&self) -> u8 {
        if self.setup_error.is_some() {
            EXIT_SETUP_FAILED
        } else if self.succeeded() {
            0
        } else {
            EXIT_MESSAGES_FAILED
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{QuarantineError, RelayError};

    const DELIVERY: [DeliveryStatus; 2] = [DeliveryStatus::Delivered, DeliveryStatus::Failed];
    const QUARANTINE: [QuarantineStatus; 3] = [
        QuarantineStatus::NotAttempted,
        QuarantineStatus::Written,
        QuarantineStatus::Failed,
    ];

    #[test]
    fn source_retained_only_when_both_copies_failed() {
        for delivery in DELIVERY {
            for quarantine in QUARANTINE {
                let both_failed = delivery == DeliveryStatus::Failed
                    && quarantine != QuarantineStatus::Written;
                let expected = if both_failed {
                    Disposition::Retain
                } else {
                    Disposition::Delete
                };
                assert_eq!(
                    Disposition::decide(delivery, quarantine),
                    expected,
                    "{delivery:?} / {quarantine:?}"
                );
            }
        }
    }

    #[test]
    fn state_matches_disposition() {
        for delivery in DELIVERY {
            for quarantine in QUARANTINE {
                let state = MessageState::from_statuses(delivery, quarantine);
                let retained = Disposition::decide(delivery, quarantine) == Disposition::Retain;
                assert_eq!(state == MessageState::BothFailed, retained);
            }
        }
    }

    fn transport_error() -> MessageError {
        MessageError::TransportFailed(RelayError::Transport {
            host: "localhost:25".into(),
            reason: "connection refused".into(),
        })
    }

    #[test]
    fn quarantined_message_counts_as_handled() {
        let mut report = MessageReport::new("incoming/a", MessageState::LocallyQuarantined);
        report.source_removed = true;
        report.errors.push(transport_error());
        assert!(report.handled());
        assert!(report.failed());

        let pass = PassReport {
            setup_error: None,
            messages: vec![report],
        };
        assert!(pass.succeeded());
        assert_eq!(pass.exit_code(), 0);
    }

    #[test]
    fn both_failed_fails_the_pass() {
        let mut report = MessageReport::new("incoming/a", MessageState::BothFailed);
        report.errors.push(transport_error());
        report.errors.push(MessageError::QuarantineFailed(QuarantineError::CreateDir {
            path: "/q".into(),
            source: std::io::Error::other("read-only"),
        }));
        let pass = PassReport {
            setup_error: None,
            messages: vec![report],
        };
        assert!(!pass.succeeded());
        assert_eq!(pass.exit_code(), EXIT_MESSAGES_FAILED);
    }

    #[test]
    fn setup_failure_exit_code() {
        let pass = PassReport::setup_failed(MailboxError::List {
            prefix: "incoming".into(),
            reason: "no route".into(),
        });
        assert!(!pass.succeeded());
        assert_eq!(pass.exit_code(), EXIT_SETUP_FAILED);
    }

    #[test]
    fn empty_pass_succeeds() {
        assert_eq!(PassReport::default().exit_code(), 0);
    }

    #[test]
    fn error_text_has_one_cause_per_line() {
        let mut report = MessageReport::new("incoming/a", MessageState::LocallyQuarantined);
        report.verdict = VirusVerdict::Fail;
        report.source_removed = true;
        report.quarantine_path = Some("/var/lib/fetchses/undelivered/a".into());
        report.errors.push(transport_error());

        let text = report.error_text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "object incoming/a:");
        assert!(lines[1].starts_with("failed to deliver message"));
        assert_eq!(lines[2], VIRUS_MARKER);
        assert_eq!(lines[3], "wrote decrypted data to /var/lib/fetchses/undelivered/a");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn retained_source_is_reported() {
        let mut report = MessageReport::new("incoming/a", MessageState::BothFailed);
        report.errors.push(transport_error());
        assert!(report.error_text().ends_with("source object incoming/a retained"));
    }
}
