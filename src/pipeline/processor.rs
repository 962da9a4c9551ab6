//! Pipeline orchestrator: drives each object from the new-mail prefix to a
//! terminal state.
//!
//! Per object:
//! 1. `get` (fetch + decrypt). Failure moves the object to the error prefix.
//! 2. Extract envelope from headers, then hand to the relay.
//! 3. Any failure in step 2 quarantines the plaintext locally.
//! 4. Delete the source unless no durable copy exists anywhere else.
//! 5. Log each failure cause on its own line and send one alert.
//!
//! Messages are processed one at a time in listing order and never affect
//! each other.

use std::sync::Arc;

use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, error, info, warn};

use crate::alert::{Alert, AlertCategory, AlertSink};
use crate::error::{MailboxError, MessageError};
use crate::mailbox::Mailbox;
use crate::pipeline::headers::{HeaderExtractor, VIRUS_VERDICT_HEADER};
use crate::pipeline::types::{
    DeliveryStatus, Disposition, MessageReport, MessageState, PassReport, QuarantineStatus,
    Selection,
};
use crate::relay::quarantine::{MAX_NAME_ATTEMPTS, numbered_name};
use crate::relay::{DeliveryRelay, quarantine_filename};

/// Store layout and alert text the pipeline needs.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub new_mail_prefix: String,
    pub error_prefix: String,
    /// Body for virus alerts; a generated description is used when unset.
    pub virus_notice: Option<String>,
}

/// Drains the new-mail prefix into the relay, one object at a time.
pub struct Pipeline {
    mailbox: Arc<dyn Mailbox>,
    relay: DeliveryRelay,
    alerts: Arc<dyn AlertSink>,
    extractor: HeaderExtractor,
    settings: PipelineSettings,
    log: Dispatch,
}

impl Pipeline {
    /// Create a new pipeline. Every collaborator is injected; `log`
    /// receives all pipeline events.
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        relay: DeliveryRelay,
        alerts: Arc<dyn AlertSink>,
        extractor: HeaderExtractor,
        settings: PipelineSettings,
        log: Dispatch,
    ) -> Self {
        Self {
            mailbox,
            relay,
            alerts,
            extractor,
            settings,
            log,
        }
    }

    /// Run one pass over `selection`.
    pub async fn run(&self, selection: Selection) -> PassReport {
        self.run_pass(selection)
            .with_subscriber(self.log.clone())
            .await
    }

    async fn run_pass(&self, selection: Selection) -> PassReport {
        let keys = match selection {
            Selection::Key(key) => vec![key],
            Selection::All => match self.mailbox.list(&self.settings.new_mail_prefix).await {
                Ok(keys) => keys,
                Err(e) => return self.abort(e).await,
            },
        };

        let total = keys.len();
        info!(mailbox = self.mailbox.name(), total, "Starting pass");

        let mut messages = Vec::with_capacity(total);
        for key in keys {
            let report = self.process(&key).await;
            self.report(&report).await;
            messages.push(report);
        }

        let pass = PassReport {
            setup_error: None,
            messages,
        };
        info!(
            handled = pass.handled_count(),
            total,
            "Pass complete"
        );
        pass
    }

    /// The mailbox is unreachable: nothing can be processed.
    async fn abort(&self, e: MailboxError) -> PassReport {
        error!(
            mailbox = self.mailbox.name(),
            error = %e,
            "Failed to list mailbox"
        );
        self.alert(Alert::new(
            AlertCategory::Error,
            format!("failed to list {}: {e}", self.mailbox.name()),
        ))
        .await;
        PassReport::setup_failed(e)
    }

    /// Drive one object to a terminal state. Never fails; everything that
    /// went wrong is recorded in the report.
    pub async fn process(&self, key: &str) -> MessageReport {
        info!("receiving {}/{}", self.mailbox.name(), key);

        let payload = match self.mailbox.get(key).await {
            Ok(payload) => payload,
            Err(e) => return self.quarantine_remote(key, e).await,
        };
        self.deliver(key, &payload).await
    }

    /// Move an undecryptable object to the error prefix.
    async fn quarantine_remote(&self, key: &str, cause: MailboxError) -> MessageReport {
        let filename = quarantine_filename(key);
        warn!(key = %key, error = %cause, "Decryption failed, moving object");

        let mut report = MessageReport::new(key, MessageState::RemoteQuarantined);
        report.errors.push(MessageError::DecryptFailed(cause));

        let (dest, copied) = self.copy_to_error_prefix(key, &filename).await;
        report.remote_key = Some(dest.clone());
        let moved = match copied {
            Ok(()) => self.mailbox.delete(key).await,
            Err(e) => Err(e),
        };
        match moved {
            Ok(()) => {
                info!(key = %key, dest = %dest, "Object moved to error prefix");
                report.source_removed = true;
            }
            Err(source) => report
                .errors
                .push(MessageError::RemoteQuarantineFailed { dest, source }),
        }
        report
    }

    /// Copy `key` under the error prefix without replacing an earlier
    /// object that flattened to the same name. Returns the key tried last.
    async fn copy_to_error_prefix(
        &self,
        key: &str,
        filename: &str,
    ) -> (String, Result<(), MailboxError>) {
        let prefix = &self.settings.error_prefix;
        let mut dest = format!("{prefix}/{filename}");
        for attempt in 0..MAX_NAME_ATTEMPTS {
            dest = format!("{prefix}/{}", numbered_name(filename, attempt));
            match self.mailbox.copy(key, &dest).await {
                Err(MailboxError::AlreadyExists { .. }) => continue,
                result => return (dest, result),
            }
        }
        let taken = MailboxError::AlreadyExists { key: dest.clone() };
        (dest, Err(taken))
    }

    /// Deliver a decrypted payload, falling back to local quarantine.
    async fn deliver(&self, key: &str, payload: &[u8]) -> MessageReport {
        let mut report = MessageReport::new(key, MessageState::Delivered);

        let delivery = match self.extractor.extract(payload) {
            Ok(headers) => {
                report.verdict = headers.verdict;
                let sent = self
                    .relay
                    .deliver(&headers.from, &headers.recipients, payload)
                    .await
                    .map_err(MessageError::from);
                report.headers = Some(headers);
                sent
            }
            Err(e) => {
                report.verdict = e.verdict();
                Err(MessageError::from(e))
            }
        };

        let (delivery, quarantine) = match delivery {
            Ok(()) => (DeliveryStatus::Delivered, QuarantineStatus::NotAttempted),
            Err(e) => {
                report.errors.push(e);
                match self.relay.quarantine(key, payload).await {
                    Ok(path) => {
                        report.quarantine_path = Some(path);
                        (DeliveryStatus::Failed, QuarantineStatus::Written)
                    }
                    Err(e) => {
                        report.errors.push(e.into());
                        (DeliveryStatus::Failed, QuarantineStatus::Failed)
                    }
                }
            }
        };
        report.state = MessageState::from_statuses(delivery, quarantine);

        match Disposition::decide(delivery, quarantine) {
            Disposition::Delete => match self.mailbox.delete(key).await {
                Ok(()) => report.source_removed = true,
                Err(e) => report.errors.push(MessageError::SourceDeleteFailed(e)),
            },
            Disposition::Retain => {
                warn!(key = %key, "No durable copy exists, retaining source object");
            }
        }

        report
    }

    /// Log and alert on a finished message.
    async fn report(&self, report: &MessageReport) {
        if report.virus_delivered() {
            warn!(
                key = %report.key,
                header = VIRUS_VERDICT_HEADER,
                "Delivered message flagged by virus scan"
            );
            self.alert(Alert::new(AlertCategory::Virus, self.virus_body(report)))
                .await;
        }

        if report.failed() {
            let text = report.error_text();
            // One log event per cause so line-based collectors keep them apart.
            for line in text.lines() {
                error!(key = %report.key, state = report.state.label(), "{line}");
            }
            self.alert(Alert::new(AlertCategory::Error, text)).await;
        }
    }

    fn virus_body(&self, report: &MessageReport) -> String {
        if let Some(notice) = &self.settings.virus_notice {
            return notice.clone();
        }
        let (from, to) = report
            .headers
            .as_ref()
            .map(|h| (h.from.as_str(), h.recipients.join(", ")))
            .unwrap_or(("unknown", String::new()));
        format!(
            "object {} from {from} to {to} failed the upstream virus scan \
             ({VIRUS_VERDICT_HEADER}: FAIL) and was delivered to the local relay",
            report.key
        )
    }

    async fn alert(&self, alert: Alert) {
        if let Err(e) = self.alerts.notify(&alert).await {
            warn!(
                sink = self.alerts.name(),
                category = %alert.category,
                error = %e,
                "Failed to send alert"
            );
        }
    }
}
