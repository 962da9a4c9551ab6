//! Delivery relay: hand messages to the local MTA, fall back to disk.

pub mod quarantine;
pub mod smtp;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{QuarantineError, RelayError};

pub use quarantine::{quarantine_filename, write_quarantine};
pub use smtp::SmtpRelay;

/// Something that can submit a raw message with an explicit envelope.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Submit `message` verbatim to `recipients` with `envelope_from` as the
    /// SMTP sender. Implementations must not retry.
    async fn send(
        &self,
        envelope_from: &str,
        recipients: &[String],
        message: &[u8],
    ) -> Result<(), RelayError>;
}

/// Relay with a local quarantine directory as its safety net.
pub struct DeliveryRelay {
    transport: Arc<dyn MailTransport>,
    quarantine_dir: PathBuf,
}

impl DeliveryRelay {
    /// Create a relay that quarantines into `quarantine_dir`.
    pub fn new(transport: Arc<dyn MailTransport>, quarantine_dir: PathBuf) -> Self {
        Self {
            transport,
            quarantine_dir,
        }
    }

    /// Directory undeliverable messages are written to.
    pub fn quarantine_dir(&self) -> &Path {
        &self.quarantine_dir
    }

    /// Submit the message unmodified. A failure is returned, not retried.
    pub async fn deliver(
        &self,
        envelope_from: &str,
        recipients: &[String],
        payload: &[u8],
    ) -> Result<(), RelayError> {
        self.transport
            .send(envelope_from, recipients, payload)
            .await?;
        info!(
            from = %envelope_from,
            recipients = %recipients.join(","),
            "Message delivered"
        );
        Ok(())
    }

    /// Persist the payload for the object `key` into the quarantine directory.
    pub async fn quarantine(&self, key: &str, payload: &[u8]) -> Result<PathBuf, QuarantineError> {
        let filename = quarantine_filename(key);
        let path = write_quarantine(&self.quarantine_dir, &filename, payload).await?;
        warn!(key = %key, path = %path.display(), "Message quarantined locally");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        fail: bool,
        sent: Mutex<Vec<(String, Vec<String>, Vec<u8>)>>,
    }

    #[async_trait]
    impl MailTransport for Recorder {
        async fn send(
            &self,
            envelope_from: &str,
            recipients: &[String],
            message: &[u8],
        ) -> Result<(), RelayError> {
            if self.fail {
                return Err(RelayError::Transport {
                    host: "localhost".into(),
                    reason: "connection refused".into(),
                });
            }
            self.sent.lock().unwrap().push((
                envelope_from.to_string(),
                recipients.to_vec(),
                message.to_vec(),
            ));
            Ok(())
        }
    }

    #[tokio::test]
    async fn deliver_passes_payload_through_unmodified() {
        let transport = Arc::new(Recorder::default());
        let relay = DeliveryRelay::new(transport.clone(), PathBuf::from("/nonexistent"));
        let payload = b"From: a@x.com\r\nTo: b@corp.example\r\n\r\nhello\r\n";

        relay
            .deliver("a@x.com", &["b@corp.example".to_string()], payload)
            .await
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "a@x.com");
        assert_eq!(sent[0].1, vec!["b@corp.example"]);
        assert_eq!(sent[0].2, payload.to_vec());
    }

    #[tokio::test]
    async fn deliver_surfaces_transport_failure() {
        let transport = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let relay = DeliveryRelay::new(transport, PathBuf::from("/nonexistent"));
        let err = relay
            .deliver("a@x.com", &["b@corp.example".to_string()], b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Transport { .. }));
    }

    #[tokio::test]
    async fn quarantine_uses_key_without_prefix() {
        let tmp = TempDir::new().unwrap();
        let relay = DeliveryRelay::new(Arc::new(Recorder::default()), tmp.path().join("undelivered"));

        let path = relay.quarantine("incoming/abc123", b"raw").await.unwrap();
        assert_eq!(path, tmp.path().join("undelivered").join("abc123"));
        assert_eq!(std::fs::read(path).unwrap(), b"raw\n");
    }
}
