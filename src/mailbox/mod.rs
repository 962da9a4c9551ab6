//! The object store SES writes inbound mail into.
//!
//! The pipeline only needs four operations. `get` returns plaintext: any
//! envelope decryption happens behind it, and a decryption failure is just
//! a failed `get`.

pub mod dir;

use async_trait::async_trait;

use crate::error::MailboxError;

pub use dir::DirMailbox;

/// Object store holding inbound mail, addressed by `<prefix>/<name>` keys.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Human-readable store name for log lines (bucket, directory).
    fn name(&self) -> &str;

    /// Keys under `prefix`, in listing order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, MailboxError>;

    /// Fetch and decrypt one object.
    async fn get(&self, key: &str) -> Result<Vec<u8>, MailboxError>;

    /// Copy an object to `new_key`, leaving the original in place.
    ///
    /// Never replaces an existing object: a taken `new_key` fails with
    /// [`MailboxError::AlreadyExists`].
    async fn copy(&self, key: &str, new_key: &str) -> Result<(), MailboxError>;

    /// Remove an object.
    async fn delete(&self, key: &str) -> Result<(), MailboxError>;
}
