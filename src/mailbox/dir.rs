//! Directory-backed mailbox: each object is a file under `root/<key>`.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::MailboxError;
use crate::mailbox::Mailbox;

/// Filesystem object store. Keys are `/`-separated paths relative to `root`.
///
/// Objects are stored in plaintext; files whose name starts with `.` are
/// treated as in-flight uploads and never listed.
#[derive(Debug, Clone)]
pub struct DirMailbox {
    root: PathBuf,
    name: String,
}

impl DirMailbox {
    /// Create a mailbox over `root`. Nothing is touched until first use.
    pub fn new(root: PathBuf) -> Self {
        let name = root.display().to_string();
        Self { root, name }
    }

    /// Directory holding the objects.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key onto a path inside `root`, refusing anything that escapes it.
    fn resolve(&self, key: &str) -> Result<PathBuf, MailboxError> {
        let invalid = |reason: &str| MailboxError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        if key.is_empty() {
            return Err(invalid("empty key"));
        }
        let relative = Path::new(key);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                Component::ParentDir => return Err(invalid("contains '..'")),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid("must be relative"));
                }
                Component::CurDir => return Err(invalid("contains '.'")),
            }
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Mailbox for DirMailbox {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, MailboxError> {
        let list_err = |reason: String| MailboxError::List {
            prefix: prefix.to_string(),
            reason,
        };

        if !fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(list_err(format!("{} is not a directory", self.root.display())));
        }

        let prefix = prefix.trim_matches('/');
        let start = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.resolve(prefix)?
        };

        let mut keys = Vec::new();
        let mut pending = vec![(start, prefix.to_string())];
        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // An empty prefix simply has no objects yet.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(list_err(e.to_string())),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| list_err(e.to_string()))?
            {
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else {
                    debug!(path = %entry.path().display(), "Skipping non UTF-8 object name");
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }

                let key = if key_prefix.is_empty() {
                    name.to_string()
                } else {
                    format!("{key_prefix}/{name}")
                };

                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| list_err(e.to_string()))?;
                if file_type.is_dir() {
                    pending.push((entry.path(), key));
                } else if file_type.is_file() {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, MailboxError> {
        let path = self.resolve(key)?;
        fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => MailboxError::NotFound {
                key: key.to_string(),
            },
            _ => MailboxError::Get {
                key: key.to_string(),
                reason: e.to_string(),
            },
        })
    }

    async fn copy(&self, key: &str, new_key: &str) -> Result<(), MailboxError> {
        let copy_err = |reason: String| MailboxError::Copy {
            key: key.to_string(),
            dest: new_key.to_string(),
            reason,
        };

        let from = self.resolve(key)?;
        let to = self.resolve(new_key)?;
        let data = fs::read(&from).await.map_err(|e| copy_err(e.to_string()))?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| copy_err(e.to_string()))?;
        }

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&to)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(MailboxError::AlreadyExists {
                    key: new_key.to_string(),
                });
            }
            Err(e) => return Err(copy_err(e.to_string())),
        };
        file.write_all(&data)
            .await
            .map_err(|e| copy_err(e.to_string()))?;
        file.sync_all()
            .await
            .map_err(|e| copy_err(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), MailboxError> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // Deleting a missing object is not an error for an object store.
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(key = %key, "Object already gone");
                Ok(())
            }
            Err(e) => Err(MailboxError::Delete {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
