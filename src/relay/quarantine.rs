//! Local on-disk fallback for messages the relay could not take.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::QuarantineError;

/// Numbered alternatives tried before giving up on a taken name.
pub const MAX_NAME_ATTEMPTS: usize = 1000;

/// File name for a quarantined object: the key minus its `<prefix>/`.
///
/// Keys without a separator are used whole; deeper separators are flattened
/// so the file always lands directly inside the quarantine directory.
/// Flattening can map different keys to one name, so writers must never
/// replace an existing file (see [`numbered_name`]).
pub fn quarantine_filename(key: &str) -> String {
    let name = match key.split_once('/') {
        Some((_, rest)) if !rest.is_empty() => rest,
        _ => key,
    };
    name.replace('/', "_")
}

/// `name` on the first attempt, then `name.1`, `name.2`, ...
pub fn numbered_name(name: &str, attempt: usize) -> String {
    if attempt == 0 {
        name.to_string()
    } else {
        format!("{name}.{attempt}")
    }
}

/// Write `payload` (plus a trailing newline) to a new file in `dir`,
/// creating `dir` on demand. Both are readable by the owner only.
///
/// Existing files are never touched: a taken `filename` moves on to the
/// next [`numbered_name`]. Returns the path actually written.
pub async fn write_quarantine(
    dir: &Path,
    filename: &str,
    payload: &[u8],
) -> Result<PathBuf, QuarantineError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder
        .create(dir)
        .await
        .map_err(|source| QuarantineError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let path = dir.join(numbered_name(filename, attempt));
        let mut file = match options.open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(source) => return Err(QuarantineError::Write { path, source }),
        };

        let write_err = |source| QuarantineError::Write {
            path: path.clone(),
            source,
        };
        file.write_all(payload).await.map_err(write_err)?;
        file.write_all(b"\n").await.map_err(write_err)?;
        file.flush().await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;
        return Ok(path);
    }

    Err(QuarantineError::Write {
        path: dir.join(filename),
        source: std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("{MAX_NAME_ATTEMPTS} quarantine names already taken"),
        ),
    })
}
