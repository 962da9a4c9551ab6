//! Error types for fetchses.

use std::path::PathBuf;
use std::time::Duration;

use crate::pipeline::headers::VirusVerdict;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Logging setup errors.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log filter {filter}: {reason}")]
    Filter { filter: String, reason: String },

    #[error("File logging needs logging.directory")]
    NoDirectory,

    #[error("Cannot open log directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Source mailbox (object store) errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("failed to list objects under {prefix}: {reason}")]
    List { prefix: String, reason: String },

    #[error("failed to fetch object {key}: {reason}")]
    Get { key: String, reason: String },

    #[error("failed to copy object {key} to {dest}: {reason}")]
    Copy {
        key: String,
        dest: String,
        reason: String,
    },

    #[error("failed to delete object {key}: {reason}")]
    Delete { key: String, reason: String },

    #[error("object {key} not found")]
    NotFound { key: String },

    #[error("object {key} already exists")]
    AlreadyExists { key: String },

    #[error("invalid object key {key}: {reason}")]
    InvalidKey { key: String, reason: String },
}

/// Header extraction failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("failed to parse message: no readable header block")]
    MalformedMessage,

    #[error("failed to parse the From address: {reason}")]
    InvalidSender {
        reason: String,
        verdict: VirusVerdict,
    },

    #[error("failed to resolve any recipient in {domain}")]
    NoRecipients {
        domain: String,
        verdict: VirusVerdict,
    },
}

impl ExtractError {
    /// Virus verdict read before extraction failed, if the header block parsed.
    pub fn verdict(&self) -> VirusVerdict {
        match self {
            Self::MalformedMessage => VirusVerdict::Absent,
            Self::InvalidSender { verdict, .. } | Self::NoRecipients { verdict, .. } => *verdict,
        }
    }
}

/// Mail transport errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid address {address}: {reason}")]
    Address { address: String, reason: String },

    #[error("invalid envelope: {0}")]
    Envelope(String),

    #[error("SMTP relay {host} failed: {reason}")]
    Transport { host: String, reason: String },

    #[error("SMTP task failed: {0}")]
    Task(String),
}

/// Local quarantine write errors.
#[derive(Debug, thiserror::Error)]
pub enum QuarantineError {
    #[error("failed to create quarantine directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write quarantine file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Alert delivery errors. Never escalated past a log line.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("failed to build alert message: {0}")]
    Build(String),

    #[error("failed to send alert: {0}")]
    Send(#[from] RelayError),

    #[error("failed to spawn alert script {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("alert script IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("alert script {program} exited with {status}: {stderr}")]
    ScriptFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("alert script {program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

/// Everything that can go wrong with a single message during a pass.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to decrypt object: {0}")]
    DecryptFailed(MailboxError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("failed to deliver message: {0}")]
    TransportFailed(#[from] RelayError),

    #[error(transparent)]
    QuarantineFailed(#[from] QuarantineError),

    #[error("failed to move object to {dest}: {source}")]
    RemoteQuarantineFailed { dest: String, source: MailboxError },

    #[error("failed to delete source object: {0}")]
    SourceDeleteFailed(MailboxError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
