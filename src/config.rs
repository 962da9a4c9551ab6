//! Configuration types, loaded from a TOML file.

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fetchses.toml";

/// Full process configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub mailbox: MailboxConfig,
    pub mail: MailConfig,
    #[serde(default)]
    pub alert: AlertConfig,
}

/// Where log lines go.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log to stderr. When false, log to `directory/fetchses.log`.
    #[serde(default = "default_true")]
    pub console: bool,
    pub directory: Option<PathBuf>,
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            console: true,
            directory: None,
            level: default_log_level(),
        }
    }
}

/// Source object store layout.
#[derive(Debug, Clone, Deserialize)]
pub struct MailboxConfig {
    /// Directory backing the object store.
    pub root: PathBuf,
    /// Prefix SES writes new mail under.
    pub new_mail_prefix: String,
    /// Prefix undecryptable objects are moved to.
    pub error_prefix: String,
}

/// SMTP transport security towards the local relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    #[default]
    None,
    Opportunistic,
    Required,
}

/// Delivery settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    /// Serviced domain; recipients outside it are dropped.
    pub domain: String,
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub tls: TlsMode,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    /// Local directory for messages that could not be delivered.
    pub quarantine_dir: PathBuf,
    /// Body of the virus alert; a generic notice is used when unset.
    pub virus_notice: Option<String>,
}

/// Alert sink selection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AlertConfig {
    #[default]
    Disabled,
    /// Email alerts through the same relay.
    Smtp { from: String, to: Vec<String> },
    /// Run `program args... <category>` with the alert body on stdin.
    Script {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_script_timeout")]
        timeout_secs: u64,
    },
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_script_timeout() -> u64 {
    30
}

impl Config {
    /// Read, parse and validate the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::InvalidValue {
                key: "config".into(),
                message: format!("'{}' is not a normal file", path.display()),
            });
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse and validate TOML content.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config =
            toml::from_str(content).map_err(|e| ConfigError::ParseError {
                path: PathBuf::new(),
                reason: e.to_string(),
            })?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        self.mail.domain = self.mail.domain.trim().to_lowercase();
        self.mailbox.new_mail_prefix = self.mailbox.new_mail_prefix.trim_matches('/').to_string();
        self.mailbox.error_prefix = self.mailbox.error_prefix.trim_matches('/').to_string();
        // TOML delivers LF, SMTP wants CRLF.
        if let Some(notice) = &mut self.mail.virus_notice {
            *notice = notice.replace("\r\n", "\n").replace('\n', "\r\n");
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require(&self.mail.domain, "mail.domain", "Set the domain this relay serves.")?;
        require(
            &self.mailbox.new_mail_prefix,
            "mailbox.new_mail_prefix",
            "Set the prefix SES writes new mail under.",
        )?;
        require(
            &self.mailbox.error_prefix,
            "mailbox.error_prefix",
            "Set the prefix undecryptable mail is moved to.",
        )?;
        if prefixes_overlap(&self.mailbox.new_mail_prefix, &self.mailbox.error_prefix) {
            return Err(ConfigError::InvalidValue {
                key: "mailbox.error_prefix".into(),
                message: "must not equal, contain or sit under mailbox.new_mail_prefix".into(),
            });
        }
        if !self.logging.console && self.logging.directory.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "logging.directory".into(),
                hint: "Required when logging.console is false.".into(),
            });
        }

        match &self.alert {
            AlertConfig::Disabled => {}
            AlertConfig::Smtp { from, to } => {
                require(from, "alert.from", "Set the sender address for alerts.")?;
                if to.iter().all(|t| t.trim().is_empty()) {
                    return Err(ConfigError::MissingRequired {
                        key: "alert.to".into(),
                        hint: "List at least one alert recipient.".into(),
                    });
                }
            }
            AlertConfig::Script { program, .. } => {
                if program.as_os_str().is_empty() {
                    return Err(ConfigError::MissingRequired {
                        key: "alert.program".into(),
                        hint: "Set the notification script to run.".into(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Whether one prefix equals the other or nests inside it on `/` boundaries.
/// Listing recurses, so overlapping prefixes would re-list moved objects.
fn prefixes_overlap(a: &str, b: &str) -> bool {
    let nested = |outer: &str, inner: &str| {
        inner
            .strip_prefix(outer)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    };
    nested(a, b) || nested(b, a)
}

fn require(value: &str, key: &str, hint: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingRequired {
            key: key.to_string(),
            hint: hint.to_string(),
        });
    }
    Ok(())
}
