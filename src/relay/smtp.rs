//! SMTP transport to the local relay via lettre.

use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Address, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::debug;

use crate::config::{MailConfig, TlsMode};
use crate::error::RelayError;
use crate::relay::MailTransport;

/// Blocking lettre transport, driven from `spawn_blocking`.
#[derive(Clone)]
pub struct SmtpRelay {
    host: String,
    transport: SmtpTransport,
}

impl SmtpRelay {
    /// Build a transport for the relay described by `config`. No connection
    /// is made until the first send.
    pub fn new(config: &MailConfig) -> Result<Self, RelayError> {
        let mut builder =
            SmtpTransport::builder_dangerous(config.smtp_host.as_str()).port(config.smtp_port);

        if config.tls != TlsMode::None {
            let params = TlsParameters::new(config.smtp_host.clone()).map_err(|e| {
                RelayError::Transport {
                    host: config.smtp_host.clone(),
                    reason: format!("TLS setup failed: {e}"),
                }
            })?;
            builder = builder.tls(match config.tls {
                TlsMode::Required => Tls::Required(params),
                _ => Tls::Opportunistic(params),
            });
        }

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                password.expose_secret().to_string(),
            ));
        }

        Ok(Self {
            host: format!("{}:{}", config.smtp_host, config.smtp_port),
            transport: builder.build(),
        })
    }

    /// `host:port` of the relay, for log lines.
    pub fn host(&self) -> &str {
        &self.host
    }
}

fn parse_address(address: &str) -> Result<Address, RelayError> {
    address.parse::<Address>().map_err(|e| RelayError::Address {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl MailTransport for SmtpRelay {
    async fn send(
        &self,
        envelope_from: &str,
        recipients: &[String],
        message: &[u8],
    ) -> Result<(), RelayError> {
        let from = parse_address(envelope_from)?;
        let to = recipients
            .iter()
            .map(|r| parse_address(r))
            .collect::<Result<Vec<_>, _>>()?;
        let envelope =
            Envelope::new(Some(from), to).map_err(|e| RelayError::Envelope(e.to_string()))?;

        let transport = self.transport.clone();
        let message = message.to_vec();
        let response = tokio::task::spawn_blocking(move || transport.send_raw(&envelope, &message))
            .await
            .map_err(|e| RelayError::Task(e.to_string()))?
            .map_err(|e| RelayError::Transport {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;

        debug!(host = %self.host, code = %response.code(), "SMTP relay accepted message");
        Ok(())
    }
}
