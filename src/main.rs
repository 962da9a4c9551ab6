use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{Dispatch, error, info, warn};

use fetchses::alert::{Alert, AlertCategory, build_alert_sink, standalone_alert_sink};
use fetchses::config::{Config, DEFAULT_CONFIG_PATH};
use fetchses::logging;
use fetchses::mailbox::{DirMailbox, Mailbox};
use fetchses::pipeline::{HeaderExtractor, Pipeline, PipelineSettings, Selection};
use fetchses::relay::{DeliveryRelay, MailTransport, SmtpRelay};

/// Exit code for configuration and logging problems.
const EXIT_CONFIG: u8 = 1;

/// Deliver SES-received mail from the object store to the local MTA.
#[derive(Debug, Parser)]
#[command(name = "fetchses", version, about)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, env = "FETCHSES_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Process only this object key instead of the whole new-mail prefix.
    #[arg(short, long)]
    key: Option<String>,

    /// Log to stderr regardless of the configured destination.
    #[arg(long)]
    console: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Another provider may already be installed; either one will do.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fetchses: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let log = match logging::init(&config.logging) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("fetchses: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    // Tasks spawned outside the pipeline (SMTP, alert scripts) log here too.
    let _ = tracing::dispatcher::set_global_default(log.dispatch().clone());

    info!(config = %cli.config.display(), "fetchses launched");

    let pipeline = match build_pipeline(&config, log.dispatch().clone()) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!(error = %e, "Setup failed");
            alert_setup_failure(&config, &e).await;
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let selection = cli.key.map(Selection::Key).unwrap_or(Selection::All);
    let report = pipeline.run(selection).await;
    ExitCode::from(report.exit_code())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(&cli.config)
        .with_context(|| format!("cannot load {}", cli.config.display()))?;
    if cli.console {
        config.logging.console = true;
    }
    Ok(config)
}

/// Best-effort alert when the pipeline could not be built. SMTP alerts
/// only work if the relay itself came up.
async fn alert_setup_failure(config: &Config, cause: &fetchses::error::Error) {
    let sink = match SmtpRelay::new(&config.mail) {
        Ok(relay) => Some(build_alert_sink(&config.alert, Arc::new(relay))),
        Err(_) => standalone_alert_sink(&config.alert),
    };
    let Some(sink) = sink else {
        warn!("No alert channel available without the SMTP relay");
        return;
    };

    let alert = Alert::new(AlertCategory::Error, format!("fetchses setup failed: {cause}"));
    if let Err(e) = sink.notify(&alert).await {
        warn!(sink = sink.name(), error = %e, "Failed to send alert");
    }
}

fn build_pipeline(config: &Config, log: Dispatch) -> fetchses::error::Result<Pipeline> {
    let mailbox: Arc<dyn Mailbox> = Arc::new(DirMailbox::new(config.mailbox.root.clone()));
    let transport: Arc<dyn MailTransport> = Arc::new(SmtpRelay::new(&config.mail)?);
    let relay = DeliveryRelay::new(transport.clone(), config.mail.quarantine_dir.clone());
    let alerts = build_alert_sink(&config.alert, transport);
    let extractor = HeaderExtractor::new(&config.mail.domain)?;

    let settings = PipelineSettings {
        new_mail_prefix: config.mailbox.new_mail_prefix.clone(),
        error_prefix: config.mailbox.error_prefix.clone(),
        virus_notice: config.mail.virus_notice.clone(),
    };

    Ok(Pipeline::new(mailbox, relay, alerts, extractor, settings, log))
}
