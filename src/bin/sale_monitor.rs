use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use portals_sale_monitor::api::FeedClient;
use portals_sale_monitor::config::{AppConfig, CONFIG_PATH};
use portals_sale_monitor::credential::{CredentialProvider, StaticProvider, TokenFileProvider};
use portals_sale_monitor::monitor::{Monitor, MonitorSettings};
use portals_sale_monitor::notifier::{Notifier, TelegramPublisher};
use portals_sale_monitor::reporter;
use portals_sale_monitor::state::StateFile;

#[derive(Parser)]
#[command(
    name = "sale-monitor",
    about = "Watch the Portals marketplace for gift sales and post them to Telegram"
)]
struct Args {
    /// Config file (defaults apply when it is absent)
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// State file holding seen sales and the current credential
    #[arg(long)]
    state: Option<PathBuf>,

    /// Polling cadence in seconds
    #[arg(long)]
    check_interval: Option<u64>,

    /// Scheduled credential refresh cadence in seconds
    #[arg(long)]
    token_refresh_interval: Option<u64>,

    /// Attempt ceiling for fetches and deliveries
    #[arg(long)]
    max_retries: Option<u32>,

    /// Per-request timeout in seconds
    #[arg(long)]
    request_timeout: Option<u64>,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) {
        let settings = &mut config.settings;
        if let Some(path) = &self.state {
            settings.state_path = path.clone();
        }
        if let Some(secs) = self.check_interval {
            settings.check_interval_secs = secs;
        }
        if let Some(secs) = self.token_refresh_interval {
            settings.token_refresh_interval_secs = secs;
        }
        if let Some(n) = self.max_retries {
            settings.max_retries = n;
        }
        if let Some(secs) = self.request_timeout {
            settings.request_timeout_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = AppConfig::load_or_default(&args.config)?;
    config.apply_env();
    args.apply(&mut config);
    config.validate()?;
    info!("Loaded config from {}", args.config.display());

    let settings = &config.settings;
    let timeout = settings.request_timeout();
    let feed = FeedClient::new(&config.feed.api_url, config.feed.page_size, timeout)?;

    let provider: Box<dyn CredentialProvider> = match std::env::var("PORTALS_TOKEN") {
        Ok(token) if !token.trim().is_empty() => {
            info!("Using credential from PORTALS_TOKEN");
            Box::new(StaticProvider::new(token))
        }
        _ => {
            info!("Reading credentials from {}", config.feed.token_file.display());
            Box::new(TokenFileProvider::new(
                &config.feed.token_file,
                config
                    .feed
                    .token_max_age_secs
                    .map(std::time::Duration::from_secs),
            ))
        }
    };

    let publisher = TelegramPublisher::new(
        config.telegram_bot_token()?,
        config.telegram_channel()?,
        timeout,
    )?;
    let notifier = Notifier::new(
        publisher,
        settings.retry_policy(),
        settings.pin_threshold,
        settings.max_messages_per_minute,
    );

    info!(
        "Starting sale monitor: channel={} poll={}s refresh={}s state={}",
        config.telegram_channel()?,
        settings.check_interval_secs,
        settings.token_refresh_interval_secs,
        settings.state_path.display()
    );

    let mut monitor = Monitor::new(
        feed,
        provider,
        notifier,
        StateFile::new(&settings.state_path),
        settings.retry_policy(),
        MonitorSettings::from(settings),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Stop requested, finishing the current sale");
        let _ = shutdown_tx.send(true);
    });

    let summary = monitor.run(shutdown_rx).await?;
    reporter::report_run_summary(&summary);
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Could not listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
