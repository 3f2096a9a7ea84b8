use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use signalwatch::config::{Config, ConfigProvider, EnvConfig, FileConfig};
use signalwatch::gateway::dispatcher::Dispatcher;
use signalwatch::gateway::intents;
use signalwatch::gateway::GatewaySession;
use signalwatch::signal::SignalExtractor;
use signalwatch::sink::{
    self, FanoutSink, LogSink, SignalQueue, SignalSink, TelegramSink, WebhookSink,
};

#[derive(Parser)]
#[command(name = "signalwatch", version, about = "Watch Discord channels for contract-address signals")]
struct Cli {
    /// TOML config file. Without it, settings come from the environment.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signalwatch=debug".into()),
        )
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    let provider: Box<dyn ConfigProvider> = match cli.config {
        Some(path) => Box::new(FileConfig::new(path)),
        None => Box::new(EnvConfig),
    };
    let config = provider.load().context("failed to load configuration")?;

    let signal_sink = build_sink(&config);
    print_banner(&config, &signal_sink);

    let (queue, receiver) = SignalQueue::bounded(config.queue_capacity);
    let forwarder = tokio::spawn(sink::forward(receiver, signal_sink));

    let extractor = SignalExtractor::new(config.subscribed_channel_ids.iter().cloned());
    let dispatcher = Dispatcher::new(extractor, queue);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutdown requested");
            shutdown.cancel();
        }
    });

    let mut session = GatewaySession::new(config.gateway, dispatcher, shutdown);
    let result = session.run().await;

    // Dropping the session drops the last queue producer, which lets the
    // forwarder drain what is left and exit.
    drop(session);
    if let Err(e) = forwarder.await {
        tracing::warn!("signal forwarder stopped abnormally: {e}");
    }

    result.context("gateway session failed")?;
    Ok(())
}

/// Every signal is logged; the webhook and Telegram sinks join when configured.
fn build_sink(config: &Config) -> Arc<FanoutSink> {
    let mut sinks: Vec<Arc<dyn SignalSink>> = vec![Arc::new(LogSink)];
    if let Some(url) = config.webhook_url.as_deref() {
        sinks.push(Arc::new(WebhookSink::new(url)));
    }
    if let Some(telegram) = &config.telegram {
        sinks.push(Arc::new(TelegramSink::new(telegram)));
    }
    Arc::new(FanoutSink::new(sinks))
}

fn print_banner(config: &Config, sinks: &FanoutSink) {
    let version = env!("CARGO_PKG_VERSION");
    let git_sha = env!("GIT_SHA");
    let auth = if intents::is_bot_token(&config.gateway.token) {
        format!("bot (intents {})", config.gateway.intents)
    } else {
        "user".to_string()
    };
    let sink = sinks.names().join(", ");

    eprintln!();
    eprintln!("  \x1b[1;36msignalwatch\x1b[0m \x1b[2mv{version} ({git_sha})\x1b[0m");
    eprintln!();
    eprintln!("  \x1b[2mgateway\x1b[0m      {}", config.gateway.url);
    eprintln!("  \x1b[2mauth\x1b[0m         {auth}");
    eprintln!(
        "  \x1b[2mchannels\x1b[0m     {}",
        config.subscribed_channel_ids.join(", ")
    );
    eprintln!("  \x1b[2msink\x1b[0m         {sink}");
    eprintln!();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
