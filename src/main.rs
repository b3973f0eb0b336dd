//! `entangle` command line: `serve` the demo service or `watch` one.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use entangle::demo;
use entangle::settings::{DEFAULT_SETTINGS_FILE, EntangleSettings, load_settings_from_path};
use entangle_client::{Client, ServiceEvent, websocket};
use entangle_core::logging::init_subscriber;
use entangle_server::EntangleServer;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "entangle", version, about = "Mirror a server object onto remote clients")]
struct Cli {
    /// Settings file (JSON). Missing file means defaults.
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the demo service over WebSocket.
    Serve {
        /// Port to bind; overrides settings.
        #[arg(long)]
        port: Option<u16>,
        /// Seconds between `luckyNumber` bumps.
        #[arg(long, default_value_t = 5)]
        bump_secs: u64,
    },
    /// Subscribe to a service and log every change.
    Watch {
        /// Server WebSocket URL.
        #[arg(long, default_value = "ws://127.0.0.1:4000/ws")]
        url: String,
        /// Service id to mirror.
        #[arg(long, default_value = demo::DEMO_SERVICE)]
        service: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = load_settings_from_path(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_subscriber(&settings.log_level);

    match cli.command {
        Command::Serve { port, bump_secs } => serve(settings, port, bump_secs).await,
        Command::Watch { url, service } => watch(settings, url, service).await,
    }
}

async fn serve(
    settings: EntangleSettings,
    port: Option<u16>,
    bump_secs: u64,
) -> anyhow::Result<()> {
    let mut config = settings.server;
    if let Some(port) = port {
        config.port = port;
    }

    let mut server = EntangleServer::new(config);
    match entangle_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(err) => warn!(error = %err, "metrics recorder not installed"),
    }

    let store = demo::register(server.registry());
    let handle = server.listen().await.context("binding listener")?;
    info!(url = %handle.ws_url(), service = demo::DEMO_SERVICE, "demo ready");

    let ticker = demo::spawn_lucky_number(
        store,
        Duration::from_secs(bump_secs.max(1)),
        server.shutdown().token(),
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    let report = handle.stop().await;
    info!(drained = report.drained, forced = report.forced, "sessions closed");
    let _ = ticker.await;
    Ok(())
}

async fn watch(settings: EntangleSettings, url: String, service_id: String) -> anyhow::Result<()> {
    let client = Client::with_transport(websocket::connector(url.clone()), settings.client)?;
    let service = client.subscribe(service_id.as_str())?;

    let id = service_id.clone();
    let _listener = service.on(move |event| match event {
        ServiceEvent::Ready => info!(service_id = %id, "ready"),
        ServiceEvent::Change { key, value: Some(value) } => info!(%key, %value, "changed"),
        ServiceEvent::Change { key, value: None } => info!(%key, "deleted"),
        ServiceEvent::Error(message) => warn!(%message, "service error"),
    });

    info!(%url, service_id = %service_id, "waiting for initial sync");
    service.wait_ready().await?;
    info!(snapshot = %serde_json::Value::Object(service.snapshot()), "synchronized");

    for key in service.keys().into_iter().filter(|k| service.is_method(k)) {
        info!(method = %key, "remote method available");
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    client.disconnect();
    Ok(())
}
