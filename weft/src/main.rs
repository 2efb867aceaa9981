//! The `weft-hub` server process.
//!
//! Wires the hub to the outside world: TCP listener, settings file, file
//! watches for hot reload and signal-driven shutdown. All state lives inside
//! the hub task; everything here only feeds its event channel.

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use weft_overlay::auth::{CredentialStore, StaticCredentials};
use weft_overlay::error::{HubError, Result};
use weft_overlay::events::{HubEvent, WatchSlot};
use weft_overlay::hub::{HubOptions, OverlayHub};
use weft_overlay::identity::Identity;
use weft_overlay::settings::Settings;
use weft_overlay::{pump, watch};

#[derive(Debug, Parser)]
#[command(name = "weft-hub", about = "Overlay hub for IoT message routing")]
struct Cli {
    /// This hub's overlay identifier (0 = controller)
    #[arg(long)]
    uid: u64,

    /// Settings file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen address from the settings
    #[arg(long)]
    listen: Option<String>,

    /// Credential table for client authentication
    #[arg(long)]
    credentials: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::parse("")?,
    };
    let listen = cli
        .listen
        .clone()
        .unwrap_or_else(|| settings.overlay.listen.clone());

    let options = HubOptions::from_settings(cli.uid, &settings)?;
    let identity = Identity::configure(&settings)?;
    let credentials: Box<dyn CredentialStore> = match &cli.credentials {
        Some(path) => Box::new(StaticCredentials::load(path)?),
        None => Box::new(StaticCredentials::new()),
    };

    let hub = OverlayHub::new(options, identity, credentials)?;
    let events = hub.events();
    let ids = hub.ids();

    // Signal-driven shutdown: a process-wide flag plus an event-channel poke
    // so the loop wakes immediately.
    let shutting_down = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&shutting_down);
        let events = events.clone();
        ctrlc::set_handler(move || {
            if !flag.swap(true, Ordering::SeqCst) {
                let _ = events.send(HubEvent::Shutdown);
            }
        })
        .map_err(|e| HubError::config(format!("signal handler: {e}")))?;
    }

    // Hot reload watches over the files the settings name.
    let mut watched = Vec::new();
    if let Some(path) = &cli.config {
        watched.push((WatchSlot::Configuration, path.clone()));
    }
    for (slot, option) in [
        (WatchSlot::HostsDatabase, &settings.paths.hosts_db),
        (WatchSlot::HostsFile, &settings.paths.hosts_file),
        (WatchSlot::PrivateKey, &settings.paths.private_key),
        (WatchSlot::PublicKey, &settings.paths.public_key),
        (WatchSlot::SslRoot, &settings.paths.ssl_root),
        (WatchSlot::SslCertificate, &settings.paths.ssl_certificate),
        (WatchSlot::SslKey, &settings.paths.ssl_key),
    ] {
        if let Some(path) = option {
            watched.push((slot, PathBuf::from(path)));
        }
    }
    let _monitor = watch::install(watched, events.clone())?;

    compio::runtime::Runtime::new()
        .map_err(HubError::Io)?
        .block_on(async move {
            let listener = match compio::net::TcpListener::bind(listen.as_str()).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(%listen, error = %e, "cannot bind");
                    return Err(HubError::Io(e));
                }
            };
            info!(%listen, uid = cli.uid, "listening");
            compio::runtime::spawn(pump::run_listener(listener, events, ids)).detach();
            hub.run().await;
            Ok(())
        })
}
