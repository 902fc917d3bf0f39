// lanshare Linux daemon: discovery, text messages and file transfer on the LAN.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use lanshare_core::{
    EventHandler, FileId, FileIdentityStore, Interrupt, Service, TransferProgress, COMPATIBILITY,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// An offer waiting for the daemon's decision.
struct Offer {
    file_id: FileId,
    host: String,
    name: String,
    size: u64,
}

/// Logs events; offers are queued for the main task, which owns the accept policy.
struct DaemonHandler {
    offers: mpsc::UnboundedSender<Offer>,
}

impl EventHandler for DaemonHandler {
    fn on_text(&self, host: &str, text: &str) {
        info!(%host, %text, "text received");
    }

    fn on_file_offer(&self, file_id: FileId, host: &str, file_name: &str, size: u64) {
        let _ = self.offers.send(Offer {
            file_id,
            host: host.to_owned(),
            name: file_name.to_owned(),
            size,
        });
    }

    fn on_file_progress(&self, p: &TransferProgress) {
        if p.state.is_terminal() {
            info!(
                peer = %p.peer,
                file_id = p.file_id,
                direction = ?p.direction,
                state = %p.state,
                transferred = p.transferred,
                total = p.total,
                "transfer finished"
            );
        } else {
            debug!(file_id = p.file_id, transferred = p.transferred, total = p.total, "progress");
        }
    }
}

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("lanshare-daemon {} (compatibility {})", VERSION, COMPATIBILITY);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("lanshare_core=info,lanshare_daemon=info")),
        )
        .init();

    let cfg = config::load()?;
    if let Some(dir) = &cfg.download_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating download dir {}", dir.display()))?;
    }
    let store = FileIdentityStore::new(cfg.identity_path());
    let service = Service::create(cfg.service.clone(), &store).context("starting service")?;
    if service.is_first_run() {
        info!(path = %store.path().display(), "first run, identity saved");
    }

    let (offer_tx, mut offer_rx) = mpsc::unbounded_channel();
    service.set_handler(Arc::new(DaemonHandler { offers: offer_tx }));

    let stop = Interrupt::new();
    let discovery = service.spawn_discovery(stop.clone())?;
    let data = service.spawn_data_service(stop.clone())?;
    service.start_auto_broadcast();
    info!(
        version = VERSION,
        discovery_port = service.discovery_port(),
        data_port = service.data_port(),
        group = cfg.service.group,
        "lanshare daemon running"
    );

    let rt = service.runtime();
    rt.block_on(async {
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                res = &mut shutdown => break res,
                Some(offer) = offer_rx.recv() => decide(&service, cfg.download_dir.as_deref(), offer),
            }
        }
    })?;

    info!("shutting down");
    stop.trigger();
    for task in [discovery, data] {
        match rt.block_on(task) {
            Ok(Err(e)) => warn!(error = %e, "service loop ended with error"),
            Err(e) => warn!(error = %e, "service loop panicked"),
            Ok(Ok(())) => {}
        }
    }
    Ok(())
}

/// Accept into the download directory when one is configured, otherwise reject.
fn decide(service: &Service, download_dir: Option<&Path>, offer: Offer) {
    let dest = download_dir.and_then(|dir| {
        Path::new(&offer.name)
            .file_name()
            .map(|name| dir.join(name))
    });
    let accept = dest.is_some();
    let dest = dest.unwrap_or_else(PathBuf::new);
    info!(host = %offer.host, name = %offer.name, size = offer.size, accept, "file offered");
    if let Err(e) = service.respond_to_file(&offer.host, offer.file_id, offer.size, &dest, accept) {
        warn!(host = %offer.host, file_id = offer.file_id, error = %e, "cannot answer offer");
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
