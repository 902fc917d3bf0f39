//! Service facade: one LAN presence with its own runtime, registry, session table and callbacks.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::data::{BroadcastReport, DataService};
use crate::discovery::DiscoveryService;
use crate::error::{EngineError, Result};
use crate::handler::{EventHandler, HandlerSlot};
use crate::identity::{system_host_name, Identity, IdentityStore};
use crate::interrupt::Interrupt;
use crate::peers::{BufferTooSmall, PeerRecord, PeerRegistry};
use crate::transfer::{FileId, SessionInfo, SessionTable};

const MIN_AUTO_BROADCAST: Duration = Duration::from_millis(100);

/// A running instance. Instances are independent and may coexist in one process.
///
/// Blocking methods drive the service's own runtime. Called from inside any tokio runtime
/// (for example from an `EventHandler` callback) they return `EngineError::InsideRuntime`.
/// Dropping the service stops its loops and must happen outside the runtime.
pub struct Service {
    config: Arc<ServiceConfig>,
    identity: Arc<Identity>,
    first_run: bool,
    peers: Arc<PeerRegistry>,
    sessions: Arc<SessionTable>,
    handler: HandlerSlot,
    data_port: Arc<AtomicU16>,
    discovery: Arc<DiscoveryService>,
    data: Arc<DataService>,
    /// Fired on drop; every loop started by this service also watches it.
    shutdown: Interrupt,
    auto_broadcast: AtomicBool,
    runtime: Runtime,
}

impl Service {
    /// Start a service, generating and saving an identity if `store` holds none.
    pub fn create(config: ServiceConfig, store: &dyn IdentityStore) -> Result<Self> {
        let (identity, first_run) = match store.load()? {
            Some(identity) => (identity, false),
            None => {
                let name = config.host_name.clone().unwrap_or_else(system_host_name);
                let identity = Identity::generate(name);
                store.save(&identity)?;
                info!(instance = %identity.instance_id, "generated new identity");
                (identity, true)
            }
        };
        Self::build(config, identity, first_run)
    }

    /// Start a service from a previously saved identity. `NoIdentity` if there is none.
    pub fn restore(config: ServiceConfig, store: &dyn IdentityStore) -> Result<Self> {
        let identity = store.load()?.ok_or(EngineError::NoIdentity)?;
        Self::build(config, identity, false)
    }

    fn build(config: ServiceConfig, mut identity: Identity, first_run: bool) -> Result<Self> {
        config.validate()?;
        if let Some(name) = &config.host_name {
            identity.host_name = name.clone();
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("lanshare")
            .build()
            .map_err(EngineError::Runtime)?;

        let config = Arc::new(config);
        let identity = Arc::new(identity);
        let peers = Arc::new(PeerRegistry::new(config.stale_after()));
        let sessions = Arc::new(SessionTable::new());
        let handler = HandlerSlot::default();
        let data_port = Arc::new(AtomicU16::new(config.data_port));
        let discovery = Arc::new(DiscoveryService::new(
            Arc::clone(&config),
            Arc::clone(&identity),
            Arc::clone(&peers),
            Arc::clone(&data_port),
        ));
        let data = Arc::new(DataService::new(
            Arc::clone(&config),
            Arc::clone(&peers),
            Arc::clone(&sessions),
            handler.clone(),
            Arc::clone(&data_port),
        ));
        info!(
            instance = %identity.instance_id,
            host = %identity.host_name,
            group = config.group,
            first_run,
            "service created"
        );
        Ok(Self {
            config,
            identity,
            first_run,
            peers,
            sessions,
            handler,
            data_port,
            discovery,
            data,
            shutdown: Interrupt::new(),
            auto_broadcast: AtomicBool::new(false),
            runtime,
        })
    }

    pub fn is_first_run(&self) -> bool {
        self.first_run
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn runtime(&self) -> Handle {
        self.runtime.handle().clone()
    }

    pub fn set_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handler.set(handler);
    }

    /// Port the data service advertises: the bound port once it runs, else the configured one.
    pub fn data_port(&self) -> u16 {
        self.data_port.load(Ordering::SeqCst)
    }

    pub fn discovery_port(&self) -> u16 {
        self.discovery.listen_port()
    }

    fn watch(&self, interrupt: Interrupt) -> Interrupt {
        interrupt.or(&self.shutdown)
    }

    /// Drive `future` on the service runtime from a host thread.
    fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        if Handle::try_current().is_ok() {
            return Err(EngineError::InsideRuntime);
        }
        Ok(self.runtime.block_on(future))
    }

    // ---- discovery ----

    /// Run discovery on the calling thread until `interrupt` fires.
    pub fn run_discovery(&self, interrupt: Interrupt) -> Result<()> {
        let interrupt = self.watch(interrupt);
        self.block_on(async {
            let socket = self.discovery.bind().await?;
            self.discovery.run(socket, interrupt).await
        })?
    }

    /// Bind now, then run discovery in the background.
    pub fn spawn_discovery(&self, interrupt: Interrupt) -> Result<JoinHandle<Result<()>>> {
        let interrupt = self.watch(interrupt);
        let socket = self.block_on(self.discovery.bind())??;
        let discovery = Arc::clone(&self.discovery);
        Ok(self
            .runtime
            .spawn(async move { discovery.run(socket, interrupt).await }))
    }

    pub fn broadcast_once(&self) -> Result<usize> {
        self.block_on(self.discovery.broadcast_once())?
    }

    /// Announce every `auto_broadcast_interval` until the service is dropped. Idempotent.
    pub fn start_auto_broadcast(&self) {
        if self.auto_broadcast.swap(true, Ordering::SeqCst) {
            return;
        }
        let discovery = Arc::clone(&self.discovery);
        let stop = self.shutdown.clone();
        let period = self.config.auto_broadcast_interval().max(MIN_AUTO_BROADCAST);
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if stop.is_triggered() {
                    break;
                }
                if let Err(e) = discovery.broadcast_once().await {
                    warn!(error = %e, "auto broadcast failed");
                }
            }
        });
        info!(?period, "auto broadcast started");
    }

    // ---- peers ----

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.snapshot()
    }

    /// Encoded peer list (see `peers::decode_peer_list`).
    pub fn peer_list_bytes(&self) -> Vec<u8> {
        self.peers.encode_peer_list()
    }

    pub fn peer_list_into(&self, buf: &mut [u8]) -> std::result::Result<usize, BufferTooSmall> {
        self.peers.serialize_into(buf)
    }

    // ---- data service ----

    /// Run the data service on the calling thread until `interrupt` fires.
    pub fn run_data_service(&self, interrupt: Interrupt) -> Result<()> {
        let interrupt = self.watch(interrupt);
        self.block_on(async {
            let listener = self.data.bind().await?;
            self.data.run(listener, interrupt).await
        })?
    }

    /// Bind now, then run the data service in the background.
    pub fn spawn_data_service(&self, interrupt: Interrupt) -> Result<JoinHandle<Result<()>>> {
        let interrupt = self.watch(interrupt);
        let listener = self.block_on(self.data.bind())??;
        let data = Arc::clone(&self.data);
        Ok(self
            .runtime
            .spawn(async move { data.run(listener, interrupt).await }))
    }

    /// `host` is `ip` or `ip:port`. A bare IP uses the port the peer advertised, if known,
    /// otherwise the configured data port.
    pub fn resolve_host(&self, host: &str) -> Result<SocketAddr> {
        let host = host.trim();
        if let Ok(addr) = host.parse::<SocketAddr>() {
            return Ok(addr);
        }
        let ip: IpAddr = host
            .parse()
            .map_err(|_| EngineError::InvalidHost(host.to_owned()))?;
        let advertised = self
            .peers
            .snapshot()
            .into_iter()
            .find(|p| p.addr.ip() == ip)
            .map(|p| p.addr);
        Ok(advertised.unwrap_or_else(|| SocketAddr::new(ip, self.config.data_port)))
    }

    fn host_ip(host: &str) -> Result<IpAddr> {
        let host = host.trim();
        host.parse::<IpAddr>()
            .or_else(|_| host.parse::<SocketAddr>().map(|a| a.ip()))
            .map_err(|_| EngineError::InvalidHost(host.to_owned()))
    }

    pub fn send_text(&self, host: &str, text: &str) -> Result<()> {
        let target = self.resolve_host(host)?;
        self.block_on(self.data.send_text(target, text))?
    }

    pub fn broadcast_text(&self, text: &str) -> Result<BroadcastReport> {
        self.block_on(self.data.broadcast_text(text))
    }

    /// Offer a file. Returns its id once the offer is sent; progress arrives through the handler.
    pub fn try_send_file(&self, host: &str, path: &Path) -> Result<FileId> {
        let target = self.resolve_host(host)?;
        self.block_on(self.data.try_send_file(target, path))?
    }

    /// Answer an incoming offer. Safe to call from an `EventHandler` callback.
    pub fn respond_to_file(
        &self,
        host: &str,
        file_id: FileId,
        size: u64,
        dest: &Path,
        accept: bool,
    ) -> Result<()> {
        let peer = Self::host_ip(host)?;
        self.data
            .respond_to_file(peer, file_id, size, dest.to_path_buf(), accept)
    }

    /// Ask the flow driving `file_id` with `host` to stop. Safe to call from a callback.
    pub fn cancel_transfer(&self, host: &str, file_id: FileId) -> Result<()> {
        let peer = Self::host_ip(host)?;
        self.data.cancel_transfer(peer, file_id)
    }

    pub fn transfers(&self) -> Vec<SessionInfo> {
        self.sessions.list()
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
