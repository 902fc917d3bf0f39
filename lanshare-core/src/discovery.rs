//! LAN discovery: UDP announces to the broadcast targets, parse announces from others,
//! keep the peer registry fresh.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace, warn};

use crate::config::ServiceConfig;
use crate::error::{EngineError, Result};
use crate::identity::Identity;
use crate::interrupt::Interrupt;
use crate::peers::{PeerRecord, PeerRegistry};
use crate::protocol::{Message, COMPATIBILITY};

const MAX_DATAGRAM: usize = 65536;

/// Why a datagram did not update the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    NotAnnounce,
    OwnAnnounce,
    OtherGroup,
    Incompatible,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatagramOutcome {
    Accepted {
        addr: SocketAddr,
        is_new: bool,
        /// Where to send a direct reply, if the announcer asked for one.
        reply_to: Option<SocketAddr>,
    },
    Dropped(DropReason),
}

pub struct DiscoveryService {
    config: Arc<ServiceConfig>,
    identity: Arc<Identity>,
    peers: Arc<PeerRegistry>,
    /// Advertised data-service port; updated once the data listener is bound.
    data_port: Arc<AtomicU16>,
    /// Port the listen socket actually bound.
    listen_port: AtomicU16,
    send_socket: OnceCell<UdpSocket>,
}

impl DiscoveryService {
    pub fn new(
        config: Arc<ServiceConfig>,
        identity: Arc<Identity>,
        peers: Arc<PeerRegistry>,
        data_port: Arc<AtomicU16>,
    ) -> Self {
        let listen_port = AtomicU16::new(config.discovery_port);
        Self {
            config,
            identity,
            peers,
            data_port,
            listen_port,
            send_socket: OnceCell::new(),
        }
    }

    /// Bound listen port once `bind` has run, else the configured one.
    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::SeqCst)
    }

    fn announce(&self, need_response: bool) -> Message {
        Message::DiscoveryAnnounce {
            compatibility: COMPATIBILITY,
            group: self.config.group,
            instance_id: self.identity.instance_id,
            host_name: self.identity.host_name.clone(),
            data_port: self.data_port.load(Ordering::SeqCst),
            discovery_port: self.listen_port.load(Ordering::SeqCst),
            need_response,
        }
    }

    /// Bind the listen socket. Failure here is fatal for the discovery service.
    pub async fn bind(&self) -> Result<UdpSocket> {
        let addr = self.config.discovery_addr();
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| EngineError::Bind {
                what: "discovery socket",
                addr,
                source,
            })?;
        socket.set_broadcast(true)?;
        let local = socket.local_addr()?;
        self.listen_port.store(local.port(), Ordering::SeqCst);
        info!(addr = %local, group = self.config.group, "discovery listening");
        Ok(socket)
    }

    async fn sender(&self) -> Result<&UdpSocket> {
        self.send_socket
            .get_or_try_init(|| async {
                let addr = SocketAddr::new(
                    IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                    self.config.discovery_send_port,
                );
                let socket = UdpSocket::bind(addr)
                    .await
                    .map_err(|source| EngineError::Bind {
                        what: "discovery send socket",
                        addr,
                        source,
                    })?;
                socket.set_broadcast(true)?;
                Ok::<_, EngineError>(socket)
            })
            .await
    }

    /// Send one announce to every broadcast target. Returns how many targets it reached;
    /// fails only if none did.
    pub async fn broadcast_once(&self) -> Result<usize> {
        let socket = self.sender().await?;
        let frame = self.announce(true).encode()?;
        let mut sent = 0;
        let mut last_err = None;
        for target in self.config.broadcast_targets() {
            match socket.send_to(&frame, target).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    warn!(%target, error = %e, "announce send failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if sent == 0 => Err(EngineError::Io(e)),
            _ => {
                trace!(targets = sent, "announce sent");
                Ok(sent)
            }
        }
    }

    /// Apply one received datagram to the registry.
    pub fn handle_datagram(&self, bytes: &[u8], from: SocketAddr, now: Instant) -> DatagramOutcome {
        let msg = match Message::decode(bytes) {
            Ok(m) => m,
            Err(e) => {
                debug!(%from, error = %e, "dropping malformed datagram");
                return DatagramOutcome::Dropped(DropReason::Malformed);
            }
        };
        let (compatibility, group, instance_id, host_name, data_port, discovery_port, need_response) =
            match msg {
                Message::DiscoveryAnnounce {
                    compatibility,
                    group,
                    instance_id,
                    host_name,
                    data_port,
                    discovery_port,
                    need_response,
                } => (
                    compatibility,
                    group,
                    instance_id,
                    host_name,
                    data_port,
                    discovery_port,
                    need_response,
                ),
                other => {
                    debug!(%from, kind = other.kind(), "non-announce on discovery port");
                    return DatagramOutcome::Dropped(DropReason::NotAnnounce);
                }
            };
        if instance_id == self.identity.instance_id {
            return DatagramOutcome::Dropped(DropReason::OwnAnnounce);
        }
        if group != self.config.group {
            trace!(%from, group, "announce from another group");
            return DatagramOutcome::Dropped(DropReason::OtherGroup);
        }
        if compatibility != COMPATIBILITY {
            debug!(%from, compatibility, "incompatible peer");
            return DatagramOutcome::Dropped(DropReason::Incompatible);
        }
        let addr = SocketAddr::new(from.ip(), data_port);
        let is_new = self.peers.upsert(PeerRecord {
            addr,
            group,
            compatibility,
            host_name: host_name.clone(),
            last_seen: now,
        });
        if is_new {
            info!(peer = %addr, host = %host_name, "peer discovered");
        }
        DatagramOutcome::Accepted {
            addr,
            is_new,
            reply_to: need_response.then(|| SocketAddr::new(from.ip(), discovery_port)),
        }
    }

    /// Receive announces until `interrupt` fires. Each wait is bounded by the poll interval;
    /// stale peers are swept whenever a wait times out.
    pub async fn run(&self, socket: UdpSocket, interrupt: Interrupt) -> Result<()> {
        let poll = self.config.poll_interval();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let reply = self.announce(false);
        while !interrupt.is_triggered() {
            match tokio::time::timeout(poll, socket.recv_from(&mut buf)).await {
                Ok(Ok((n, from))) => {
                    if let DatagramOutcome::Accepted {
                        reply_to: Some(to), ..
                    } = self.handle_datagram(&buf[..n], from, Instant::now())
                    {
                        self.reply(&socket, &reply, to).await;
                    }
                }
                // ICMP errors from earlier sends surface here on some platforms.
                Ok(Err(e)) => debug!(error = %e, "discovery receive failed"),
                Err(_) => {
                    let removed = self.peers.sweep();
                    if removed > 0 {
                        debug!(removed, "stale peers swept");
                    }
                }
            }
        }
        info!("discovery stopped");
        Ok(())
    }

    async fn reply(&self, socket: &UdpSocket, template: &Message, to: SocketAddr) {
        let mut msg = template.clone();
        // Data port may have changed since the loop started.
        if let Message::DiscoveryAnnounce { data_port, .. } = &mut msg {
            *data_port = self.data_port.load(Ordering::SeqCst);
        }
        match msg.encode() {
            Ok(frame) => {
                if let Err(e) = socket.send_to(&frame, to).await {
                    debug!(%to, error = %e, "discovery reply failed");
                }
            }
            Err(e) => warn!(error = %e, "cannot encode discovery reply"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn service(config: ServiceConfig) -> DiscoveryService {
        let config = Arc::new(config);
        let peers = Arc::new(PeerRegistry::new(config.stale_after()));
        DiscoveryService::new(
            Arc::clone(&config),
            Arc::new(Identity::generate("local")),
            peers,
            Arc::new(AtomicU16::new(4000)),
        )
    }

    fn announce(group: u8, compatibility: u32, instance_id: Uuid, need_response: bool) -> Vec<u8> {
        Message::DiscoveryAnnounce {
            compatibility,
            group,
            instance_id,
            host_name: "remote".into(),
            data_port: 7000,
            discovery_port: 7001,
            need_response,
        }
        .encode()
        .unwrap()
    }

    fn loopback_config() -> ServiceConfig {
        ServiceConfig {
            discovery_port: 0,
            poll_interval_ms: 50,
            group: 2,
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn accepts_same_group_and_keys_by_data_port() {
        let d = service(loopback_config());
        let from: SocketAddr = "10.1.1.5:40000".parse().unwrap();
        let outcome = d.handle_datagram(&announce(2, COMPATIBILITY, Uuid::new_v4(), true), from, Instant::now());
        assert_eq!(
            outcome,
            DatagramOutcome::Accepted {
                addr: "10.1.1.5:7000".parse().unwrap(),
                is_new: true,
                reply_to: Some("10.1.1.5:7001".parse().unwrap()),
            }
        );
        let peers = d.peers.snapshot();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].host_name, "remote");
    }

    #[test]
    fn drops_other_group_self_and_incompatible() {
        let d = service(loopback_config());
        let from: SocketAddr = "10.1.1.5:40000".parse().unwrap();
        let now = Instant::now();
        let own = d.identity.instance_id;
        assert_eq!(
            d.handle_datagram(&announce(3, COMPATIBILITY, Uuid::new_v4(), false), from, now),
            DatagramOutcome::Dropped(DropReason::OtherGroup)
        );
        assert_eq!(
            d.handle_datagram(&announce(2, COMPATIBILITY, own, false), from, now),
            DatagramOutcome::Dropped(DropReason::OwnAnnounce)
        );
        assert_eq!(
            d.handle_datagram(&announce(2, COMPATIBILITY + 1, Uuid::new_v4(), false), from, now),
            DatagramOutcome::Dropped(DropReason::Incompatible)
        );
        assert_eq!(
            d.handle_datagram(b"not a packet", from, now),
            DatagramOutcome::Dropped(DropReason::Malformed)
        );
        let text = Message::Text { text: "hi".into() }.encode().unwrap();
        assert_eq!(
            d.handle_datagram(&text, from, now),
            DatagramOutcome::Dropped(DropReason::NotAnnounce)
        );
        assert!(d.peers.is_empty());
    }

    #[tokio::test]
    async fn run_returns_within_a_poll_cycle_and_releases_port() {
        let d = service(loopback_config());
        let socket = d.bind().await.unwrap();
        let addr = socket.local_addr().unwrap();
        let interrupt = Interrupt::new();
        let stop = interrupt.clone();
        let task = tokio::spawn(async move { d.run(socket, stop).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        interrupt.trigger();
        tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("loop did not stop")
            .unwrap()
            .unwrap();
        UdpSocket::bind(("0.0.0.0", addr.port())).await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_reaches_listener_and_gets_reply() {
        let listener = Arc::new(service(loopback_config()));
        let listen_socket = listener.bind().await.unwrap();
        let listen_port = listen_socket.local_addr().unwrap().port();

        let announcer = service(ServiceConfig {
            broadcast_targets: vec![SocketAddr::from(([127, 0, 0, 1], listen_port))],
            ..loopback_config()
        });
        let announcer_socket = announcer.bind().await.unwrap();

        let interrupt = Interrupt::new();
        let task = {
            let listener = Arc::clone(&listener);
            let stop = interrupt.clone();
            tokio::spawn(async move { listener.run(listen_socket, stop).await })
        };

        assert_eq!(announcer.broadcast_once().await.unwrap(), 1);

        // The listener answers on the announcer's discovery port.
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, from) = tokio::time::timeout(
            Duration::from_secs(2),
            announcer_socket.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        let outcome = announcer.handle_datagram(&buf[..n], from, Instant::now());
        assert!(matches!(
            outcome,
            DatagramOutcome::Accepted { reply_to: None, .. }
        ));
        assert_eq!(announcer.peers.len(), 1);

        let peers = listener.peers.snapshot();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].addr, SocketAddr::from(([127, 0, 0, 1], 4000)));

        interrupt.trigger();
        task.await.unwrap().unwrap();
    }
}
