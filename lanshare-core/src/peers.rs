//! Peer registry: peers seen through discovery, keyed by data-service address, with freshness tracking.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::wire::{self, CodecError};

/// One known peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Source IP of the announce plus the advertised data-service port.
    pub addr: SocketAddr,
    pub group: u8,
    pub compatibility: u32,
    pub host_name: String,
    pub last_seen: Instant,
}

/// Flat form of a peer handed to hosts. One packet per entry, payload is bincode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub ip: String,
    pub data_port: u16,
    pub group: u8,
    pub compatibility: u32,
    pub host_name: String,
}

impl From<&PeerRecord> for PeerEntry {
    fn from(r: &PeerRecord) -> Self {
        Self {
            ip: r.addr.ip().to_string(),
            data_port: r.addr.port(),
            group: r.group,
            compatibility: r.compatibility,
            host_name: r.host_name.clone(),
        }
    }
}

/// Caller-supplied buffer cannot hold the peer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("peer list needs {required} bytes")]
pub struct BufferTooSmall {
    pub required: usize,
}

pub struct PeerRegistry {
    peers: RwLock<BTreeMap<SocketAddr, PeerRecord>>,
    stale_after: Duration,
}

impl PeerRegistry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            peers: RwLock::new(BTreeMap::new()),
            stale_after,
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Insert or fully replace the record for `record.addr`. Returns true if the peer is new.
    pub fn upsert(&self, record: PeerRecord) -> bool {
        self.peers.write().insert(record.addr, record).is_none()
    }

    /// Fresh peers ordered by address. Stale entries are pruned on the way.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> Vec<PeerRecord> {
        let mut peers = self.peers.write();
        let stale_after = self.stale_after;
        peers.retain(|_, p| !is_stale(p, now, stale_after));
        peers.values().cloned().collect()
    }

    /// Drop stale peers. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut peers = self.peers.write();
        let before = peers.len();
        let stale_after = self.stale_after;
        peers.retain(|_, p| !is_stale(p, now, stale_after));
        before - peers.len()
    }

    /// Number of stored records, stale or not.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Encode the current snapshot as consecutive packets.
    pub fn encode_peer_list(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for record in self.snapshot() {
            let entry = PeerEntry::from(&record);
            match bincode::serialize(&entry)
                .map_err(CodecError::Encode)
                .and_then(|payload| wire::encode(&payload))
            {
                Ok(frame) => out.extend_from_slice(&frame),
                Err(e) => tracing::warn!(peer = %record.addr, error = %e, "skipping unencodable peer"),
            }
        }
        out
    }

    /// Write the peer list into `buf`. Nothing is written when it does not fit.
    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<usize, BufferTooSmall> {
        let bytes = self.encode_peer_list();
        if bytes.len() > buf.len() {
            return Err(BufferTooSmall {
                required: bytes.len(),
            });
        }
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }
}

fn is_stale(peer: &PeerRecord, now: Instant, stale_after: Duration) -> bool {
    now.saturating_duration_since(peer.last_seen) > stale_after
}

/// Parse a buffer produced by `serialize_into`.
pub fn decode_peer_list(mut bytes: &[u8]) -> Result<Vec<PeerEntry>, CodecError> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        let (payload, consumed) = wire::decode_frame(bytes)?;
        out.push(bincode::deserialize(payload).map_err(CodecError::Decode)?);
        bytes = &bytes[consumed..];
    }
    Ok(out)
}
