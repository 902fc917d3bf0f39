//! lanshare engine: LAN peer discovery, text messages and file transfer between
//! instances of the same group.
//! Hosts embed a `Service`, register an `EventHandler` and drive the loops with an `Interrupt`.

pub mod config;
pub mod data;
pub mod discovery;
pub mod error;
pub mod ffi;
pub mod handler;
pub mod identity;
pub mod interrupt;
pub mod peers;
pub mod protocol;
pub mod service;
pub mod transfer;
pub mod wire;

pub use config::{ChunkRefusal, ConfigError, ServiceConfig};
pub use data::BroadcastReport;
pub use error::{EngineError, Result};
pub use handler::{EventHandler, NoopHandler, TransferProgress};
pub use identity::{FileIdentityStore, Identity, IdentityStore, MemoryIdentityStore};
pub use interrupt::Interrupt;
pub use peers::{decode_peer_list, BufferTooSmall, PeerEntry, PeerRecord};
pub use protocol::{Message, CHUNK_SIZE, COMPATIBILITY};
pub use service::Service;
pub use transfer::{Direction, FileId, SessionInfo, TransferError, TransferState};
pub use wire::CodecError;

/// Crate version reported to hosts.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
