//! Host event callbacks.

use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::transfer::{Direction, FileId, SessionInfo, TransferState};

/// Progress or final status of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub file_id: FileId,
    pub direction: Direction,
    pub peer: IpAddr,
    pub transferred: u64,
    pub total: u64,
    pub state: TransferState,
}

impl From<&SessionInfo> for TransferProgress {
    fn from(info: &SessionInfo) -> Self {
        Self {
            file_id: info.file_id,
            direction: info.direction,
            peer: info.peer,
            transferred: info.transferred,
            total: info.size,
            state: info.state,
        }
    }
}

/// Receives events from the service. Called from runtime worker threads, so implementations
/// must be cheap. Blocking `Service` methods return `EngineError::InsideRuntime` from here;
/// `respond_to_file` and `cancel_transfer` are safe to call.
pub trait EventHandler: Send + Sync {
    fn on_text(&self, _host: &str, _text: &str) {}

    /// A peer offered a file. Answer with `Service::respond_to_file`.
    fn on_file_offer(&self, _file_id: FileId, _host: &str, _file_name: &str, _size: u64) {}

    fn on_file_progress(&self, _progress: &TransferProgress) {}

    /// A chunk arrived for an accepted file. Returning false aborts the transfer.
    fn on_file_chunk(&self, _file_id: FileId, _offset: u64, _data: &[u8]) -> bool {
        true
    }
}

/// Ignores every event; chunks are accepted.
pub struct NoopHandler;

impl EventHandler for NoopHandler {}

/// Replaceable handler shared between the service and its loops.
#[derive(Clone)]
pub struct HandlerSlot(Arc<RwLock<Arc<dyn EventHandler>>>);

impl HandlerSlot {
    pub fn new(handler: Arc<dyn EventHandler>) -> Self {
        Self(Arc::new(RwLock::new(handler)))
    }

    pub fn get(&self) -> Arc<dyn EventHandler> {
        Arc::clone(&self.0.read())
    }

    pub fn set(&self, handler: Arc<dyn EventHandler>) {
        *self.0.write() = handler;
    }
}

impl Default for HandlerSlot {
    fn default() -> Self {
        Self::new(Arc::new(NoopHandler))
    }
}
