//! File transfer sessions: state machine, per-peer file id space, host decisions.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Transfer identifier, unique among live sessions with one peer in one direction.
pub type FileId = u8;

/// Number of distinct file ids per peer and direction.
pub const FILE_ID_SPACE: usize = FileId::MAX as usize + 1;

/// Lifecycle of one file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    Offered,
    Accepted,
    InProgress,
    Completed,
    Rejected,
    Cancelled,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed
                | TransferState::Rejected
                | TransferState::Cancelled
                | TransferState::Failed
        )
    }

    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Offered, Accepted)
                | (Offered, Rejected)
                | (Offered, Failed)
                | (Offered, Cancelled)
                | (Accepted, InProgress)
                | (Accepted, Failed)
                | (Accepted, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Cancelled)
                | (InProgress, Failed)
        )
    }

    /// Numeric status code reported to C hosts.
    pub fn code(self) -> u8 {
        match self {
            TransferState::Offered => 1,
            TransferState::Accepted => 2,
            TransferState::InProgress => 3,
            TransferState::Completed => 4,
            TransferState::Rejected => 5,
            TransferState::Cancelled => 6,
            TransferState::Failed => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(TransferState::Offered),
            2 => Some(TransferState::Accepted),
            3 => Some(TransferState::InProgress),
            4 => Some(TransferState::Completed),
            5 => Some(TransferState::Rejected),
            6 => Some(TransferState::Cancelled),
            7 => Some(TransferState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Sending,
    Receiving,
}

/// Host decision on an incoming offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept(PathBuf),
    Reject,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub file_id: FileId,
    pub direction: Direction,
    pub peer: IpAddr,
    pub file_name: String,
    pub size: u64,
    pub transferred: u64,
    pub state: TransferState,
    pub path: Option<PathBuf>,
}

/// One file exchange. The flow task driving it owns the file handle; the table owns the bookkeeping.
struct FileTransferSession {
    info: SessionInfo,
    cancel: Arc<AtomicBool>,
    /// Present while a received offer waits for the host.
    decision: Option<oneshot::Sender<Decision>>,
}

impl FileTransferSession {
    fn transition(&mut self, next: TransferState) -> Result<(), TransferError> {
        let from = self.info.state;
        if !from.can_transition_to(next) {
            return Err(TransferError::InvalidTransition { from, to: next });
        }
        self.info.state = next;
        Ok(())
    }
}

type SessionKey = (IpAddr, Direction, FileId);

/// Handles given to the task that drives a freshly opened session.
pub struct SessionHandles {
    pub file_id: FileId,
    pub cancel: Arc<AtomicBool>,
}

/// All live sessions of one service. Every look-up + check + transition happens under one lock.
pub struct SessionTable {
    sessions: Mutex<HashMap<SessionKey, FileTransferSession>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a Sending session in `Offered` on the lowest free id for `peer`.
    pub fn open_sending(
        &self,
        peer: IpAddr,
        file_name: String,
        size: u64,
        path: PathBuf,
    ) -> Result<SessionHandles, TransferError> {
        let mut sessions = self.sessions.lock();
        let file_id = (0..=FileId::MAX)
            .find(|id| !sessions.contains_key(&(peer, Direction::Sending, *id)))
            .ok_or(TransferError::TooManySessions { peer })?;
        let cancel = Arc::new(AtomicBool::new(false));
        sessions.insert(
            (peer, Direction::Sending, file_id),
            FileTransferSession {
                info: SessionInfo {
                    file_id,
                    direction: Direction::Sending,
                    peer,
                    file_name,
                    size,
                    transferred: 0,
                    state: TransferState::Offered,
                    path: Some(path),
                },
                cancel: cancel.clone(),
                decision: None,
            },
        );
        Ok(SessionHandles { file_id, cancel })
    }

    /// Create a Receiving session in `Offered` for an offer from `peer`.
    /// Returns the cancel flag and the channel on which the host decision arrives.
    pub fn open_receiving(
        &self,
        peer: IpAddr,
        file_id: FileId,
        file_name: String,
        size: u64,
    ) -> Result<(SessionHandles, oneshot::Receiver<Decision>), TransferError> {
        let mut sessions = self.sessions.lock();
        let key = (peer, Direction::Receiving, file_id);
        if sessions.contains_key(&key) {
            return Err(TransferError::DuplicateSession { file_id });
        }
        let (tx, rx) = oneshot::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        sessions.insert(
            key,
            FileTransferSession {
                info: SessionInfo {
                    file_id,
                    direction: Direction::Receiving,
                    peer,
                    file_name,
                    size,
                    transferred: 0,
                    state: TransferState::Offered,
                    path: None,
                },
                cancel: cancel.clone(),
                decision: Some(tx),
            },
        );
        Ok((SessionHandles { file_id, cancel }, rx))
    }

    /// Apply the host's decision to a pending received offer. Only one caller can win.
    pub fn resolve_offer(
        &self,
        peer: IpAddr,
        file_id: FileId,
        size: u64,
        decision: Decision,
    ) -> Result<(), TransferError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&(peer, Direction::Receiving, file_id))
            .ok_or(TransferError::UnknownSession { file_id })?;
        if session.info.state != TransferState::Offered {
            return Err(TransferError::NotPending {
                file_id,
                state: session.info.state,
            });
        }
        if session.info.size != size {
            return Err(TransferError::SizeMismatch {
                expected: session.info.size,
                got: size,
            });
        }
        let tx = session.decision.take().ok_or(TransferError::NotPending {
            file_id,
            state: session.info.state,
        })?;
        let next = match &decision {
            Decision::Accept(path) => {
                session.info.path = Some(path.clone());
                TransferState::Accepted
            }
            Decision::Reject => TransferState::Rejected,
        };
        session.transition(next)?;
        if tx.send(decision).is_err() {
            // The connection went away between the offer and the answer.
            session.info.state = TransferState::Failed;
            return Err(TransferError::NotPending {
                file_id,
                state: TransferState::Failed,
            });
        }
        Ok(())
    }

    /// Fail a received offer nobody answered in time. Returns false if a decision already won.
    pub fn expire_offer(&self, peer: IpAddr, file_id: FileId) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&(peer, Direction::Receiving, file_id)) {
            Some(s) if s.info.state == TransferState::Offered => {
                s.decision = None;
                s.info.state = TransferState::Failed;
                true
            }
            _ => false,
        }
    }

    pub fn transition(
        &self,
        peer: IpAddr,
        direction: Direction,
        file_id: FileId,
        next: TransferState,
    ) -> Result<SessionInfo, TransferError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&(peer, direction, file_id))
            .ok_or(TransferError::UnknownSession { file_id })?;
        session.transition(next)?;
        Ok(session.info.clone())
    }

    pub fn record_progress(
        &self,
        peer: IpAddr,
        direction: Direction,
        file_id: FileId,
        transferred: u64,
    ) {
        if let Some(s) = self.sessions.lock().get_mut(&(peer, direction, file_id)) {
            s.info.transferred = transferred;
        }
    }

    pub fn get(&self, peer: IpAddr, direction: Direction, file_id: FileId) -> Option<SessionInfo> {
        self.sessions
            .lock()
            .get(&(peer, direction, file_id))
            .map(|s| s.info.clone())
    }

    /// Drop a session whose final status has been delivered; frees its id.
    pub fn remove(&self, peer: IpAddr, direction: Direction, file_id: FileId) -> Option<SessionInfo> {
        self.sessions
            .lock()
            .remove(&(peer, direction, file_id))
            .map(|s| s.info)
    }

    pub fn cancel_flag(
        &self,
        peer: IpAddr,
        direction: Direction,
        file_id: FileId,
    ) -> Option<Arc<AtomicBool>> {
        self.sessions
            .lock()
            .get(&(peer, direction, file_id))
            .map(|s| Arc::clone(&s.cancel))
    }

    /// Flag live sessions with `peer` and `file_id` (either direction) for cancellation.
    pub fn request_cancel(&self, peer: IpAddr, file_id: FileId) -> Result<(), TransferError> {
        let sessions = self.sessions.lock();
        let mut found = false;
        for direction in [Direction::Sending, Direction::Receiving] {
            if let Some(s) = sessions.get(&(peer, direction, file_id)) {
                if !s.info.state.is_terminal() {
                    s.cancel.store(true, Ordering::SeqCst);
                    found = true;
                }
            }
        }
        if found {
            Ok(())
        } else {
            Err(TransferError::UnknownSession { file_id })
        }
    }

    /// Fail and remove every unfinished Receiving session. Used when the data service stops.
    pub fn fail_receiving(&self) -> Vec<SessionInfo> {
        let mut sessions = self.sessions.lock();
        let keys: Vec<SessionKey> = sessions
            .iter()
            .filter(|(_, s)| s.info.direction == Direction::Receiving && !s.info.state.is_terminal())
            .map(|(k, _)| *k)
            .collect();
        keys.into_iter()
            .filter_map(|k| sessions.remove(&k))
            .map(|mut s| {
                s.info.state = TransferState::Failed;
                s.info
            })
            .collect()
    }

    pub fn active_count(&self, peer: IpAddr, direction: Direction) -> usize {
        self.sessions
            .lock()
            .keys()
            .filter(|(p, d, _)| *p == peer && *d == direction)
            .count()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.lock().values().map(|s| s.info.clone()).collect()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid transfer transition {from} -> {to}")]
    InvalidTransition {
        from: TransferState,
        to: TransferState,
    },
    #[error("all 256 file ids with {peer} are in use")]
    TooManySessions { peer: IpAddr },
    #[error("unknown transfer {file_id}")]
    UnknownSession { file_id: FileId },
    #[error("transfer {file_id} already exists")]
    DuplicateSession { file_id: FileId },
    #[error("transfer {file_id} is not awaiting a decision (state {state})")]
    NotPending {
        file_id: FileId,
        state: TransferState,
    },
    #[error("size mismatch: offer was {expected} bytes, got {got}")]
    SizeMismatch { expected: u64, got: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));

    fn open(table: &SessionTable) -> FileId {
        table
            .open_sending(PEER, "a.bin".into(), 10, PathBuf::from("/tmp/a.bin"))
            .unwrap()
            .file_id
    }

    #[test]
    fn terminal_states_never_transition() {
        use TransferState::*;
        let all = [Offered, Accepted, InProgress, Completed, Rejected, Cancelled, Failed];
        for from in [Completed, Rejected, Cancelled, Failed] {
            assert!(from.is_terminal());
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn happy_path_transitions() {
        use TransferState::*;
        assert!(Offered.can_transition_to(Accepted));
        assert!(Accepted.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(!Offered.can_transition_to(Completed));
        assert!(!Offered.can_transition_to(InProgress));
    }

    #[test]
    fn status_codes_roundtrip() {
        for code in 1..=7 {
            assert_eq!(TransferState::from_code(code).unwrap().code(), code);
        }
        assert!(TransferState::from_code(0).is_none());
    }

    #[test]
    fn lowest_free_id_is_recycled() {
        let table = SessionTable::new();
        assert_eq!(open(&table), 0);
        assert_eq!(open(&table), 1);
        assert_eq!(open(&table), 2);
        table.remove(PEER, Direction::Sending, 1);
        assert_eq!(open(&table), 1);
    }

    #[test]
    fn id_space_exhaustion() {
        let table = SessionTable::new();
        for _ in 0..FILE_ID_SPACE {
            open(&table);
        }
        assert_eq!(table.active_count(PEER, Direction::Sending), FILE_ID_SPACE);
        let err = table
            .open_sending(PEER, "b.bin".into(), 1, PathBuf::from("/tmp/b.bin"))
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::TooManySessions { .. }));
        // Another peer has its own id space.
        let other = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 21));
        assert!(table
            .open_sending(other, "b.bin".into(), 1, PathBuf::from("/tmp/b.bin"))
            .is_ok());
    }

    #[test]
    fn invalid_transition_is_reported() {
        let table = SessionTable::new();
        let id = open(&table);
        let err = table
            .transition(PEER, Direction::Sending, id, TransferState::Completed)
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::InvalidTransition {
                from: TransferState::Offered,
                to: TransferState::Completed
            }
        ));
    }

    #[test]
    fn decision_is_delivered_once() {
        let table = SessionTable::new();
        let (_, mut rx) = table.open_receiving(PEER, 4, "c.txt".into(), 5).unwrap();
        table
            .resolve_offer(PEER, 4, 5, Decision::Accept(PathBuf::from("/tmp/c.txt")))
            .unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Decision::Accept(PathBuf::from("/tmp/c.txt"))
        );
        let second = table.resolve_offer(PEER, 4, 5, Decision::Reject).unwrap_err();
        assert!(matches!(
            second,
            TransferError::NotPending {
                state: TransferState::Accepted,
                ..
            }
        ));
    }

    #[test]
    fn decision_checks_size_and_existence() {
        let table = SessionTable::new();
        let _pending = table.open_receiving(PEER, 1, "d".into(), 5).unwrap();
        assert!(matches!(
            table.resolve_offer(PEER, 1, 6, Decision::Reject),
            Err(TransferError::SizeMismatch { expected: 5, got: 6 })
        ));
        assert!(matches!(
            table.resolve_offer(PEER, 2, 5, Decision::Reject),
            Err(TransferError::UnknownSession { file_id: 2 })
        ));
        assert!(matches!(
            table.open_receiving(PEER, 1, "d".into(), 5),
            Err(TransferError::DuplicateSession { file_id: 1 })
        ));
    }

    #[test]
    fn expired_offer_cannot_be_accepted() {
        let table = SessionTable::new();
        let _pending = table.open_receiving(PEER, 8, "e".into(), 5).unwrap();
        assert!(table.expire_offer(PEER, 8));
        assert!(matches!(
            table.resolve_offer(PEER, 8, 5, Decision::Reject),
            Err(TransferError::NotPending {
                state: TransferState::Failed,
                ..
            })
        ));
    }

    #[test]
    fn decided_offer_does_not_expire() {
        let table = SessionTable::new();
        let _pending = table.open_receiving(PEER, 8, "e".into(), 5).unwrap();
        table.resolve_offer(PEER, 8, 5, Decision::Reject).unwrap();
        assert!(!table.expire_offer(PEER, 8));
        assert_eq!(
            table.get(PEER, Direction::Receiving, 8).unwrap().state,
            TransferState::Rejected
        );
    }

    #[test]
    fn cancel_sets_flag() {
        let table = SessionTable::new();
        let handles = table
            .open_sending(PEER, "f".into(), 1, PathBuf::from("/tmp/f"))
            .unwrap();
        table.request_cancel(PEER, handles.file_id).unwrap();
        assert!(handles.cancel.load(Ordering::SeqCst));
        assert!(table.request_cancel(PEER, 200).is_err());
    }

    #[test]
    fn stopping_fails_pending_receives() {
        let table = SessionTable::new();
        let _pending = table.open_receiving(PEER, 0, "g".into(), 5).unwrap();
        open(&table);
        let failed = table.fail_receiving();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].state, TransferState::Failed);
        assert_eq!(table.list().len(), 1);
    }
}
