//! Data service: TCP listener for texts and file transfers, plus the outbound side
//! (send text, offer a file, stream its chunks).

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{ChunkRefusal, ServiceConfig};
use crate::error::{EngineError, Result};
use crate::handler::{HandlerSlot, TransferProgress};
use crate::interrupt::Interrupt;
use crate::peers::PeerRegistry;
use crate::protocol::{Message, CHUNK_SIZE};
use crate::transfer::{Decision, Direction, FileId, SessionTable, TransferError, TransferState};
use crate::wire::{self, CodecError, MAX_PAYLOAD_LEN};

/// Outcome of sending one text to every known peer.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<SocketAddr>,
    pub failed: Vec<(SocketAddr, EngineError)>,
}

pub struct DataService {
    config: Arc<ServiceConfig>,
    peers: Arc<PeerRegistry>,
    sessions: Arc<SessionTable>,
    handler: HandlerSlot,
    /// Port advertised by discovery. Holds the bound port once `bind` succeeds.
    data_port: Arc<AtomicU16>,
}

impl DataService {
    pub fn new(
        config: Arc<ServiceConfig>,
        peers: Arc<PeerRegistry>,
        sessions: Arc<SessionTable>,
        handler: HandlerSlot,
        data_port: Arc<AtomicU16>,
    ) -> Self {
        Self {
            config,
            peers,
            sessions,
            handler,
            data_port,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.data_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| EngineError::Bind {
                what: "data listener",
                addr,
                source,
            })?;
        let local = listener.local_addr()?;
        self.data_port.store(local.port(), Ordering::SeqCst);
        info!(addr = %local, "data service listening");
        Ok(listener)
    }

    /// Accept connections until `interrupt` fires. Connection errors are logged and never end the loop.
    pub async fn run(self: &Arc<Self>, listener: TcpListener, interrupt: Interrupt) -> Result<()> {
        let poll = self.config.poll_interval();
        let mut connections = JoinSet::new();
        while !interrupt.is_triggered() {
            match tokio::time::timeout(poll, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let this = Arc::clone(self);
                    connections.spawn(async move { this.handle_connection(stream, addr).await });
                }
                Ok(Err(e)) => warn!(error = %e, "accept failed"),
                Err(_) => {}
            }
            while let Some(done) = connections.try_join_next() {
                if let Err(e) = done {
                    if e.is_panic() {
                        warn!(error = %e, "connection task panicked");
                    }
                }
            }
        }
        drop(listener);
        connections.shutdown().await;
        for info in self.sessions.fail_receiving() {
            warn!(peer = %info.peer, file_id = info.file_id, "receive aborted by shutdown");
            self.handler.get().on_file_progress(&TransferProgress::from(&info));
        }
        info!("data service stopped");
        Ok(())
    }

    async fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) {
        let first = match read_message(&mut stream, self.config.io_timeout(), "first message").await {
            Ok(m) => m,
            Err(e) => {
                debug!(peer = %addr, error = %e, "dropping connection");
                return;
            }
        };
        debug!(peer = %addr, kind = first.kind(), "incoming");
        let peer = addr.ip();
        match first {
            Message::Text { text } => self.handler.get().on_text(&peer.to_string(), &text),
            Message::FileOffer {
                file_id,
                size,
                name,
            } => self.receive_file(stream, peer, file_id, size, name).await,
            Message::FileResponse {
                file_id, accepted, ..
            } => self.on_file_response(stream, peer, file_id, accepted, None).await,
            Message::FileStatus {
                file_id,
                transferred,
                total,
                state,
            } => self.apply_remote_status(peer, file_id, transferred, total, state),
            Message::FileChunk { file_id, .. } => {
                warn!(peer = %addr, file_id, "chunk outside of a transfer, dropped")
            }
            Message::DiscoveryAnnounce { .. } => {
                warn!(peer = %addr, "announce on the data port, closing")
            }
        }
    }

    // ---- receiving ----

    async fn receive_file(
        &self,
        mut stream: TcpStream,
        peer: IpAddr,
        file_id: FileId,
        size: u64,
        name: String,
    ) {
        let io_timeout = self.config.io_timeout();
        let reject = Message::FileResponse {
            file_id,
            size,
            accepted: false,
        };
        let (handles, mut decision_rx) =
            match self.sessions.open_receiving(peer, file_id, name.clone(), size) {
                Ok(opened) => opened,
                Err(e) => {
                    warn!(%peer, file_id, error = %e, "refusing offer");
                    let _ = write_message(&mut stream, &reject, io_timeout).await;
                    return;
                }
            };
        info!(%peer, file_id, name = %name, size, "file offered");
        self.handler
            .get()
            .on_file_offer(file_id, &peer.to_string(), &name, size);

        let decision = match tokio::time::timeout(self.config.offer_timeout(), &mut decision_rx).await {
            Ok(Ok(d)) => d,
            Ok(Err(_)) => {
                // Session was torn down while waiting.
                self.finish(peer, Direction::Receiving, file_id, TransferState::Failed);
                return;
            }
            Err(_) => {
                if self.sessions.expire_offer(peer, file_id) {
                    warn!(%peer, file_id, "offer not answered in time");
                    let _ = write_message(&mut stream, &reject, io_timeout).await;
                    self.conclude(peer, Direction::Receiving, file_id);
                    return;
                }
                // Host answered right at the deadline.
                match decision_rx.try_recv() {
                    Ok(d) => d,
                    Err(_) => {
                        self.finish(peer, Direction::Receiving, file_id, TransferState::Failed);
                        return;
                    }
                }
            }
        };

        let dest = match decision {
            Decision::Accept(dest) => dest,
            Decision::Reject => {
                info!(%peer, file_id, "offer rejected");
                if let Err(e) = write_message(&mut stream, &reject, io_timeout).await {
                    debug!(%peer, file_id, error = %e, "cannot deliver rejection");
                }
                self.conclude(peer, Direction::Receiving, file_id);
                return;
            }
        };

        let mut file = match File::create(&dest).await {
            Ok(f) => f,
            Err(e) => {
                warn!(%peer, file_id, path = %dest.display(), error = %e, "cannot create destination");
                let _ = write_message(&mut stream, &reject, io_timeout).await;
                self.finish(peer, Direction::Receiving, file_id, TransferState::Failed);
                return;
            }
        };
        let accept = Message::FileResponse {
            file_id,
            size,
            accepted: true,
        };
        let started = match write_message(&mut stream, &accept, io_timeout).await {
            Ok(()) => self
                .sessions
                .transition(peer, Direction::Receiving, file_id, TransferState::InProgress)
                .map(|_| ())
                .map_err(EngineError::from),
            Err(e) => Err(e),
        };
        let outcome = match started {
            Ok(()) => {
                self.receive_chunks(&mut stream, &mut file, peer, file_id, size, &handles.cancel)
                    .await
            }
            Err(e) => Err(e),
        };
        drop(file);
        let state = match outcome {
            Ok(state) => {
                info!(%peer, file_id, %state, path = %dest.display(), "receive finished");
                state
            }
            Err(e) => {
                warn!(%peer, file_id, error = %e, "receive failed");
                TransferState::Failed
            }
        };
        // Only complete files are left behind.
        if state != TransferState::Completed {
            if let Err(e) = tokio::fs::remove_file(&dest).await {
                debug!(path = %dest.display(), error = %e, "cannot remove partial file");
            }
        }
        self.finish(peer, Direction::Receiving, file_id, state);
    }

    /// Read chunks until `size` bytes are written. Returns `Completed` or `Cancelled`.
    async fn receive_chunks(
        &self,
        stream: &mut TcpStream,
        file: &mut File,
        peer: IpAddr,
        file_id: FileId,
        size: u64,
        cancel: &AtomicBool,
    ) -> Result<TransferState> {
        let io_timeout = self.config.io_timeout();
        let handler = self.handler.get();
        let mut transferred = 0u64;
        loop {
            if transferred == size {
                file.flush().await?;
                let done = Message::FileStatus {
                    file_id,
                    transferred,
                    total: size,
                    state: TransferState::Completed,
                };
                if let Err(e) = write_message(stream, &done, io_timeout).await {
                    debug!(%peer, file_id, error = %e, "cannot confirm completion");
                }
                return Ok(TransferState::Completed);
            }
            if cancel.load(Ordering::SeqCst) {
                notify_cancelled(stream, file_id, transferred, size, io_timeout).await;
                drain(stream, io_timeout).await;
                return Ok(TransferState::Cancelled);
            }
            match read_message(stream, io_timeout, "file chunk").await? {
                Message::FileChunk {
                    file_id: id,
                    offset,
                    data,
                } if id == file_id => {
                    let end = offset.saturating_add(data.len() as u64);
                    if offset != transferred || end > size {
                        return Err(EngineError::BadChunk {
                            expected: transferred,
                            offset,
                            len: data.len(),
                        });
                    }
                    if !handler.on_file_chunk(file_id, offset, &data) {
                        info!(%peer, file_id, offset, "chunk refused by host");
                        if self.config.chunk_refusal == ChunkRefusal::NotifySender {
                            notify_cancelled(stream, file_id, transferred, size, io_timeout).await;
                            drain(stream, io_timeout).await;
                        }
                        return Ok(TransferState::Cancelled);
                    }
                    file.write_all(&data).await?;
                    transferred = end;
                    self.sessions
                        .record_progress(peer, Direction::Receiving, file_id, transferred);
                }
                Message::FileStatus {
                    file_id: id,
                    state: TransferState::Cancelled,
                    ..
                } if id == file_id => {
                    info!(%peer, file_id, "sender cancelled");
                    return Ok(TransferState::Cancelled);
                }
                other => return Err(EngineError::UnexpectedMessage(other.kind())),
            }
        }
    }

    // ---- sending ----

    async fn connect(&self, target: SocketAddr) -> Result<TcpStream> {
        match tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(target)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(EngineError::ConnectFailed {
                addr: target,
                source,
            }),
            Err(_) => Err(EngineError::ConnectFailed {
                addr: target,
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            }),
        }
    }

    /// Deliver one text. No retry.
    pub async fn send_text(&self, target: SocketAddr, text: &str) -> Result<()> {
        let msg = Message::Text {
            text: text.to_owned(),
        };
        // Reject oversize text before touching the network.
        check_size(&msg)?;
        let mut stream = self.connect(target).await?;
        write_message(&mut stream, &msg, self.config.io_timeout()).await?;
        let _ = stream.shutdown().await;
        debug!(peer = %target, len = text.len(), "text sent");
        Ok(())
    }

    /// Send `text` to every fresh peer. One failure never stops the fan-out.
    pub async fn broadcast_text(&self, text: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for peer in self.peers.snapshot() {
            match self.send_text(peer.addr, text).await {
                Ok(()) => report.delivered.push(peer.addr),
                Err(e) => {
                    warn!(peer = %peer.addr, error = %e, "broadcast text not delivered");
                    report.failed.push((peer.addr, e));
                }
            }
        }
        report
    }

    /// Offer `path` to `target`. Returns once the offer is on the wire; the rest runs in the background.
    pub async fn try_send_file(self: &Arc<Self>, target: SocketAddr, path: &Path) -> Result<FileId> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| EngineError::InvalidPath(path.display().to_string()))?;
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        let peer = target.ip();
        let handles = self
            .sessions
            .open_sending(peer, name.clone(), size, path.to_path_buf())?;
        let file_id = handles.file_id;

        let offer = Message::FileOffer {
            file_id,
            size,
            name: name.clone(),
        };
        let opened = match self.connect(target).await {
            Ok(mut stream) => write_message(&mut stream, &offer, self.config.io_timeout())
                .await
                .map(|()| stream),
            Err(e) => Err(e),
        };
        let stream = match opened {
            Ok(s) => s,
            Err(e) => {
                self.sessions.remove(peer, Direction::Sending, file_id);
                return Err(e);
            }
        };
        info!(peer = %target, file_id, name = %name, size, "file offered");

        let this = Arc::clone(self);
        tokio::spawn(async move { this.await_response(stream, peer, file_id, file).await });
        Ok(file_id)
    }

    async fn await_response(&self, mut stream: TcpStream, peer: IpAddr, file_id: FileId, file: File) {
        let limit = self.config.offer_timeout() + self.config.io_timeout();
        match read_message(&mut stream, limit, "offer response").await {
            Ok(Message::FileResponse {
                file_id: id,
                accepted,
                ..
            }) if id == file_id => {
                self.on_file_response(stream, peer, file_id, accepted, Some(file))
                    .await
            }
            Ok(other) => {
                warn!(%peer, file_id, kind = other.kind(), "unexpected reply to offer");
                self.finish(peer, Direction::Sending, file_id, TransferState::Failed);
            }
            Err(e) => {
                warn!(%peer, file_id, error = %e, "no answer to offer");
                self.finish(peer, Direction::Sending, file_id, TransferState::Failed);
            }
        }
    }

    /// Act on the receiver's decision for one of our offers. `file` is reopened from the
    /// session path when the answer arrives on a fresh connection.
    async fn on_file_response(
        &self,
        stream: TcpStream,
        peer: IpAddr,
        file_id: FileId,
        accepted: bool,
        file: Option<File>,
    ) {
        if !accepted {
            let pending = self
                .sessions
                .get(peer, Direction::Sending, file_id)
                .is_some_and(|s| s.state == TransferState::Offered);
            if !pending {
                warn!(%peer, file_id, "rejection for a transfer that is not pending, ignored");
                return;
            }
            info!(%peer, file_id, "offer rejected by peer");
            self.finish(peer, Direction::Sending, file_id, TransferState::Rejected);
            return;
        }
        let info = match self
            .sessions
            .transition(peer, Direction::Sending, file_id, TransferState::Accepted)
        {
            Ok(info) => info,
            Err(e) => {
                warn!(%peer, file_id, error = %e, "acceptance for unknown or finished transfer");
                return;
            }
        };
        let file = match file {
            Some(f) => Ok(f),
            None => match &info.path {
                Some(path) => File::open(path).await.map_err(EngineError::from),
                None => Err(EngineError::InvalidPath(info.file_name.clone())),
            },
        };
        let cancel = self
            .sessions
            .cancel_flag(peer, Direction::Sending, file_id)
            .unwrap_or_default();
        let started = file.and_then(|f| {
            self.sessions
                .transition(peer, Direction::Sending, file_id, TransferState::InProgress)
                .map(|_| f)
                .map_err(EngineError::from)
        });
        let outcome = match started {
            Ok(f) => self.stream_file(stream, peer, file_id, f, info.size, &cancel).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(state) => {
                info!(%peer, file_id, %state, "send finished");
                self.finish(peer, Direction::Sending, file_id, state);
            }
            Err(e) => {
                warn!(%peer, file_id, error = %e, "send failed");
                self.finish(peer, Direction::Sending, file_id, TransferState::Failed);
            }
        }
    }

    async fn stream_file(
        &self,
        stream: TcpStream,
        peer: IpAddr,
        file_id: FileId,
        mut file: File,
        size: u64,
        cancel: &AtomicBool,
    ) -> Result<TransferState> {
        let (mut reader, mut writer) = stream.into_split();

        // Forward whatever the receiver says while we write.
        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        let watcher = tokio::spawn(async move {
            while let Ok(payload) = wire::read_packet(&mut reader).await {
                match Message::from_payload(&payload) {
                    Ok(msg) => {
                        if status_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "undecodable message from receiver");
                        break;
                    }
                }
            }
        });

        let result = self
            .pump_chunks(&mut writer, &mut status_rx, peer, file_id, &mut file, size, cancel)
            .await;
        watcher.abort();
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn pump_chunks(
        &self,
        writer: &mut OwnedWriteHalf,
        status_rx: &mut mpsc::UnboundedReceiver<Message>,
        peer: IpAddr,
        file_id: FileId,
        file: &mut File,
        size: u64,
        cancel: &AtomicBool,
    ) -> Result<TransferState> {
        let io_timeout = self.config.io_timeout();
        let handler = self.handler.get();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut offset = 0u64;
        while offset < size {
            if cancel.load(Ordering::SeqCst) {
                notify_cancelled(writer, file_id, offset, size, io_timeout).await;
                return Ok(TransferState::Cancelled);
            }
            while let Ok(msg) = status_rx.try_recv() {
                if let Some(state) = remote_terminal(&msg, file_id) {
                    return settle_remote(state);
                }
            }
            let want = (size - offset).min(CHUNK_SIZE as u64) as usize;
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(EngineError::SourceShrank {
                    expected: size,
                    read: offset,
                });
            }
            let chunk = Message::FileChunk {
                file_id,
                offset,
                data: buf[..n].to_vec(),
            };
            if let Err(e) = write_message(writer, &chunk, io_timeout).await {
                // A receiver that cancelled may have closed before we saw its status.
                while let Ok(msg) = status_rx.try_recv() {
                    if let Some(state) = remote_terminal(&msg, file_id) {
                        return settle_remote(state);
                    }
                }
                return Err(e);
            }
            offset += n as u64;
            self.sessions
                .record_progress(peer, Direction::Sending, file_id, offset);
            handler.on_file_progress(&TransferProgress {
                file_id,
                direction: Direction::Sending,
                peer,
                transferred: offset,
                total: size,
                state: TransferState::InProgress,
            });
        }

        // Completed only once the receiver confirms its last write.
        let poll = self.config.poll_interval();
        let deadline = tokio::time::Instant::now() + io_timeout;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                return Err(EngineError::Timeout("completion confirmation"));
            }
            match tokio::time::timeout(poll.min(left), status_rx.recv()).await {
                Ok(Some(msg)) => match remote_terminal(&msg, file_id) {
                    Some(TransferState::Completed) => return Ok(TransferState::Completed),
                    Some(state) => return settle_remote(state),
                    None => {}
                },
                Ok(None) => return Err(EngineError::ConnectionClosed),
                Err(_) => {}
            }
            if cancel.load(Ordering::SeqCst) {
                notify_cancelled(writer, file_id, size, size, io_timeout).await;
                return Ok(TransferState::Cancelled);
            }
        }
    }

    /// A status that arrives as the first frame of a fresh connection.
    fn apply_remote_status(
        &self,
        peer: IpAddr,
        file_id: FileId,
        transferred: u64,
        total: u64,
        state: TransferState,
    ) {
        let direction = [Direction::Sending, Direction::Receiving]
            .into_iter()
            .find(|d| self.sessions.get(peer, *d, file_id).is_some());
        let Some(direction) = direction else {
            debug!(%peer, file_id, %state, "status for unknown transfer");
            return;
        };
        self.handler.get().on_file_progress(&TransferProgress {
            file_id,
            direction,
            peer,
            transferred,
            total,
            state,
        });
        if state == TransferState::Cancelled {
            let _ = self.sessions.request_cancel(peer, file_id);
        }
    }

    // ---- host decisions ----

    pub fn respond_to_file(
        &self,
        peer: IpAddr,
        file_id: FileId,
        size: u64,
        dest: PathBuf,
        accept: bool,
    ) -> Result<()> {
        let decision = if accept {
            Decision::Accept(dest)
        } else {
            Decision::Reject
        };
        self.sessions.resolve_offer(peer, file_id, size, decision)?;
        Ok(())
    }

    pub fn cancel_transfer(&self, peer: IpAddr, file_id: FileId) -> Result<()> {
        self.sessions.request_cancel(peer, file_id)?;
        info!(%peer, file_id, "cancel requested");
        Ok(())
    }

    // ---- bookkeeping ----

    /// Move a session to its final `state` and conclude it. A session that cannot take that
    /// state is still driven by another flow and is left alone.
    fn finish(&self, peer: IpAddr, direction: Direction, file_id: FileId, state: TransferState) {
        match self.sessions.transition(peer, direction, file_id, state) {
            Ok(_) => self.conclude(peer, direction, file_id),
            Err(TransferError::InvalidTransition { from, .. }) if from.is_terminal() => {
                self.conclude(peer, direction, file_id)
            }
            Err(e) => debug!(%peer, file_id, error = %e, "final transition skipped"),
        }
    }

    /// Remove the session and hand its final status to the host.
    fn conclude(&self, peer: IpAddr, direction: Direction, file_id: FileId) {
        if let Some(info) = self.sessions.remove(peer, direction, file_id) {
            self.handler.get().on_file_progress(&TransferProgress::from(&info));
        }
    }
}

fn remote_terminal(msg: &Message, file_id: FileId) -> Option<TransferState> {
    match msg {
        Message::FileStatus {
            file_id: id, state, ..
        } if *id == file_id && state.is_terminal() => Some(*state),
        _ => None,
    }
}

fn settle_remote(state: TransferState) -> Result<TransferState> {
    match state {
        TransferState::Cancelled => Ok(TransferState::Cancelled),
        other => Err(EngineError::RemoteStatus(other)),
    }
}

fn check_size(msg: &Message) -> Result<Vec<u8>> {
    let payload = msg.to_payload()?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        }
        .into());
    }
    Ok(payload)
}

async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: Duration,
    what: &'static str,
) -> Result<Message> {
    let payload = match tokio::time::timeout(limit, wire::read_packet(reader)).await {
        Ok(Ok(p)) => p,
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(EngineError::ConnectionClosed)
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(EngineError::Timeout(what)),
    };
    Ok(Message::from_payload(&payload)?)
}

async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
    limit: Duration,
) -> Result<()> {
    let payload = check_size(msg)?;
    match tokio::time::timeout(limit, wire::write_packet(writer, &payload)).await {
        Ok(r) => r.map_err(EngineError::WriteFailed),
        Err(_) => Err(EngineError::Timeout("write")),
    }
}

/// Discard input until the peer closes, so our last status is read before the socket goes away.
async fn drain<R: AsyncRead + Unpin>(reader: &mut R, limit: Duration) {
    let mut scratch = [0u8; 4096];
    let _ = tokio::time::timeout(limit, async {
        while let Ok(n) = reader.read(&mut scratch).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;
}

async fn notify_cancelled<W: AsyncWrite + Unpin>(
    writer: &mut W,
    file_id: FileId,
    transferred: u64,
    total: u64,
    limit: Duration,
) {
    let status = Message::FileStatus {
        file_id,
        transferred,
        total,
        state: TransferState::Cancelled,
    };
    if let Err(e) = write_message(writer, &status, limit).await {
        debug!(file_id, error = %e, "cannot notify peer of cancellation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::EventHandler;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        progress: Mutex<Vec<TransferProgress>>,
        refuse_chunks: bool,
    }

    impl EventHandler for Recorder {
        fn on_file_progress(&self, progress: &TransferProgress) {
            self.progress.lock().push(progress.clone());
        }

        fn on_file_chunk(&self, _file_id: FileId, _offset: u64, _data: &[u8]) -> bool {
            !self.refuse_chunks
        }
    }

    struct Fixture {
        service: Arc<DataService>,
        recorder: Arc<Recorder>,
        sessions: Arc<SessionTable>,
        addr: SocketAddr,
        interrupt: Interrupt,
    }

    fn test_config() -> ServiceConfig {
        ServiceConfig {
            data_bind_addr: IpAddr::from([127, 0, 0, 1]),
            data_port: 0,
            poll_interval_ms: 50,
            io_timeout_ms: 2000,
            ..ServiceConfig::default()
        }
    }

    async fn start() -> Fixture {
        start_with(test_config(), Recorder::default()).await
    }

    async fn start_with(config: ServiceConfig, recorder: Recorder) -> Fixture {
        let config = Arc::new(config);
        let recorder = Arc::new(recorder);
        let sessions = Arc::new(SessionTable::new());
        let service = Arc::new(DataService::new(
            Arc::clone(&config),
            Arc::new(PeerRegistry::new(config.stale_after())),
            Arc::clone(&sessions),
            HandlerSlot::new(recorder.clone()),
            Arc::new(AtomicU16::new(0)),
        ));
        let listener = service.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let interrupt = Interrupt::new();
        {
            let service = Arc::clone(&service);
            let interrupt = interrupt.clone();
            tokio::spawn(async move { service.run(listener, interrupt).await });
        }
        Fixture {
            service,
            recorder,
            sessions,
            addr,
            interrupt,
        }
    }

    async fn wait_for_offer(sessions: &SessionTable) -> FileId {
        for _ in 0..100 {
            if let Some(s) = sessions.list().into_iter().next() {
                return s.file_id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("offer never arrived");
    }

    async fn wait_for_final(recorder: &Recorder) -> TransferProgress {
        for _ in 0..300 {
            if let Some(p) = recorder
                .progress
                .lock()
                .iter()
                .find(|p| p.state.is_terminal())
            {
                return p.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transfer never finished");
    }

    async fn expect_msg(stream: &mut TcpStream) -> Message {
        read_message(stream, Duration::from_secs(2), "test").await.unwrap()
    }

    #[tokio::test]
    async fn one_byte_short_never_completes() {
        let fx = start().await;
        let dir = tempfile::tempdir().unwrap();
        let mut raw = TcpStream::connect(fx.addr).await.unwrap();
        let offer = Message::FileOffer {
            file_id: 4,
            size: 10,
            name: "short.bin".into(),
        };
        write_message(&mut raw, &offer, Duration::from_secs(1)).await.unwrap();

        let id = wait_for_offer(&fx.sessions).await;
        assert_eq!(id, 4);
        fx.service
            .respond_to_file("127.0.0.1".parse().unwrap(), 4, 10, dir.path().join("short.bin"), true)
            .unwrap();
        assert!(matches!(
            expect_msg(&mut raw).await,
            Message::FileResponse { accepted: true, .. }
        ));

        let chunk = Message::FileChunk {
            file_id: 4,
            offset: 0,
            data: vec![1; 9],
        };
        write_message(&mut raw, &chunk, Duration::from_secs(1)).await.unwrap();
        drop(raw);

        let last = wait_for_final(&fx.recorder).await;
        assert_eq!(last.state, TransferState::Failed);
        assert_eq!(last.transferred, 9);
        assert!(fx
            .recorder
            .progress
            .lock()
            .iter()
            .all(|p| p.state != TransferState::Completed));
        assert!(fx.sessions.list().is_empty());
        assert!(!dir.path().join("short.bin").exists());
        fx.interrupt.trigger();
    }

    #[tokio::test]
    async fn out_of_order_chunk_fails_transfer() {
        let fx = start().await;
        let dir = tempfile::tempdir().unwrap();
        let mut raw = TcpStream::connect(fx.addr).await.unwrap();
        let offer = Message::FileOffer {
            file_id: 0,
            size: 8,
            name: "gap.bin".into(),
        };
        write_message(&mut raw, &offer, Duration::from_secs(1)).await.unwrap();
        wait_for_offer(&fx.sessions).await;
        fx.service
            .respond_to_file("127.0.0.1".parse().unwrap(), 0, 8, dir.path().join("gap.bin"), true)
            .unwrap();
        expect_msg(&mut raw).await;

        let chunk = Message::FileChunk {
            file_id: 0,
            offset: 4,
            data: vec![0; 4],
        };
        write_message(&mut raw, &chunk, Duration::from_secs(1)).await.unwrap();
        assert_eq!(wait_for_final(&fx.recorder).await.state, TransferState::Failed);
        fx.interrupt.trigger();
    }

    #[tokio::test]
    async fn exact_size_completes_and_confirms() {
        let fx = start().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("exact.bin");
        let mut raw = TcpStream::connect(fx.addr).await.unwrap();
        let offer = Message::FileOffer {
            file_id: 1,
            size: 6,
            name: "exact.bin".into(),
        };
        write_message(&mut raw, &offer, Duration::from_secs(1)).await.unwrap();
        wait_for_offer(&fx.sessions).await;
        fx.service
            .respond_to_file("127.0.0.1".parse().unwrap(), 1, 6, dest.clone(), true)
            .unwrap();
        expect_msg(&mut raw).await;
        for (offset, data) in [(0u64, b"abc"), (3, b"def")] {
            let chunk = Message::FileChunk {
                file_id: 1,
                offset,
                data: data.to_vec(),
            };
            write_message(&mut raw, &chunk, Duration::from_secs(1)).await.unwrap();
        }
        assert!(matches!(
            expect_msg(&mut raw).await,
            Message::FileStatus {
                state: TransferState::Completed,
                transferred: 6,
                ..
            }
        ));
        assert_eq!(wait_for_final(&fx.recorder).await.state, TransferState::Completed);
        assert_eq!(std::fs::read(&dest).unwrap(), b"abcdef");
        fx.interrupt.trigger();
    }

    #[tokio::test]
    async fn shutdown_fails_pending_offer() {
        let fx = start().await;
        let mut raw = TcpStream::connect(fx.addr).await.unwrap();
        let offer = Message::FileOffer {
            file_id: 2,
            size: 100,
            name: "never.bin".into(),
        };
        write_message(&mut raw, &offer, Duration::from_secs(1)).await.unwrap();
        wait_for_offer(&fx.sessions).await;
        fx.interrupt.trigger();
        let last = wait_for_final(&fx.recorder).await;
        assert_eq!(last.file_id, 2);
        assert_eq!(last.state, TransferState::Failed);
        assert!(fx.sessions.list().is_empty());
    }

    fn localhost() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    /// Offer `size` bytes as `file_id` from a raw client and accept it into `dest`.
    async fn offer_and_accept(fx: &Fixture, file_id: FileId, size: u64, dest: PathBuf) -> TcpStream {
        let mut raw = TcpStream::connect(fx.addr).await.unwrap();
        let offer = Message::FileOffer {
            file_id,
            size,
            name: "x.bin".into(),
        };
        write_message(&mut raw, &offer, Duration::from_secs(1)).await.unwrap();
        wait_for_offer(&fx.sessions).await;
        fx.service
            .respond_to_file(localhost(), file_id, size, dest, true)
            .unwrap();
        assert!(matches!(
            expect_msg(&mut raw).await,
            Message::FileResponse { accepted: true, .. }
        ));
        raw
    }

    async fn send_chunk(raw: &mut TcpStream, file_id: FileId, offset: u64, data: &[u8]) {
        let chunk = Message::FileChunk {
            file_id,
            offset,
            data: data.to_vec(),
        };
        write_message(raw, &chunk, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn unanswered_offer_fails_and_rejects_sender() {
        let fx = start_with(
            ServiceConfig {
                offer_timeout_ms: 200,
                ..test_config()
            },
            Recorder::default(),
        )
        .await;
        let mut raw = TcpStream::connect(fx.addr).await.unwrap();
        let offer = Message::FileOffer {
            file_id: 9,
            size: 42,
            name: "ignored.bin".into(),
        };
        write_message(&mut raw, &offer, Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            expect_msg(&mut raw).await,
            Message::FileResponse {
                file_id: 9,
                accepted: false,
                ..
            }
        ));
        let last = wait_for_final(&fx.recorder).await;
        assert_eq!((last.file_id, last.state), (9, TransferState::Failed));
        assert!(fx.sessions.list().is_empty());
        // Too late now.
        assert!(fx
            .service
            .respond_to_file(localhost(), 9, 42, PathBuf::from("late.bin"), true)
            .is_err());
        fx.interrupt.trigger();
    }

    #[tokio::test]
    async fn local_only_refusal_closes_without_status() {
        let fx = start_with(
            ServiceConfig {
                chunk_refusal: ChunkRefusal::LocalOnly,
                ..test_config()
            },
            Recorder {
                refuse_chunks: true,
                ..Recorder::default()
            },
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("refused.bin");
        let mut raw = offer_and_accept(&fx, 0, 8, dest.clone()).await;
        send_chunk(&mut raw, 0, 0, b"abcd").await;

        assert!(matches!(
            read_message(&mut raw, Duration::from_secs(2), "test").await,
            Err(EngineError::ConnectionClosed)
        ));
        assert_eq!(wait_for_final(&fx.recorder).await.state, TransferState::Cancelled);
        assert!(!dest.exists());
        fx.interrupt.trigger();
    }

    #[tokio::test]
    async fn host_cancel_stops_receive_and_tells_sender() {
        let fx = start().await;
        let dir = tempfile::tempdir().unwrap();
        let mut raw = offer_and_accept(&fx, 5, 12, dir.path().join("half.bin")).await;
        send_chunk(&mut raw, 5, 0, b"abcd").await;
        for _ in 0..100 {
            let done = fx
                .sessions
                .get(localhost(), Direction::Receiving, 5)
                .is_some_and(|s| s.transferred == 4);
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        fx.service.cancel_transfer(localhost(), 5).unwrap();
        // The flag is seen once the next chunk has been handled.
        send_chunk(&mut raw, 5, 4, b"efgh").await;

        assert!(matches!(
            expect_msg(&mut raw).await,
            Message::FileStatus {
                file_id: 5,
                state: TransferState::Cancelled,
                transferred: 8,
                ..
            }
        ));
        drop(raw);
        let last = wait_for_final(&fx.recorder).await;
        assert_eq!(last.state, TransferState::Cancelled);
        assert!(fx.sessions.list().is_empty());
        fx.interrupt.trigger();
    }

    #[tokio::test]
    async fn host_cancel_while_awaiting_confirmation() {
        let fx = start().await;
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("out.bin");
        std::fs::write(&src, vec![7u8; CHUNK_SIZE + 10]).unwrap();
        let receiver = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();

        let id = fx.service.try_send_file(target, &src).await.unwrap();
        let (mut raw, _) = receiver.accept().await.unwrap();
        let size = match expect_msg(&mut raw).await {
            Message::FileOffer { file_id, size, .. } => {
                assert_eq!(file_id, id);
                size
            }
            other => panic!("expected offer, got {}", other.kind()),
        };
        let accept = Message::FileResponse {
            file_id: id,
            size,
            accepted: true,
        };
        write_message(&mut raw, &accept, Duration::from_secs(1)).await.unwrap();
        let mut received = 0;
        while received < size {
            match expect_msg(&mut raw).await {
                Message::FileChunk { data, .. } => received += data.len() as u64,
                other => panic!("expected chunk, got {}", other.kind()),
            }
        }

        // Everything is sent but unconfirmed, so the session is still in progress.
        fx.service.cancel_transfer(localhost(), id).unwrap();
        assert!(matches!(
            expect_msg(&mut raw).await,
            Message::FileStatus {
                state: TransferState::Cancelled,
                ..
            }
        ));
        let last = wait_for_final(&fx.recorder).await;
        assert_eq!(last.direction, Direction::Sending);
        assert_eq!(last.state, TransferState::Cancelled);
        fx.interrupt.trigger();
    }

    #[tokio::test]
    async fn stray_rejection_leaves_running_send_alone() {
        let fx = start().await;
        let peer = localhost();
        let handles = fx
            .sessions
            .open_sending(peer, "busy.bin".into(), 100, PathBuf::from("busy.bin"))
            .unwrap();
        let id = handles.file_id;
        fx.sessions
            .transition(peer, Direction::Sending, id, TransferState::Accepted)
            .unwrap();
        fx.sessions
            .transition(peer, Direction::Sending, id, TransferState::InProgress)
            .unwrap();

        let mut raw = TcpStream::connect(fx.addr).await.unwrap();
        let reject = Message::FileResponse {
            file_id: id,
            size: 100,
            accepted: false,
        };
        write_message(&mut raw, &reject, Duration::from_secs(1)).await.unwrap();
        // The connection is closed once the message has been handled.
        assert!(read_message(&mut raw, Duration::from_secs(2), "test").await.is_err());

        let session = fx.sessions.get(peer, Direction::Sending, id).unwrap();
        assert_eq!(session.state, TransferState::InProgress);
        assert!(fx.recorder.progress.lock().is_empty());
        let next = fx
            .sessions
            .open_sending(peer, "next.bin".into(), 1, PathBuf::from("next.bin"))
            .unwrap();
        assert_ne!(next.file_id, id);
        fx.interrupt.trigger();
    }

    #[test]
    fn finish_from_a_live_state_is_ignored() {
        let sessions = Arc::new(SessionTable::new());
        let config = Arc::new(test_config());
        let recorder = Arc::new(Recorder::default());
        let service = DataService::new(
            Arc::clone(&config),
            Arc::new(PeerRegistry::new(config.stale_after())),
            Arc::clone(&sessions),
            HandlerSlot::new(recorder.clone()),
            Arc::new(AtomicU16::new(0)),
        );
        let peer = localhost();
        let id = sessions
            .open_sending(peer, "a".into(), 1, PathBuf::from("a"))
            .unwrap()
            .file_id;
        sessions
            .transition(peer, Direction::Sending, id, TransferState::Accepted)
            .unwrap();
        sessions
            .transition(peer, Direction::Sending, id, TransferState::InProgress)
            .unwrap();

        service.finish(peer, Direction::Sending, id, TransferState::Rejected);
        assert!(sessions.get(peer, Direction::Sending, id).is_some());
        assert!(recorder.progress.lock().is_empty());

        service.finish(peer, Direction::Sending, id, TransferState::Failed);
        assert!(sessions.get(peer, Direction::Sending, id).is_none());
        assert_eq!(recorder.progress.lock()[0].state, TransferState::Failed);
    }

    #[test]
    fn oversized_text_is_rejected_before_connecting() {
        let msg = Message::Text {
            text: "x".repeat(MAX_PAYLOAD_LEN),
        };
        assert!(matches!(
            check_size(&msg),
            Err(EngineError::Codec(CodecError::PayloadTooLarge { .. }))
        ));
    }
}
