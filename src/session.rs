//! Session management for multiplexed transports.
//!
//! A [`Session`] owns one reliable byte transport and runs two tasks over
//! it: a writer task draining a bounded frame queue, and a reader task
//! dispatching inbound frames to streams or to the session-level handlers
//! (new-stream SYN, GOAWAY). A third task supervises both and converts a
//! panic into an `InternalError` shutdown so a transient bug cannot poison
//! the transport asymmetrically.
//!
//! ## Stream id parity
//!
//! The client opens odd ids starting at 1, the server even ids starting
//! at 2, so both sides allocate independently without collision. A SYN
//! carrying an id with the receiver's own parity is a protocol violation
//! and kills the session.
//!
//! ## Shutdown
//!
//! Exactly one shutdown happens per session. Whoever observes the fatal
//! condition first latches the cause, sends a best-effort GOAWAY (bounded
//! at 250ms), closes the transport, and fails every stream and blocked
//! operation with `SessionClosed`.

use crate::error::{Error, ErrorCode, Result};
use crate::frame::{Frame, StreamId, WireFrame};
use crate::framer::{FrameReader, FrameWriter};
use crate::stream::{Stream, StreamShared};
use crate::stream_map::StreamMap;
use bytes::Bytes;
use core::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

/// Default per-stream flow-control window in bytes (256 KiB).
pub const DEFAULT_WINDOW_SIZE: u32 = 256 * 1024;

const DEFAULT_ACCEPT_BACKLOG: usize = 128;
const DEFAULT_WRITE_QUEUE_DEPTH: usize = 64;

/// How long a dying session waits for its GOAWAY to reach the wire.
const GOAWAY_TIMEOUT: Duration = Duration::from_millis(250);

/// Reset streams stay registered this long so late in-flight frames hit a
/// known id instead of drawing spurious unknown-stream RSTs.
const REMOVE_GRACE: Duration = Duration::from_secs(5);

/// Which side of the transport this session plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

impl Role {
    fn first_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Low bit of every id this side allocates.
    fn parity(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 0,
        }
    }
}

/// Session tuning knobs. The defaults match the protocol constants.
#[derive(Clone, Debug)]
pub struct Config {
    /// Cap on buffered-but-unread bytes per inbound stream direction.
    pub max_window_size: u32,
    /// Streams that may sit unaccepted before new SYNs are refused.
    pub accept_backlog: usize,
    /// Depth of the frame queue feeding the writer task.
    pub write_queue_depth: usize,
    /// Local transport endpoint, surfaced by `local_addr` when known.
    pub local_addr: Option<SocketAddr>,
    /// Remote transport endpoint, surfaced by `remote_addr` when known.
    pub peer_addr: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_window_size: DEFAULT_WINDOW_SIZE,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            write_queue_depth: DEFAULT_WRITE_QUEUE_DEPTH,
            local_addr: None,
            peer_addr: None,
        }
    }
}

impl Config {
    pub fn with_max_window_size(mut self, bytes: u32) -> Self {
        self.max_window_size = bytes;
        self
    }

    pub fn with_accept_backlog(mut self, streams: usize) -> Self {
        self.accept_backlog = streams;
        self
    }

    pub fn with_write_queue_depth(mut self, frames: usize) -> Self {
        self.write_queue_depth = frames;
        self
    }

    pub fn with_addrs(mut self, local: Option<SocketAddr>, peer: Option<SocketAddr>) -> Self {
        self.local_addr = local;
        self.peer_addr = peer;
        self
    }
}

/// Endpoint address of a session or stream.
///
/// Transports that expose socket addresses surface them; anything else
/// gets the synthetic address, which displays as `muxado`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionAddr {
    Socket(SocketAddr),
    Synthetic,
}

impl fmt::Display for SessionAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionAddr::Socket(addr) => addr.fmt(f),
            SessionAddr::Synthetic => f.write_str("muxado"),
        }
    }
}

/// One entry on the writer task's queue. `done` is present for
/// synchronous writes that need the wire result.
#[derive(Debug)]
pub(crate) struct WriteRequest {
    pub frame: WireFrame,
    pub done: Option<oneshot::Sender<Result<()>>>,
}

#[derive(Debug)]
pub(crate) struct SessionInner {
    role: Role,
    config: Config,
    frames: mpsc::Sender<WriteRequest>,
    streams: StreamMap<Arc<StreamShared>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
    /// Next id to allocate locally; steps by 2 to preserve parity.
    next_id: AtomicU32,
    ids_exhausted: AtomicBool,
    local_gone_away: AtomicBool,
    remote_gone_away: AtomicBool,
    /// Highest stream id observed from the peer, echoed in GOAWAY.
    remote_last_id: AtomicU32,
    /// One-shot shutdown guard.
    dying: AtomicBool,
    cause: OnceLock<Error>,
    remote_cause: OnceLock<(ErrorCode, Bytes)>,
    dead_tx: watch::Sender<bool>,
}

impl SessionInner {
    pub(crate) fn terminal_error(&self) -> Error {
        self.cause.get().cloned().unwrap_or(Error::SessionClosed)
    }

    pub(crate) fn remove_stream(&self, id: StreamId) {
        self.streams.remove(id);
    }

    pub(crate) fn local_addr(&self) -> SessionAddr {
        match self.config.local_addr {
            Some(addr) => SessionAddr::Socket(addr),
            None => SessionAddr::Synthetic,
        }
    }

    pub(crate) fn remote_addr(&self) -> SessionAddr {
        match self.config.peer_addr {
            Some(addr) => SessionAddr::Socket(addr),
            None => SessionAddr::Synthetic,
        }
    }

    async fn send_goaway(
        &self,
        code: ErrorCode,
        debug: Bytes,
        deadline: Option<Instant>,
    ) -> Result<()> {
        self.local_gone_away.store(true, Ordering::SeqCst);
        let frame = WireFrame::GoAway {
            last_stream_id: StreamId::from_wire(self.remote_last_id.load(Ordering::SeqCst)),
            code,
            debug,
        };
        let (done_tx, done_rx) = oneshot::channel();
        let send = async {
            self.frames
                .send(WriteRequest {
                    frame,
                    done: Some(done_tx),
                })
                .await
                .map_err(|_| self.terminal_error())?;
            match done_rx.await {
                Ok(result) => result,
                Err(_) => Err(self.terminal_error()),
            }
        };
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, send)
                .await
                .map_err(|_| Error::WriteTimeout)?,
            None => send.await,
        }
    }

    /// Shut the session down. Idempotent: the first caller wins and
    /// subsequent calls return immediately.
    async fn die(&self, cause: Error) {
        if self.dying.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(%cause, "session shutting down");
        let _ = self.cause.set(cause.clone());

        if !self.local_gone_away.load(Ordering::SeqCst) {
            let deadline = Instant::now() + GOAWAY_TIMEOUT;
            let debug = Bytes::from(cause.to_string());
            if let Err(err) = self.send_goaway(cause.code(), debug, Some(deadline)).await {
                tracing::debug!(%err, "best-effort GOAWAY not written");
            }
        }

        // Stops both loops; the transport halves drop with them.
        let _ = self.dead_tx.send(true);

        for (_, shared) in self.streams.snapshot() {
            shared.fail_with(Error::SessionClosed);
        }
        self.streams.clear();
    }
}

/// Drop a stream's registration after the in-flight grace period.
pub(crate) fn remove_after_grace(inner: Arc<SessionInner>, id: StreamId) {
    tokio::spawn(async move {
        tokio::time::sleep(REMOVE_GRACE).await;
        inner.streams.remove(id);
    });
}

/// A multiplexed session over a single reliable byte transport.
///
/// Cheap to clone; all methods take `&self`. Dropping every handle does
/// not shut the session down -- call [`Session::close`] or rely on
/// transport EOF.
#[derive(Clone, Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Run the client side of a session over `io`. Client sessions open
    /// odd-numbered streams.
    pub fn client<T>(io: T, config: Config) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Session::start(io, Role::Client, config)
    }

    /// Run the server side of a session over `io`. Server sessions open
    /// even-numbered streams.
    pub fn server<T>(io: T, config: Config) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Session::start(io, Role::Server, config)
    }

    /// Dial `addr` over TCP and run the client side of a session on the
    /// connection, surfacing the socket addresses.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Session> {
        let tcp = TcpStream::connect(addr).await?;
        let config = Config::default().with_addrs(tcp.local_addr().ok(), tcp.peer_addr().ok());
        Ok(Session::start(tcp, Role::Client, config))
    }

    fn start<T>(io: T, role: Role, config: Config) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (frame_tx, frame_rx) = mpsc::channel(config.write_queue_depth.max(1));
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let (dead_tx, _) = watch::channel(false);

        let inner = Arc::new(SessionInner {
            next_id: AtomicU32::new(role.first_id()),
            role,
            frames: frame_tx,
            streams: StreamMap::new(),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            ids_exhausted: AtomicBool::new(false),
            local_gone_away: AtomicBool::new(false),
            remote_gone_away: AtomicBool::new(false),
            remote_last_id: AtomicU32::new(0),
            dying: AtomicBool::new(false),
            cause: OnceLock::new(),
            remote_cause: OnceLock::new(),
            dead_tx,
            config,
        });

        // Subscribe before spawning so a death flip can never be missed.
        let dead_for_reader = inner.dead_tx.subscribe();
        let dead_for_writer = inner.dead_tx.subscribe();
        let reader = tokio::spawn(read_loop(
            inner.clone(),
            FrameReader::new(read_half),
            accept_tx,
            dead_for_reader,
        ));
        let writer = tokio::spawn(write_loop(
            inner.clone(),
            frame_rx,
            FrameWriter::new(write_half),
            dead_for_writer,
        ));
        tokio::spawn(supervise(inner.clone(), reader, writer));

        Session { inner }
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Session {
        Session { inner }
    }

    /// Open a new outbound stream.
    ///
    /// Returns immediately: the SYN rides on the stream's first DATA
    /// frame. Fails with `RemoteGoneAway` once the peer sent GOAWAY and
    /// with `StreamsExhausted` when the 31-bit id space runs out.
    pub fn open(&self) -> Result<Stream> {
        let inner = &self.inner;
        if inner.dying.load(Ordering::SeqCst) {
            return Err(inner.terminal_error());
        }
        if inner.remote_gone_away.load(Ordering::SeqCst) {
            return Err(Error::RemoteGoneAway);
        }
        if inner.ids_exhausted.load(Ordering::SeqCst) {
            return Err(Error::StreamsExhausted);
        }
        let raw = inner.next_id.fetch_add(2, Ordering::SeqCst);
        if raw > StreamId::MAX {
            inner.ids_exhausted.store(true, Ordering::SeqCst);
            return Err(Error::StreamsExhausted);
        }
        let id = StreamId::new(raw)?;
        let shared = Arc::new(StreamShared::new(
            id,
            Arc::downgrade(inner),
            inner.frames.clone(),
            inner.config.max_window_size,
            DEFAULT_WINDOW_SIZE,
            true,
        ));
        inner.streams.insert(id, shared.clone());
        // Racing a concurrent shutdown: the shutdown's sweep may have run
        // before the insert, leaving this stream unfailed.
        if inner.dying.load(Ordering::SeqCst) {
            shared.fail_with(Error::SessionClosed);
            inner.streams.remove(id);
            return Err(inner.terminal_error());
        }
        tracing::trace!(stream_id = %id, "opened stream");
        Ok(Stream::new(shared))
    }

    /// Alias for [`Session::open`].
    pub fn open_stream(&self) -> Result<Stream> {
        self.open()
    }

    /// Wait for the peer to open a stream.
    ///
    /// Once the session dies this returns the terminal cause
    /// (`SessionClosed` after a clean local shutdown).
    pub async fn accept(&self) -> Result<Stream> {
        let mut rx = self.inner.accept_rx.lock().await;
        match rx.recv().await {
            // A stream queued just before the session died was already
            // swept; hand back the terminal error instead.
            Some(_) if self.inner.dying.load(Ordering::SeqCst) => {
                Err(self.inner.terminal_error())
            }
            Some(stream) => Ok(stream),
            None => Err(self.inner.terminal_error()),
        }
    }

    /// Alias for [`Session::accept`].
    pub async fn accept_stream(&self) -> Result<Stream> {
        self.accept().await
    }

    /// Shut the session down with `SessionClosed`.
    pub async fn close(&self) -> Result<()> {
        self.inner.die(Error::SessionClosed).await;
        Ok(())
    }

    /// Announce that no new peer streams will be processed.
    ///
    /// Sends GOAWAY carrying the highest peer stream id seen; SYNs
    /// arriving afterwards are refused with RST(`StreamRefused`). The
    /// session keeps serving streams at or below that id.
    pub async fn go_away(
        &self,
        code: ErrorCode,
        debug: Bytes,
        deadline: Option<Instant>,
    ) -> Result<()> {
        self.inner.send_goaway(code, debug, deadline).await
    }

    /// Block until the session is dead and report `(local_cause,
    /// remote_cause, remote_debug)`. The remote half is only present if
    /// the peer sent GOAWAY.
    pub async fn wait(&self) -> (Error, Option<ErrorCode>, Bytes) {
        let mut dead = self.inner.dead_tx.subscribe();
        while !*dead.borrow_and_update() {
            if dead.changed().await.is_err() {
                break;
            }
        }
        let local = self.inner.terminal_error();
        match self.inner.remote_cause.get() {
            Some((code, debug)) => (local, Some(*code), debug.clone()),
            None => (local, None, Bytes::new()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.dying.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> SessionAddr {
        self.inner.local_addr()
    }

    pub fn remote_addr(&self) -> SessionAddr {
        self.inner.remote_addr()
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    inner: Arc<SessionInner>,
    mut rx: mpsc::Receiver<WriteRequest>,
    mut framer: FrameWriter<W>,
    mut dead: watch::Receiver<bool>,
) {
    loop {
        let req = tokio::select! {
            req = rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
            _ = dead.changed() => break,
        };

        // A stalled transport must not outlive the session, so the write
        // itself races the death signal.
        let written = tokio::select! {
            result = framer.write_frame(&req.frame) => Some(result),
            _ = dead.changed() => None,
        };
        match written {
            Some(Ok(())) => {
                if let Some(done) = req.done {
                    let _ = done.send(Ok(()));
                }
            }
            Some(Err(err)) => {
                tracing::debug!(%err, "transport write failed");
                if let Some(done) = req.done {
                    let _ = done.send(Err(err.clone()));
                }
                inner.die(err).await;
                break;
            }
            None => {
                if let Some(done) = req.done {
                    let _ = done.send(Err(inner.terminal_error()));
                }
                break;
            }
        }
    }

    // Unblock everything still queued behind the death.
    rx.close();
    while let Ok(req) = rx.try_recv() {
        if let Some(done) = req.done {
            let _ = done.send(Err(inner.terminal_error()));
        }
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    inner: Arc<SessionInner>,
    mut framer: FrameReader<R>,
    accept_tx: mpsc::Sender<Stream>,
    mut dead: watch::Receiver<bool>,
) {
    let result = loop {
        let frame = tokio::select! {
            frame = framer.read_frame() => frame,
            _ = dead.changed() => break Ok(()),
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => break Err(err),
        };
        if let Err(err) = handle_frame(&inner, &mut framer, &accept_tx, frame).await {
            break Err(err);
        }
    };
    if let Err(err) = result {
        tracing::debug!(%err, "session reader failed");
        inner.die(err).await;
    }
}

async fn handle_frame<R: AsyncRead + Unpin>(
    inner: &Arc<SessionInner>,
    framer: &mut FrameReader<R>,
    accept_tx: &mpsc::Sender<Stream>,
    frame: Frame,
) -> Result<()> {
    match frame {
        Frame::Data {
            stream_id,
            syn: true,
            fin,
            length,
        } => handle_syn(inner, framer, accept_tx, stream_id, fin, length).await,

        Frame::Data {
            stream_id,
            syn: false,
            fin,
            length,
        } => match inner.streams.get(stream_id) {
            Some(shared) => deliver_data(&shared, framer, length, fin).await,
            None => {
                // A pure FIN racing stream deallocation is expected; data
                // for a dead id draws an RST but never kills the session.
                if length == 0 && fin {
                    return Ok(());
                }
                framer.drain_body().await?;
                tracing::debug!(%stream_id, "data for unknown stream");
                send_async(
                    inner,
                    WireFrame::Rst {
                        stream_id,
                        code: ErrorCode::StreamClosed,
                    },
                )
                .await;
                Ok(())
            }
        },

        Frame::Rst { stream_id, code } => {
            if let Some(shared) = inner.streams.get(stream_id) {
                shared.handle_rst(code);
                remove_after_grace(inner.clone(), stream_id);
            }
            Ok(())
        }

        Frame::WndInc {
            stream_id,
            increment,
        } => {
            if let Some(shared) = inner.streams.get(stream_id) {
                shared.grant(increment);
            }
            Ok(())
        }

        Frame::GoAway {
            last_stream_id,
            code,
            debug,
        } => {
            tracing::debug!(%last_stream_id, %code, "peer sent GOAWAY");
            inner.remote_gone_away.store(true, Ordering::SeqCst);
            let _ = inner.remote_cause.set((code, debug));
            // Streams the peer never processed fail so their users can
            // retry them on a fresh session.
            let parity = inner.role.parity();
            for (id, shared) in inner.streams.snapshot() {
                if id.get() % 2 == parity && id > last_stream_id {
                    shared.fail_with(Error::RemoteGoneAway);
                    inner.streams.remove(id);
                }
            }
            Ok(())
        }

        Frame::Unknown { .. } => Ok(()),
    }
}

async fn handle_syn<R: AsyncRead + Unpin>(
    inner: &Arc<SessionInner>,
    framer: &mut FrameReader<R>,
    accept_tx: &mpsc::Sender<Stream>,
    stream_id: StreamId,
    fin: bool,
    length: u32,
) -> Result<()> {
    if stream_id.get() % 2 == inner.role.parity() {
        return Err(Error::Protocol(format!(
            "peer SYN on stream id {stream_id} with local parity"
        )));
    }
    inner
        .remote_last_id
        .fetch_max(stream_id.get(), Ordering::SeqCst);

    if inner.local_gone_away.load(Ordering::SeqCst) {
        framer.drain_body().await?;
        send_async(
            inner,
            WireFrame::Rst {
                stream_id,
                code: ErrorCode::StreamRefused,
            },
        )
        .await;
        return Ok(());
    }

    let shared = Arc::new(StreamShared::new(
        stream_id,
        Arc::downgrade(inner),
        inner.frames.clone(),
        inner.config.max_window_size,
        DEFAULT_WINDOW_SIZE,
        false,
    ));
    if !inner.streams.insert(stream_id, shared.clone()) {
        return Err(Error::Protocol(format!(
            "peer SYN reuses active stream id {stream_id}"
        )));
    }

    let mut pending = Stream::new(shared.clone());
    let queued = match accept_tx.try_send(pending) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(stream)) => {
            pending = stream;
            tokio::task::yield_now().await;
            accept_tx.try_send(pending).is_ok()
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    };
    if !queued {
        tracing::warn!(%stream_id, "accept queue full, refusing stream");
        inner.streams.remove(stream_id);
        framer.drain_body().await?;
        send_async(
            inner,
            WireFrame::Rst {
                stream_id,
                code: ErrorCode::AcceptQueueFull,
            },
        )
        .await;
        return Ok(());
    }

    deliver_data(&shared, framer, length, fin).await
}

/// Stream a DATA body from the framer into the stream's inbound buffer.
///
/// The frame body is always consumed in full so the transport position
/// stays consistent with the framer, even when the buffer overflows or
/// the stream stopped accepting input.
async fn deliver_data<R: AsyncRead + Unpin>(
    shared: &Arc<StreamShared>,
    framer: &mut FrameReader<R>,
    length: u32,
    fin: bool,
) -> Result<()> {
    let rejecting = shared.is_read_closed();
    let mut overflowed = false;
    let mut remaining = length as usize;
    let mut chunk = [0u8; 8192];
    while remaining > 0 {
        let n = framer.read_body_chunk(&mut chunk).await?;
        if n == 0 {
            return Err(Error::PeerEof);
        }
        remaining -= n;
        if !rejecting && !overflowed && shared.push_chunk(&chunk[..n]).is_err() {
            overflowed = true;
        }
    }

    if rejecting {
        // Data after the local side closed; a bare FIN is tolerated.
        if !(length == 0 && fin) {
            shared.reset_with(Error::StreamClosed).await;
        }
        return Ok(());
    }
    if overflowed {
        tracing::debug!(stream_id = %shared.id(), "inbound window exceeded");
        shared.reset_with(Error::FlowControl).await;
        return Ok(());
    }
    if fin {
        shared.handle_fin();
    }
    Ok(())
}

async fn send_async(inner: &Arc<SessionInner>, frame: WireFrame) {
    let _ = inner
        .frames
        .send(WriteRequest { frame, done: None })
        .await;
}

async fn supervise(inner: Arc<SessionInner>, reader: JoinHandle<()>, writer: JoinHandle<()>) {
    enum FirstDone {
        Reader,
        Writer,
    }

    let mut reader = reader;
    let mut writer = writer;
    let (first_result, first_done) = tokio::select! {
        result = &mut reader => (result, FirstDone::Reader),
        result = &mut writer => (result, FirstDone::Writer),
    };
    flag_panic(&inner, first_result).await;
    // A loop that stopped without declaring a cause would strand its
    // sibling; make the shutdown explicit.
    if !inner.dying.load(Ordering::SeqCst) {
        inner
            .die(Error::Internal("session task exited unexpectedly".into()))
            .await;
    }
    let second_result = match first_done {
        FirstDone::Reader => writer.await,
        FirstDone::Writer => reader.await,
    };
    flag_panic(&inner, second_result).await;
}

async fn flag_panic(inner: &Arc<SessionInner>, result: std::result::Result<(), JoinError>) {
    if let Err(err) = result
        && err.is_panic()
    {
        tracing::error!("session task panicked");
        inner
            .die(Error::Internal("session task panicked".into()))
            .await;
    }
}
