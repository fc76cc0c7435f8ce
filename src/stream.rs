//! Per-stream state machine: the user-facing [`Stream`] handle and the
//! shared state that the session's reader and writer tasks update.
//!
//! The inbound and outbound halves close independently. Receiving FIN
//! closes the inbound half, sending FIN closes the outbound half, and once
//! both are closed the stream deregisters from the session. An RST in
//! either direction tears down both halves at once.

use crate::buffer::InboundBuffer;
use crate::error::{Error, ErrorCode, Result};
use crate::frame::{StreamId, WireFrame, MAX_FRAME_LENGTH};
use crate::session::{self, Session, SessionAddr, SessionInner, WriteRequest};
use crate::window::Window;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

#[derive(Debug)]
struct HalfState {
    /// Inbound half closed: FIN observed, or the local side gave up on reads.
    read_closed: bool,
    /// Outbound half closed: FIN sent (or about to be sent).
    write_closed: bool,
    /// Terminal error latched by an RST, GOAWAY, or session death.
    terminal: Option<Error>,
}

/// State shared between the user handle and the session tasks.
#[derive(Debug)]
pub(crate) struct StreamShared {
    id: StreamId,
    session: Weak<SessionInner>,
    frames: mpsc::Sender<WriteRequest>,
    buffer: InboundBuffer,
    window: Window,
    /// Inbound window cap; also sets the WNDINC batching threshold.
    inbound_max: u32,
    /// Bytes read by the user but not yet credited back to the peer.
    unacked: Mutex<u32>,
    state: Mutex<HalfState>,
    /// SYN still owed on the next outbound DATA frame.
    syn_pending: AtomicBool,
    /// At most one RST ever leaves this stream.
    rst_sent: AtomicBool,
    /// Serializes writers so fragments of concurrent writes never interleave.
    write_serial: tokio::sync::Mutex<()>,
    write_deadline: Mutex<Option<Instant>>,
}

impl StreamShared {
    pub(crate) fn new(
        id: StreamId,
        session: Weak<SessionInner>,
        frames: mpsc::Sender<WriteRequest>,
        inbound_max: u32,
        outbound_window: u32,
        syn_pending: bool,
    ) -> StreamShared {
        StreamShared {
            id,
            session,
            frames,
            buffer: InboundBuffer::new(inbound_max as usize),
            window: Window::new(outbound_window),
            inbound_max,
            unacked: Mutex::new(0),
            state: Mutex::new(HalfState {
                read_closed: false,
                write_closed: false,
                terminal: None,
            }),
            syn_pending: AtomicBool::new(syn_pending),
            rst_sent: AtomicBool::new(false),
            write_serial: tokio::sync::Mutex::new(()),
            write_deadline: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> StreamId {
        self.id
    }

    fn state(&self) -> MutexGuard<'_, HalfState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one chunk of an inbound DATA body.
    pub(crate) fn push_chunk(&self, chunk: &[u8]) -> Result<()> {
        self.buffer.push(chunk)
    }

    pub(crate) fn is_read_closed(&self) -> bool {
        self.state().read_closed
    }

    /// Grant outbound credit from a peer WNDINC.
    pub(crate) fn grant(&self, increment: u32) {
        self.window.increment(increment);
    }

    /// Inbound FIN: close the read half, report EOF once drained.
    pub(crate) fn handle_fin(&self) {
        self.state().read_closed = true;
        self.buffer.close();
        self.maybe_deregister();
    }

    /// Peer RST: fail both halves with the peer's reason code.
    pub(crate) fn handle_rst(&self, code: ErrorCode) {
        tracing::debug!(stream_id = %self.id, %code, "stream reset by peer");
        self.fail_with(Error::StreamReset(code));
    }

    /// Latch `err` on both halves, failing pending reads and writes.
    pub(crate) fn fail_with(&self, err: Error) {
        {
            let mut st = self.state();
            if st.terminal.is_none() {
                st.terminal = Some(err.clone());
            }
            st.read_closed = true;
            st.write_closed = true;
        }
        self.buffer.set_error(err.clone());
        self.window.set_error(err);
    }

    /// Abortively close the stream, emitting at most one RST carrying
    /// `err`'s wire code.
    pub(crate) async fn reset_with(&self, err: Error) {
        let code = err.code();
        self.fail_with(err);
        if self.rst_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(stream_id = %self.id, %code, "resetting stream");
        let frame = WireFrame::Rst {
            stream_id: self.id,
            code,
        };
        let _ = self.frames.send(WriteRequest { frame, done: None }).await;
        if let Some(inner) = self.session.upgrade() {
            session::remove_after_grace(inner, self.id);
        }
    }

    async fn credit_peer(&self, n: u32) {
        let increment = {
            let mut unacked = self.unacked.lock().unwrap_or_else(PoisonError::into_inner);
            *unacked += n;
            let threshold = (self.inbound_max / 2).max(1);
            if *unacked < threshold {
                return;
            }
            std::mem::take(&mut *unacked)
        };
        let frame = WireFrame::WndInc {
            stream_id: self.id,
            increment,
        };
        // Session death makes the credit moot; ignore the failure.
        let _ = self.frames.send(WriteRequest { frame, done: None }).await;
    }

    /// Enqueue a frame and wait for the writer task to put it on the wire.
    async fn send_sync(&self, frame: WireFrame) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
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
    }

    fn terminal_error(&self) -> Error {
        if let Some(err) = &self.state().terminal {
            return err.clone();
        }
        match self.session.upgrade() {
            Some(inner) => inner.terminal_error(),
            None => Error::SessionClosed,
        }
    }

    async fn write_frames(&self, data: &[u8]) -> Result<usize> {
        let _serial = self.write_serial.lock().await;
        {
            let st = self.state();
            if let Some(err) = &st.terminal {
                return Err(err.clone());
            }
            if st.write_closed {
                return Err(Error::StreamClosed);
            }
        }

        let mut written = 0;
        while written < data.len() {
            let want = (data.len() - written).min(MAX_FRAME_LENGTH);
            let granted = self.window.decrement(want).await?;
            let syn = self.syn_pending.swap(false, Ordering::SeqCst);
            let body = Bytes::copy_from_slice(&data[written..written + granted]);
            self.send_sync(WireFrame::Data {
                stream_id: self.id,
                syn,
                fin: false,
                body,
            })
            .await?;
            written += granted;
        }
        tracing::trace!(stream_id = %self.id, written, "wrote stream data");
        Ok(written)
    }

    /// Half-close the outbound direction by sending FIN. Idempotent.
    async fn shutdown_write(&self) -> Result<()> {
        let _serial = self.write_serial.lock().await;
        {
            let mut st = self.state();
            if st.terminal.is_some() || st.write_closed {
                return Ok(());
            }
            st.write_closed = true;
        }
        let syn = self.syn_pending.swap(false, Ordering::SeqCst);
        self.send_sync(WireFrame::Data {
            stream_id: self.id,
            syn,
            fin: true,
            body: Bytes::new(),
        })
        .await?;
        self.maybe_deregister();
        Ok(())
    }

    async fn with_write_deadline<T>(
        &self,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let deadline = *self
            .write_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| Error::WriteTimeout)?,
            None => fut.await,
        }
    }

    /// Deregister from the session once both halves closed cleanly.
    /// Reset and error paths keep the entry around for the removal grace.
    fn maybe_deregister(&self) {
        let done = {
            let st = self.state();
            st.read_closed && st.write_closed && st.terminal.is_none()
        };
        if done && let Some(inner) = self.session.upgrade() {
            inner.remove_stream(self.id);
        }
    }
}

/// A full-duplex byte stream multiplexed onto a [`Session`].
///
/// Handles are cheap to clone and share; reads and writes take `&self`.
/// Concurrent writers are serialized so their fragments never interleave
/// on the wire.
#[derive(Clone, Debug)]
pub struct Stream {
    shared: Arc<StreamShared>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>) -> Stream {
        Stream { shared }
    }

    /// The 31-bit id this stream occupies on its session.
    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    /// The session this stream belongs to, unless it already shut down.
    pub fn session(&self) -> Option<Session> {
        self.shared.session.upgrade().map(Session::from_inner)
    }

    pub fn local_addr(&self) -> SessionAddr {
        self.session()
            .map(|s| s.local_addr())
            .unwrap_or(SessionAddr::Synthetic)
    }

    pub fn remote_addr(&self) -> SessionAddr {
        self.session()
            .map(|s| s.remote_addr())
            .unwrap_or(SessionAddr::Synthetic)
    }

    /// Read buffered stream data, blocking until data, EOF, an error, or
    /// the read deadline. Returns 0 at EOF. Bytes handed to the caller are
    /// credited back to the peer (batched into WNDINC frames).
    pub async fn read(&self, out: &mut [u8]) -> Result<usize> {
        let n = self.shared.buffer.read(out).await?;
        if n > 0 {
            self.shared.credit_peer(n as u32).await;
        }
        Ok(n)
    }

    /// Write the whole of `data`, fragmenting to the frame size limit and
    /// the currently granted window. Blocks while the peer's window is
    /// exhausted; respects the write deadline.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.shared
            .with_write_deadline(self.shared.write_frames(data))
            .await
    }

    /// Gracefully close the stream: send FIN, then refuse further local
    /// reads and writes. Idempotent; at most one FIN is emitted.
    pub async fn close(&self) -> Result<()> {
        let result = self
            .shared
            .with_write_deadline(self.shared.shutdown_write())
            .await;
        {
            let mut st = self.shared.state();
            st.read_closed = true;
        }
        self.shared.buffer.set_error(Error::StreamClosed);
        if let Some(inner) = self.shared.session.upgrade() {
            inner.remove_stream(self.shared.id);
        }
        result
    }

    /// Half-close: send FIN but keep reading. Idempotent.
    pub async fn close_write(&self) -> Result<()> {
        self.shared
            .with_write_deadline(self.shared.shutdown_write())
            .await
    }

    /// Set both the read and write deadlines. `None` clears them.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.shared.buffer.set_deadline(deadline);
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self
            .shared
            .write_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = deadline;
    }
}
