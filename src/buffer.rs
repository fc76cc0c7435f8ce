// ABOUTME: Bounded inbound byte buffer feeding user reads on a stream
// ABOUTME: The session reader task appends; user tasks block in read until data, EOF, error, or deadline

use crate::error::{Error, Result};
use bytes::{Buf, BytesMut};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct Inner {
    data: BytesMut,
    max: usize,
    eof: bool,
    error: Option<Error>,
    deadline: Option<Instant>,
}

/// A bounded FIFO byte buffer with blocking reads and read deadlines.
///
/// Terminal conditions (EOF, error) latch but are only reported once the
/// buffered data has been drained. The deadline is an absolute instant,
/// re-checked after every wakeup because deadline changes and data arrival
/// race freely.
#[derive(Debug)]
pub(crate) struct InboundBuffer {
    inner: Mutex<Inner>,
    readable: Notify,
}

impl InboundBuffer {
    pub fn new(max: usize) -> InboundBuffer {
        InboundBuffer {
            inner: Mutex::new(Inner {
                data: BytesMut::new(),
                max,
                eof: false,
                error: None,
                deadline: None,
            }),
            readable: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a chunk delivered by the session reader task.
    ///
    /// Exceeding the capacity latches [`Error::BufferFull`]; the caller is
    /// expected to keep consuming the rest of the frame body from the
    /// transport so the framer stays in sync, discarding what it reads.
    pub fn push(&self, chunk: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        if let Some(err) = &inner.error {
            return Err(err.clone());
        }
        if inner.data.len() + chunk.len() > inner.max {
            inner.error = Some(Error::BufferFull);
            drop(inner);
            self.readable.notify_waiters();
            return Err(Error::BufferFull);
        }
        inner.data.extend_from_slice(chunk);
        drop(inner);
        self.readable.notify_waiters();
        Ok(())
    }

    /// Copy buffered bytes into `out`, blocking while the buffer is empty
    /// and no terminal condition or deadline applies. Returns 0 at EOF.
    pub async fn read(&self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.readable.notified();
            let deadline = {
                let mut inner = self.lock();
                if !inner.data.is_empty() {
                    let n = out.len().min(inner.data.len());
                    inner.data.copy_to_slice(&mut out[..n]);
                    return Ok(n);
                }
                if let Some(err) = &inner.error {
                    return Err(err.clone());
                }
                if inner.eof {
                    return Ok(0);
                }
                inner.deadline
            };
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(Error::DeadlineExceeded);
                    }
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Latch a terminal error. The first error wins.
    pub fn set_error(&self, err: Error) {
        let mut inner = self.lock();
        if inner.error.is_none() {
            inner.error = Some(err);
        }
        drop(inner);
        self.readable.notify_waiters();
    }

    /// Latch EOF; buffered data remains readable until drained.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.eof = true;
        drop(inner);
        self.readable.notify_waiters();
    }

    /// Replace the read deadline. `None` clears it. Waiters are woken so
    /// the new value takes effect immediately, including instants already
    /// in the past.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.lock().deadline = deadline;
        self.readable.notify_waiters();
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn push_then_read_partial() {
        let buffer = InboundBuffer::new(64);
        buffer.push(b"hello world").unwrap();

        let mut out = [0u8; 5];
        assert_eq!(buffer.read(&mut out).await.unwrap(), 5);
        assert_eq!(&out, b"hello");

        let mut rest = [0u8; 16];
        assert_eq!(buffer.read(&mut rest).await.unwrap(), 6);
        assert_eq!(&rest[..6], b" world");
    }

    #[tokio::test]
    async fn read_blocks_until_push() {
        let buffer = Arc::new(InboundBuffer::new(64));

        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut out = [0u8; 8];
                let n = buffer.read(&mut out).await.unwrap();
                out[..n].to_vec()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!reader.is_finished());

        buffer.push(b"data").unwrap();
        assert_eq!(reader.await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn eof_reported_after_drain() {
        let buffer = InboundBuffer::new(64);
        buffer.push(b"tail").unwrap();
        buffer.close();

        let mut out = [0u8; 8];
        assert_eq!(buffer.read(&mut out).await.unwrap(), 4);
        assert_eq!(buffer.read(&mut out).await.unwrap(), 0);
        assert_eq!(buffer.read(&mut out).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn error_reported_after_drain() {
        let buffer = InboundBuffer::new(64);
        buffer.push(b"tail").unwrap();
        buffer.set_error(Error::StreamReset(crate::error::ErrorCode::StreamCancelled));

        let mut out = [0u8; 8];
        assert_eq!(buffer.read(&mut out).await.unwrap(), 4);
        assert_eq!(
            buffer.read(&mut out).await,
            Err(Error::StreamReset(crate::error::ErrorCode::StreamCancelled))
        );
    }

    #[tokio::test]
    async fn overflow_latches_buffer_full() {
        let buffer = InboundBuffer::new(4);
        buffer.push(b"abc").unwrap();
        assert_eq!(buffer.push(b"de"), Err(Error::BufferFull));
        assert_eq!(buffer.push(b"f"), Err(Error::BufferFull));

        // Buffered data stays readable, then the latched error surfaces.
        let mut out = [0u8; 8];
        assert_eq!(buffer.read(&mut out).await.unwrap(), 3);
        assert_eq!(buffer.read(&mut out).await, Err(Error::BufferFull));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_unblocks_reader() {
        let buffer = Arc::new(InboundBuffer::new(64));
        buffer.set_deadline(Some(Instant::now() + Duration::from_millis(50)));

        let mut out = [0u8; 8];
        assert_eq!(buffer.read(&mut out).await, Err(Error::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn data_beats_deadline() {
        let buffer = InboundBuffer::new(64);
        buffer.set_deadline(Some(Instant::now() - Duration::from_secs(1)));
        buffer.push(b"ok").unwrap();

        let mut out = [0u8; 8];
        assert_eq!(buffer.read(&mut out).await.unwrap(), 2);
        // Drained; now the past deadline applies.
        assert_eq!(buffer.read(&mut out).await, Err(Error::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_deadline_replaces_the_old_timer() {
        let buffer = Arc::new(InboundBuffer::new(64));
        buffer.set_deadline(Some(Instant::now() + Duration::from_secs(3600)));

        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut out = [0u8; 8];
                buffer.read(&mut out).await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let start = Instant::now();
        buffer.set_deadline(Some(start + Duration::from_millis(20)));
        assert_eq!(reader.await.unwrap(), Err(Error::DeadlineExceeded));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_deadline_restores_blocking_reads() {
        let buffer = InboundBuffer::new(64);
        buffer.set_deadline(Some(Instant::now() - Duration::from_secs(1)));

        let mut out = [0u8; 8];
        assert_eq!(buffer.read(&mut out).await, Err(Error::DeadlineExceeded));

        buffer.set_deadline(None);
        buffer.push(b"later").unwrap();
        assert_eq!(buffer.read(&mut out).await.unwrap(), 5);
    }
}
