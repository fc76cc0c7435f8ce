// ABOUTME: Sequential frame I/O over an async byte transport
// ABOUTME: One FrameReader and one FrameWriter per session, never shared between tasks

use crate::error::{Error, ErrorCode, Result};
use crate::frame::{
    Frame, FrameHeader, FrameType, Flags, StreamId, WireFrame, HEADER_SIZE, MAX_GOAWAY_DEBUG,
};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Serializes frames onto the write half of a transport.
///
/// Not safe for concurrent use; the session runs exactly one writer task.
#[derive(Debug)]
pub struct FrameWriter<W> {
    io: W,
    scratch: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W) -> FrameWriter<W> {
        FrameWriter {
            io,
            scratch: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Encode `frame` and write it fully to the transport.
    pub async fn write_frame(&mut self, frame: &WireFrame) -> Result<()> {
        self.scratch.clear();
        frame.encode(&mut self.scratch)?;
        self.io.write_all(&self.scratch).await?;
        self.io.flush().await?;
        Ok(())
    }
}

/// Reads frames from the read half of a transport.
///
/// `read_frame` returns owned values for every type except DATA, whose body
/// stays on the wire and is consumed through [`FrameReader::read_body_chunk`].
/// Whatever body is left unconsumed when `read_frame` is called again gets
/// drained first, so the framer can never desynchronize from the transport.
#[derive(Debug)]
pub struct FrameReader<R> {
    io: R,
    /// Unread bytes of the current DATA frame body.
    pending_body: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R) -> FrameReader<R> {
        FrameReader {
            io,
            pending_body: 0,
        }
    }

    /// Bytes of the current DATA frame body not yet consumed.
    pub fn body_remaining(&self) -> u64 {
        self.pending_body
    }

    /// Read the next frame header and decode the frame.
    ///
    /// Validation failures follow the session error policy: impossible
    /// lengths are [`Error::FrameSize`], rule violations (stream id zero,
    /// window increment high bit) are [`Error::Protocol`]. A transport EOF
    /// surfaces as [`Error::PeerEof`].
    pub async fn read_frame(&mut self) -> Result<Frame> {
        self.drain_body().await?;

        let mut raw = [0u8; HEADER_SIZE];
        self.io.read_exact(&mut raw).await?;
        let header = FrameHeader::decode(raw);
        tracing::trace!(?header, "read frame header");

        match header.typ {
            FrameType::Data => {
                if header.stream_id == StreamId::ZERO {
                    return Err(Error::Protocol("DATA on stream id 0".into()));
                }
                self.pending_body = u64::from(header.length);
                Ok(Frame::Data {
                    stream_id: header.stream_id,
                    syn: header.flags.contains(Flags::SYN),
                    fin: header.flags.contains(Flags::FIN),
                    length: header.length,
                })
            }
            FrameType::Rst => {
                if header.length != 4 {
                    return Err(Error::FrameSize(format!(
                        "RST body length {} != 4",
                        header.length
                    )));
                }
                if header.stream_id == StreamId::ZERO {
                    return Err(Error::Protocol("RST on stream id 0".into()));
                }
                let mut body = [0u8; 4];
                self.io.read_exact(&mut body).await?;
                Ok(Frame::Rst {
                    stream_id: header.stream_id,
                    code: ErrorCode::from(u32::from_be_bytes(body)),
                })
            }
            FrameType::WndInc => {
                if header.length != 4 {
                    return Err(Error::FrameSize(format!(
                        "WNDINC body length {} != 4",
                        header.length
                    )));
                }
                if header.stream_id == StreamId::ZERO {
                    return Err(Error::Protocol("WNDINC on stream id 0".into()));
                }
                let mut body = [0u8; 4];
                self.io.read_exact(&mut body).await?;
                let increment = u32::from_be_bytes(body);
                if increment > StreamId::MAX {
                    return Err(Error::Protocol(format!(
                        "window increment {increment:#x} has the high bit set"
                    )));
                }
                Ok(Frame::WndInc {
                    stream_id: header.stream_id,
                    increment,
                })
            }
            FrameType::GoAway => {
                if header.length < 8 {
                    return Err(Error::FrameSize(format!(
                        "GOAWAY body length {} < 8",
                        header.length
                    )));
                }
                let mut fixed = [0u8; 8];
                self.io.read_exact(&mut fixed).await?;
                let last_stream_id =
                    StreamId::from_wire(u32::from_be_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]));
                let code =
                    ErrorCode::from(u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]));

                let debug_len = header.length as usize - 8;
                let keep = debug_len.min(MAX_GOAWAY_DEBUG);
                let mut debug = vec![0u8; keep];
                self.io.read_exact(&mut debug).await?;
                let dropped = debug_len - keep;
                if dropped > 0 {
                    tracing::warn!(dropped, "GOAWAY debug payload over cap, discarding excess");
                    self.skip(dropped as u64).await?;
                }
                Ok(Frame::GoAway {
                    last_stream_id,
                    code,
                    debug: Bytes::from(debug),
                })
            }
            FrameType::Unknown(typ) => {
                tracing::warn!(typ, length = header.length, "skipping unknown frame type");
                self.skip(u64::from(header.length)).await?;
                Ok(Frame::Unknown {
                    typ,
                    length: header.length,
                })
            }
        }
    }

    /// Read the next chunk of the current DATA frame body into `buf`.
    /// Returns 0 once the body is fully consumed.
    pub async fn read_body_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pending_body == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(self.pending_body.min(usize::MAX as u64) as usize);
        let n = self.io.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(Error::PeerEof);
        }
        self.pending_body -= n as u64;
        Ok(n)
    }

    /// Consume whatever is left of the current DATA frame body.
    pub async fn drain_body(&mut self) -> Result<()> {
        let mut scratch = [0u8; 4096];
        while self.pending_body > 0 {
            self.read_body_chunk(&mut scratch).await?;
        }
        Ok(())
    }

    async fn skip(&mut self, mut n: u64) -> Result<()> {
        let mut scratch = [0u8; 4096];
        while n > 0 {
            let want = (scratch.len() as u64).min(n) as usize;
            self.io.read_exact(&mut scratch[..want]).await?;
            n -= want as u64;
        }
        Ok(())
    }
}
