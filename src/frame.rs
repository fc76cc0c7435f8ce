//! Wire format for the muxado framing layer: the 8-byte common header,
//! the typed frame values, and their structural validation rules.
//!
//! All integers are big-endian. The common header packs a 24-bit length,
//! a 4-bit type (high nibble of byte 3), a 4-bit flag set (low nibble of
//! byte 3), and a 31-bit stream id whose high bit is always zero:
//!
//! ```text
//! byte:  0        1        2        3        4        5        6        7
//!       |  length (24 bits)        |type|flag|  stream id (31 bits)        |
//! ```

use crate::error::{Error, ErrorCode, Result};
use bytes::{BufMut, Bytes, BytesMut};
use core::fmt;
use num_enum::{FromPrimitive, IntoPrimitive};
use std::ops::BitOr;

/// Size of the common frame header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest body a single frame may carry (24-bit length field).
pub const MAX_FRAME_LENGTH: usize = 0x00FF_FFFF;

/// Upper bound on the GOAWAY debug payload retained by the decoder.
/// Anything beyond this is drained from the transport and discarded.
pub const MAX_GOAWAY_DEBUG: usize = 1024 * 1024;

/// A 31-bit stream identifier. Id 0 is reserved for session-level frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u32);

impl StreamId {
    /// The session-level id used by GOAWAY frames.
    pub const ZERO: StreamId = StreamId(0);

    /// Largest representable id (high bit must stay clear).
    pub const MAX: u32 = 0x7FFF_FFFF;

    /// Construct a stream id, rejecting values with the high bit set.
    pub fn new(raw: u32) -> Result<StreamId> {
        if raw > Self::MAX {
            return Err(Error::Protocol(format!(
                "stream id {raw:#x} exceeds 31 bits"
            )));
        }
        Ok(StreamId(raw))
    }

    /// Construct from wire bytes, masking off the reserved high bit.
    pub(crate) fn from_wire(raw: u32) -> StreamId {
        StreamId(raw & Self::MAX)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Frame flag set, 4 bits. Only DATA frames define flags today.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    /// First frame of a new stream.
    pub const SYN: Flags = Flags(0x1);
    /// Last frame the sender will emit on this stream.
    pub const FIN: Flags = Flags(0x2);

    pub const fn empty() -> Flags {
        Flags(0)
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub(crate) fn from_bits(bits: u8) -> Flags {
        Flags(bits & 0x0F)
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Frame type nibble. Unrecognized types are preserved so the reader can
/// drain and skip them without killing the session.
#[derive(FromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    Data = 0x0,
    Rst = 0x1,
    WndInc = 0x2,
    GoAway = 0x7,
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// The decoded 8-byte common header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub typ: FrameType,
    pub flags: Flags,
    pub stream_id: StreamId,
}

impl FrameHeader {
    /// Encode the header into `buf`, validating the structural limits:
    /// length fits in 24 bits, the type and flag nibbles are in range, and
    /// the stream id high bit is clear (guaranteed by [`StreamId`]).
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        if self.length as usize > MAX_FRAME_LENGTH {
            return Err(Error::FrameSize(format!(
                "frame length {} exceeds maximum {MAX_FRAME_LENGTH}",
                self.length
            )));
        }
        let typ = u8::from(self.typ);
        if typ > 0x0F {
            return Err(Error::Protocol(format!("frame type {typ:#x} exceeds 4 bits")));
        }
        if self.flags.bits() > 0x0F {
            return Err(Error::Protocol(format!(
                "flags {:#x} exceed 4 bits",
                self.flags.bits()
            )));
        }

        buf.reserve(HEADER_SIZE);
        buf.put_u8((self.length >> 16) as u8);
        buf.put_u8((self.length >> 8) as u8);
        buf.put_u8(self.length as u8);
        buf.put_u8((typ << 4) | self.flags.bits());
        buf.put_u32(self.stream_id.get());
        Ok(())
    }

    /// Decode a header from its 8 raw bytes. Structurally infallible: the
    /// stream id high bit is masked, unknown types are preserved as-is.
    pub fn decode(raw: [u8; HEADER_SIZE]) -> FrameHeader {
        let length = u32::from(raw[0]) << 16 | u32::from(raw[1]) << 8 | u32::from(raw[2]);
        let typ = FrameType::from(raw[3] >> 4);
        let flags = Flags::from_bits(raw[3] & 0x0F);
        let stream_id = StreamId::from_wire(u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]));
        FrameHeader {
            length,
            typ,
            flags,
            stream_id,
        }
    }
}

/// An owned outbound frame, consumed by the writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireFrame {
    Data {
        stream_id: StreamId,
        syn: bool,
        fin: bool,
        body: Bytes,
    },
    Rst {
        stream_id: StreamId,
        code: ErrorCode,
    },
    WndInc {
        stream_id: StreamId,
        increment: u32,
    },
    GoAway {
        last_stream_id: StreamId,
        code: ErrorCode,
        debug: Bytes,
    },
}

impl WireFrame {
    pub fn stream_id(&self) -> StreamId {
        match self {
            WireFrame::Data { stream_id, .. }
            | WireFrame::Rst { stream_id, .. }
            | WireFrame::WndInc { stream_id, .. } => *stream_id,
            WireFrame::GoAway { .. } => StreamId::ZERO,
        }
    }

    /// Serialize header and body into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            WireFrame::Data {
                stream_id,
                syn,
                fin,
                body,
            } => {
                if stream_id.get() == 0 {
                    return Err(Error::Protocol("DATA on stream id 0".into()));
                }
                let mut flags = Flags::empty();
                if *syn {
                    flags = flags | Flags::SYN;
                }
                if *fin {
                    flags = flags | Flags::FIN;
                }
                FrameHeader {
                    length: body.len() as u32,
                    typ: FrameType::Data,
                    flags,
                    stream_id: *stream_id,
                }
                .encode(buf)?;
                buf.extend_from_slice(body);
            }
            WireFrame::Rst { stream_id, code } => {
                if stream_id.get() == 0 {
                    return Err(Error::Protocol("RST on stream id 0".into()));
                }
                FrameHeader {
                    length: 4,
                    typ: FrameType::Rst,
                    flags: Flags::empty(),
                    stream_id: *stream_id,
                }
                .encode(buf)?;
                buf.put_u32(u32::from(*code));
            }
            WireFrame::WndInc {
                stream_id,
                increment,
            } => {
                if stream_id.get() == 0 {
                    return Err(Error::Protocol("WNDINC on stream id 0".into()));
                }
                if *increment > StreamId::MAX {
                    return Err(Error::Protocol(format!(
                        "window increment {increment:#x} has the high bit set"
                    )));
                }
                FrameHeader {
                    length: 4,
                    typ: FrameType::WndInc,
                    flags: Flags::empty(),
                    stream_id: *stream_id,
                }
                .encode(buf)?;
                buf.put_u32(*increment);
            }
            WireFrame::GoAway {
                last_stream_id,
                code,
                debug,
            } => {
                let length = 8 + debug.len();
                FrameHeader {
                    length: length as u32,
                    typ: FrameType::GoAway,
                    flags: Flags::empty(),
                    stream_id: StreamId::ZERO,
                }
                .encode(buf)?;
                buf.put_u32(last_stream_id.get());
                buf.put_u32(u32::from(*code));
                buf.extend_from_slice(debug);
            }
        }
        Ok(())
    }
}

/// A decoded inbound frame.
///
/// `Data` carries only the header fields; the body stays on the transport
/// and must be consumed through the framer before the next read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: StreamId,
        syn: bool,
        fin: bool,
        length: u32,
    },
    Rst {
        stream_id: StreamId,
        code: ErrorCode,
    },
    WndInc {
        stream_id: StreamId,
        increment: u32,
    },
    GoAway {
        last_stream_id: StreamId,
        code: ErrorCode,
        debug: Bytes,
    },
    /// Unrecognized frame type; the body has already been drained.
    Unknown { typ: u8, length: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = FrameHeader {
            length: 0x123456,
            typ: FrameType::Data,
            flags: Flags::SYN | Flags::FIN,
            stream_id: StreamId::new(0x2843).unwrap(),
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);

        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&buf);
        assert_eq!(FrameHeader::decode(raw), header);
    }

    #[test]
    fn rst_serialization_vector() {
        // RST, length 4, stream id 0x2843, code 5
        let frame = WireFrame::Rst {
            stream_id: StreamId::new(0x2843).unwrap(),
            code: ErrorCode::StreamClosed,
        };

        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        assert_eq!(
            buf.as_ref(),
            &[0x00, 0x00, 0x04, 0x10, 0x00, 0x00, 0x28, 0x43, 0x00, 0x00, 0x00, 0x05]
        );

        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&buf[..HEADER_SIZE]);
        let header = FrameHeader::decode(raw);
        assert_eq!(header.length, 4);
        assert_eq!(header.typ, FrameType::Rst);
        assert_eq!(header.flags, Flags::empty());
        assert_eq!(header.stream_id.get(), 0x2843);
    }

    #[test]
    fn length_over_24_bits_is_rejected() {
        let header = FrameHeader {
            length: MAX_FRAME_LENGTH as u32 + 1,
            typ: FrameType::Data,
            flags: Flags::empty(),
            stream_id: StreamId::new(1).unwrap(),
        };
        let mut buf = BytesMut::new();
        assert!(matches!(header.encode(&mut buf), Err(Error::FrameSize(_))));
    }

    #[test]
    fn stream_id_high_bit_is_rejected() {
        assert!(StreamId::new(0x8000_0000).is_err());
        assert!(StreamId::new(StreamId::MAX).is_ok());
    }

    #[test]
    fn decode_masks_stream_id_high_bit() {
        let raw = [0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF];
        let header = FrameHeader::decode(raw);
        assert_eq!(header.stream_id.get(), StreamId::MAX);
    }

    #[test]
    fn unknown_frame_type_is_preserved() {
        let raw = [0x00, 0x00, 0x00, 0x3C, 0x00, 0x00, 0x00, 0x07];
        let header = FrameHeader::decode(raw);
        assert_eq!(header.typ, FrameType::Unknown(0x3));
        assert_eq!(header.flags.bits(), 0xC);
    }

    #[test]
    fn wndinc_high_bit_is_rejected() {
        let frame = WireFrame::WndInc {
            stream_id: StreamId::new(1).unwrap(),
            increment: 0x8000_0000,
        };
        let mut buf = BytesMut::new();
        assert!(matches!(frame.encode(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn goaway_encodes_last_id_code_and_debug() {
        let frame = WireFrame::GoAway {
            last_stream_id: StreamId::new(300).unwrap(),
            code: ErrorCode::NoError,
            debug: Bytes::from_static(b"bye"),
        };
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();

        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&buf[..HEADER_SIZE]);
        let header = FrameHeader::decode(raw);
        assert_eq!(header.typ, FrameType::GoAway);
        assert_eq!(header.length, 11);
        assert_eq!(header.stream_id, StreamId::ZERO);
        assert_eq!(&buf[HEADER_SIZE..HEADER_SIZE + 4], &300u32.to_be_bytes());
        assert_eq!(&buf[HEADER_SIZE + 4..HEADER_SIZE + 8], &0u32.to_be_bytes());
        assert_eq!(&buf[HEADER_SIZE + 8..], b"bye");
    }

    #[test]
    fn data_frames_require_nonzero_stream_id() {
        let frame = WireFrame::Data {
            stream_id: StreamId::ZERO,
            syn: false,
            fin: false,
            body: Bytes::new(),
        };
        let mut buf = BytesMut::new();
        assert!(matches!(frame.encode(&mut buf), Err(Error::Protocol(_))));
    }
}
