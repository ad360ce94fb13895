use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::constant::MAX_PACKAGE_SZ;
use crate::error::{Error, Result};

/// SiriDB package header (zero-copy)
///
/// Layout matches the SiriDB wire protocol, little-endian:
/// - length: 4 bytes (payload length, header excluded)
/// - pid: 2 bytes (request id, correlates the response)
/// - ty: 1 byte (message type)
/// - check: 1 byte (`ty XOR 0xFF`)
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct FrameHeader {
    length: U32LE,
    pid: U16LE,
    ty: u8,
    check: u8,
}

pub const HEADER_SIZE: usize = size_of::<FrameHeader>();

impl FrameHeader {
    pub fn new(length: usize, pid: u16, ty: u8) -> Self {
        Self {
            length: U32LE::new(length as u32),
            pid: U16LE::new(pid),
            ty,
            check: ty ^ 0xFF,
        }
    }

    pub fn length(&self) -> usize {
        self.length.get() as usize
    }

    pub fn pid(&self) -> u16 {
        self.pid.get()
    }

    pub fn ty(&self) -> u8 {
        self.ty
    }
}

/// A complete package received from the server.
#[derive(Debug)]
pub struct Frame {
    pub pid: u16,
    pub ty: u8,
    pub payload: BytesMut,
}

/// Build the wire bytes for one package: header followed by payload.
///
/// The payload size must have been checked against [`MAX_PACKAGE_SZ`]
/// before this point.
pub fn encode_frame(pid: u16, ty: u8, payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader::new(payload.len(), pid, ty);
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Streaming package parser implementing `tokio_util::codec::Decoder`.
///
/// Emits a [`Frame`] once both the header and `length` payload bytes are
/// buffered. A bad check byte or an oversized length is unrecoverable: the
/// buffer is cleared and the caller is expected to drop the connection.
pub struct FrameCodec {
    state: DecoderState,
}

enum DecoderState {
    ReadingHeader,
    ReadingPayload { length: usize, pid: u16, ty: u8 },
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            state: DecoderState::ReadingHeader,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.state {
                DecoderState::ReadingHeader => {
                    if src.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let length = src.get_u32_le() as usize;
                    let pid = src.get_u16_le();
                    let ty = src.get_u8();
                    let check = src.get_u8();

                    if check != ty ^ 0xFF {
                        src.clear();
                        return Err(Error::ProtocolError(format!(
                            "invalid check bit for package type {ty}"
                        )));
                    }
                    if length > MAX_PACKAGE_SZ {
                        src.clear();
                        return Err(Error::ProtocolError(format!(
                            "package size {length} exceeds the maximum of {MAX_PACKAGE_SZ} bytes"
                        )));
                    }

                    self.state = DecoderState::ReadingPayload { length, pid, ty };
                }
                DecoderState::ReadingPayload { length, pid, ty } => {
                    if src.len() < length {
                        return Ok(None);
                    }

                    let payload = src.split_to(length);
                    self.state = DecoderState::ReadingHeader;

                    return Ok(Some(Frame { pid, ty, payload }));
                }
            }
        }
    }
}
