#![forbid(unsafe_code)]

//! `pciefw` wire codec.
//!
//! Two message shapes travel over the link between the local (virtual) PCI device and the remote
//! endpoint. Every multi-byte integer is little-endian and fields are packed without padding.
//!
//! Request:
//!
//! ```text
//! 0          2        3       4         5                 13              15
//! +----------+--------+-------+---------+-----------------+---------------+----------------+
//! | size u16 | op u8  | bar u8| width u8| addr u64        | payload_len u16| payload ...    |
//! +----------+--------+-------+---------+-----------------+---------------+----------------+
//! ```
//!
//! Reply (fixed size):
//!
//! ```text
//! 0          2           3                     11
//! +----------+-----------+---------------------+
//! | size u16 | status u8 | data [u8; 8]        |
//! +----------+-----------+---------------------+
//! ```
//!
//! `size` always covers the whole message, including the size field itself. Replies are always
//! [`REPLY_LEN`] bytes and requests are never shorter than [`REQUEST_HEADER_LEN`], so the declared
//! size alone is enough to tell the two apart on a shared connection (see [`classify_frame_len`]).

use core::fmt;

/// Length of the `size` prefix shared by every message.
pub const FRAME_HEADER_LEN: usize = 2;

/// Offset of the inline payload inside a request (the fixed request header length).
pub const REQUEST_HEADER_LEN: usize = 15;

/// Maximum inline payload carried by a single request.
pub const MAX_PAYLOAD_LEN: usize = 0x1000;

/// Maximum encoded request length (and the size of a session's message buffer).
pub const MAX_MESSAGE_LEN: usize = REQUEST_HEADER_LEN + MAX_PAYLOAD_LEN;

/// Encoded reply length.
pub const REPLY_LEN: usize = 11;

/// Number of base address registers in a type 0 configuration header.
pub const PCI_NUM_BARS: usize = 6;

// Keep in sync with the remote endpoint's opcode table.
pub const OP_READ_CONFIG: u8 = 0;
pub const OP_WRITE_CONFIG: u8 = 1;
pub const OP_READ_MEM: u8 = 2;
pub const OP_WRITE_MEM: u8 = 3;
pub const OP_READ_IO: u8 = 4;
pub const OP_WRITE_IO: u8 = 5;
pub const OP_INT: u8 = 6;
pub const OP_MSI: u8 = 7;
pub const OP_MSIX: u8 = 8;

/// Request operation code.
///
/// Unknown values are preserved so that a receiver can report exactly what it got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    ReadConfig,
    WriteConfig,
    ReadMem,
    WriteMem,
    ReadIo,
    WriteIo,
    Int,
    Msi,
    Msix,
    Unknown(u8),
}

impl Opcode {
    pub const fn from_u8(v: u8) -> Self {
        match v {
            OP_READ_CONFIG => Self::ReadConfig,
            OP_WRITE_CONFIG => Self::WriteConfig,
            OP_READ_MEM => Self::ReadMem,
            OP_WRITE_MEM => Self::WriteMem,
            OP_READ_IO => Self::ReadIo,
            OP_WRITE_IO => Self::WriteIo,
            OP_INT => Self::Int,
            OP_MSI => Self::Msi,
            OP_MSIX => Self::Msix,
            other => Self::Unknown(other),
        }
    }

    pub const fn to_u8(self) -> u8 {
        match self {
            Self::ReadConfig => OP_READ_CONFIG,
            Self::WriteConfig => OP_WRITE_CONFIG,
            Self::ReadMem => OP_READ_MEM,
            Self::WriteMem => OP_WRITE_MEM,
            Self::ReadIo => OP_READ_IO,
            Self::WriteIo => OP_WRITE_IO,
            Self::Int => OP_INT,
            Self::Msi => OP_MSI,
            Self::Msix => OP_MSIX,
            Self::Unknown(v) => v,
        }
    }

    /// Returns `true` for the three operations that expect a [`Reply`].
    pub const fn expects_reply(self) -> bool {
        matches!(self, Self::ReadConfig | Self::ReadMem | Self::ReadIo)
    }

    /// Returns `true` for the three operations that carry `width` bytes of payload.
    pub const fn carries_data(self) -> bool {
        matches!(self, Self::WriteConfig | Self::WriteMem | Self::WriteIo)
    }
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        Self::from_u8(value)
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        value.to_u8()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadConfig => f.write_str("read-config"),
            Self::WriteConfig => f.write_str("write-config"),
            Self::ReadMem => f.write_str("read-mem"),
            Self::WriteMem => f.write_str("write-mem"),
            Self::ReadIo => f.write_str("read-io"),
            Self::WriteIo => f.write_str("write-io"),
            Self::Int => f.write_str("int"),
            Self::Msi => f.write_str("msi"),
            Self::Msix => f.write_str("msix"),
            Self::Unknown(v) => write!(f, "unknown(0x{v:02x})"),
        }
    }
}

/// Bus access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessWidth {
    Byte = 1,
    Word = 2,
    Dword = 4,
    Qword = 8,
}

impl AccessWidth {
    pub const fn from_bytes(n: usize) -> Option<Self> {
        match n {
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            4 => Some(Self::Dword),
            8 => Some(Self::Qword),
            _ => None,
        }
    }

    pub const fn bytes(self) -> usize {
        self as usize
    }

    /// Mask covering the low `self.bytes()` bytes of a `u64`.
    pub const fn mask(self) -> u64 {
        match self {
            Self::Qword => u64::MAX,
            other => (1u64 << (other.bytes() * 8)) - 1,
        }
    }
}

impl TryFrom<u8> for AccessWidth {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_bytes(usize::from(value)).ok_or(DecodeError::InvalidWidth { width: value })
    }
}

impl fmt::Display for AccessWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// A decoded (or to-be-encoded) request.
///
/// `width` is kept as the raw wire byte: remote-initiated events (`msi`, `int`) do not carry a
/// meaningful access width and must still decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub opcode: Opcode,
    pub bar: u8,
    pub width: u8,
    pub addr: u64,
    pub payload: &'a [u8],
}

impl<'a> Request<'a> {
    /// Builds a read request (payload is always empty).
    pub fn read(opcode: Opcode, bar: u8, width: AccessWidth, addr: u64) -> Self {
        Self {
            opcode,
            bar,
            width: width as u8,
            addr,
            payload: &[],
        }
    }

    /// Builds a write request whose payload is the `width` low bytes of the value.
    pub fn write(opcode: Opcode, bar: u8, width: AccessWidth, addr: u64, data: &'a [u8]) -> Self {
        debug_assert_eq!(data.len(), width.bytes());
        Self {
            opcode,
            bar,
            width: width as u8,
            addr,
            payload: data,
        }
    }

    pub fn encoded_len(&self) -> usize {
        REQUEST_HEADER_LEN + self.payload.len()
    }
}

/// A reply to a read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reply {
    pub status: u8,
    pub data: [u8; 8],
}

impl Reply {
    /// Builds a successful reply carrying `value` in its data slot.
    pub fn with_value(value: u64) -> Self {
        Self {
            status: 0,
            data: value.to_le_bytes(),
        }
    }

    /// Extracts the low `width` bytes of the data slot.
    pub fn value(&self, width: AccessWidth) -> u64 {
        u64::from_le_bytes(self.data) & width.mask()
    }
}

/// What a frame carries, according to its declared length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Reply,
    Request,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    TooShort { len: usize, min: usize },
    FrameTooLarge { len: usize, max: usize },
    InvalidFrameLen { len: usize },
    Truncated { expected: usize, got: usize },
    PayloadLenMismatch { frame_len: usize, payload_len: usize },
    InvalidWidth { width: u8 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TooShort { len, min } => write!(f, "frame too short: {len} < {min}"),
            DecodeError::FrameTooLarge { len, max } => {
                write!(f, "frame too large: {len} > {max}")
            }
            DecodeError::InvalidFrameLen { len } => write!(
                f,
                "invalid frame length {len} (expected {REPLY_LEN} or {REQUEST_HEADER_LEN}..={MAX_MESSAGE_LEN})"
            ),
            DecodeError::Truncated { expected, got } => {
                write!(f, "frame truncated: expected {expected} bytes, got {got}")
            }
            DecodeError::PayloadLenMismatch {
                frame_len,
                payload_len,
            } => write!(
                f,
                "payload length {payload_len} does not match frame length {frame_len}"
            ),
            DecodeError::InvalidWidth { width } => write!(f, "invalid access width: {width}"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    PayloadTooLarge { len: usize, max: usize },
    BufferTooSmall { len: usize, needed: usize },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::PayloadTooLarge { len, max } => {
                write!(f, "payload too large: {len} > {max}")
            }
            EncodeError::BufferTooSmall { len, needed } => {
                write!(f, "output buffer too small: {len} < {needed}")
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// Reads the declared frame length from a frame header.
pub fn frame_len(header: [u8; FRAME_HEADER_LEN]) -> usize {
    usize::from(u16::from_le_bytes(header))
}

/// Classifies a frame by its declared length.
pub fn classify_frame_len(len: usize) -> Result<FrameKind, DecodeError> {
    match len {
        REPLY_LEN => Ok(FrameKind::Reply),
        REQUEST_HEADER_LEN..=MAX_MESSAGE_LEN => Ok(FrameKind::Request),
        len if len > MAX_MESSAGE_LEN => Err(DecodeError::FrameTooLarge {
            len,
            max: MAX_MESSAGE_LEN,
        }),
        len => Err(DecodeError::InvalidFrameLen { len }),
    }
}

/// Encodes `req` into the front of `buf`, returning the number of bytes written.
pub fn encode_request(req: &Request<'_>, buf: &mut [u8]) -> Result<usize, EncodeError> {
    if req.payload.len() > MAX_PAYLOAD_LEN {
        return Err(EncodeError::PayloadTooLarge {
            len: req.payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    let len = req.encoded_len();
    if buf.len() < len {
        return Err(EncodeError::BufferTooSmall {
            len: buf.len(),
            needed: len,
        });
    }

    // Both fit in u16: len <= MAX_MESSAGE_LEN.
    buf[0..2].copy_from_slice(&(len as u16).to_le_bytes());
    buf[2] = req.opcode.to_u8();
    buf[3] = req.bar;
    buf[4] = req.width;
    buf[5..13].copy_from_slice(&req.addr.to_le_bytes());
    buf[13..15].copy_from_slice(&(req.payload.len() as u16).to_le_bytes());
    buf[REQUEST_HEADER_LEN..len].copy_from_slice(req.payload);
    Ok(len)
}

/// Encodes `req` into a freshly allocated buffer.
pub fn encode_request_vec(req: &Request<'_>) -> Result<Vec<u8>, EncodeError> {
    let mut out = vec![0u8; req.encoded_len()];
    let len = encode_request(req, &mut out)?;
    out.truncate(len);
    Ok(out)
}

/// Decodes a request from the front of `buf`.
///
/// Only the first `size` bytes (as declared by the frame header) are interpreted; anything after
/// them is ignored so callers can decode straight out of a reusable max-size buffer.
pub fn decode_request(buf: &[u8]) -> Result<Request<'_>, DecodeError> {
    if buf.len() < REQUEST_HEADER_LEN {
        return Err(DecodeError::TooShort {
            len: buf.len(),
            min: REQUEST_HEADER_LEN,
        });
    }

    let len = frame_len([buf[0], buf[1]]);
    if len > MAX_MESSAGE_LEN {
        return Err(DecodeError::FrameTooLarge {
            len,
            max: MAX_MESSAGE_LEN,
        });
    }
    if len < REQUEST_HEADER_LEN {
        return Err(DecodeError::InvalidFrameLen { len });
    }
    if buf.len() < len {
        return Err(DecodeError::Truncated {
            expected: len,
            got: buf.len(),
        });
    }

    let payload_len = usize::from(u16::from_le_bytes([buf[13], buf[14]]));
    if REQUEST_HEADER_LEN + payload_len != len {
        return Err(DecodeError::PayloadLenMismatch {
            frame_len: len,
            payload_len,
        });
    }

    let mut addr = [0u8; 8];
    addr.copy_from_slice(&buf[5..13]);

    Ok(Request {
        opcode: Opcode::from_u8(buf[2]),
        bar: buf[3],
        width: buf[4],
        addr: u64::from_le_bytes(addr),
        payload: &buf[REQUEST_HEADER_LEN..len],
    })
}

pub fn encode_reply(reply: &Reply) -> [u8; REPLY_LEN] {
    let mut out = [0u8; REPLY_LEN];
    out[0..2].copy_from_slice(&(REPLY_LEN as u16).to_le_bytes());
    out[2] = reply.status;
    out[3..].copy_from_slice(&reply.data);
    out
}

/// Decodes a reply. The layout is fixed, so only the available length is checked.
pub fn decode_reply(buf: &[u8]) -> Result<Reply, DecodeError> {
    if buf.len() < REPLY_LEN {
        return Err(DecodeError::TooShort {
            len: buf.len(),
            min: REPLY_LEN,
        });
    }
    let mut data = [0u8; 8];
    data.copy_from_slice(&buf[3..REPLY_LEN]);
    Ok(Reply {
        status: buf[2],
        data,
    })
}
