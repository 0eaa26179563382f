//! RFC 6455 frame parsing and serialization.
//!
//! Client-to-server frames arrive masked and are unmasked during parsing;
//! server-to-client frames are emitted unmasked. Masking, when requested,
//! draws its 4-byte key from the process CSPRNG.

use thiserror::Error;

/// Frame opcodes per [RFC 6455 §5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Parses the low 4 bits of the first frame byte.
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value & 0x0F {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }

    #[inline(always)]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Opcodes `>= 0x8` are control frames.
    #[inline(always)]
    pub const fn is_control(self) -> bool {
        (self as u8) >= 0x8
    }
}

/// Errors surfaced by the frame codec. All of them are protocol errors from
/// the connection's point of view, except [`FrameError::Insufficient`],
/// which a buffering caller may treat as "wait for more bytes".
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("insufficient data for WebSocket frame")]
    Insufficient,
    #[error("invalid opcode: 0x{0:X}")]
    UnknownOpcode(u8),
    #[error("negative 64-bit payload length")]
    NegativeLength,
}

/// The fixed part of a frame: flag bits, opcode, mask flag and payload
/// length (64-bit unsigned).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub payload_length: u64,
}

/// A parsed or constructed WebSocket frame.
///
/// The payload is always stored unmasked; the masking key, when present, is
/// applied during serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub masking_key: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

/// XOR (un)masking per RFC 6455 §5.3; the operation is symmetric.
fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

impl Frame {
    fn build(opcode: Opcode, payload: Vec<u8>, masked: bool) -> Self {
        Self {
            header: FrameHeader {
                fin: true,
                rsv1: false,
                rsv2: false,
                rsv3: false,
                opcode,
                masked,
                payload_length: payload.len() as u64,
            },
            masking_key: masked.then(rand::random::<[u8; 4]>),
            payload,
        }
    }

    /// A final text frame; the payload is the UTF-8 encoding of `text`.
    pub fn text(text: &str, masked: bool) -> Self {
        Self::build(Opcode::Text, text.as_bytes().to_vec(), masked)
    }

    /// A final binary frame.
    pub fn binary(data: Vec<u8>, masked: bool) -> Self {
        Self::build(Opcode::Binary, data, masked)
    }

    /// A ping frame echoing `payload`.
    pub fn ping(payload: Vec<u8>) -> Self {
        Self::build(Opcode::Ping, payload, false)
    }

    /// A pong frame echoing `payload`.
    pub fn pong(payload: Vec<u8>) -> Self {
        Self::build(Opcode::Pong, payload, false)
    }

    /// A close frame: 2-byte big-endian status code, then the UTF-8 reason.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Self::build(Opcode::Close, payload, false)
    }

    /// Decodes a close payload into `(code, reason)`; an empty payload
    /// defaults to `(1000, "")`.
    pub fn parse_close(payload: &[u8]) -> (u16, String) {
        if payload.len() < 2 {
            return (1000, String::new());
        }
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
        (code, reason)
    }

    /// The payload decoded as UTF-8 (lossy).
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Parses one frame from `buf`, returning it together with the number
    /// of bytes consumed. [`FrameError::Insufficient`] means `buf` does not
    /// yet hold a complete frame.
    pub fn parse(buf: &[u8]) -> Result<(Frame, usize), FrameError> {
        if buf.len() < 2 {
            return Err(FrameError::Insufficient);
        }

        let first = buf[0];
        let fin = first & 0x80 != 0;
        let rsv1 = first & 0x40 != 0;
        let rsv2 = first & 0x20 != 0;
        let rsv3 = first & 0x10 != 0;
        let opcode = Opcode::from_u8(first)?;

        let second = buf[1];
        let masked = second & 0x80 != 0;
        let mut pos = 2;

        let payload_length: u64 = match second & 0x7F {
            126 => {
                if buf.len() < pos + 2 {
                    return Err(FrameError::Insufficient);
                }
                let len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as u64;
                pos += 2;
                len
            }
            127 => {
                if buf.len() < pos + 8 {
                    return Err(FrameError::Insufficient);
                }
                let raw = i64::from_be_bytes(buf[pos..pos + 8].try_into().unwrap());
                if raw < 0 {
                    return Err(FrameError::NegativeLength);
                }
                pos += 8;
                raw as u64
            }
            len => len as u64,
        };

        let masking_key = if masked {
            if buf.len() < pos + 4 {
                return Err(FrameError::Insufficient);
            }
            let key: [u8; 4] = buf[pos..pos + 4].try_into().unwrap();
            pos += 4;
            Some(key)
        } else {
            None
        };

        if ((buf.len() - pos) as u64) < payload_length {
            return Err(FrameError::Insufficient);
        }
        let end = pos + payload_length as usize;
        let mut payload = buf[pos..end].to_vec();

        if let Some(key) = masking_key {
            apply_mask(&mut payload, key);
        }

        Ok((
            Frame {
                header: FrameHeader {
                    fin,
                    rsv1,
                    rsv2,
                    rsv3,
                    opcode,
                    masked,
                    payload_length,
                },
                masking_key,
                payload,
            },
            end,
        ))
    }

    /// Serializes the frame. A masked frame is emitted with its stored key
    /// and the payload XOR-obfuscated.
    pub fn serialize(&self) -> Vec<u8> {
        let len = self.payload.len();
        let mut out = Vec::with_capacity(14 + len);

        let mut first = self.header.opcode.as_u8();
        if self.header.fin {
            first |= 0x80;
        }
        if self.header.rsv1 {
            first |= 0x40;
        }
        if self.header.rsv2 {
            first |= 0x20;
        }
        if self.header.rsv3 {
            first |= 0x10;
        }
        out.push(first);

        let mask_bit = if self.header.masked { 0x80 } else { 0x00 };
        if len <= 125 {
            out.push(mask_bit | len as u8);
        } else if len <= 65535 {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        match (self.header.masked, self.masking_key) {
            (true, Some(key)) => {
                out.extend_from_slice(&key);
                let mut masked_payload = self.payload.clone();
                apply_mask(&mut masked_payload, key);
                out.extend_from_slice(&masked_payload);
            }
            _ => out.extend_from_slice(&self.payload),
        }

        out
    }
}
