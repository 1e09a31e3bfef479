//! RFC 6455 frame codec.
//!
//! Parses client frames (masked) out of a streaming read buffer and
//! serializes server frames (unmasked). Control frames must be unfragmented.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame-level protocol violation; the connection is closed with a
/// protocol status when one surfaces.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("reserved opcode {0:#x}")]
    BadOpcode(u8),

    #[error("payload length exceeds 2^63")]
    Oversized,

    #[error("fragmented control frame")]
    FragmentedControl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_bits(bits: u8) -> Result<Self, FrameError> {
        match bits {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(FrameError::BadOpcode(other)),
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    pub fn is_data(self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }
}

/// A single WebSocket frame. Parsed payloads are already unmasked; the
/// masking key is retained so tests can assert round-trips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub masking_key: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            masking_key: None,
            payload: payload.into(),
        }
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, payload)
    }

    pub fn close() -> Self {
        Self::new(true, OpCode::Close, Bytes::new())
    }

    pub fn pong(payload: Bytes) -> Self {
        Self::new(true, OpCode::Pong, payload)
    }

    /// Attempts to parse one complete frame from the front of `buf`,
    /// consuming its bytes. Returns `Ok(None)` when more data is needed.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let fin = buf[0] & 0x80 != 0;
        if buf[0] & 0x70 != 0 {
            // RSV bits: no extensions negotiated
            return Err(FrameError::BadOpcode(buf[0] & 0x7F));
        }
        let opcode = OpCode::from_bits(buf[0] & 0x0F)?;
        let masked = buf[1] & 0x80 != 0;

        let (payload_len, mut header_len) = match buf[1] & 0x7F {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4usize)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let len = u64::from_be_bytes(buf[2..10].try_into().expect("8 bytes"));
                if len > 1 << 63 {
                    return Err(FrameError::Oversized);
                }
                (len, 10usize)
            }
            short => (u64::from(short), 2usize),
        };

        if opcode.is_control() && !fin {
            return Err(FrameError::FragmentedControl);
        }

        let masking_key = if masked {
            if buf.len() < header_len + 4 {
                return Ok(None);
            }
            let key = [
                buf[header_len],
                buf[header_len + 1],
                buf[header_len + 2],
                buf[header_len + 3],
            ];
            header_len += 4;
            Some(key)
        } else {
            None
        };

        let payload_len = usize::try_from(payload_len).map_err(|_| FrameError::Oversized)?;
        if buf.len() < header_len + payload_len {
            return Ok(None);
        }

        let _ = buf.split_to(header_len);
        let mut payload = buf.split_to(payload_len);
        if let Some(key) = masking_key {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }

        Ok(Some(Frame {
            fin,
            opcode,
            masking_key,
            payload: payload.freeze(),
        }))
    }

    /// Serializes the frame, masking the payload when a key is set.
    pub fn serialize(&self) -> Bytes {
        let len = self.payload.len();
        let mut out = BytesMut::with_capacity(len + 14);

        out.put_u8(u8::from(self.fin) << 7 | self.opcode.bits());

        let mask_bit = u8::from(self.masking_key.is_some()) << 7;
        if len <= 125 {
            out.put_u8(mask_bit | len as u8);
        } else if len < 1 << 16 {
            out.put_u8(mask_bit | 126);
            out.put_u16(len as u16);
        } else {
            out.put_u8(mask_bit | 127);
            out.put_u64(len as u64);
        }

        match self.masking_key {
            Some(key) => {
                out.put_slice(&key);
                out.extend(
                    self.payload
                        .iter()
                        .enumerate()
                        .map(|(i, b)| b ^ key[i % 4]),
                );
            }
            None => out.put_slice(&self.payload),
        }

        out.freeze()
    }
}
