//! Reference link codec for carrying [`Message`]s over a byte stream.
//!
//! Real deployments wrap frames in their own C2 envelope; this codec exists
//! so the core can be driven over a plain TCP link.
//!
//! ```text
//! magic:          [u8; 4]  "TMX0"
//! flags:          u8       FrameFlags
//! reserved:       [u8; 3]
//! tunnel_id:      u64
//! sequence/ack:   u64
//! payload_length: u32
//! checksum:       u32      first 4 bytes of blake3(payload), LE
//! payload:        [u8]     payload_length bytes
//! ```

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TunnelError;
use crate::frame::{Frame, FrameFlags, Message};

pub const MAGIC: [u8; 4] = *b"TMX0";
pub const HEADER_SIZE: usize = 32;
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

fn checksum(payload: &[u8]) -> u32 {
    let hash = blake3::hash(payload);
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        if src[0..4] != MAGIC {
            return Err(TunnelError::InvalidMagic);
        }

        let mut header = &src[4..HEADER_SIZE];
        let raw_flags = header.get_u8();
        header.advance(3);
        let tunnel_id = header.get_u64_le();
        let sequence = header.get_u64_le();
        let payload_length = header.get_u32_le() as usize;
        let expected_checksum = header.get_u32_le();

        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge {
                size: HEADER_SIZE + payload_length,
                max: MAX_FRAME_SIZE,
            });
        }
        let flags = FrameFlags::from_bits(raw_flags).ok_or(TunnelError::UnknownFlags(raw_flags))?;

        if src.len() < HEADER_SIZE + payload_length {
            src.reserve(HEADER_SIZE + payload_length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(payload_length).freeze();
        if checksum(&payload) != expected_checksum {
            return Err(TunnelError::ChecksumMismatch);
        }

        if flags.contains(FrameFlags::RESEND) {
            return Ok(Some(Message::Resend {
                tunnel_id,
                ack: sequence,
            }));
        }
        Ok(Some(Message::Data(Frame {
            tunnel_id,
            sequence,
            payload,
            is_close: flags.contains(FrameFlags::CLOSE),
        })))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = TunnelError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (flags, tunnel_id, sequence, payload) = match item {
            Message::Data(frame) => (frame.flags(), frame.tunnel_id, frame.sequence, frame.payload),
            Message::Resend { tunnel_id, ack } => {
                (FrameFlags::RESEND, tunnel_id, ack, bytes::Bytes::new())
            }
        };
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge {
                size: HEADER_SIZE + payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&MAGIC);
        dst.put_u8(flags.bits());
        dst.put_bytes(0, 3);
        dst.put_u64_le(tunnel_id);
        dst.put_u64_le(sequence);
        dst.put_u32_le(payload.len() as u32);
        dst.put_u32_le(checksum(&payload));
        dst.put_slice(&payload);
        Ok(())
    }
}
