//! Six byte bus frame codec
//!
//! ```text
//! ┌────────┬────────┬──────────┬──────────┬───────┬──────────┐
//! │ domain │ sender │ receiver │ register │ value │ checksum │
//! └────────┴────────┴──────────┴──────────┴───────┴──────────┘
//! ```
//!
//! The checksum is the wrapping sum of the first five bytes. Garbage in
//! front of a frame (line noise, a frame cut in half at startup) is skipped
//! one byte at a time until a frame with a valid checksum lines up.

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

pub const FRAME_LEN: usize = 6;
pub const DOMAIN: u8 = 0x01;

/// Register byte used by query requests; the queried register goes in `value`
pub const QUERY_REGISTER: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub sender: u8,
    pub receiver: u8,
    pub register: u8,
    pub value: u8,
}

impl Frame {
    pub fn checksum(&self) -> u8 {
        [DOMAIN, self.sender, self.receiver, self.register, self.value]
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b))
    }

    pub fn is_query(&self) -> bool {
        self.register == QUERY_REGISTER
    }
}

#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        loop {
            if src.len() < FRAME_LEN {
                return Ok(None);
            }

            if src[0] != DOMAIN {
                src.advance(1);
                continue;
            }

            let frame = Frame {
                sender: src[1],
                receiver: src[2],
                register: src[3],
                value: src[4],
            };

            if frame.checksum() != src[5] {
                debug!("Dropping byte, checksum mismatch for {:02x?}", &src[..FRAME_LEN]);
                src.advance(1);
                continue;
            }

            src.advance(FRAME_LEN);
            return Ok(Some(frame));
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(FRAME_LEN);
        dst.put_u8(DOMAIN);
        dst.put_u8(frame.sender);
        dst.put_u8(frame.receiver);
        dst.put_u8(frame.register);
        dst.put_u8(frame.value);
        dst.put_u8(frame.checksum());
        Ok(())
    }
}
