//! NUL-delimited JSON frame codec
//!
//! Every frame on the streaming endpoint is a JSON object followed by a single
//! `\0` byte. Chunk boundaries of the underlying HTTP body are arbitrary, so
//! the decoder buffers until a delimiter shows up.

use crate::GenerationFrame;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Byte separating frames on the wire.
pub const FRAME_DELIMITER: u8 = b'\0';

#[derive(Error, Debug)]
pub enum FrameCodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Codec for the frame stream.
#[derive(Debug, Clone, Default)]
pub struct NulFrameCodec {
    /// Bytes already scanned for a delimiter.
    next_index: usize,
}

impl NulFrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_blank(payload: &[u8]) -> bool {
    payload.iter().all(u8::is_ascii_whitespace)
}

impl Decoder for NulFrameCodec {
    type Item = GenerationFrame;
    type Error = FrameCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(offset) = buf[self.next_index..]
                .iter()
                .position(|b| *b == FRAME_DELIMITER)
            else {
                self.next_index = buf.len();
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;
            let chunk = buf.split_to(end + 1);
            let payload = &chunk[..end];

            if is_blank(payload) {
                continue;
            }
            return Ok(Some(serde_json::from_slice(payload)?));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        self.next_index = 0;
        let rest = buf.split();
        if is_blank(&rest) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&rest)?))
    }
}

impl Encoder<GenerationFrame> for NulFrameCodec {
    type Error = FrameCodecError;

    fn encode(&mut self, item: GenerationFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        serde_json::to_writer(dst.writer(), &item)?;
        dst.put_u8(FRAME_DELIMITER);
        Ok(())
    }
}

/// Encode a single frame into an owned buffer, delimiter included.
pub fn encode_frame(frame: &GenerationFrame) -> Result<Bytes, FrameCodecError> {
    let mut buf = BytesMut::new();
    NulFrameCodec::new().encode(frame.clone(), &mut buf)?;
    Ok(buf.freeze())
}
