use crate::protocol::{PayloadItem, SendError};
use bytes::BytesMut;
use tokio_util::codec::Encoder;
use tracing::warn;

/// Copies outbound payload bytes through verbatim, up to the declared
/// content length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthEncoder {
    remaining: u64,
}

impl LengthEncoder {
    pub fn new(length: u64) -> Self {
        Self { remaining: length }
    }

    pub fn is_finish(&self) -> bool {
        self.remaining == 0
    }
}

impl Encoder<PayloadItem> for LengthEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.remaining == 0 {
            if item.is_chunk() {
                warn!("encode payload_item but declared length already written");
            }
            return Ok(());
        }

        match item {
            PayloadItem::Chunk(bytes) => {
                if bytes.is_empty() {
                    return Ok(());
                }
                if bytes.len() as u64 > self.remaining {
                    return Err(SendError::invalid_body("body exceeds declared content-length"));
                }
                dst.extend_from_slice(&bytes);
                self.remaining -= bytes.len() as u64;
                Ok(())
            }
            PayloadItem::Eof => Ok(()),
        }
    }
}
