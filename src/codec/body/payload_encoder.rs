use crate::codec::body::chunked_encoder::ChunkedEncoder;
use crate::codec::body::length_encoder::LengthEncoder;
use crate::protocol::{PayloadItem, PayloadSize, SendError};
use bytes::BytesMut;

use tokio_util::codec::Encoder;

/// Frames outbound response payloads according to the chosen wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEncoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    /// content-length payload
    Length(LengthEncoder),

    /// transfer-encoding chunked payload
    Chunked(ChunkedEncoder),

    /// no body at all
    NoBody,
}

impl PayloadEncoder {
    pub fn empty() -> Self {
        Self { kind: Kind::NoBody }
    }

    pub fn chunked() -> Self {
        Self { kind: Kind::Chunked(ChunkedEncoder::new()) }
    }

    pub fn fix_length(size: u64) -> Self {
        Self { kind: Kind::Length(LengthEncoder::new(size)) }
    }

    /// True once every byte the response head promised has been framed.
    pub fn is_finish(&self) -> bool {
        match &self.kind {
            Kind::Length(encoder) => encoder.is_finish(),
            Kind::Chunked(encoder) => encoder.is_finish(),
            Kind::NoBody => true,
        }
    }
}

impl From<PayloadSize> for PayloadEncoder {
    fn from(size: PayloadSize) -> Self {
        match size {
            PayloadSize::Length(n) => PayloadEncoder::fix_length(n),
            PayloadSize::Chunked => PayloadEncoder::chunked(),
            PayloadSize::Empty => PayloadEncoder::empty(),
        }
    }
}

impl Encoder<PayloadItem> for PayloadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match &mut self.kind {
            Kind::Length(encoder) => encoder.encode(item, dst),
            Kind::Chunked(encoder) => encoder.encode(item, dst),
            Kind::NoBody => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn length_framing_reports_completion() {
        let mut encoder = PayloadEncoder::from(PayloadSize::Length(4));
        let mut dst = BytesMut::new();

        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"ab")), &mut dst).unwrap();
        assert!(!encoder.is_finish());

        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"cd")), &mut dst).unwrap();
        encoder.encode(PayloadItem::Eof, &mut dst).unwrap();
        assert!(encoder.is_finish());
        assert_eq!(&dst[..], b"abcd");
    }

    #[test]
    fn short_body_is_not_finished_at_eof() {
        let mut encoder = PayloadEncoder::from(PayloadSize::Length(10));
        let mut dst = BytesMut::new();

        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"short")), &mut dst).unwrap();
        encoder.encode(PayloadItem::Eof, &mut dst).unwrap();
        assert!(!encoder.is_finish());
    }

    #[test]
    fn chunked_framing_finishes_on_the_zero_chunk() {
        let mut encoder = PayloadEncoder::from(PayloadSize::Chunked);
        let mut dst = BytesMut::new();

        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"x")), &mut dst).unwrap();
        assert!(!encoder.is_finish());
        encoder.encode(PayloadItem::Eof, &mut dst).unwrap();
        assert!(encoder.is_finish());
    }

    #[test]
    fn empty_framing_is_always_finished() {
        assert!(PayloadEncoder::from(PayloadSize::Empty).is_finish());
    }
}
