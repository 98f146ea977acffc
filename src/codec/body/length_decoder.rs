//! Decoder for request bodies framed by a `Content-Length` header
//! ([RFC 7230 section 3.3.2](https://tools.ietf.org/html/rfc7230#section-3.3.2)).

use std::cmp;

use crate::protocol::{ParseError, PayloadItem};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Tracks the number of body bytes still owed by the peer and slices them
/// out of the read buffer as they arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthDecoder {
    remaining: u64,
}

impl LengthDecoder {
    pub fn new(length: u64) -> Self {
        Self { remaining: length }
    }
}

impl Decoder for LengthDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.remaining == 0 {
            return Ok(Some(PayloadItem::Eof));
        }

        if src.is_empty() {
            return Ok(None);
        }

        let len = cmp::min(self.remaining, src.len() as u64);
        let bytes = src.split_to(len as usize).freeze();

        self.remaining -= bytes.len() as u64;
        Ok(Some(PayloadItem::Chunk(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_at_declared_length() {
        let mut buffer: BytesMut = BytesMut::from(&b"0123456789extra"[..]);

        let mut decoder = LengthDecoder::new(10);
        let payload = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(payload.is_chunk());
        assert_eq!(&payload.as_bytes().unwrap()[..], b"0123456789");
        assert_eq!(&buffer[..], b"extra");

        let eof = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(eof.is_eof());
    }

    #[test]
    fn accumulates_fragmented_chunks() {
        let mut decoder = LengthDecoder::new(8);
        let mut collected = Vec::new();

        for fragment in [&b"ab"[..], &b"cde"[..], &b"fgh"[..]] {
            let mut buffer = BytesMut::from(fragment);
            while let Some(item) = decoder.decode(&mut buffer).unwrap() {
                match item {
                    PayloadItem::Chunk(bytes) => collected.extend_from_slice(&bytes),
                    PayloadItem::Eof => break,
                }
            }
        }

        assert_eq!(collected, b"abcdefgh");
    }
}
