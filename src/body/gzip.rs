//! Gzip stages for the body pipeline.
//!
//! [`GzipBodyDecoder`] sits ahead of a request's body sink when the request
//! declares `Content-Encoding: gzip`; [`GzipBodyEncoder`] wraps a response's
//! body reader when gzip content encoding is enabled. Compressed output size
//! is unpredictable, so enabling the encoder forces the response's content
//! length to unknown and therefore chunked transfer on the wire.

use std::io;
use std::io::Write;

use bytes::Bytes;
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use tracing::trace;

use crate::body::{BodyReader, BodyWriter, Collector};

/// Writer-side decorator that inflates `Content-Encoding: gzip` request
/// bodies before forwarding them to the inner sink.
pub struct GzipBodyDecoder<W> {
    decoder: GzDecoder<Collector>,
    inner: W,
}

impl<W: BodyWriter> GzipBodyDecoder<W> {
    pub fn new(inner: W) -> Self {
        Self { decoder: GzDecoder::new(Collector::new()), inner }
    }

    fn forward(&mut self) -> io::Result<()> {
        let inflated = self.decoder.get_mut().take();
        if !inflated.is_empty() {
            self.inner.write(&inflated)?;
        }
        Ok(())
    }
}

impl<W: BodyWriter> BodyWriter for GzipBodyDecoder<W> {
    fn open(&mut self) -> io::Result<()> {
        self.inner.open()
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.decoder.write_all(data)?;
        self.forward()
    }

    fn close(&mut self) -> io::Result<()> {
        self.decoder.try_finish()?;
        self.forward()?;
        self.inner.close()
    }
}

/// Reader-side decorator that deflates the inner reader's output.
pub struct GzipBodyEncoder {
    encoder: GzEncoder<Collector>,
    inner: Box<dyn BodyReader>,
    input_eof: bool,
    finalized: bool,
}

impl GzipBodyEncoder {
    pub fn new(inner: Box<dyn BodyReader>) -> Self {
        Self {
            encoder: GzEncoder::new(Collector::new(), Compression::default()),
            inner,
            input_eof: false,
            finalized: false,
        }
    }
}

impl BodyReader for GzipBodyEncoder {
    fn open(&mut self) -> io::Result<()> {
        self.inner.open()
    }

    fn read(&mut self) -> io::Result<Bytes> {
        loop {
            if !self.encoder.get_ref().is_empty() {
                return Ok(self.encoder.get_mut().take());
            }

            if self.input_eof {
                if self.finalized {
                    return Ok(Bytes::new());
                }
                self.encoder.try_finish()?;
                self.finalized = true;
                return Ok(self.encoder.get_mut().take());
            }

            let data = self.inner.read()?;
            if data.is_empty() {
                self.input_eof = true;
                continue;
            }
            trace!(len = data.len(), "compressing body chunk");
            self.encoder.write_all(&data)?;
        }
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::DataReader;
    use std::io::Read;

    struct CollectingSink {
        data: Vec<u8>,
        opened: bool,
        closed: bool,
    }

    impl CollectingSink {
        fn new() -> Self {
            Self { data: Vec::new(), opened: false, closed: false }
        }
    }

    impl BodyWriter for CollectingSink {
        fn open(&mut self) -> io::Result<()> {
            self.opened = true;
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> io::Result<()> {
            self.data.extend_from_slice(data);
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    fn gzip_compress(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn decoder_inflates_fragmented_input() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let compressed = gzip_compress(&payload);

        let mut decoder = GzipBodyDecoder::new(CollectingSink::new());
        decoder.open().unwrap();
        for piece in compressed.chunks(13) {
            decoder.write(piece).unwrap();
        }
        decoder.close().unwrap();

        assert!(decoder.inner.opened);
        assert!(decoder.inner.closed);
        assert_eq!(decoder.inner.data, payload);
    }

    #[test]
    fn decoder_rejects_garbage() {
        let mut decoder = GzipBodyDecoder::new(CollectingSink::new());
        decoder.open().unwrap();
        let result = decoder.write(b"this is definitely not a gzip stream").and_then(|_| decoder.close());
        assert!(result.is_err());
    }

    #[test]
    fn encoder_round_trips() {
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 7) as u8).collect();

        let mut encoder = GzipBodyEncoder::new(Box::new(DataReader::new(Bytes::from(payload.clone()))));
        encoder.open().unwrap();

        let mut compressed = Vec::new();
        loop {
            let chunk = encoder.read().unwrap();
            if chunk.is_empty() {
                break;
            }
            compressed.extend_from_slice(&chunk);
        }
        encoder.close();

        let mut inflated = Vec::new();
        flate2::read::GzDecoder::new(&compressed[..]).read_to_end(&mut inflated).unwrap();
        assert_eq!(inflated, payload);
    }
}
