//! Wire codecs: request-head parsing, body framing and response
//! serialization, all built on `tokio_util::codec`.

pub(crate) mod body;
mod header_decoder;
mod header_encoder;
mod request_decoder;

pub use body::PayloadEncoder;
pub use header_encoder::HeaderEncoder;
pub use request_decoder::RequestDecoder;
