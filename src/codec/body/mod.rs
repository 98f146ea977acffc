//! Wire framing for message bodies.
//!
//! Two strategies on each side: fixed `Content-Length` runs and chunked
//! transfer encoding, coordinated by [`PayloadDecoder`] / [`PayloadEncoder`].

pub(crate) mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;

pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
