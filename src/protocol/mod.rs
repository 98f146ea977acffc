//! Shared protocol vocabulary: message/payload types and the error taxonomy.

mod error;
mod message;

pub use error::{ParseError, SendError, ServerError};
pub use message::{Message, PayloadItem, PayloadSize, ResponseHead};
