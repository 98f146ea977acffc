//! An embeddable async HTTP/1.1 server engine built on tokio.
//!
//! The engine accepts TCP connections (IPv4 and best-effort IPv6), parses
//! requests with zero-copy header decoding, routes them through an
//! application-registered handler list (most recently registered wins) and
//! streams responses back with keep-alive, chunked transfer encoding, gzip
//! in both directions, byte ranges, conditional GET and Basic/Digest
//! authentication.
//!
//! Handlers are registered while the server is stopped; `start` freezes the
//! configuration and shares it immutably with every connection task.
//!
//! ```no_run
//! use futures::FutureExt;
//! use hearth_http::{RequestBodyKind, Response, Server, ServerOptions};
//! use http::Method;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut server = Server::new(ServerOptions::default());
//!     server.add_handler_for_method_path(
//!         Method::GET,
//!         "/hello",
//!         RequestBodyKind::None,
//!         Box::new(|_request| async { Some(Response::text("hello world")) }.boxed()),
//!     );
//!     let port = server.start().await.unwrap();
//!     println!("listening on port {port}");
//!     futures::future::pending::<()>().await;
//! }
//! ```

pub mod auth;
pub mod body;
pub(crate) mod codec;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod request;
pub mod response;
pub mod server;
pub mod util;

pub use auth::{AuthenticationScheme, Authenticator};
pub use body::multipart::MultiPart;
pub use body::{BodyReader, BodyWriter};
pub use connection::{ConnectionHooks, RequestSnapshot};
pub use handler::{Handler, MatchFn, ProcessFn};
pub use protocol::ServerError;
pub use request::{ByteRange, Request, RequestBodyKind, RequestHead};
pub use response::{AsyncChunkFn, Response, ResponseBody};
pub use server::{
    AuthenticationConfig, BonjourConfig, Server, ServerDelegate, ServerOptions, ServiceRegistrar,
};
