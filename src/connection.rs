//! Per-connection state machine.
//!
//! Each accepted socket is served by one task that runs requests strictly
//! in sequence: headers are parsed, the body is streamed through the
//! matched request's writer chain, authentication runs, the handler
//! produces a response and the response is written before the next header
//! block is touched. Parse failures abort the connection with a minimal
//! status-line response; handler execution has no server-side timeout.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use futures::StreamExt;
use http::{HeaderValue, Method, StatusCode, Uri, Version};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, error, info, warn};

use crate::body::gzip::{GzipBodyDecoder, GzipBodyEncoder};
use crate::body::{BodyReader, BodyWriter};
use crate::codec::{HeaderEncoder, PayloadEncoder, RequestDecoder};
use crate::protocol::{ParseError, PayloadItem, PayloadSize, ResponseHead, SendError};
use crate::request::{Request, RequestHead};
use crate::response::{Response, ResponseBody};
use crate::server::ServerContext;
use crate::util;

/// Request facts that survive handing the [`Request`] to its handler,
/// needed afterwards for response override and body suppression.
pub struct RequestSnapshot {
    method: Method,
    path: String,
    mapped_from_head: bool,
    if_none_match: Option<String>,
    if_modified_since: Option<SystemTime>,
    accepts_gzip: bool,
    keep_alive: bool,
}

impl RequestSnapshot {
    fn capture(head: &RequestHead, request: &Request, keep_alive: bool) -> Self {
        Self {
            method: head.method().clone(),
            path: head.path().to_string(),
            mapped_from_head: head.mapped_from_head(),
            if_none_match: request.if_none_match().map(str::to_string),
            if_modified_since: request.if_modified_since(),
            accepts_gzip: request.accepts_gzip(),
            keep_alive,
        }
    }

    /// The matched method, after any HEAD to GET mapping.
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mapped_from_head(&self) -> bool {
        self.mapped_from_head
    }

    pub fn if_none_match(&self) -> Option<&str> {
        self.if_none_match.as_deref()
    }

    pub fn if_modified_since(&self) -> Option<SystemTime> {
        self.if_modified_since
    }

    pub fn accepts_gzip(&self) -> bool {
        self.accepts_gzip
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    fn is_get_or_head(&self) -> bool {
        self.mapped_from_head || self.method == Method::GET || self.method == Method::HEAD
    }

    fn suppresses_response_body(&self) -> bool {
        self.mapped_from_head || self.method == Method::HEAD
    }
}

/// Per-connection override points for embedders, the moral equivalent of
/// subclassing the connection. All methods have pass-through defaults.
pub trait ConnectionHooks: Send + Sync {
    /// Veto point right after accept; `false` closes the socket with no
    /// request processing at all.
    fn should_open(&self, _peer: SocketAddr) -> bool {
        true
    }

    /// May replace the request URI before handler matching.
    fn rewrite_request_uri(&self, _head: &RequestHead) -> Option<Uri> {
        None
    }

    /// Extra preflight after authentication; a response short-circuits the
    /// handler.
    fn preflight(&self, _request: &Request) -> Option<Response> {
        None
    }

    /// Last chance to replace the response before it is written. Runs
    /// after the built-in conditional-GET downgrade.
    fn override_response(&self, response: Response, _request: &RequestSnapshot) -> Response {
        response
    }

    fn did_abort(&self, _status: StatusCode) {}

    /// Called once when the connection closes, with cumulative wire byte
    /// counts.
    fn did_close(&self, _bytes_read: u64, _bytes_written: u64) {}
}

enum Flow {
    KeepAlive,
    Close,
}

enum BodyError {
    Parse(ParseError),
    Sink(io::Error),
}

pub(crate) struct Connection {
    context: Arc<ServerContext>,
    reader: FramedRead<OwnedReadHalf, RequestDecoder>,
    writer: OwnedWriteHalf,
    peer_addr: SocketAddr,
    bytes_read: u64,
    bytes_written: u64,
}

impl Connection {
    pub(crate) fn new(context: Arc<ServerContext>, stream: TcpStream, peer_addr: SocketAddr) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            context,
            reader: FramedRead::new(read_half, RequestDecoder::new()),
            writer: write_half,
            peer_addr,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub(crate) async fn serve(mut self) {
        if let Some(hooks) = &self.context.hooks {
            if !hooks.should_open(self.peer_addr) {
                debug!(peer = %self.peer_addr, "connection vetoed by open hook");
                return;
            }
        }
        self.context.connection_opened();
        debug!(peer = %self.peer_addr, "connection open");

        loop {
            match self.handle_one().await {
                Flow::KeepAlive => {}
                Flow::Close => break,
            }
        }

        let _ = self.writer.shutdown().await;
        if let Some(hooks) = &self.context.hooks {
            hooks.did_close(self.bytes_read, self.bytes_written);
        }
        debug!(
            peer = %self.peer_addr,
            bytes_read = self.bytes_read,
            bytes_written = self.bytes_written,
            "connection closed"
        );
        self.context.connection_closed();
    }

    async fn handle_one(&mut self) -> Flow {
        let context = Arc::clone(&self.context);

        let (mut head, payload_size) = match self.reader.next().await {
            None => return Flow::Close,
            Some(Err(error)) => {
                let status = match error {
                    ParseError::TooLargeHeader { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                    ParseError::Io { ref source } => {
                        debug!(peer = %self.peer_addr, error = %source, "read failed");
                        return Flow::Close;
                    }
                    _ => StatusCode::BAD_REQUEST,
                };
                warn!(peer = %self.peer_addr, error = %error, "malformed request");
                self.abort(status).await;
                return Flow::Close;
            }
            Some(Ok(crate::protocol::Message::Header(parts))) => parts,
            Some(Ok(crate::protocol::Message::Payload(_))) => {
                error!(peer = %self.peer_addr, "payload before header block");
                return Flow::Close;
            }
        };
        self.bytes_read += head.header_block_size() as u64;

        if let Some(hooks) = &context.hooks {
            if let Some(uri) = hooks.rewrite_request_uri(&head) {
                debug!(from = %head.uri(), to = %uri, "request uri rewritten");
                head.set_uri(uri);
            }
        }
        if context.map_head_to_get && head.method() == Method::HEAD {
            head.map_to_get();
        }

        let keep_alive = wants_keep_alive(&head);

        let matched = context
            .handlers
            .iter()
            .enumerate()
            .rev()
            .find_map(|(index, handler)| handler.claim(&head).map(|request| (index, request)));
        let Some((handler_index, mut request)) = matched else {
            info!(method = %head.method(), path = %head.path(), "no handler matched");
            self.abort(StatusCode::NOT_IMPLEMENTED).await;
            return Flow::Close;
        };

        info!(method = %head.method(), path = %head.path(), "request");
        let snapshot = RequestSnapshot::capture(&head, &request, keep_alive);

        let body_result = if payload_size == PayloadSize::Empty {
            self.drain_empty_payload().await
        } else if request_is_gzip_encoded(&head) {
            let mut decoder = GzipBodyDecoder::new(&mut request);
            self.read_body(&mut decoder).await
        } else {
            self.read_body(&mut request).await
        };
        match body_result {
            Ok(()) => {}
            Err(BodyError::Parse(error)) => {
                warn!(peer = %self.peer_addr, error = %error, "malformed request body");
                self.abort(StatusCode::BAD_REQUEST).await;
                return Flow::Close;
            }
            Err(BodyError::Sink(error)) => {
                warn!(peer = %self.peer_addr, error = %error, "request body sink failed");
                self.abort(StatusCode::INTERNAL_SERVER_ERROR).await;
                return Flow::Close;
            }
        }

        let mut preflight = context.authenticator.as_ref().and_then(|auth| auth.check(&head));
        if preflight.is_none() {
            if let Some(hooks) = &context.hooks {
                preflight = hooks.preflight(&request);
            }
        }

        let response = match preflight {
            Some(response) => response,
            None => match context.handlers[handler_index].process(request).await {
                Some(response) => response,
                None => {
                    warn!(path = %snapshot.path, "handler produced no response");
                    Response::error_html(StatusCode::INTERNAL_SERVER_ERROR, "handler produced no response")
                }
            },
        };

        let mut response = apply_conditional_get(response, &snapshot);
        if let Some(hooks) = &context.hooks {
            response = hooks.override_response(response, &snapshot);
        }

        let status = response.status();
        if let Err(error) = self.write_response(response, &snapshot, keep_alive).await {
            warn!(peer = %self.peer_addr, error = %error, "failed to write response");
            return Flow::Close;
        }
        info!(status = %status, path = %snapshot.path, "response");

        if keep_alive {
            Flow::KeepAlive
        } else {
            Flow::Close
        }
    }

    /// A bodyless request still yields one end-of-payload marker from the
    /// decoder; consume it without touching the request's writer chain.
    async fn drain_empty_payload(&mut self) -> Result<(), BodyError> {
        match self.reader.next().await {
            Some(Ok(crate::protocol::Message::Payload(PayloadItem::Eof))) => Ok(()),
            Some(Err(error)) => Err(BodyError::Parse(error)),
            None => Err(BodyError::Parse(ParseError::io(unexpected_eof()))),
            Some(Ok(_)) => Err(BodyError::Parse(ParseError::invalid_body("unexpected frame in empty payload"))),
        }
    }

    async fn read_body<W: BodyWriter>(&mut self, writer: &mut W) -> Result<(), BodyError> {
        writer.open().map_err(BodyError::Sink)?;
        loop {
            match self.reader.next().await {
                None => return Err(BodyError::Parse(ParseError::io(unexpected_eof()))),
                Some(Err(error)) => return Err(BodyError::Parse(error)),
                Some(Ok(crate::protocol::Message::Payload(PayloadItem::Chunk(chunk)))) => {
                    self.bytes_read += chunk.len() as u64;
                    writer.write(&chunk).map_err(BodyError::Sink)?;
                }
                Some(Ok(crate::protocol::Message::Payload(PayloadItem::Eof))) => {
                    writer.close().map_err(BodyError::Sink)?;
                    return Ok(());
                }
                Some(Ok(crate::protocol::Message::Header(_))) => {
                    return Err(BodyError::Parse(ParseError::invalid_body("header block inside payload")));
                }
            }
        }
    }

    async fn write_response(
        &mut self,
        mut response: Response,
        snapshot: &RequestSnapshot,
        keep_alive: bool,
    ) -> Result<(), SendError> {
        if response.gzip_enabled() && snapshot.accepts_gzip() && response.body_is_async() {
            debug!(path = %snapshot.path(), "gzip requested but the body is an async stream, sending uncompressed");
        }
        let gzip = response.gzip_enabled()
            && snapshot.accepts_gzip()
            && response.has_body()
            && !response.body_is_async();
        let payload_size = if gzip { PayloadSize::Chunked } else { response.payload_size() };

        let head = self.build_head(&response, gzip, keep_alive);
        let mut buffer = BytesMut::with_capacity(512);
        HeaderEncoder.encode((head, payload_size), &mut buffer)?;
        self.write_buffer(&mut buffer).await?;

        let suppress = snapshot.suppresses_response_body();
        match response.take_body() {
            ResponseBody::Empty => Ok(()),
            ResponseBody::Reader(reader) => {
                let reader: Box<dyn BodyReader> =
                    if gzip { Box::new(GzipBodyEncoder::new(reader)) } else { reader };
                self.stream_reader(reader, payload_size, suppress).await
            }
            ResponseBody::AsyncStream(mut chunk_fn) => {
                if suppress {
                    return Ok(());
                }
                let mut encoder = PayloadEncoder::from(payload_size);
                let mut buffer = BytesMut::with_capacity(8 * 1024);
                loop {
                    let chunk = chunk_fn().await.map_err(SendError::io)?;
                    if chunk.is_empty() {
                        encoder.encode(PayloadItem::Eof, &mut buffer)?;
                        if !encoder.is_finish() {
                            return Err(SendError::invalid_body("body ended short of declared content-length"));
                        }
                        self.write_buffer(&mut buffer).await?;
                        return Ok(());
                    }
                    encoder.encode(PayloadItem::Chunk(chunk), &mut buffer)?;
                    self.write_buffer(&mut buffer).await?;
                }
            }
        }
    }

    async fn stream_reader(
        &mut self,
        mut reader: Box<dyn BodyReader>,
        payload_size: PayloadSize,
        suppress: bool,
    ) -> Result<(), SendError> {
        if suppress {
            reader.close();
            return Ok(());
        }
        if let Err(error) = reader.open() {
            reader.close();
            return Err(SendError::io(error));
        }
        let mut encoder = PayloadEncoder::from(payload_size);
        let mut buffer = BytesMut::with_capacity(8 * 1024);
        let result = loop {
            let chunk = match reader.read() {
                Ok(chunk) => chunk,
                Err(error) => break Err(SendError::io(error)),
            };
            if chunk.is_empty() {
                if let Err(error) = encoder.encode(PayloadItem::Eof, &mut buffer) {
                    break Err(error);
                }
                if !encoder.is_finish() {
                    break Err(SendError::invalid_body("body ended short of declared content-length"));
                }
                break self.write_buffer(&mut buffer).await;
            }
            if let Err(error) = encoder.encode(PayloadItem::Chunk(chunk), &mut buffer) {
                break Err(error);
            }
            if let Err(error) = self.write_buffer(&mut buffer).await {
                break Err(error);
            }
        };
        reader.close();
        result
    }

    fn build_head(&self, response: &Response, gzip: bool, keep_alive: bool) -> ResponseHead {
        let mut head = ResponseHead::new(());
        *head.status_mut() = response.status();
        *head.version_mut() = Version::HTTP_11;
        let headers = head.headers_mut();

        if let Ok(value) = HeaderValue::from_str(&self.context.server_name) {
            headers.insert(http::header::SERVER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&util::format_rfc822(SystemTime::now())) {
            headers.insert(http::header::DATE, value);
        }
        headers.insert(
            http::header::CONNECTION,
            HeaderValue::from_static(if keep_alive { "keep-alive" } else { "close" }),
        );

        let cache_control = if response.cache_control_max_age() > 0 {
            format!("max-age={}, public", response.cache_control_max_age())
        } else {
            "no-cache".to_string()
        };
        if let Ok(value) = HeaderValue::from_str(&cache_control) {
            headers.insert(http::header::CACHE_CONTROL, value);
        }
        if let Some(date) = response.last_modified() {
            if let Ok(value) = HeaderValue::from_str(&util::format_rfc822(date)) {
                headers.insert(http::header::LAST_MODIFIED, value);
            }
        }
        if let Some(etag) = response.etag() {
            if let Ok(value) = HeaderValue::from_str(etag) {
                headers.insert(http::header::ETAG, value);
            }
        }
        if let Some(content_type) = response.content_type() {
            if let Ok(value) = HeaderValue::from_str(content_type) {
                headers.insert(http::header::CONTENT_TYPE, value);
            }
        }
        if gzip {
            headers.insert(http::header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
        for (name, value) in response.additional_headers() {
            headers.append(name.clone(), value.clone());
        }
        head
    }

    /// Status line plus minimal headers, no body; used on every failure
    /// path reached without a complete response.
    async fn abort(&mut self, status: StatusCode) {
        let mut head = ResponseHead::new(());
        *head.status_mut() = status;
        *head.version_mut() = Version::HTTP_11;
        let headers = head.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&self.context.server_name) {
            headers.insert(http::header::SERVER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&util::format_rfc822(SystemTime::now())) {
            headers.insert(http::header::DATE, value);
        }
        headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));

        let mut buffer = BytesMut::with_capacity(128);
        if HeaderEncoder.encode((head, PayloadSize::Empty), &mut buffer).is_ok() {
            let _ = self.write_buffer(&mut buffer).await;
        }
        if let Some(hooks) = &self.context.hooks {
            hooks.did_abort(status);
        }
    }

    async fn write_buffer(&mut self, buffer: &mut BytesMut) -> Result<(), SendError> {
        if buffer.is_empty() {
            return Ok(());
        }
        self.writer.write_all(buffer).await.map_err(SendError::io)?;
        self.bytes_written += buffer.len() as u64;
        buffer.clear();
        Ok(())
    }
}

fn unexpected_eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-request")
}

fn request_is_gzip_encoded(head: &RequestHead) -> bool {
    head.headers()
        .get(http::header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().eq_ignore_ascii_case("gzip"))
        .unwrap_or(false)
}

fn wants_keep_alive(head: &RequestHead) -> bool {
    let connection = head
        .headers()
        .get(http::header::CONNECTION)
        .and_then(|value| value.to_str().ok());
    let has_token = |token: &str| {
        connection
            .map(|value| value.split(',').any(|piece| piece.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    };
    match head.version() {
        Version::HTTP_11 => !has_token("close"),
        Version::HTTP_10 => has_token("keep-alive"),
        _ => false,
    }
}

/// Downgrades a successful response whose validators match the request's
/// conditional headers: 304 for GET and HEAD, 412 for everything else.
/// Cache metadata survives onto the replacement.
fn apply_conditional_get(response: Response, snapshot: &RequestSnapshot) -> Response {
    if !response.status().is_success() {
        return response;
    }

    let etag_match = match (snapshot.if_none_match(), response.etag()) {
        (Some(requested), Some(current)) => requested == current,
        _ => false,
    };
    // last-modified compares at one second granularity after RFC 822 parsing
    let date_match = !etag_match
        && match (snapshot.if_modified_since(), response.last_modified()) {
            (Some(since), Some(modified)) => whole_seconds(modified) <= whole_seconds(since),
            _ => false,
        };
    if !etag_match && !date_match {
        return response;
    }

    let status = if snapshot.is_get_or_head() {
        StatusCode::NOT_MODIFIED
    } else {
        StatusCode::PRECONDITION_FAILED
    };
    let mut replacement = Response::with_status(status);
    replacement.set_cache_control_max_age(response.cache_control_max_age());
    if let Some(date) = response.last_modified() {
        replacement.set_last_modified(date);
    }
    if let Some(etag) = response.etag() {
        replacement.set_etag(etag);
    }
    replacement
}

fn whole_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|duration| duration.as_secs()).unwrap_or(0)
}
