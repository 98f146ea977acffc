//! Incoming request model: the parsed head handed to handler matching and
//! the [`Request`] a matched handler receives, including its body storage.
//!
//! A `Request` is the terminal [`BodyWriter`] of the inbound pipeline; the
//! registered body kind decides where bytes land: discarded, accumulated
//! in memory, spooled to a temp file, or decoded as form data.

use std::collections::HashMap;
use std::io;
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;

use bytes::BytesMut;
use http::{HeaderMap, Method, Uri, Version};
use tempfile::NamedTempFile;

use crate::body::multipart::{MultiPart, MultiPartDecoder};
use crate::body::BodyWriter;
use crate::util;

/// A parsed `Range` header, `bytes` unit only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=start-end`, both inclusive
    FromTo(u64, u64),
    /// `bytes=start-`, from an offset to the end
    From(u64),
    /// `bytes=-n`, the last `n` bytes
    Suffix(u64),
}

impl ByteRange {
    /// Parses a `Range` header value. Multi-range requests and non-byte
    /// units are treated as absent.
    pub fn parse(value: &str) -> Option<Self> {
        let spec = value.trim().strip_prefix("bytes=")?.trim();
        if spec.contains(',') {
            return None;
        }
        let (start, end) = spec.split_once('-')?;
        let (start, end) = (start.trim(), end.trim());
        match (start.is_empty(), end.is_empty()) {
            (true, false) => Some(ByteRange::Suffix(end.parse().ok()?)),
            (false, true) => Some(ByteRange::From(start.parse().ok()?)),
            (false, false) => {
                let (start, end) = (start.parse().ok()?, end.parse().ok()?);
                if start > end {
                    return None;
                }
                Some(ByteRange::FromTo(start, end))
            }
            (true, true) => None,
        }
    }

    /// Resolves the range against a resource of `size` bytes into an
    /// `(offset, length)` window, or `None` when unsatisfiable.
    pub fn resolve(&self, size: u64) -> Option<(u64, u64)> {
        let (offset, length) = match *self {
            ByteRange::FromTo(start, end) => (start, end.saturating_sub(start) + 1),
            ByteRange::From(start) => (start, size.saturating_sub(start)),
            ByteRange::Suffix(n) => (size.saturating_sub(n), n.min(size)),
        };
        if offset >= size || length == 0 {
            return None;
        }
        Some((offset, length.min(size - offset)))
    }
}

/// The request line and headers, parsed before handler matching.
#[derive(Debug, Clone)]
pub struct RequestHead {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    path: String,
    query: HashMap<String, String>,
    header_block_size: usize,
    mapped_from_head: bool,
}

impl RequestHead {
    pub(crate) fn new(method: Method, uri: Uri, version: Version, headers: HeaderMap, header_block_size: usize) -> Self {
        let (path, query) = split_uri(&uri);
        Self { method, uri, version, headers, path, query, header_block_size, mapped_from_head: false }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The percent-decoded request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Decoded query string arguments.
    pub fn query(&self) -> &HashMap<String, String> {
        &self.query
    }

    /// Size in bytes of the request line plus headers on the wire.
    pub fn header_block_size(&self) -> usize {
        self.header_block_size
    }

    /// Replaces the request URI; used by the URL rewrite hook before
    /// handler matching.
    pub fn set_uri(&mut self, uri: Uri) {
        let (path, query) = split_uri(&uri);
        self.uri = uri;
        self.path = path;
        self.query = query;
    }

    /// Rewrites a HEAD request to GET for handler matching, remembering
    /// that the response body must be suppressed.
    pub(crate) fn map_to_get(&mut self) {
        self.method = Method::GET;
        self.mapped_from_head = true;
    }

    /// True when this request arrived as HEAD and was mapped to GET.
    pub fn mapped_from_head(&self) -> bool {
        self.mapped_from_head
    }

    fn header_str(&self, name: http::header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

fn split_uri(uri: &Uri) -> (String, HashMap<String, String>) {
    let path = util::unescape_url_string(uri.path()).unwrap_or_else(|| uri.path().to_string());
    let query = uri.query().map(util::parse_url_encoded_form).unwrap_or_default();
    (path, query)
}

/// How a handler wants the request body captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestBodyKind {
    /// Body bytes are read and discarded
    None,
    /// Body accumulates in memory
    Data,
    /// Body spools to a uniquely-named temp file
    File,
    /// `multipart/form-data` decoded into parts
    MultiPartForm,
    /// `application/x-www-form-urlencoded` decoded into arguments
    UrlEncodedForm,
}

enum RequestBody {
    None,
    Data(BytesMut),
    File(Option<NamedTempFile>),
    MultiPartForm(MultiPartDecoder),
    UrlEncodedForm(BytesMut),
}

/// A matched request: head metadata captured once at construction plus the
/// body storage declared by its handler.
pub struct Request {
    head: RequestHead,
    content_type: Option<String>,
    content_length: Option<u64>,
    if_modified_since: Option<SystemTime>,
    if_none_match: Option<String>,
    byte_range: Option<ByteRange>,
    accepts_gzip: bool,
    captures: Vec<String>,
    body: RequestBody,
}

impl Request {
    /// Builds a request around a matched head. Returns `None` when the
    /// body kind's preconditions do not hold, e.g. a multipart kind
    /// without a parseable boundary.
    pub fn new(head: RequestHead, kind: RequestBodyKind) -> Option<Self> {
        let content_type = head.header_str(http::header::CONTENT_TYPE).map(str::to_string);
        let content_length =
            head.header_str(http::header::CONTENT_LENGTH).and_then(|value| value.trim().parse().ok());
        let if_modified_since =
            head.header_str(http::header::IF_MODIFIED_SINCE).and_then(util::parse_rfc822);
        let if_none_match = head.header_str(http::header::IF_NONE_MATCH).map(str::to_string);
        let byte_range = head.header_str(http::header::RANGE).and_then(ByteRange::parse);
        let accepts_gzip = head
            .header_str(http::header::ACCEPT_ENCODING)
            .map(|value| value.split(',').any(|token| token.trim().eq_ignore_ascii_case("gzip")))
            .unwrap_or(false);

        let body = match kind {
            RequestBodyKind::None => RequestBody::None,
            RequestBodyKind::Data => RequestBody::Data(buffer_for(content_length)),
            RequestBodyKind::File => RequestBody::File(None),
            RequestBodyKind::UrlEncodedForm => RequestBody::UrlEncodedForm(buffer_for(content_length)),
            RequestBodyKind::MultiPartForm => {
                let boundary = content_type
                    .as_deref()
                    .filter(|value| value.to_ascii_lowercase().starts_with("multipart/form-data"))
                    .and_then(|value| util::header_param(value, "boundary"))?;
                RequestBody::MultiPartForm(MultiPartDecoder::new(&boundary))
            }
        };

        Some(Self {
            head,
            content_type,
            content_length,
            if_modified_since,
            if_none_match,
            byte_range,
            accepts_gzip,
            captures: Vec::new(),
            body,
        })
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn method(&self) -> &Method {
        self.head.method()
    }

    pub fn path(&self) -> &str {
        self.head.path()
    }

    pub fn query(&self) -> &HashMap<String, String> {
        self.head.query()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.head.headers()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn if_modified_since(&self) -> Option<SystemTime> {
        self.if_modified_since
    }

    pub fn if_none_match(&self) -> Option<&str> {
        self.if_none_match.as_deref()
    }

    pub fn byte_range(&self) -> Option<ByteRange> {
        self.byte_range
    }

    /// Whether the client advertised gzip support in `Accept-Encoding`.
    pub fn accepts_gzip(&self) -> bool {
        self.accepts_gzip
    }

    /// Capture groups from a regex path handler, in match order.
    pub fn captures(&self) -> &[String] {
        &self.captures
    }

    pub(crate) fn set_captures(&mut self, captures: Vec<String>) {
        self.captures = captures;
    }

    /// Accumulated body bytes for `Data` and `UrlEncodedForm` kinds.
    pub fn body_data(&self) -> Option<&[u8]> {
        match &self.body {
            RequestBody::Data(buffer) | RequestBody::UrlEncodedForm(buffer) => Some(buffer),
            _ => None,
        }
    }

    /// Body bytes decoded as UTF-8.
    pub fn body_text(&self) -> Option<String> {
        self.body_data().and_then(|data| String::from_utf8(data.to_vec()).ok())
    }

    /// Path of the temp file holding a `File` body, valid until the
    /// request is dropped.
    pub fn temp_path(&self) -> Option<&Path> {
        match &self.body {
            RequestBody::File(file) => file.as_ref().map(NamedTempFile::path),
            _ => None,
        }
    }

    /// Decoded parts of a `MultiPartForm` body.
    pub fn multipart_parts(&self) -> Option<&[MultiPart]> {
        match &self.body {
            RequestBody::MultiPartForm(decoder) => Some(decoder.parts()),
            _ => None,
        }
    }

    /// First part with the given control name.
    pub fn multipart_part(&self, control_name: &str) -> Option<&MultiPart> {
        self.multipart_parts()?.iter().find(|part| part.control_name() == control_name)
    }

    /// Arguments of a `UrlEncodedForm` body.
    pub fn form_arguments(&self) -> Option<HashMap<String, String>> {
        match &self.body {
            RequestBody::UrlEncodedForm(buffer) => {
                let text = std::str::from_utf8(buffer).ok()?;
                Some(util::parse_url_encoded_form(text))
            }
            _ => None,
        }
    }
}

/// Up-front allocation for in-memory bodies is capped so a hostile
/// `Content-Length` cannot reserve arbitrary memory; the buffer still
/// grows past the cap if the body actually delivers more.
const BODY_PREALLOCATION_CAP: u64 = 256 * 1024;

fn buffer_for(content_length: Option<u64>) -> BytesMut {
    match content_length {
        Some(length) => BytesMut::with_capacity(length.min(BODY_PREALLOCATION_CAP) as usize),
        None => BytesMut::new(),
    }
}

impl BodyWriter for Request {
    fn open(&mut self) -> io::Result<()> {
        if let RequestBody::File(file) = &mut self.body {
            if file.is_none() {
                *file = Some(NamedTempFile::new()?);
            }
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.body {
            RequestBody::None => Ok(()),
            RequestBody::Data(buffer) | RequestBody::UrlEncodedForm(buffer) => {
                buffer.extend_from_slice(data);
                Ok(())
            }
            RequestBody::File(file) => match file {
                Some(file) => file.as_file_mut().write_all(data),
                None => Err(io::Error::new(io::ErrorKind::Other, "body file was not opened")),
            },
            RequestBody::MultiPartForm(decoder) => decoder.write(data),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match &mut self.body {
            RequestBody::File(Some(file)) => file.as_file_mut().flush(),
            RequestBody::MultiPartForm(decoder) => decoder.close(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(method: Method, target: &str, headers: &[(&str, &str)]) -> RequestHead {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            header_map.append(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        RequestHead::new(method, target.parse().unwrap(), Version::HTTP_11, header_map, 0)
    }

    #[test]
    fn path_and_query_are_decoded() {
        let head = head(Method::GET, "/a%20b/c?x=1&name=J%C3%B8rgen", &[]);
        assert_eq!(head.path(), "/a b/c");
        assert_eq!(head.query().get("x").unwrap(), "1");
        assert_eq!(head.query().get("name").unwrap(), "Jørgen");
    }

    #[test]
    fn byte_range_parsing() {
        assert_eq!(ByteRange::parse("bytes=100-199"), Some(ByteRange::FromTo(100, 199)));
        assert_eq!(ByteRange::parse("bytes=500-"), Some(ByteRange::From(500)));
        assert_eq!(ByteRange::parse("bytes=-300"), Some(ByteRange::Suffix(300)));
        assert_eq!(ByteRange::parse("bytes=200-100"), None);
        assert_eq!(ByteRange::parse("bytes=0-0,10-20"), None);
        assert_eq!(ByteRange::parse("lines=1-2"), None);
    }

    #[test]
    fn byte_range_resolution() {
        assert_eq!(ByteRange::FromTo(100, 199).resolve(1000), Some((100, 100)));
        assert_eq!(ByteRange::FromTo(900, 5000).resolve(1000), Some((900, 100)));
        assert_eq!(ByteRange::From(990).resolve(1000), Some((990, 10)));
        assert_eq!(ByteRange::Suffix(50).resolve(1000), Some((950, 50)));
        assert_eq!(ByteRange::Suffix(5000).resolve(1000), Some((0, 1000)));
        assert_eq!(ByteRange::From(1000).resolve(1000), None);
        assert_eq!(ByteRange::FromTo(2000, 3000).resolve(1000), None);
    }

    #[test]
    fn data_body_is_presized_from_content_length() {
        let request =
            Request::new(head(Method::POST, "/", &[("content-length", "64")]), RequestBodyKind::Data)
                .unwrap();
        match &request.body {
            RequestBody::Data(buffer) => assert!(buffer.capacity() >= 64),
            _ => panic!("expected a buffered body"),
        }

        // a hostile declared length must not reserve memory up front
        let request = Request::new(
            head(Method::POST, "/", &[("content-length", "18446744073709551615")]),
            RequestBodyKind::Data,
        )
        .unwrap();
        match &request.body {
            RequestBody::Data(buffer) => assert!(buffer.capacity() as u64 <= BODY_PREALLOCATION_CAP),
            _ => panic!("expected a buffered body"),
        }
    }

    #[test]
    fn metadata_is_captured_from_headers() {
        let head = head(
            Method::POST,
            "/upload",
            &[
                ("content-type", "text/plain"),
                ("content-length", "11"),
                ("accept-encoding", "deflate, gzip"),
                ("if-none-match", "\"abc\""),
                ("range", "bytes=0-9"),
            ],
        );
        let request = Request::new(head, RequestBodyKind::Data).unwrap();
        assert_eq!(request.content_type(), Some("text/plain"));
        assert_eq!(request.content_length(), Some(11));
        assert!(request.accepts_gzip());
        assert_eq!(request.if_none_match(), Some("\"abc\""));
        assert_eq!(request.byte_range(), Some(ByteRange::FromTo(0, 9)));
    }

    #[test]
    fn data_body_accumulates() {
        let head = head(Method::POST, "/", &[("content-length", "10")]);
        let mut request = Request::new(head, RequestBodyKind::Data).unwrap();
        request.open().unwrap();
        request.write(b"hello ").unwrap();
        request.write(b"body").unwrap();
        request.close().unwrap();
        assert_eq!(request.body_text().unwrap(), "hello body");
    }

    #[test]
    fn file_body_spools_to_disk() {
        let head = head(Method::PUT, "/f", &[]);
        let mut request = Request::new(head, RequestBodyKind::File).unwrap();
        request.open().unwrap();
        request.write(b"on disk").unwrap();
        request.close().unwrap();
        let content = std::fs::read(request.temp_path().unwrap()).unwrap();
        assert_eq!(content, b"on disk");
    }

    #[test]
    fn url_encoded_form_body_parses_arguments() {
        let head = head(Method::POST, "/form", &[("content-type", "application/x-www-form-urlencoded")]);
        let mut request = Request::new(head, RequestBodyKind::UrlEncodedForm).unwrap();
        request.open().unwrap();
        request.write(b"a=1&msg=hello+world&e=%26").unwrap();
        request.close().unwrap();
        let arguments = request.form_arguments().unwrap();
        assert_eq!(arguments.get("a").unwrap(), "1");
        assert_eq!(arguments.get("msg").unwrap(), "hello world");
        assert_eq!(arguments.get("e").unwrap(), "&");
    }

    #[test]
    fn multipart_kind_requires_a_boundary() {
        let without = head(Method::POST, "/form", &[("content-type", "multipart/form-data")]);
        assert!(Request::new(without, RequestBodyKind::MultiPartForm).is_none());

        let with = head(Method::POST, "/form", &[("content-type", "multipart/form-data; boundary=XYZ")]);
        assert!(Request::new(with, RequestBodyKind::MultiPartForm).is_some());
    }
}
