//! Outgoing response model: status and entity metadata plus a body source.
//!
//! Bodies are produced through the [`BodyReader`] side of the pipeline so
//! that in-memory data, file windows and app-defined streams all flow
//! through the same connection write path. A body without a known length
//! is sent with chunked framing.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::body::{BodyReader, DataReader, FileReader};
use crate::protocol::PayloadSize;
use crate::request::ByteRange;
use crate::util;

/// Producer of one async body chunk; an empty `Bytes` ends the body.
pub type AsyncChunkFn = Box<dyn FnMut() -> BoxFuture<'static, io::Result<Bytes>> + Send>;

pub enum ResponseBody {
    Empty,
    /// Synchronous reader chain, includes in-memory and file bodies
    Reader(Box<dyn BodyReader>),
    /// App-driven async producer, always chunked
    AsyncStream(AsyncChunkFn),
}

/// A response under construction by a handler.
///
/// Entity metadata set here is serialized by the connection; `Cache-Control`,
/// `ETag` and `Last-Modified` survive conversion to a not-modified response.
pub struct Response {
    status: StatusCode,
    content_type: Option<String>,
    content_length: Option<u64>,
    cache_control_max_age: u32,
    last_modified: Option<SystemTime>,
    etag: Option<String>,
    gzip_enabled: bool,
    additional_headers: HeaderMap,
    body: ResponseBody,
}

impl Response {
    pub fn new() -> Self {
        Self::with_status(StatusCode::OK)
    }

    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            content_type: None,
            content_length: None,
            cache_control_max_age: 0,
            last_modified: None,
            etag: None,
            gzip_enabled: false,
            additional_headers: HeaderMap::new(),
            body: ResponseBody::Empty,
        }
    }

    /// A redirect to `location`, 301 when permanent and 302 otherwise.
    pub fn redirect(location: &str, permanent: bool) -> Self {
        let status = if permanent { StatusCode::MOVED_PERMANENTLY } else { StatusCode::FOUND };
        let mut response = Self::with_status(status);
        response.add_header(http::header::LOCATION, location);
        response
    }

    pub fn data(data: impl Into<Bytes>, content_type: &str) -> Self {
        let data = data.into();
        let mut response = Self::new();
        response.content_type = Some(content_type.to_string());
        response.content_length = Some(data.len() as u64);
        response.body = ResponseBody::Reader(Box::new(DataReader::new(data)));
        response
    }

    pub fn text(text: &str) -> Self {
        Self::data(Bytes::copy_from_slice(text.as_bytes()), "text/plain; charset=utf-8")
    }

    pub fn html(html: &str) -> Self {
        Self::data(Bytes::copy_from_slice(html.as_bytes()), "text/html; charset=utf-8")
    }

    /// An HTML error page in the given status.
    pub fn error_html(status: StatusCode, message: &str) -> Self {
        let title = format!(
            "HTTP Error {} ({})",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        );
        let page = format!(
            "<!DOCTYPE html>\n\
             <html lang=\"en\">\n\
             <head><meta charset=\"utf-8\"><title>{title}</title></head>\n\
             <body><h1>{title}</h1><p>{}</p></body>\n\
             </html>\n",
            html_escape(message)
        );
        let mut response = Self::html(&page);
        response.status = status;
        response
    }

    /// Serves a whole file, content type inferred from the extension.
    pub fn file(path: &Path) -> io::Result<Self> {
        Self::file_with_range(path, None)
    }

    /// Serves a file or a byte range of it.
    ///
    /// A satisfiable range yields 206 with a `Content-Range` header; an
    /// unsatisfiable one fails with [`io::ErrorKind::InvalidInput`] so the
    /// caller can answer 416. The `ETag` and `Last-Modified` validators are
    /// derived from the file metadata.
    pub fn file_with_range(path: &Path, range: Option<ByteRange>) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
        }
        let size = metadata.len();

        let (status, offset, length) = match range {
            None => (StatusCode::OK, 0, size),
            Some(range) => {
                let (offset, length) = range
                    .resolve(size)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unsatisfiable byte range"))?;
                (StatusCode::PARTIAL_CONTENT, offset, length)
            }
        };

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
        let mut response = Self::with_status(status);
        response.content_type = Some(util::mime_type_for_extension(extension, &HashMap::new()));
        response.content_length = Some(length);
        response.last_modified = metadata.modified().ok();
        response.etag = Some(file_etag(&metadata));
        if status == StatusCode::PARTIAL_CONTENT {
            let end = offset + length - 1;
            response.add_header(http::header::CONTENT_RANGE, &format!("bytes {offset}-{end}/{size}"));
        }
        response.body = ResponseBody::Reader(Box::new(FileReader::new(path.to_path_buf(), offset, length)));
        Ok(response)
    }

    /// A chunked body pulled from a synchronous reader.
    pub fn stream(content_type: &str, reader: Box<dyn BodyReader>) -> Self {
        let mut response = Self::new();
        response.content_type = Some(content_type.to_string());
        response.body = ResponseBody::Reader(reader);
        response
    }

    /// A chunked body produced by an async block, one future per chunk.
    pub fn async_stream(content_type: &str, chunk_fn: AsyncChunkFn) -> Self {
        let mut response = Self::new();
        response.content_type = Some(content_type.to_string());
        response.body = ResponseBody::AsyncStream(chunk_fn);
        response
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.content_type = Some(content_type.to_string());
    }

    /// Declared body length; `None` means chunked framing.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// `max-age` for `Cache-Control`; zero emits `no-cache`.
    pub fn cache_control_max_age(&self) -> u32 {
        self.cache_control_max_age
    }

    pub fn set_cache_control_max_age(&mut self, max_age: u32) {
        self.cache_control_max_age = max_age;
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    pub fn set_last_modified(&mut self, date: SystemTime) {
        self.last_modified = Some(date);
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn set_etag(&mut self, etag: &str) {
        self.etag = Some(etag.to_string());
    }

    /// Whether the body may be gzip-compressed for clients that accept it.
    /// Off by default; forcing chunked framing is not always wanted.
    pub fn gzip_enabled(&self) -> bool {
        self.gzip_enabled
    }

    pub fn set_gzip_enabled(&mut self, enabled: bool) {
        self.gzip_enabled = enabled;
    }

    /// Marks the body as a download with the given filename. The plain
    /// `filename` parameter is sanitized to ASCII; the full name travels in
    /// the RFC 5987 `filename*` parameter.
    pub fn set_attachment_filename(&mut self, filename: &str) {
        let safe: String = filename
            .chars()
            .map(|c| if c.is_ascii() && c != '"' && c != '\\' { c } else { '_' })
            .collect();
        self.add_header(
            http::header::CONTENT_DISPOSITION,
            &format!("attachment; filename=\"{safe}\"; filename*=UTF-8''{}", util::escape_url_string(filename)),
        );
    }

    pub fn add_header(&mut self, name: HeaderName, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.additional_headers.append(name, value);
        }
    }

    pub fn additional_headers(&self) -> &HeaderMap {
        &self.additional_headers
    }

    pub fn has_body(&self) -> bool {
        !matches!(self.body, ResponseBody::Empty)
    }

    /// Async bodies bypass the synchronous reader chain, so compression
    /// cannot wrap them.
    pub(crate) fn body_is_async(&self) -> bool {
        matches!(self.body, ResponseBody::AsyncStream(_))
    }

    /// Wire framing for this response as currently configured.
    pub(crate) fn payload_size(&self) -> PayloadSize {
        if !self.has_body() {
            return PayloadSize::Empty;
        }
        match self.content_length {
            Some(length) => PayloadSize::Length(length),
            None => PayloadSize::Chunked,
        }
    }

    pub(crate) fn take_body(&mut self) -> ResponseBody {
        std::mem::replace(&mut self.body, ResponseBody::Empty)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

/// Weak validator from file identity and mtime, stable across restarts.
fn file_etag(metadata: &std::fs::Metadata) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        format!("\"{}/{}/{}\"", metadata.dev(), metadata.ino(), metadata.mtime())
    }
    #[cfg(not(unix))]
    {
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|duration| duration.as_secs())
            .unwrap_or(0);
        format!("\"{}/{}\"", metadata.len(), mtime)
    }
}

fn html_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for character in text.chars() {
        match character {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn data_response_declares_length() {
        let response = Response::data(Bytes::from_static(b"hello"), "text/plain");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.content_length(), Some(5));
        assert_eq!(response.payload_size(), PayloadSize::Length(5));
    }

    #[test]
    fn empty_response_has_empty_payload() {
        let response = Response::with_status(StatusCode::NO_CONTENT);
        assert!(!response.has_body());
        assert_eq!(response.payload_size(), PayloadSize::Empty);
    }

    #[test]
    fn stream_without_length_is_chunked() {
        let reader = Box::new(crate::body::DataReader::new(Bytes::from_static(b"x")));
        let response = Response::stream("application/octet-stream", reader);
        assert_eq!(response.payload_size(), PayloadSize::Chunked);
    }

    #[test]
    fn only_async_stream_bodies_are_flagged_async() {
        let chunk_fn: AsyncChunkFn = Box::new(|| Box::pin(async { Ok(Bytes::new()) }));
        assert!(Response::async_stream("text/plain", chunk_fn).body_is_async());

        assert!(!Response::text("payload").body_is_async());
        let reader = Box::new(crate::body::DataReader::new(Bytes::from_static(b"x")));
        assert!(!Response::stream("application/octet-stream", reader).body_is_async());
        assert!(!Response::with_status(StatusCode::NO_CONTENT).body_is_async());
    }

    #[test]
    fn file_response_carries_validators() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 1000]).unwrap();
        file.flush().unwrap();

        let response = Response::file(file.path()).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.content_length(), Some(1000));
        assert!(response.etag().unwrap().starts_with('"'));
        assert!(response.last_modified().is_some());
    }

    #[test]
    fn range_response_is_partial_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&(0u8..=255).cycle().take(1000).collect::<Vec<u8>>()).unwrap();
        file.flush().unwrap();

        let response =
            Response::file_with_range(file.path(), Some(ByteRange::FromTo(100, 199))).unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.content_length(), Some(100));
        let content_range = response.additional_headers().get(http::header::CONTENT_RANGE).unwrap();
        assert_eq!(content_range, "bytes 100-199/1000");
    }

    #[test]
    fn unsatisfiable_range_fails_construction() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[1u8; 10]).unwrap();
        file.flush().unwrap();

        let error = Response::file_with_range(file.path(), Some(ByteRange::From(10))).err().unwrap();
        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn error_page_escapes_the_message() {
        let mut response = Response::error_html(StatusCode::NOT_FOUND, "no <file> here");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.has_body());
        match response.take_body() {
            ResponseBody::Reader(mut reader) => {
                reader.open().unwrap();
                let body = reader.read().unwrap();
                let text = std::str::from_utf8(&body).unwrap();
                assert!(text.contains("HTTP Error 404"));
                assert!(text.contains("no &lt;file&gt; here"));
            }
            _ => panic!("expected an in-memory body"),
        }
    }
}
