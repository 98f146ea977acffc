//! Streaming `multipart/form-data` decoding (RFC 2388).
//!
//! [`MultiPartDecoder`] is a writer-side stage: the connection feeds it raw
//! body bytes in arbitrary fragments and it scans for boundary markers,
//! parses each part's header block and forwards the part's body bytes to an
//! in-memory argument sink or a temp-file sink. Boundary markers split
//! across fragment borders are handled by retaining an unflushed tail and
//! re-scanning. `multipart/mixed` parts (multi-file attachments bound to a
//! single control) recurse into a nested decoder.

use std::io;
use std::io::Write;
use std::path::Path;

use bytes::{Buf, Bytes, BytesMut};
use tempfile::NamedTempFile;
use tracing::trace;

use crate::body::BodyWriter;
use crate::util::header_param;

/// One decoded part of a `multipart/form-data` body.
pub struct MultiPart {
    control_name: String,
    content_type: String,
    mime_type: String,
    payload: PartPayload,
}

/// Payload of a part: either an in-memory argument or a file spooled to a
/// uniquely-named temp file that is deleted when the part is dropped.
pub enum PartPayload {
    Argument { data: Bytes },
    File { file_name: String, temp_file: NamedTempFile },
}

impl MultiPart {
    /// The form control name from `Content-Disposition`.
    pub fn control_name(&self) -> &str {
        &self.control_name
    }

    /// The part's declared content type, parameters included.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// The content type stripped of its parameters.
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn is_file(&self) -> bool {
        matches!(self.payload, PartPayload::File { .. })
    }

    /// Raw bytes of an argument part.
    pub fn data(&self) -> Option<&Bytes> {
        match &self.payload {
            PartPayload::Argument { data } => Some(data),
            PartPayload::File { .. } => None,
        }
    }

    /// Argument bytes decoded as UTF-8 text.
    pub fn text(&self) -> Option<String> {
        self.data().and_then(|data| String::from_utf8(data.to_vec()).ok())
    }

    /// The client-supplied file name of a file part.
    pub fn file_name(&self) -> Option<&str> {
        match &self.payload {
            PartPayload::File { file_name, .. } => Some(file_name),
            PartPayload::Argument { .. } => None,
        }
    }

    /// Path of the temp file holding a file part's content.
    pub fn temp_path(&self) -> Option<&Path> {
        match &self.payload {
            PartPayload::File { temp_file, .. } => Some(temp_file.path()),
            PartPayload::Argument { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Looking for the first `--boundary` marker
    Preamble,
    /// Collecting a part's header block up to the blank line
    Headers,
    /// Forwarding part content up to the next `\r\n--boundary`
    Content,
    /// Closing delimiter seen, everything further is epilogue
    Done,
}

enum PartSink {
    Argument { meta: PartMeta, data: BytesMut },
    File { meta: PartMeta, file_name: String, temp_file: NamedTempFile },
    Nested { decoder: Box<MultiPartDecoder> },
}

struct PartMeta {
    control_name: String,
    content_type: String,
    mime_type: String,
}

/// Writer stage that decodes one multipart body.
pub struct MultiPartDecoder {
    /// `\r\n--<boundary>`, the delimiter between parts
    delimiter: Vec<u8>,
    state: State,
    buffer: BytesMut,
    current: Option<PartSink>,
    parts: Vec<MultiPart>,
    /// Control name inherited by nested `multipart/mixed` parts
    inherited_control_name: Option<String>,
}

impl MultiPartDecoder {
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"\r\n--");
        delimiter.extend_from_slice(boundary.as_bytes());
        Self {
            delimiter,
            state: State::Preamble,
            buffer: BytesMut::new(),
            current: None,
            parts: Vec::new(),
            inherited_control_name: None,
        }
    }

    fn nested(boundary: &str, control_name: String) -> Self {
        let mut decoder = Self::new(boundary);
        decoder.inherited_control_name = Some(control_name);
        decoder
    }

    /// All decoded parts, in body order. Valid after `close`.
    pub fn into_parts(self) -> Vec<MultiPart> {
        self.parts
    }

    pub fn parts(&self) -> &[MultiPart] {
        &self.parts
    }

    fn process(&mut self) -> io::Result<()> {
        loop {
            let advanced = match self.state {
                State::Preamble => self.process_preamble()?,
                State::Headers => self.process_headers()?,
                State::Content => self.process_content()?,
                State::Done => {
                    // epilogue is ignored
                    self.buffer.clear();
                    return Ok(());
                }
            };
            if !advanced {
                return Ok(());
            }
        }
    }

    /// Consumes everything through the first boundary marker. Returns false
    /// when more data is needed.
    fn process_preamble(&mut self) -> io::Result<bool> {
        // the first marker has no leading CRLF
        let marker = &self.delimiter[2..];
        let Some(pos) = find(&self.buffer, marker) else {
            let keep = marker.len().saturating_sub(1);
            let excess = self.buffer.len().saturating_sub(keep);
            self.buffer.advance(excess);
            return Ok(false);
        };
        let after = pos + marker.len();
        if self.buffer.len() < after + 2 {
            return Ok(false);
        }
        match &self.buffer[after..after + 2] {
            b"\r\n" => {
                self.buffer.advance(after + 2);
                self.state = State::Headers;
                Ok(true)
            }
            b"--" => {
                self.buffer.advance(after + 2);
                self.state = State::Done;
                Ok(true)
            }
            _ => Err(malformed("unexpected bytes after boundary marker")),
        }
    }

    fn process_headers(&mut self) -> io::Result<bool> {
        let Some(end) = find(&self.buffer, b"\r\n\r\n") else {
            return Ok(false);
        };
        let header_block = self.buffer.split_to(end + 4);
        let header_text = std::str::from_utf8(&header_block[..end])
            .map_err(|_| malformed("part headers are not valid UTF-8"))?;

        let mut disposition = "";
        let mut content_type = "text/plain";
        for line in header_text.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-disposition") {
                disposition = value;
            } else if name.eq_ignore_ascii_case("content-type") {
                content_type = value;
            }
        }

        let control_name = header_param(disposition, "name")
            .or_else(|| self.inherited_control_name.clone())
            .ok_or_else(|| malformed("part has no control name"))?;
        let file_name = header_param(disposition, "filename");
        let mime_type = mime_essence(content_type);

        trace!(control = %control_name, mime = %mime_type, file = ?file_name, "multipart part headers");

        let meta = PartMeta { control_name: control_name.clone(), content_type: content_type.to_string(), mime_type };

        let sink = if meta.mime_type.eq_ignore_ascii_case("multipart/mixed") {
            let boundary =
                header_param(content_type, "boundary").ok_or_else(|| malformed("multipart/mixed without boundary"))?;
            PartSink::Nested { decoder: Box::new(MultiPartDecoder::nested(&boundary, control_name)) }
        } else if let Some(file_name) = file_name {
            let temp_file = NamedTempFile::new()?;
            PartSink::File { meta, file_name, temp_file }
        } else {
            PartSink::Argument { meta, data: BytesMut::new() }
        };

        self.current = Some(sink);
        self.state = State::Content;
        Ok(true)
    }

    fn process_content(&mut self) -> io::Result<bool> {
        match find(&self.buffer, &self.delimiter) {
            Some(pos) => {
                let after = pos + self.delimiter.len();
                if self.buffer.len() < after + 2 {
                    // flush content ahead of the delimiter, keep the rest
                    let data = self.buffer.split_to(pos);
                    self.sink_write(&data)?;
                    return Ok(false);
                }
                let data = self.buffer.split_to(pos);
                self.sink_write(&data)?;
                // re-resolve positions after the split
                let two = [self.buffer[self.delimiter.len()], self.buffer[self.delimiter.len() + 1]];
                match &two {
                    b"\r\n" => {
                        self.buffer.advance(self.delimiter.len() + 2);
                        self.finish_part()?;
                        self.state = State::Headers;
                        Ok(true)
                    }
                    b"--" => {
                        self.buffer.advance(self.delimiter.len() + 2);
                        self.finish_part()?;
                        self.state = State::Done;
                        Ok(true)
                    }
                    _ => Err(malformed("unexpected bytes after part delimiter")),
                }
            }
            None => {
                // a delimiter may straddle the fragment border, retain a tail
                let keep = self.delimiter.len() + 1;
                if self.buffer.len() > keep {
                    let flush = self.buffer.len() - keep;
                    let data = self.buffer.split_to(flush);
                    self.sink_write(&data)?;
                }
                Ok(false)
            }
        }
    }

    fn sink_write(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        match self.current.as_mut().expect("part sink missing in content state") {
            PartSink::Argument { data: sink, .. } => {
                sink.extend_from_slice(data);
                Ok(())
            }
            PartSink::File { temp_file, .. } => temp_file.as_file_mut().write_all(data),
            PartSink::Nested { decoder } => BodyWriter::write(decoder.as_mut(), data),
        }
    }

    fn finish_part(&mut self) -> io::Result<()> {
        let sink = self.current.take().expect("part sink missing at part end");
        match sink {
            PartSink::Argument { meta, data } => {
                self.parts.push(MultiPart {
                    control_name: meta.control_name,
                    content_type: meta.content_type,
                    mime_type: meta.mime_type,
                    payload: PartPayload::Argument { data: data.freeze() },
                });
            }
            PartSink::File { meta, file_name, mut temp_file } => {
                temp_file.as_file_mut().flush()?;
                self.parts.push(MultiPart {
                    control_name: meta.control_name,
                    content_type: meta.content_type,
                    mime_type: meta.mime_type,
                    payload: PartPayload::File { file_name, temp_file },
                });
            }
            PartSink::Nested { mut decoder } => {
                BodyWriter::close(decoder.as_mut())?;
                self.parts.append(&mut decoder.parts);
            }
        }
        Ok(())
    }
}

impl BodyWriter for MultiPartDecoder {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.buffer.extend_from_slice(data);
        self.process()
    }

    fn close(&mut self) -> io::Result<()> {
        if self.state != State::Done {
            return Err(malformed("multipart body ended before closing delimiter"));
        }
        Ok(())
    }
}

fn malformed(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason)
}

/// Naive subsequence search; part bodies are scanned at most twice per
/// fragment so this stays linear in practice.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Content type without its parameters.
fn mime_essence(content_type: &str) -> String {
    content_type.split(';').next().unwrap_or(content_type).trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(decoder: &mut MultiPartDecoder, body: &[u8], fragment: usize) {
        for piece in body.chunks(fragment) {
            BodyWriter::write(decoder, piece).unwrap();
        }
        BodyWriter::close(decoder).unwrap();
    }

    fn simple_form() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"--XYZ\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"title\"\r\n\r\n");
        body.extend_from_slice(b"hello world\r\n");
        body.extend_from_slice(b"--XYZ\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n");
        body.extend_from_slice(b"Content-Type: text/plain\r\n\r\n");
        body.extend_from_slice(b"0123456789\r\n");
        body.extend_from_slice(b"--XYZ--\r\n");
        body
    }

    #[test]
    fn decodes_argument_and_file_parts() {
        let mut decoder = MultiPartDecoder::new("XYZ");
        feed(&mut decoder, &simple_form(), usize::MAX);

        let parts = decoder.into_parts();
        assert_eq!(parts.len(), 2);

        assert_eq!(parts[0].control_name(), "title");
        assert!(!parts[0].is_file());
        assert_eq!(parts[0].text().unwrap(), "hello world");
        assert_eq!(parts[0].mime_type(), "text/plain");

        assert_eq!(parts[1].control_name(), "doc");
        assert_eq!(parts[1].file_name().unwrap(), "a.txt");
        let content = std::fs::read(parts[1].temp_path().unwrap()).unwrap();
        assert_eq!(content, b"0123456789");
    }

    #[test]
    fn boundary_split_across_fragments() {
        let body = simple_form();
        for fragment in [1, 2, 3, 5, 7, 11] {
            let mut decoder = MultiPartDecoder::new("XYZ");
            feed(&mut decoder, &body, fragment);

            let parts = decoder.into_parts();
            assert_eq!(parts.len(), 2, "fragment size {fragment}");
            assert_eq!(parts[0].text().unwrap(), "hello world");
            let content = std::fs::read(parts[1].temp_path().unwrap()).unwrap();
            assert_eq!(content, b"0123456789", "fragment size {fragment}");
        }
    }

    #[test]
    fn part_content_may_contain_boundary_lookalikes() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--B\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"x\"\r\n\r\n");
        body.extend_from_slice(b"--Bogus\r\nnot a real --B boundary");
        body.extend_from_slice(b"\r\n--B--\r\n");

        let mut decoder = MultiPartDecoder::new("B");
        feed(&mut decoder, &body, usize::MAX);

        let parts = decoder.into_parts();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].text().unwrap(), "--Bogus\r\nnot a real --B boundary");
    }

    #[test]
    fn nested_multipart_mixed() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--OUTER\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"files\"\r\n");
        body.extend_from_slice(b"Content-Type: multipart/mixed; boundary=INNER\r\n\r\n");
        body.extend_from_slice(b"--INNER\r\n");
        body.extend_from_slice(b"Content-Disposition: attachment; filename=\"one.txt\"\r\n\r\n");
        body.extend_from_slice(b"first\r\n");
        body.extend_from_slice(b"--INNER\r\n");
        body.extend_from_slice(b"Content-Disposition: attachment; filename=\"two.txt\"\r\n\r\n");
        body.extend_from_slice(b"second\r\n");
        body.extend_from_slice(b"--INNER--\r\n");
        body.extend_from_slice(b"--OUTER--\r\n");

        let mut decoder = MultiPartDecoder::new("OUTER");
        feed(&mut decoder, &body, 9);

        let parts = decoder.into_parts();
        assert_eq!(parts.len(), 2);
        for (part, (name, content)) in parts.iter().zip([("one.txt", b"first".as_slice()), ("two.txt", b"second")]) {
            assert_eq!(part.control_name(), "files");
            assert_eq!(part.file_name().unwrap(), name);
            assert_eq!(std::fs::read(part.temp_path().unwrap()).unwrap(), content);
        }
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut decoder = MultiPartDecoder::new("XYZ");
        BodyWriter::write(&mut decoder, b"--XYZ\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\ndat").unwrap();
        assert!(BodyWriter::close(&mut decoder).is_err());
    }

    #[test]
    fn header_param_variants() {
        assert_eq!(header_param("form-data; name=\"a b\"", "name").unwrap(), "a b");
        assert_eq!(header_param("form-data; name=plain", "name").unwrap(), "plain");
        assert_eq!(header_param("multipart/mixed; boundary=XYZ", "boundary").unwrap(), "XYZ");
        assert!(header_param("form-data", "name").is_none());
    }
}
