//! Handler registry model and the built-in static content handlers.
//!
//! A handler is a pair of functions: a matcher that inspects a parsed
//! request head and, when it claims the request, builds the [`Request`]
//! with the body storage it wants; and a processor that consumes that
//! request and produces the response. Matching runs in reverse
//! registration order so later registrations override earlier ones.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::{Method, StatusCode};
use regex::Regex;
use tracing::debug;

use crate::request::{Request, RequestBodyKind, RequestHead};
use crate::response::Response;
use crate::util;

pub type MatchFn = Box<dyn Fn(&RequestHead) -> Option<Request> + Send + Sync>;
pub type ProcessFn = Box<dyn Fn(Request) -> BoxFuture<'static, Option<Response>> + Send + Sync>;

/// One registered request handler.
pub struct Handler {
    match_fn: MatchFn,
    process_fn: ProcessFn,
}

impl Handler {
    pub fn new(match_fn: MatchFn, process_fn: ProcessFn) -> Self {
        Self { match_fn, process_fn }
    }

    /// Offers a head to this handler; `Some` claims the request.
    pub(crate) fn claim(&self, head: &RequestHead) -> Option<Request> {
        (self.match_fn)(head)
    }

    pub(crate) fn process(&self, request: Request) -> BoxFuture<'static, Option<Response>> {
        (self.process_fn)(request)
    }
}

/// Matcher claiming every request with the given method.
pub fn match_method(method: Method, kind: RequestBodyKind) -> MatchFn {
    Box::new(move |head| {
        if head.method() != method {
            return None;
        }
        Request::new(head.clone(), kind)
    })
}

/// Matcher for an exact method and decoded path, compared case-insensitively.
pub fn match_method_path(method: Method, path: &str, kind: RequestBodyKind) -> MatchFn {
    let path = path.to_string();
    Box::new(move |head| {
        if head.method() != method || !head.path().eq_ignore_ascii_case(&path) {
            return None;
        }
        Request::new(head.clone(), kind)
    })
}

/// Matcher for a method and a regex over the decoded path; capture groups
/// are stored on the request in match order.
pub fn match_method_path_regex(method: Method, pattern: Regex, kind: RequestBodyKind) -> MatchFn {
    Box::new(move |head| {
        if head.method() != method {
            return None;
        }
        let captures = pattern.captures(head.path())?;
        let mut request = Request::new(head.clone(), kind)?;
        request.set_captures(
            captures
                .iter()
                .skip(1)
                .map(|group| group.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect(),
        );
        Some(request)
    })
}

/// GET handler serving a fixed in-memory payload at an exact path.
pub fn static_data_handler(path: &str, data: Bytes, content_type: &str, cache_age: u32) -> Handler {
    let content_type = content_type.to_string();
    let process: ProcessFn = Box::new(move |_request| {
        let mut response = Response::data(data.clone(), &content_type);
        response.set_cache_control_max_age(cache_age);
        async move { Some(response) }.boxed()
    });
    Handler::new(match_method_path(Method::GET, path, RequestBodyKind::None), process)
}

/// GET handler serving a single file at an exact path. With `attachment`
/// set, the response carries a download disposition named after the file.
pub fn static_file_handler(
    path: &str,
    file_path: PathBuf,
    cache_age: u32,
    allow_ranges: bool,
    attachment: bool,
) -> Handler {
    let process: ProcessFn = Box::new(move |request| {
        let mut response = serve_file(&file_path, &request, cache_age, allow_ranges);
        if attachment && response.status().is_success() {
            if let Some(name) = file_path.file_name().and_then(|name| name.to_str()) {
                response.set_attachment_filename(name);
            }
        }
        async move { Some(response) }.boxed()
    });
    Handler::new(match_method_path(Method::GET, path, RequestBodyKind::None), process)
}

/// GET handler serving a directory tree under a base URL path.
///
/// Directories serve `index_filename` when present, otherwise an HTML
/// listing. Paths are normalized lexically before filesystem resolution so
/// `..` segments cannot escape the root.
pub fn directory_handler(
    base_path: &str,
    directory: PathBuf,
    index_filename: Option<String>,
    cache_age: u32,
    allow_ranges: bool,
) -> Handler {
    let base_path = if base_path.ends_with('/') { base_path.to_string() } else { format!("{base_path}/") };
    let config = Arc::new((base_path.clone(), directory, index_filename));

    let match_fn: MatchFn = Box::new(move |head| {
        if head.method() != Method::GET || !head.path().starts_with(&base_path) {
            return None;
        }
        Request::new(head.clone(), RequestBodyKind::None)
    });

    let process: ProcessFn = Box::new(move |request| {
        let config = Arc::clone(&config);
        async move {
            let (base_path, directory, index_filename) = &*config;
            Some(serve_directory(base_path, directory, index_filename.as_deref(), &request, cache_age, allow_ranges))
        }
        .boxed()
    });

    Handler::new(match_fn, process)
}

fn serve_directory(
    base_path: &str,
    directory: &Path,
    index_filename: Option<&str>,
    request: &Request,
    cache_age: u32,
    allow_ranges: bool,
) -> Response {
    let relative = util::normalize_path(&request.path()[base_path.len()..]);
    let relative = relative.trim_start_matches('/');
    let target = if relative.is_empty() { directory.to_path_buf() } else { directory.join(relative) };

    let Ok(metadata) = std::fs::metadata(&target) else {
        debug!(path = %request.path(), "no such static file");
        return Response::error_html(StatusCode::NOT_FOUND, &format!("\"{}\" does not exist", request.path()));
    };

    if metadata.is_dir() {
        if let Some(index) = index_filename {
            let index_path = target.join(index);
            if index_path.is_file() {
                return serve_file(&index_path, request, cache_age, allow_ranges);
            }
        }
        return directory_listing(request.path(), &target);
    }

    serve_file(&target, request, cache_age, allow_ranges)
}

fn serve_file(path: &Path, request: &Request, cache_age: u32, allow_ranges: bool) -> Response {
    let range = if allow_ranges { request.byte_range() } else { None };
    match Response::file_with_range(path, range) {
        Ok(mut response) => {
            response.set_cache_control_max_age(cache_age);
            if allow_ranges {
                response.add_header(http::header::ACCEPT_RANGES, "bytes");
            }
            response
        }
        Err(error) if error.kind() == std::io::ErrorKind::InvalidInput && range.is_some() => {
            let size = std::fs::metadata(path).map(|metadata| metadata.len()).unwrap_or(0);
            let mut response =
                Response::error_html(StatusCode::RANGE_NOT_SATISFIABLE, "requested range not satisfiable");
            response.add_header(http::header::CONTENT_RANGE, &format!("bytes */{size}"));
            response
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            Response::error_html(StatusCode::NOT_FOUND, &format!("\"{}\" does not exist", request.path()))
        }
        Err(error) => {
            Response::error_html(StatusCode::INTERNAL_SERVER_ERROR, &format!("failed to open file: {error}"))
        }
    }
}

/// Renders an HTML listing of `directory`, directories first with a
/// trailing slash, entries percent-escaped in their links.
fn directory_listing(url_path: &str, directory: &Path) -> Response {
    let mut entries: Vec<(String, bool)> = match std::fs::read_dir(directory) {
        Ok(reader) => reader
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                if name.starts_with('.') {
                    return None;
                }
                let is_dir = entry.file_type().ok()?.is_dir();
                Some((name, is_dir))
            })
            .collect(),
        Err(error) => {
            return Response::error_html(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("failed to list directory: {error}"),
            );
        }
    };
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut page = String::new();
    page.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head><meta charset=\"utf-8\">");
    page.push_str(&format!("<title>{url_path}</title></head>\n<body>\n<ul>\n"));
    for (name, is_dir) in entries {
        let suffix = if is_dir { "/" } else { "" };
        page.push_str(&format!(
            "<li><a href=\"{}{suffix}\">{name}{suffix}</a></li>\n",
            util::escape_url_string(&name)
        ));
    }
    page.push_str("</ul>\n</body>\n</html>\n");
    Response::html(&page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Version};

    fn head(method: Method, target: &str) -> RequestHead {
        RequestHead::new(method, target.parse().unwrap(), Version::HTTP_11, HeaderMap::new(), 0)
    }

    #[test]
    fn method_matcher_ignores_path() {
        let matcher = match_method(Method::POST, RequestBodyKind::Data);
        assert!(matcher(&head(Method::POST, "/anything")).is_some());
        assert!(matcher(&head(Method::GET, "/anything")).is_none());
    }

    #[test]
    fn path_matcher_is_exact_and_case_insensitive() {
        let matcher = match_method_path(Method::GET, "/hello", RequestBodyKind::None);
        assert!(matcher(&head(Method::GET, "/hello")).is_some());
        assert!(matcher(&head(Method::GET, "/HELLO")).is_some());
        assert!(matcher(&head(Method::GET, "/hello/world")).is_none());
        assert!(matcher(&head(Method::POST, "/hello")).is_none());
    }

    #[test]
    fn regex_matcher_collects_captures() {
        let pattern = Regex::new(r"^/users/(\d+)/posts/(\d+)$").unwrap();
        let matcher = match_method_path_regex(Method::GET, pattern, RequestBodyKind::None);
        let request = matcher(&head(Method::GET, "/users/42/posts/7")).unwrap();
        assert_eq!(request.captures(), &["42".to_string(), "7".to_string()]);
        assert!(matcher(&head(Method::GET, "/users/x/posts/7")).is_none());
    }

    #[tokio::test]
    async fn directory_handler_serves_files_and_listings() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.txt"), b"alpha").unwrap();
        std::fs::create_dir(root.path().join("sub")).unwrap();
        std::fs::write(root.path().join("sub/b.txt"), b"beta").unwrap();

        let handler = directory_handler("/static/", root.path().to_path_buf(), None, 0, true);

        let request = handler.claim(&head(Method::GET, "/static/a.txt")).unwrap();
        let response = handler.process(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.content_length(), Some(5));

        let request = handler.claim(&head(Method::GET, "/static/")).unwrap();
        let response = handler.process(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.content_type(), Some("text/html; charset=utf-8"));

        let request = handler.claim(&head(Method::GET, "/static/missing.txt")).unwrap();
        let response = handler.process(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        assert!(handler.claim(&head(Method::GET, "/elsewhere/a.txt")).is_none());
    }

    #[tokio::test]
    async fn directory_handler_does_not_escape_its_root() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("inside.txt"), b"in").unwrap();

        let handler = directory_handler("/files/", root.path().to_path_buf(), None, 0, false);
        let request = handler.claim(&head(Method::GET, "/files/../outside-marker.txt")).unwrap();
        let response = handler.process(request).await.unwrap();
        // normalization strips the traversal, so this resolves inside the root
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn static_file_handler_can_mark_a_download() {
        let root = tempfile::tempdir().unwrap();
        let file_path = root.path().join("report.csv");
        std::fs::write(&file_path, b"a,b\n1,2\n").unwrap();

        let handler = static_file_handler("/report", file_path, 0, false, true);
        let request = handler.claim(&head(Method::GET, "/report")).unwrap();
        let response = handler.process(request).await.unwrap();

        let disposition = response.additional_headers().get(http::header::CONTENT_DISPOSITION).unwrap();
        assert!(disposition.to_str().unwrap().starts_with("attachment; filename=\"report.csv\""));
    }

    #[tokio::test]
    async fn static_data_handler_sets_cache_age() {
        let handler = static_data_handler("/logo", Bytes::from_static(b"png!"), "image/png", 3600);
        let request = handler.claim(&head(Method::GET, "/logo")).unwrap();
        let response = handler.process(request).await.unwrap();
        assert_eq!(response.content_type(), Some("image/png"));
        assert_eq!(response.cache_control_max_age(), 3600);
        assert_eq!(response.content_length(), Some(4));
    }
}
