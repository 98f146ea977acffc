//! Pure helper functions: date parsing/formatting, URL escaping, path
//! normalization, form parsing and MIME type lookup.

use std::collections::HashMap;
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};

/// Formats a timestamp as an RFC 822 / RFC 1123 HTTP date
/// (`Sat, 30 Aug 2026 12:00:00 GMT`).
pub fn format_rfc822(date: SystemTime) -> String {
    httpdate::fmt_http_date(date)
}

/// Parses an RFC 822 / RFC 1123 HTTP date. Granularity is one second.
pub fn parse_rfc822(value: &str) -> Option<SystemTime> {
    httpdate::parse_http_date(value).ok()
}

/// Formats a timestamp as ISO 8601 (`2026-08-30T12:00:00Z`).
pub fn format_iso8601(date: SystemTime) -> String {
    let datetime: DateTime<Utc> = date.into();
    datetime.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parses an ISO 8601 timestamp, with or without an explicit offset.
pub fn parse_iso8601(value: &str) -> Option<SystemTime> {
    if let Ok(datetime) = DateTime::parse_from_rfc3339(value) {
        return Some(datetime.with_timezone(&Utc).into());
    }
    // Lenient fallback for the offset-less form some clients emit
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").ok()?;
    Some(Utc.from_utc_datetime(&naive).into())
}

/// Percent-encodes every character outside the RFC 3986 unreserved set.
///
/// Applying `escape_url_string` to its own output composed with
/// [`unescape_url_string`] is idempotent, which is what URL rewriting needs;
/// decoding is not guaranteed to be a left inverse for already-ambiguous
/// input.
pub fn escape_url_string(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Decodes percent-escapes. Returns `None` when the escapes do not form
/// valid UTF-8.
pub fn unescape_url_string(value: &str) -> Option<String> {
    urlencoding::decode(value).ok().map(|cow| cow.into_owned())
}

/// Normalizes a URL path: collapses repeated slashes, resolves `.` and `..`
/// lexically. Never touches the filesystem.
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut components: Vec<&str> = Vec::new();

    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            other => components.push(other),
        }
    }

    let joined = components.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Parses an `application/x-www-form-urlencoded` body or query string into a
/// flat map. Later duplicates win. `+` decodes to a space.
pub fn parse_url_encoded_form(form: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for pair in form.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.split_once('=') {
            Some((key, value)) => (key, value),
            None => (pair, ""),
        };
        let key = unescape_url_string(&key.replace('+', " "));
        let value = unescape_url_string(&value.replace('+', " "));
        if let (Some(key), Some(value)) = (key, value) {
            values.insert(key, value);
        }
    }
    values
}

/// Extracts a `name="value"` or `name=value` parameter from a structured
/// header value such as `Content-Type` or `Content-Disposition`.
pub fn header_param(header_value: &str, param: &str) -> Option<String> {
    for piece in header_value.split(';') {
        let piece = piece.trim();
        let Some((key, value)) = piece.split_once('=') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case(param) {
            continue;
        }
        let value = value.trim();
        let value = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')).unwrap_or(value);
        return Some(value.to_string());
    }
    None
}

/// Looks up the MIME type for a file extension, consulting the caller's
/// override map first, then the built-in table.
pub fn mime_type_for_extension(extension: &str, overrides: &HashMap<String, String>) -> String {
    let lowered = extension.to_ascii_lowercase();
    if let Some(mime) = overrides.get(&lowered) {
        return mime.clone();
    }
    mime_guess::from_ext(&lowered)
        .first()
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

/// A macro for early returns with an error if a condition is not met.
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn rfc822_round_trip() {
        let date = UNIX_EPOCH + Duration::from_secs(784111777);
        let formatted = format_rfc822(date);
        assert_eq!(formatted, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_rfc822(&formatted), Some(date));
    }

    #[test]
    fn rfc822_rejects_garbage() {
        assert!(parse_rfc822("yesterday-ish").is_none());
    }

    #[test]
    fn iso8601_round_trip() {
        let date = UNIX_EPOCH + Duration::from_secs(784111777);
        let formatted = format_iso8601(date);
        assert_eq!(formatted, "1994-11-06T08:49:37Z");
        assert_eq!(parse_iso8601(&formatted), Some(date));
        assert_eq!(parse_iso8601("1994-11-06T08:49:37"), Some(date));
    }

    #[test]
    fn escape_is_idempotent_over_unescape() {
        for input in ["a b+c", "path/to%20file", ":@/?&=+", "héllo wörld", "plain"] {
            let escaped = escape_url_string(input);
            let round = escape_url_string(&unescape_url_string(&escaped).unwrap());
            assert_eq!(round, escaped, "input: {input}");
        }
    }

    #[test]
    fn normalize_path_resolves_dots() {
        assert_eq!(normalize_path("/a/b/../c"), "/a/c");
        assert_eq!(normalize_path("/a//b/./c/"), "/a/b/c");
        assert_eq!(normalize_path("/../../x"), "/x");
        assert_eq!(normalize_path("a/b/.."), "a");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn form_parsing() {
        let values = parse_url_encoded_form("a=1&b=two+words&c=%2Fpath&flag");
        assert_eq!(values.get("a").unwrap(), "1");
        assert_eq!(values.get("b").unwrap(), "two words");
        assert_eq!(values.get("c").unwrap(), "/path");
        assert_eq!(values.get("flag").unwrap(), "");
    }

    #[test]
    fn mime_lookup() {
        let mut overrides = HashMap::new();
        overrides.insert("log".to_string(), "text/plain".to_string());
        assert_eq!(mime_type_for_extension("html", &overrides), "text/html");
        assert_eq!(mime_type_for_extension("LOG", &overrides), "text/plain");
        assert_eq!(mime_type_for_extension("xyzzy", &overrides), "application/octet-stream");
    }
}
