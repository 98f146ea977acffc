//! HTTP authentication gate applied before handler processing.
//!
//! Supports Basic (RFC 7617) and Digest (RFC 7616 without `qop`, i.e. the
//! RFC 2069 computation). The Digest nonce is minted once per server start;
//! credentials presented against an older nonce get a `stale=TRUE`
//! re-challenge so well-behaved clients retry without prompting the user.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::prelude::*;
use http::StatusCode;
use md5::{Digest, Md5};
use tracing::debug;

use crate::request::RequestHead;
use crate::response::Response;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationScheme {
    Basic,
    Digest,
}

/// Validates `Authorization` headers against a fixed account table.
pub struct Authenticator {
    scheme: AuthenticationScheme,
    realm: String,
    accounts: HashMap<String, String>,
    nonce: String,
}

impl Authenticator {
    pub fn new(scheme: AuthenticationScheme, realm: &str, accounts: HashMap<String, String>) -> Self {
        Self { scheme, realm: realm.to_string(), accounts, nonce: mint_nonce() }
    }

    #[cfg(test)]
    fn new_with_parts(scheme: AuthenticationScheme, realm: &str, accounts: HashMap<String, String>, nonce: String) -> Self {
        Self { scheme, realm: realm.to_string(), accounts, nonce }
    }

    pub fn scheme(&self) -> AuthenticationScheme {
        self.scheme
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Checks a request's credentials. Returns `None` when authorized,
    /// otherwise the 401 challenge to send instead of dispatching.
    pub fn check(&self, head: &RequestHead) -> Option<Response> {
        let authorization = head
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        let verdict = match (self.scheme, authorization) {
            (_, None) => Verdict::Unauthorized,
            (AuthenticationScheme::Basic, Some(value)) => self.check_basic(value),
            (AuthenticationScheme::Digest, Some(value)) => self.check_digest(head, value),
        };
        match verdict {
            Verdict::Authorized => None,
            Verdict::Unauthorized => Some(self.challenge(false)),
            Verdict::StaleNonce => Some(self.challenge(true)),
        }
    }

    fn check_basic(&self, authorization: &str) -> Verdict {
        let Some(credentials) = authorization.strip_prefix("Basic ") else {
            return Verdict::Unauthorized;
        };
        let credentials = credentials.trim();
        for (user, password) in &self.accounts {
            let expected = BASE64_STANDARD.encode(format!("{user}:{password}"));
            if credentials == expected {
                return Verdict::Authorized;
            }
        }
        debug!("rejected Basic credentials");
        Verdict::Unauthorized
    }

    fn check_digest(&self, head: &RequestHead, authorization: &str) -> Verdict {
        let Some(parameters) = authorization.strip_prefix("Digest ").map(parse_digest_params) else {
            return Verdict::Unauthorized;
        };
        let (Some(username), Some(realm), Some(nonce), Some(uri), Some(response)) = (
            parameters.get("username"),
            parameters.get("realm"),
            parameters.get("nonce"),
            parameters.get("uri"),
            parameters.get("response"),
        ) else {
            return Verdict::Unauthorized;
        };
        if realm != &self.realm {
            return Verdict::Unauthorized;
        }
        if nonce != &self.nonce {
            // likely minted by a previous run of this server
            debug!("stale Digest nonce");
            return Verdict::StaleNonce;
        }
        let Some(password) = self.accounts.get(username) else {
            return Verdict::Unauthorized;
        };
        let ha1 = md5_hex(&format!("{username}:{}:{password}", self.realm));
        let ha2 = md5_hex(&format!("{}:{uri}", head.method()));
        let expected = md5_hex(&format!("{ha1}:{}:{ha2}", self.nonce));
        if expected.eq_ignore_ascii_case(response) {
            Verdict::Authorized
        } else {
            debug!(%username, "rejected Digest credentials");
            Verdict::Unauthorized
        }
    }

    fn challenge(&self, stale: bool) -> Response {
        let header = match self.scheme {
            AuthenticationScheme::Basic => format!("Basic realm=\"{}\"", self.realm),
            AuthenticationScheme::Digest if stale => {
                format!("Digest realm=\"{}\", nonce=\"{}\", stale=TRUE", self.realm, self.nonce)
            }
            AuthenticationScheme::Digest => {
                format!("Digest realm=\"{}\", nonce=\"{}\"", self.realm, self.nonce)
            }
        };
        let mut response = Response::with_status(StatusCode::UNAUTHORIZED);
        response.add_header(http::header::WWW_AUTHENTICATE, &header);
        response
    }
}

enum Verdict {
    Authorized,
    Unauthorized,
    StaleNonce,
}

/// Parses the comma-separated `key="value"` parameters of a Digest header.
fn parse_digest_params(parameters: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for piece in parameters.split(',') {
        let Some((key, value)) = piece.split_once('=') else {
            continue;
        };
        let value = value.trim();
        let value = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')).unwrap_or(value);
        values.insert(key.trim().to_ascii_lowercase(), value.to_string());
    }
    values
}

fn md5_hex(input: &str) -> String {
    let digest = Md5::digest(input.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

fn mint_nonce() -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    md5_hex(&format!("{}:{}", now.as_nanos(), std::process::id()))
}
