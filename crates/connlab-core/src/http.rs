//! HTTP/1.1 request and response descriptors.
//!
//! Only the subset the harness needs: bodies are absent, Content-Length
//! framed, chunked, or (for responses) delimited by connection close.

mod codec;


pub use codec::{
    read_request, read_response, read_response_prefix, write_request, write_response, ParseLimits,
};

use crate::error::{HarnessError, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "HTTP/1.0" => Some(Version::Http10),
            "HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Http10 => f.write_str("HTTP/1.0"),
            Version::Http11 => f.write_str("HTTP/1.1"),
        }
    }
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces every header called `name` with a single value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the comma-separated `name` header lists `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .flat_map(|(_, value)| value.split(','))
            .any(|part| part.trim().eq_ignore_ascii_case(token))
    }

    pub fn content_length(&self) -> Option<&str> {
        self.get("Content-Length")
    }

    pub fn is_chunked(&self) -> bool {
        self.has_token("Transfer-Encoding", "chunked")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Empty,
    Fixed(Vec<u8>),
    Chunked(Vec<u8>),
}

impl Body {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Fixed(data) | Body::Chunked(data) => data,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.bytes()).into_owned()
    }
}

/// Credentials a client presents when challenged.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub scheme: String,
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Body,
    /// Never serialized; consulted when the server answers with a challenge.
    pub credentials: Option<Credentials>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            version: Version::Http11,
            headers: Headers::new(),
            body: Body::Empty,
            credentials: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn has_body(&self) -> bool {
        !matches!(self.body, Body::Empty)
    }

    /// Whether the client asked for a persistent connection.
    pub fn wants_keep_alive(&self) -> bool {
        if self.headers.has_token("Connection", "close") {
            return false;
        }
        match self.version {
            Version::Http11 => true,
            Version::Http10 => self.headers.has_token("Connection", "keep-alive"),
        }
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

pub fn is_redirect_status(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// Statuses whose responses never carry a body.
pub fn is_bodiless_status(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: u16,
    reason: String,
    version: Version,
    headers: Headers,
    body: Body,
    keep_alive: Option<bool>,
    close_connection: bool,
    no_content_length: bool,
    resolved: bool,
    truncated: bool,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            version: Version::Http11,
            headers: Headers::new(),
            body: Body::Empty,
            keep_alive: None,
            close_connection: false,
            no_content_length: false,
            resolved: false,
            truncated: false,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn with_text(status: u16, text: impl Into<String>) -> Self {
        let mut response = Self::new(status);
        response.body = Body::Fixed(text.into().into_bytes());
        response
    }

    /// An error response carrying `message` as its body.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        let mut response = Self::with_text(status, message);
        response.headers.set("Content-Type", "text/plain");
        response
    }

    pub fn redirect(status: u16, location: impl Into<String>) -> Self {
        let mut response = Self::new(status);
        response.headers.set("Location", location.into());
        response
    }

    /// Builder-style header for a response that has not been resolved yet.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if !self.resolved {
            self.headers.set(name, value);
        }
        self
    }

    pub(crate) fn received(
        version: Version,
        status: u16,
        reason: String,
        headers: Headers,
        body: Body,
    ) -> Self {
        let keep_alive = if headers.has_token("Connection", "close") {
            false
        } else {
            match version {
                Version::Http11 => true,
                Version::Http10 => headers.has_token("Connection", "keep-alive"),
            }
        };
        Self {
            status,
            reason,
            version,
            headers,
            body,
            keep_alive: Some(keep_alive),
            close_connection: !keep_alive,
            no_content_length: false,
            resolved: true,
            truncated: false,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }

    pub fn keep_alive(&self) -> Option<bool> {
        self.keep_alive
    }

    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    /// The client stopped reading before the body ended.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Whether the connection may carry another exchange after this one.
    pub fn allows_reuse(&self) -> bool {
        !self.close_connection && self.keep_alive.unwrap_or(false)
    }

    fn ensure_mutable(&self, what: &str) -> Result<()> {
        if self.resolved {
            return Err(HarnessError::contract(format!(
                "cannot change {} after headers were resolved",
                what
            )));
        }
        Ok(())
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.ensure_mutable("headers")?;
        self.headers.set(name, value);
        Ok(())
    }

    pub fn set_body(&mut self, body: Body) -> Result<()> {
        self.ensure_mutable("body")?;
        self.body = body;
        Ok(())
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) -> Result<()> {
        self.ensure_mutable("keep-alive")?;
        self.keep_alive = Some(keep_alive);
        Ok(())
    }

    pub fn set_close_connection(&mut self, close: bool) -> Result<()> {
        self.ensure_mutable("close-connection")?;
        self.close_connection = close;
        Ok(())
    }

    pub fn set_no_content_length(&mut self, value: bool) -> Result<()> {
        self.ensure_mutable("content-length mode")?;
        self.no_content_length = value;
        Ok(())
    }

    /// Computes framing and connection headers. Runs once; later calls are
    /// no-ops.
    pub fn resolve_headers(&mut self) {
        if self.resolved {
            return;
        }
        match &self.body {
            Body::Chunked(_) => {
                self.headers.remove("Content-Length");
                self.headers.set("Transfer-Encoding", "chunked");
            }
            Body::Fixed(data) => {
                if !self.no_content_length && !self.headers.contains("Content-Length") {
                    self.headers.set("Content-Length", data.len().to_string());
                }
            }
            Body::Empty => {
                if !self.no_content_length
                    && !is_bodiless_status(self.status)
                    && !self.headers.contains("Content-Length")
                {
                    self.headers.set("Content-Length", "0");
                }
            }
        }
        let close_delimited = !self.headers.contains("Content-Length")
            && !self.headers.is_chunked()
            && !is_bodiless_status(self.status);
        if close_delimited {
            self.close_connection = true;
        }
        if !self.headers.contains("Connection") {
            let persistent = !self.close_connection && self.keep_alive.unwrap_or(false);
            self.headers.set(
                "Connection",
                if persistent { "keep-alive" } else { "close" },
            );
        }
        if close_delimited {
            self.headers.set("Connection", "close");
        }
        if self.headers.has_token("Connection", "close") {
            self.close_connection = true;
            self.keep_alive = Some(false);
        } else {
            self.keep_alive = Some(true);
        }
        self.resolved = true;
    }
}
