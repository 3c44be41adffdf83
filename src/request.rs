//! Incremental HTTP request parser.
//!
//! Lines are pulled from a `ByteBuffer` one at a time and drive the state machine
//! `RequestLine -> Headers -> Body -> Finish`. When the buffer runs dry before the
//! request is complete the parser keeps its state, so the next read event can feed
//! more bytes into the same parse.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, warn};

use crate::buffer::ByteBuffer;
use crate::constants::CRLF;
use crate::users::{Access, UserPool};

/// Logical paths that are served from `<path>.html`.
const DEFAULT_PAGES: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

/// Outcome of a successful `parse` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// The request can be answered.
    Complete,
    /// More bytes are needed; parser state is preserved.
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed request line: {0:?}")]
    BadRequestLine(String),
}

#[derive(Debug, Default, Clone)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub form: HashMap<String, String>,
}

pub struct RequestParser {
    state: ParseState,
    request: ParsedRequest,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            request: ParsedRequest::default(),
        }
    }

    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.request = ParsedRequest::default();
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn request(&self) -> &ParsedRequest {
        &self.request
    }

    pub fn method(&self) -> &str {
        &self.request.method
    }

    pub fn path(&self) -> &str {
        &self.request.path
    }

    pub fn version(&self) -> &str {
        &self.request.version
    }

    pub fn body(&self) -> &str {
        &self.request.body
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.request.headers.get(key).map(String::as_str)
    }

    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.request.form.get(key).map(String::as_str)
    }

    pub fn is_keep_alive(&self) -> bool {
        self.header("Connection") == Some("keep-alive") && self.request.version == "1.1"
    }

    /// Consume as many lines from `buf` as the current state allows.
    ///
    /// `users` is consulted only for form posts to the login and registration pages.
    pub fn parse(
        &mut self,
        buf: &mut ByteBuffer,
        users: Option<&UserPool>,
    ) -> Result<ParseStatus, ParseError> {
        while buf.readable_bytes() > 0 && self.state != ParseState::Finish {
            let raw = buf.retrieve_until(CRLF);
            if raw.is_empty() {
                // Partial line; wait for the rest.
                break;
            }
            let line = String::from_utf8_lossy(raw.strip_suffix(CRLF).unwrap_or(&raw)).into_owned();

            match self.state {
                ParseState::RequestLine => {
                    self.parse_request_line(&line)?;
                    self.normalize_path();
                }
                ParseState::Headers => self.parse_header(&line),
                ParseState::Body => self.parse_body(line, users),
                ParseState::Finish => {}
            }
        }

        debug!(
            method = %self.request.method,
            path = %self.request.path,
            version = %self.request.version,
            state = ?self.state,
            "parsed request"
        );
        Ok(self.status())
    }

    fn status(&self) -> ParseStatus {
        match self.state {
            ParseState::Finish => ParseStatus::Complete,
            ParseState::Body if self.announced_body_len() == 0 => ParseStatus::Complete,
            _ => ParseStatus::Incomplete,
        }
    }

    fn announced_body_len(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// `METHOD SP PATH SP HTTP/VERSION`, no spaces inside any of the three fields.
    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let bad = || ParseError::BadRequestLine(line.to_string());

        let mut parts = line.splitn(3, ' ');
        let (Some(method), Some(path), Some(rest)) = (parts.next(), parts.next(), parts.next())
        else {
            warn!("request line error: {line:?}");
            return Err(bad());
        };
        let Some(version) = rest.strip_prefix("HTTP/") else {
            warn!("request line error: {line:?}");
            return Err(bad());
        };
        if version.contains(' ') {
            warn!("request line error: {line:?}");
            return Err(bad());
        }

        self.request.method = method.to_string();
        self.request.path = path.to_string();
        self.request.version = version.to_string();
        self.state = ParseState::Headers;
        Ok(())
    }

    fn normalize_path(&mut self) {
        let path = &mut self.request.path;
        if path == "/" {
            *path = "/index.html".to_string();
        } else if DEFAULT_PAGES.contains(&path.as_str()) {
            path.push_str(".html");
        }
    }

    /// `KEY: VALUE`. Anything else, the blank separator line included, ends the headers.
    fn parse_header(&mut self, line: &str) {
        match line.split_once(':') {
            Some((key, value)) => {
                let value = value.strip_prefix(' ').unwrap_or(value);
                self.request
                    .headers
                    .insert(key.to_string(), value.to_string());
            }
            None => self.state = ParseState::Body,
        }
    }

    fn parse_body(&mut self, line: String, users: Option<&UserPool>) {
        self.request.body = line;
        self.parse_post(users);
        self.state = ParseState::Finish;
        debug!(body = %self.request.body, "request body");
    }

    fn parse_post(&mut self, users: Option<&UserPool>) {
        if self.request.method != "POST" || self.header("Content-Type") != Some(FORM_URLENCODED) {
            return;
        }
        self.request.form = decode_form(&self.request.body);

        let access = match self.request.path.as_str() {
            "/register.html" => Access::Register,
            "/login.html" => Access::Login,
            _ => return,
        };
        let name = self.form_value("username").unwrap_or_default();
        let password = self.form_value("password").unwrap_or_default();
        let verified = match users {
            Some(pool) => pool.verify(name, password, access),
            None => {
                warn!("no credential store configured, rejecting {access:?}");
                false
            }
        };
        self.request.path = if verified {
            "/welcome.html".to_string()
        } else {
            "/error.html".to_string()
        };
    }
}

/// Decode an `application/x-www-form-urlencoded` body. Per key and value: percent-decode,
/// then `+` becomes a space, then surrounding spaces are trimmed. Later duplicates win.
pub fn decode_form(body: &str) -> HashMap<String, String> {
    let mut form = HashMap::new();
    for token in body.split('&') {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        form.insert(decode_component(key), decode_component(value));
    }
    form
}

fn decode_component(raw: &str) -> String {
    let decoded = percent_decode(raw.as_bytes()).replace('+', " ");
    decoded.trim_matches(' ').to_string()
}

fn percent_decode(bytes: &[u8]) -> String {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
