use std::fmt::Display;

use bytes::Bytes;

use super::Method;
use crate::error::{Result, RtspError};

/// Default `Server`/`User-Agent` value (RFC 2326 §12.36, §12.41).
pub const DEFAULT_AGENT: &str = concat!("rtsp-reactor/", env!("CARGO_PKG_VERSION"));

/// An outgoing RTSP request or response (RFC 2326 §6, §7).
///
/// Serializes to the standard text format:
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 1\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// Uses a builder pattern: chain [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then call [`serialize`](Self::serialize)
/// or [`encode`](Self::encode). `Content-Length` is computed automatically
/// when a body is present.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspMessage {
    start_line: String,
    status_code: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RtspMessage {
    pub fn response(status_code: u16, status_text: &str) -> Self {
        RtspMessage {
            start_line: format!("RTSP/1.0 {} {}", status_code, status_text),
            status_code: Some(status_code),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn request(method: Method, uri: &str) -> Self {
        RtspMessage {
            start_line: format!("{} {} RTSP/1.0", method, uri),
            status_code: None,
            headers: Vec::new(),
            body: None,
        }
    }

    /// 200 OK: success (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::response(200, "OK")
    }

    /// Status code for responses, `None` for requests.
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    pub fn start_line(&self) -> &str {
        &self.start_line
    }

    pub fn add_header(mut self, name: &str, value: impl Display) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Add a header only when `value` is present.
    pub fn add_optional_header(self, name: &str, value: Option<impl Display>) -> Self {
        match value {
            Some(value) => self.add_header(name, value),
            None => self,
        }
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Case-insensitive header lookup (RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Serialize to the RTSP text wire format.
    ///
    /// If a body is present, `Content-Length` is appended automatically
    /// (RFC 2326 §12.14).
    pub fn serialize(&self) -> String {
        let mut message = format!("{}\r\n", self.start_line);

        for (name, value) in &self.headers {
            message.push_str(&format!("{}: {}\r\n", name, value));
        }

        if let Some(body) = &self.body {
            message.push_str(&format!("Content-Length: {}\r\n", body.len()));
            message.push_str("\r\n");
            message.push_str(body);
        } else {
            message.push_str("\r\n");
        }
        message
    }

    /// Serialize into bytes, failing if the result exceeds `limit`.
    pub fn encode(&self, limit: usize) -> Result<Bytes> {
        let text = self.serialize();
        if text.len() > limit {
            return Err(RtspError::MessageTooLarge {
                size: text.len(),
                limit,
            });
        }
        Ok(Bytes::from(text))
    }
}
