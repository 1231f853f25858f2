//! RTSP protocol implementation (RFC 2326).
//!
//! This module handles the text-based RTSP signaling protocol: incremental
//! parsing of requests (server side) and responses (pusher side), building
//! the messages each side sends, digest authentication and SDP generation.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://server/stream RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! Interleaved RTP/RTCP (RFC 2326 §10.12) shares the same TCP stream and is
//! framed as `'$' <channel> <u16 length> <payload>`. Both parsers hand such
//! frames back as [`ParseOutcome::Interleaved`] when they appear between
//! messages.
//!
//! ## Supported methods
//!
//! | Method | RFC section | Role |
//! |--------|-------------|------|
//! | OPTIONS | §10.1 | both |
//! | DESCRIBE | §10.2 | server |
//! | ANNOUNCE | §10.3 | pusher |
//! | SETUP | §10.4 | both |
//! | PLAY | §10.5 | server |
//! | RECORD | §10.11 | pusher |
//! | TEARDOWN | §10.7 | both |
//! | GET_PARAMETER | §10.8 | server (keep-alive) |

pub mod auth;
pub mod message;
pub mod request;
pub mod response;
pub mod sdp;
pub mod transport;

use std::fmt;

use bytes::{Buf, Bytes, BytesMut};

pub use auth::{DigestAuthentication, DigestChallenge, DigestCredentials};
pub use message::RtspMessage;
pub use request::{RequestParseState, RtspRequest};
pub use response::{ResponseParseState, RtspResponse};
pub use transport::TransportHeader;

use crate::error::{ParseErrorKind, Result, RtspError};

/// Default RTSP port (RFC 2326 §3.2).
pub const DEFAULT_RTSP_PORT: u16 = 554;

/// RTSP request method (RFC 2326 §10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    Options,
    Describe,
    Announce,
    Setup,
    Play,
    Pause,
    Record,
    Teardown,
    GetParameter,
    SetParameter,
    Redirect,
    #[default]
    Unknown,
}

impl Method {
    pub fn parse(name: &str) -> Method {
        match name {
            "OPTIONS" => Method::Options,
            "DESCRIBE" => Method::Describe,
            "ANNOUNCE" => Method::Announce,
            "SETUP" => Method::Setup,
            "PLAY" => Method::Play,
            "PAUSE" => Method::Pause,
            "RECORD" => Method::Record,
            "TEARDOWN" => Method::Teardown,
            "GET_PARAMETER" => Method::GetParameter,
            "SET_PARAMETER" => Method::SetParameter,
            "REDIRECT" => Method::Redirect,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Options => "OPTIONS",
            Method::Describe => "DESCRIBE",
            Method::Announce => "ANNOUNCE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Pause => "PAUSE",
            Method::Record => "RECORD",
            Method::Teardown => "TEARDOWN",
            Method::GetParameter => "GET_PARAMETER",
            Method::SetParameter => "SET_PARAMETER",
            Method::Redirect => "REDIRECT",
            Method::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An `rtsp://host[:port]/suffix` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspUrl {
    pub host: String,
    pub port: u16,
    /// Path after the authority, without the leading `/`.
    pub suffix: String,
}

impl RtspUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = || RtspError::InvalidUrl(url.to_string());

        let rest = url
            .get(..7)
            .filter(|scheme| scheme.eq_ignore_ascii_case("rtsp://"))
            .map(|_| &url[7..])
            .ok_or_else(invalid)?;

        let (authority, suffix) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos + 1..]),
            None => (rest, ""),
        };
        // Credentials in the authority are not used for signaling.
        let authority = authority.rsplit('@').next().unwrap_or(authority);

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (authority, DEFAULT_RTSP_PORT),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(RtspUrl {
            host: host.to_string(),
            port,
            suffix: suffix.trim_end_matches('/').to_string(),
        })
    }
}

impl fmt::Display for RtspUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rtsp://{}:{}/{}", self.host, self.port, self.suffix)
    }
}

/// RTP or RTCP payload carried on the RTSP stream (RFC 2326 §10.12).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterleavedFrame {
    pub channel: u8,
    pub payload: Bytes,
}

/// Result of one incremental parse step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The buffer ends mid-message; feed more bytes and call again.
    NeedMore,
    /// A full message has been parsed.
    Complete,
    /// An interleaved binary frame was consumed from the front of the buffer.
    Interleaved(InterleavedFrame),
}

/// Remove one CRLF- (or bare LF-) terminated line from the front of `buf`.
///
/// Returns `None` without consuming anything when no terminator is buffered.
pub(crate) fn take_line(buf: &mut BytesMut, max_size: usize) -> Result<Option<String>> {
    let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > max_size {
            return Err(RtspError::parse(ParseErrorKind::LineTooLong));
        }
        return Ok(None);
    };
    if pos > max_size {
        return Err(RtspError::parse(ParseErrorKind::LineTooLong));
    }
    let line = buf.split_to(pos + 1);
    let text = String::from_utf8_lossy(&line[..pos]);
    Ok(Some(text.trim_end_matches('\r').to_string()))
}

/// Remove one `$`-framed packet from the front of `buf`, if complete.
pub(crate) fn take_interleaved(buf: &mut BytesMut) -> Option<InterleavedFrame> {
    if buf.len() < 4 || buf[0] != b'$' {
        return None;
    }
    let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf.len() < 4 + len {
        return None;
    }
    let channel = buf[1];
    buf.advance(4);
    let payload = buf.split_to(len).freeze();
    Some(InterleavedFrame { channel, payload })
}

/// Parse a `Content-Length` header value against the message size limit.
pub(crate) fn parse_content_length(value: &str, max_size: usize) -> Result<usize> {
    let len: usize = value
        .trim()
        .parse()
        .map_err(|_| RtspError::parse(ParseErrorKind::InvalidContentLength))?;
    if len > max_size {
        return Err(RtspError::MessageTooLarge {
            size: len,
            limit: max_size,
        });
    }
    Ok(len)
}

/// Split a `name: value` header line. Lines without a colon yield `None`.
pub(crate) fn split_header(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}
