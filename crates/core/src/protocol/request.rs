use std::net::Ipv4Addr;

use bytes::{Bytes, BytesMut};

use super::message::RtspMessage;
use super::{
    DigestCredentials, Method, ParseOutcome, TransportHeader, parse_content_length, split_header,
    take_interleaved, take_line,
};
use crate::error::{ParseErrorKind, Result, RtspError};
use crate::media::MediaChannelId;
use crate::mount::extract_session_suffix;

/// Methods advertised in the `Public` header of OPTIONS responses.
pub const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN, GET_PARAMETER";

/// Position of the incremental request parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestParseState {
    ParseRequestLine,
    ParseHeadersLine,
    ParseBody,
    GotAll,
}

/// An RTSP request parsed incrementally from a connection's read buffer
/// (RFC 2326 §6).
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// [`parse_request`](Self::parse_request) consumes only complete lines, so a
/// message split across any number of reads parses the same as one read.
/// Call [`reset`](Self::reset) after handling a request to parse the next
/// one on the same connection.
///
/// Header lookup is case-insensitive per RFC 2326 §4.2. Unknown headers are
/// kept but otherwise ignored; lines without a colon are skipped.
#[derive(Debug)]
pub struct RtspRequest {
    state: RequestParseState,
    max_size: usize,
    method: Method,
    method_name: String,
    uri: String,
    version: String,
    suffix: String,
    channel: MediaChannelId,
    /// Headers as ordered (name, value) pairs, names as received.
    pub headers: Vec<(String, String)>,
    cseq: Option<String>,
    accept: Option<String>,
    transport: Option<TransportHeader>,
    session: Option<String>,
    credentials: Option<DigestCredentials>,
    content_length: usize,
    body: Bytes,
}

impl RtspRequest {
    /// `max_size` bounds a single line and a body.
    pub fn new(max_size: usize) -> Self {
        Self {
            state: RequestParseState::ParseRequestLine,
            max_size,
            method: Method::Unknown,
            method_name: String::new(),
            uri: String::new(),
            version: String::new(),
            suffix: String::new(),
            channel: MediaChannelId::Channel0,
            headers: Vec::new(),
            cseq: None,
            accept: None,
            transport: None,
            session: None,
            credentials: None,
            content_length: 0,
            body: Bytes::new(),
        }
    }

    /// Advance the parser over `buf`, consuming what it used.
    ///
    /// `$`-framed binary data found between requests is returned as
    /// [`ParseOutcome::Interleaved`]. Errors mean framing is lost and the
    /// connection should be closed.
    pub fn parse_request(&mut self, buf: &mut BytesMut) -> Result<ParseOutcome> {
        loop {
            match self.state {
                RequestParseState::GotAll => return Ok(ParseOutcome::Complete),
                RequestParseState::ParseRequestLine => {
                    if buf.first() == Some(&b'$') {
                        return Ok(match take_interleaved(buf) {
                            Some(frame) => ParseOutcome::Interleaved(frame),
                            None => ParseOutcome::NeedMore,
                        });
                    }
                    let Some(line) = take_line(buf, self.max_size)? else {
                        return Ok(ParseOutcome::NeedMore);
                    };
                    // Stray CRLFs between messages are allowed.
                    if line.trim().is_empty() {
                        continue;
                    }
                    self.parse_request_line(&line)?;
                    self.state = RequestParseState::ParseHeadersLine;
                }
                RequestParseState::ParseHeadersLine => {
                    let Some(line) = take_line(buf, self.max_size)? else {
                        return Ok(ParseOutcome::NeedMore);
                    };
                    if line.is_empty() {
                        self.state = if self.content_length > 0 {
                            RequestParseState::ParseBody
                        } else {
                            RequestParseState::GotAll
                        };
                        continue;
                    }
                    self.parse_header_line(&line)?;
                }
                RequestParseState::ParseBody => {
                    if buf.len() < self.content_length {
                        return Ok(ParseOutcome::NeedMore);
                    }
                    self.body = buf.split_to(self.content_length).freeze();
                    self.state = RequestParseState::GotAll;
                }
            }
        }
    }

    fn parse_request_line(&mut self, line: &str) -> Result<()> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 3 || !parts[2].starts_with("RTSP/") {
            return Err(RtspError::parse(ParseErrorKind::InvalidRequestLine));
        }

        self.method_name = parts[0].to_string();
        self.method = Method::parse(parts[0]);
        self.uri = parts[1].to_string();
        self.version = parts[2].to_string();

        if self.version != "RTSP/1.0" {
            tracing::warn!(version = %self.version, "client sent non-RTSP/1.0 version");
        }

        let (suffix, channel) = extract_session_suffix(&self.uri);
        self.suffix = suffix.to_string();
        self.channel = channel.unwrap_or(MediaChannelId::Channel0);
        Ok(())
    }

    fn parse_header_line(&mut self, line: &str) -> Result<()> {
        let Some((name, value)) = split_header(line) else {
            tracing::trace!(line, "ignoring malformed header line");
            return Ok(());
        };

        match name.to_ascii_lowercase().as_str() {
            "cseq" => self.cseq = Some(value.to_string()),
            "accept" => self.accept = Some(value.to_string()),
            "transport" => self.transport = TransportHeader::parse(value),
            "session" => {
                let id = value.split(';').next().unwrap_or_default().trim();
                self.session = Some(id.to_string());
            }
            "authorization" => self.credentials = DigestCredentials::parse(value),
            "content-length" => self.content_length = parse_content_length(value, self.max_size)?,
            _ => {}
        }
        self.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    pub fn state(&self) -> RequestParseState {
        self.state
    }

    pub fn got_all(&self) -> bool {
        self.state == RequestParseState::GotAll
    }

    /// Clear all per-message state for the next request.
    pub fn reset(&mut self) {
        *self = Self::new(self.max_size);
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Method token as sent, including unrecognized ones.
    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// Request-URI as sent (e.g. `rtsp://host:554/live/track0`).
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Media session suffix of the URI, without any `trackN` segment.
    pub fn url_suffix(&self) -> &str {
        &self.suffix
    }

    /// Base URL of the presentation (the URI without `/trackN`).
    pub fn base_url(&self) -> &str {
        match self.uri.rfind("/track") {
            Some(pos) if MediaChannelId::from_track_name(&self.uri[pos + 1..]).is_some() => {
                &self.uri[..pos]
            }
            _ => self.uri.trim_end_matches('/'),
        }
    }

    /// Media channel addressed by a trailing `trackN`, channel 0 otherwise.
    pub fn channel(&self) -> MediaChannelId {
        self.channel
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the CSeq header value, which numbers and orders RTSP
    /// request/response pairs (RFC 2326 §12.17).
    ///
    /// Every RTSP request must include a CSeq, and the response must echo it.
    pub fn cseq(&self) -> Option<&str> {
        self.cseq.as_deref()
    }

    /// `Accept` header value as sent.
    pub fn accept(&self) -> Option<&str> {
        self.accept.as_deref()
    }

    /// Whether a DESCRIBE may be answered with SDP. A missing `Accept`
    /// accepts anything; otherwise one media range must cover
    /// `application/sdp`.
    pub fn accepts_sdp(&self) -> bool {
        let Some(accept) = self.accept.as_deref() else {
            return true;
        };
        accept.split(',').any(|range| {
            let media = range.split(';').next().unwrap_or_default().trim();
            ["application/sdp", "application/*", "*/*"]
                .iter()
                .any(|m| media.eq_ignore_ascii_case(m))
        })
    }

    pub fn transport(&self) -> Option<&TransportHeader> {
        self.transport.as_ref()
    }

    /// Session id from the `Session` header, without parameters.
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn credentials(&self) -> Option<&DigestCredentials> {
        self.credentials.as_ref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    fn response(&self, status_code: u16, status_text: &str) -> RtspMessage {
        RtspMessage::response(status_code, status_text).add_optional_header("CSeq", self.cseq())
    }

    pub fn build_option_res(&self) -> RtspMessage {
        self.response(200, "OK").add_header("Public", PUBLIC_METHODS)
    }

    pub fn build_describe_res(&self, sdp: String) -> RtspMessage {
        self.response(200, "OK")
            .add_header("Content-Base", format!("{}/", self.base_url()))
            .add_header("Content-Type", "application/sdp")
            .with_body(sdp)
    }

    pub fn build_setup_udp_res(
        &self,
        client_ports: (u16, u16),
        server_ports: (u16, u16),
        session_id: u32,
        timeout_secs: u64,
    ) -> RtspMessage {
        self.response(200, "OK")
            .add_header(
                "Transport",
                format!(
                    "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                    client_ports.0, client_ports.1, server_ports.0, server_ports.1
                ),
            )
            .add_header("Session", format!("{};timeout={}", session_id, timeout_secs))
    }

    pub fn build_setup_tcp_res(
        &self,
        rtp_channel: u8,
        rtcp_channel: u8,
        session_id: u32,
        timeout_secs: u64,
    ) -> RtspMessage {
        self.response(200, "OK")
            .add_header(
                "Transport",
                format!("RTP/AVP/TCP;unicast;interleaved={}-{}", rtp_channel, rtcp_channel),
            )
            .add_header("Session", format!("{};timeout={}", session_id, timeout_secs))
    }

    pub fn build_setup_multicast_res(
        &self,
        group: Ipv4Addr,
        source: &str,
        port: u16,
        ttl: u32,
        session_id: u32,
        timeout_secs: u64,
    ) -> RtspMessage {
        self.response(200, "OK")
            .add_header(
                "Transport",
                format!(
                    "RTP/AVP;multicast;destination={};source={};port={}-{};ttl={}",
                    group,
                    source,
                    port,
                    port + 1,
                    ttl
                ),
            )
            .add_header("Session", format!("{};timeout={}", session_id, timeout_secs))
    }

    /// 200 to PLAY with `Range` and, when non-empty, `RTP-Info` (RFC 2326 §12.33).
    pub fn build_play_res(&self, rtp_info: &str, session_id: u32, timeout_secs: u64) -> RtspMessage {
        let message = self
            .response(200, "OK")
            .add_header("Range", "npt=0.000-")
            .add_header("Session", format!("{};timeout={}", session_id, timeout_secs));
        if rtp_info.is_empty() {
            message
        } else {
            message.add_header("RTP-Info", rtp_info)
        }
    }

    /// The `Session` header is echoed only once a SETUP assigned one.
    pub fn build_teardown_res(&self, session_id: Option<u32>) -> RtspMessage {
        with_session(self.response(200, "OK"), session_id)
    }

    pub fn build_get_parameter_res(&self, session_id: Option<u32>) -> RtspMessage {
        with_session(self.response(200, "OK"), session_id)
    }

    /// 401 carrying a Digest challenge (RFC 2617 §3.2.1).
    pub fn build_unauthorized_res(&self, realm: &str, nonce: &str) -> RtspMessage {
        self.response(401, "Unauthorized").add_header(
            "WWW-Authenticate",
            format!("Digest realm=\"{}\", nonce=\"{}\"", realm, nonce),
        )
    }

    /// 400 Bad Request: malformed or missing required header.
    pub fn build_bad_request_res(&self) -> RtspMessage {
        self.response(400, "Bad Request")
    }

    /// 404 Not Found: no media session matches the URL.
    pub fn build_not_found_res(&self) -> RtspMessage {
        self.response(404, "Not Found")
    }

    /// 406: the client's `Accept` rules out SDP.
    pub fn build_not_acceptable_res(&self) -> RtspMessage {
        self.response(406, "Not Acceptable")
    }

    pub fn build_session_not_found_res(&self) -> RtspMessage {
        self.response(454, "Session Not Found")
    }

    pub fn build_method_not_valid_res(&self) -> RtspMessage {
        self.response(455, "Method Not Valid in This State")
    }

    pub fn build_unsupported_res(&self) -> RtspMessage {
        self.response(461, "Unsupported Transport")
    }

    pub fn build_server_error_res(&self) -> RtspMessage {
        self.response(500, "Internal Server Error")
    }

    pub fn build_not_implemented_res(&self) -> RtspMessage {
        self.response(501, "Not Implemented").add_header("Public", PUBLIC_METHODS)
    }
}

fn with_session(message: RtspMessage, session_id: Option<u32>) -> RtspMessage {
    match session_id {
        Some(id) => message.add_header("Session", id),
        None => message,
    }
}
