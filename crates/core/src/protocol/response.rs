use bytes::{Bytes, BytesMut};

use super::message::RtspMessage;
use super::{
    DigestChallenge, Method, ParseOutcome, parse_content_length, split_header, take_interleaved,
    take_line,
};
use crate::error::{ParseErrorKind, Result, RtspError};
use crate::media::MediaChannelId;

/// Position of the incremental response parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseParseState {
    ParseStatusLine,
    ParseHeadersLine,
    ParseBody,
    GotAll,
}

/// Client half of an RTSP exchange, used by the pusher.
///
/// Builds the requests the pusher sends (each with the next `CSeq`, starting
/// at 1) and parses the server's replies incrementally. The method and URI of
/// the last request are remembered so a `401` can be answered by resending
/// it with credentials. The server's session id, once announced in a SETUP
/// reply, is carried on every later request.
///
/// [`reset`](Self::reset) clears only the parsed reply; request state
/// survives across the whole conversation.
#[derive(Debug)]
pub struct RtspResponse {
    url: String,
    max_size: usize,
    next_cseq: u32,
    method: Method,
    request_uri: String,
    session: Option<String>,

    state: ResponseParseState,
    status_code: u16,
    status_text: String,
    pub headers: Vec<(String, String)>,
    response_cseq: Option<u32>,
    challenge: Option<DigestChallenge>,
    content_length: usize,
    body: Bytes,
}

impl RtspResponse {
    pub fn new(url: &str, max_size: usize) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            max_size,
            next_cseq: 1,
            method: Method::Unknown,
            request_uri: String::new(),
            session: None,
            state: ResponseParseState::ParseStatusLine,
            status_code: 0,
            status_text: String::new(),
            headers: Vec::new(),
            response_cseq: None,
            challenge: None,
            content_length: 0,
            body: Bytes::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Advance the parser over `buf`, consuming what it used.
    pub fn parse_response(&mut self, buf: &mut BytesMut) -> Result<ParseOutcome> {
        loop {
            match self.state {
                ResponseParseState::GotAll => return Ok(ParseOutcome::Complete),
                ResponseParseState::ParseStatusLine => {
                    if buf.first() == Some(&b'$') {
                        return Ok(match take_interleaved(buf) {
                            Some(frame) => ParseOutcome::Interleaved(frame),
                            None => ParseOutcome::NeedMore,
                        });
                    }
                    let Some(line) = take_line(buf, self.max_size)? else {
                        return Ok(ParseOutcome::NeedMore);
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    self.parse_status_line(&line)?;
                    self.state = ResponseParseState::ParseHeadersLine;
                }
                ResponseParseState::ParseHeadersLine => {
                    let Some(line) = take_line(buf, self.max_size)? else {
                        return Ok(ParseOutcome::NeedMore);
                    };
                    if line.is_empty() {
                        self.state = if self.content_length > 0 {
                            ResponseParseState::ParseBody
                        } else {
                            ResponseParseState::GotAll
                        };
                        continue;
                    }
                    self.parse_header_line(&line)?;
                }
                ResponseParseState::ParseBody => {
                    if buf.len() < self.content_length {
                        return Ok(ParseOutcome::NeedMore);
                    }
                    self.body = buf.split_to(self.content_length).freeze();
                    self.state = ResponseParseState::GotAll;
                }
            }
        }
    }

    fn parse_status_line(&mut self, line: &str) -> Result<()> {
        let invalid = || RtspError::parse(ParseErrorKind::InvalidStatusLine);
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().ok_or_else(invalid)?;
        if !version.starts_with("RTSP/") {
            return Err(invalid());
        }
        self.status_code = parts
            .next()
            .and_then(|code| code.trim().parse().ok())
            .ok_or_else(invalid)?;
        self.status_text = parts.next().unwrap_or_default().trim().to_string();
        Ok(())
    }

    fn parse_header_line(&mut self, line: &str) -> Result<()> {
        let Some((name, value)) = split_header(line) else {
            return Ok(());
        };
        match name.to_ascii_lowercase().as_str() {
            "cseq" => self.response_cseq = value.parse().ok(),
            "session" => {
                let id = value.split(';').next().unwrap_or_default().trim();
                if !id.is_empty() {
                    self.session = Some(id.to_string());
                }
            }
            "www-authenticate" => {
                if let Some(challenge) = DigestChallenge::parse(value) {
                    self.challenge = Some(challenge);
                }
            }
            "content-length" => self.content_length = parse_content_length(value, self.max_size)?,
            _ => {}
        }
        self.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    pub fn state(&self) -> ResponseParseState {
        self.state
    }

    pub fn got_all(&self) -> bool {
        self.state == ResponseParseState::GotAll
    }

    /// Clear the parsed reply. Request numbering and the session survive.
    pub fn reset(&mut self) {
        self.state = ResponseParseState::ParseStatusLine;
        self.status_code = 0;
        self.status_text.clear();
        self.headers.clear();
        self.response_cseq = None;
        self.challenge = None;
        self.content_length = 0;
        self.body = Bytes::new();
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// `CSeq` echoed by the server in the reply being parsed.
    pub fn response_cseq(&self) -> Option<u32> {
        self.response_cseq
    }

    pub fn challenge(&self) -> Option<&DigestChallenge> {
        self.challenge.as_ref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Session id assigned by the server.
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Method of the last request built.
    pub fn method(&self) -> Method {
        self.method
    }

    /// URI of the last request built.
    pub fn request_uri(&self) -> &str {
        &self.request_uri
    }

    /// `CSeq` of the last request built, 0 before the first.
    pub fn cseq(&self) -> u32 {
        self.next_cseq - 1
    }

    fn request(&mut self, method: Method, uri: String) -> RtspMessage {
        let cseq = self.next_cseq;
        self.next_cseq = self.next_cseq.wrapping_add(1);
        self.method = method;
        self.request_uri = uri;
        RtspMessage::request(method, &self.request_uri).add_header("CSeq", cseq)
    }

    pub fn build_option_req(&mut self) -> RtspMessage {
        let uri = self.url.clone();
        self.request(Method::Options, uri)
    }

    pub fn build_describe_req(&mut self) -> RtspMessage {
        let uri = self.url.clone();
        self.request(Method::Describe, uri)
            .add_header("Accept", "application/sdp")
    }

    pub fn build_announce_req(&mut self, sdp: String) -> RtspMessage {
        let uri = self.url.clone();
        self.request(Method::Announce, uri)
            .add_header("Content-Type", "application/sdp")
            .with_body(sdp)
    }

    /// SETUP for recording over interleaved channels `2n` and `2n+1`.
    pub fn build_setup_tcp_req(&mut self, channel: MediaChannelId) -> RtspMessage {
        let uri = format!("{}/{}", self.url, channel.track_name());
        let rtp_channel = channel.index() * 2;
        let session = self.session.clone();
        self.request(Method::Setup, uri)
            .add_header(
                "Transport",
                format!(
                    "RTP/AVP/TCP;unicast;mode=record;interleaved={}-{}",
                    rtp_channel,
                    rtp_channel + 1
                ),
            )
            .add_optional_header("Session", session)
    }

    pub fn build_record_req(&mut self) -> RtspMessage {
        let uri = self.url.clone();
        let session = self.session.clone();
        self.request(Method::Record, uri)
            .add_header("Range", "npt=0.000-")
            .add_optional_header("Session", session)
    }

    pub fn build_teardown_req(&mut self) -> RtspMessage {
        let uri = self.url.clone();
        let session = self.session.clone();
        self.request(Method::Teardown, uri)
            .add_optional_header("Session", session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ok_with_session() {
        let mut res = RtspResponse::new("rtsp://h/live", 4096);
        let mut buf = BytesMut::from(
            &b"RTSP/1.0 200 OK\r\nCSeq: 3\r\nSession: 66334873;timeout=60\r\n\r\n"[..],
        );
        assert_eq!(res.parse_response(&mut buf).unwrap(), ParseOutcome::Complete);
        assert_eq!(res.status_code(), 200);
        assert_eq!(res.status_text(), "OK");
        assert_eq!(res.response_cseq(), Some(3));
        assert_eq!(res.session(), Some("66334873"));

        res.reset();
        assert_eq!(res.session(), Some("66334873"));
        let record = res.build_record_req();
        assert_eq!(record.get_header("Session"), Some("66334873"));
    }

    #[test]
    fn parse_challenge_and_skip_body() {
        let mut res = RtspResponse::new("rtsp://h/live", 4096);
        let mut buf = BytesMut::from(
            &b"RTSP/1.0 401 Unauthorized\r\nCSeq: 1\r\n\
               WWW-Authenticate: Digest realm=\"cam\", nonce=\"n0\"\r\n\
               Content-Length: 4\r\n\r\nbodyRTSP"[..],
        );
        assert_eq!(res.parse_response(&mut buf).unwrap(), ParseOutcome::Complete);
        assert_eq!(res.status_code(), 401);
        let challenge = res.challenge().unwrap();
        assert_eq!(challenge.realm, "cam");
        assert_eq!(challenge.nonce, "n0");
        assert_eq!(res.body(), b"body");
        assert_eq!(&buf[..], b"RTSP");
    }

    #[test]
    fn split_reply_resumes() {
        let mut res = RtspResponse::new("rtsp://h/live", 4096);
        let mut buf = BytesMut::from(&b"RTSP/1.0 200"[..]);
        assert_eq!(res.parse_response(&mut buf).unwrap(), ParseOutcome::NeedMore);
        buf.extend_from_slice(b" OK\r\nCSeq: 1\r\n");
        assert_eq!(res.parse_response(&mut buf).unwrap(), ParseOutcome::NeedMore);
        buf.extend_from_slice(b"\r\n");
        assert_eq!(res.parse_response(&mut buf).unwrap(), ParseOutcome::Complete);
    }

    #[test]
    fn invalid_status_line() {
        let mut res = RtspResponse::new("rtsp://h/live", 4096);
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\n\r\n"[..]);
        assert!(matches!(
            res.parse_response(&mut buf),
            Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidStatusLine
            })
        ));
        let mut res = RtspResponse::new("rtsp://h/live", 4096);
        let mut buf = BytesMut::from(&b"RTSP/1.0 abc OK\r\n\r\n"[..]);
        assert!(res.parse_response(&mut buf).is_err());
    }

    #[test]
    fn requests_number_sequentially() {
        let mut res = RtspResponse::new("rtsp://h:8554/live/", 4096);
        assert_eq!(res.cseq(), 0);

        let options = res.build_option_req();
        assert!(options.start_line().starts_with("OPTIONS rtsp://h:8554/live RTSP/1.0"));
        assert_eq!(options.get_header("CSeq"), Some("1"));

        let announce = res.build_announce_req("v=0\r\n".into());
        assert_eq!(announce.get_header("CSeq"), Some("2"));
        assert_eq!(announce.get_header("Content-Type"), Some("application/sdp"));
        assert_eq!(res.method(), Method::Announce);

        let setup = res.build_setup_tcp_req(MediaChannelId::Channel1);
        assert_eq!(setup.get_header("CSeq"), Some("3"));
        assert_eq!(res.request_uri(), "rtsp://h:8554/live/track1");
        assert_eq!(
            setup.get_header("Transport"),
            Some("RTP/AVP/TCP;unicast;mode=record;interleaved=2-3")
        );
        assert_eq!(setup.get_header("Session"), None);

        let teardown = res.build_teardown_req();
        assert_eq!(teardown.get_header("CSeq"), Some("4"));
        assert_eq!(res.cseq(), 4);
        assert!(res.build_describe_req().start_line().starts_with("DESCRIBE"));
    }
}
