//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE and sent with ANNOUNCE:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                              ← session name
//! c=IN IP4 <addr>                               ← connection address
//! t=0 0                                         ← timing (live stream)
//! a=tool:rtsp-reactor/x.y.z                     ← software (§6)
//! a=sendonly                                    ← direction (§6)
//! a=control:*                                   ← aggregate control
//! m=video 0 RTP/AVP 96                          ← one section per channel
//! a=rtpmap:96 H264/90000
//! a=fmtp:96 packetization-mode=1
//! a=control:track0
//! ```
//!
//! Multicast sessions carry the group in a media-level `c=` line and the
//! group port in the `m=` line.

use super::message::DEFAULT_AGENT;
use crate::mount::{MULTICAST_TTL, MediaSession};

/// Generate an SDP session description for the given media session.
pub fn generate_sdp(
    session: &MediaSession,
    ip: &str,
    session_id: &str,
    session_version: &str,
    username: &str,
    session_name: &str,
) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} {} IN IP4 {}",
        username, session_id, session_version, ip
    ));
    sdp.push(format!("s={}", session_name));
    sdp.push(format!("c=IN IP4 {}", ip));
    sdp.push("t=0 0".to_string());
    sdp.push(format!("a=tool:{}", DEFAULT_AGENT));
    sdp.push("a=sendonly".to_string());
    sdp.push("a=control:*".to_string());

    let group = session.multicast_address();
    if group.is_some() {
        sdp.push("a=type:broadcast".to_string());
    }

    for (channel, source) in session.sources() {
        match group {
            Some(group) => {
                let port = session.multicast_port(channel).unwrap_or_default();
                let mut lines = source.sdp_lines(port, channel);
                lines.insert(1, format!("c=IN IP4 {}/{}", group, MULTICAST_TTL));
                sdp.extend(lines);
            }
            None => sdp.extend(source.sdp_lines(0, channel)),
        }
    }

    tracing::debug!(suffix = %session.suffix(), "SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}
