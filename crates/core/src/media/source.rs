use std::fmt;

use super::MediaChannelId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => f.write_str("video"),
            MediaKind::Audio => f.write_str("audio"),
        }
    }
}

/// RTP stream parameters advertised for one media channel in SDP.
///
/// Only what an `m=` section needs; the payload format itself is the media
/// pipeline's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSource {
    pub kind: MediaKind,
    /// Encoding name for `a=rtpmap` (e.g. `H264`).
    pub encoding: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    /// Audio channel count, appended to `a=rtpmap` when present.
    pub channels: Option<u8>,
    /// `a=fmtp` parameters without the payload type prefix.
    pub fmtp: Option<String>,
}

impl MediaSource {
    /// H.264 video (RFC 6184), dynamic payload type 96, 90 kHz.
    pub fn h264() -> Self {
        Self {
            kind: MediaKind::Video,
            encoding: "H264".to_string(),
            payload_type: 96,
            clock_rate: 90_000,
            channels: None,
            fmtp: Some("packetization-mode=1".to_string()),
        }
    }

    /// H.265 video (RFC 7798), dynamic payload type 96, 90 kHz.
    pub fn h265() -> Self {
        Self {
            kind: MediaKind::Video,
            encoding: "H265".to_string(),
            payload_type: 96,
            clock_rate: 90_000,
            channels: None,
            fmtp: None,
        }
    }

    /// AAC in MPEG4-GENERIC framing (RFC 3640), dynamic payload type 97.
    pub fn aac(sample_rate: u32, channels: u8) -> Self {
        let config = aac_audio_specific_config(sample_rate, channels);
        Self {
            kind: MediaKind::Audio,
            encoding: "MPEG4-GENERIC".to_string(),
            payload_type: 97,
            clock_rate: sample_rate,
            channels: Some(channels),
            fmtp: Some(format!(
                "streamtype=5;profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config={config:04X}"
            )),
        }
    }

    /// G.711 A-law, static payload type 8 (RFC 3551).
    pub fn g711a() -> Self {
        Self {
            kind: MediaKind::Audio,
            encoding: "PCMA".to_string(),
            payload_type: 8,
            clock_rate: 8000,
            channels: Some(1),
            fmtp: None,
        }
    }

    /// G.711 µ-law, static payload type 0 (RFC 3551).
    pub fn g711u() -> Self {
        Self {
            kind: MediaKind::Audio,
            encoding: "PCMU".to_string(),
            payload_type: 0,
            clock_rate: 8000,
            channels: Some(1),
            fmtp: None,
        }
    }

    /// `m=` line plus its attributes, without the connection line.
    pub fn sdp_lines(&self, port: u16, channel: MediaChannelId) -> Vec<String> {
        let mut lines = vec![format!(
            "m={} {} RTP/AVP {}",
            self.kind, port, self.payload_type
        )];
        match self.channels {
            Some(n) if self.kind == MediaKind::Audio => lines.push(format!(
                "a=rtpmap:{} {}/{}/{}",
                self.payload_type, self.encoding, self.clock_rate, n
            )),
            _ => lines.push(format!(
                "a=rtpmap:{} {}/{}",
                self.payload_type, self.encoding, self.clock_rate
            )),
        }
        if let Some(fmtp) = &self.fmtp {
            lines.push(format!("a=fmtp:{} {}", self.payload_type, fmtp));
        }
        lines.push(format!("a=control:{}", channel.track_name()));
        lines
    }
}

/// Two-byte AudioSpecificConfig for AAC-LC (ISO/IEC 14496-3 §1.6.2.1).
fn aac_audio_specific_config(sample_rate: u32, channels: u8) -> u16 {
    const RATES: [u32; 13] = [
        96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
    ];
    let index = RATES
        .iter()
        .position(|&r| r == sample_rate)
        .unwrap_or(4) as u16;
    let profile: u16 = 2;
    (profile << 11) | (index << 7) | ((channels as u16 & 0x0f) << 3)
}
