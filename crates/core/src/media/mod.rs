//! Media model shared by the server, the pusher and the media pipeline.
//!
//! The pipeline hands over already-packetized payloads as [`RtpPacket`]s;
//! codec-specific fragmentation (RFC 6184, RFC 7798, ...) happens before
//! this crate sees them. The connection side stamps the RTP fixed header
//! ([`rtp::RtpHeader`]) per media channel:
//!
//! - **Sequence number** (16-bit, wrapping): for reordering and loss detection.
//! - **Timestamp** (32-bit): media clock supplied with each packet.
//! - **SSRC** (32-bit): randomly chosen per connection and channel.
//! - **Marker bit**: set on the last packet of an access unit.
//!
//! A session carries at most [`MAX_MEDIA_CHANNEL`] streams, typically video
//! on [`MediaChannelId::Channel0`] and audio on [`MediaChannelId::Channel1`].

pub mod rtp;
pub mod source;

use std::fmt;

use bytes::Bytes;

pub use source::{MediaKind, MediaSource};

/// Streams per media session.
pub const MAX_MEDIA_CHANNEL: usize = 2;

/// Index of a stream within a media session. Advertised as `trackN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaChannelId {
    Channel0 = 0,
    Channel1 = 1,
}

impl MediaChannelId {
    pub const ALL: [MediaChannelId; MAX_MEDIA_CHANNEL] =
        [MediaChannelId::Channel0, MediaChannelId::Channel1];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// SDP `a=control` value and URL suffix for this channel.
    pub fn track_name(self) -> String {
        format!("track{}", self.index())
    }

    /// Parse a trailing `trackN` path segment.
    pub fn from_track_name(name: &str) -> Option<Self> {
        let index = name.strip_prefix("track")?.parse::<usize>().ok()?;
        Self::from_index(index)
    }
}

impl fmt::Display for MediaChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// What a packet carries. Used for key-frame gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Part of an independently decodable video frame (IDR / I-frame).
    VideoKey,
    /// Part of a predicted video frame.
    Video,
    Audio,
}

impl FrameType {
    /// Whether a receiver can start decoding from this packet.
    pub fn starts_stream(self) -> bool {
        matches!(self, FrameType::VideoKey | FrameType::Audio)
    }
}

/// One RTP payload from the media pipeline.
///
/// `payload` excludes the RTP header, which is written per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub payload: Bytes,
    pub timestamp: u32,
    pub marker: bool,
    pub frame_type: FrameType,
}

impl RtpPacket {
    pub fn new(payload: impl Into<Bytes>, timestamp: u32, frame_type: FrameType) -> Self {
        Self {
            payload: payload.into(),
            timestamp,
            marker: false,
            frame_type,
        }
    }

    #[must_use]
    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }
}
