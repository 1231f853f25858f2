//! Relay RTP received on a UDP port (e.g. from `ffmpeg -f rtp`) into a
//! served stream.
//!
//! Incoming payload types select the media channel: the session's video
//! payload type goes to channel 0, anything else to channel 1. The incoming
//! RTP header is replaced by the server's own per-client header.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;

use rtsp::{FrameType, MediaChannelId, MediaSessionId, RtpPacket, RtspServer};

use crate::config::VideoCodec;

/// A received RTP packet, header stripped.
#[derive(Debug, PartialEq, Eq)]
pub struct Incoming<'a> {
    pub payload_type: u8,
    pub marker: bool,
    pub timestamp: u32,
    pub payload: &'a [u8],
}

/// Parse the fixed header, CSRC list, extension and padding (RFC 3550 §5.1).
pub fn parse_rtp(datagram: &[u8]) -> Option<Incoming<'_>> {
    if datagram.len() < 12 || datagram[0] >> 6 != 2 {
        return None;
    }
    let csrc_count = (datagram[0] & 0x0f) as usize;
    let mut offset = 12 + 4 * csrc_count;
    if datagram[0] & 0x10 != 0 {
        let ext = datagram.get(offset..offset + 4)?;
        offset += 4 + 4 * u16::from_be_bytes([ext[2], ext[3]]) as usize;
    }
    let mut end = datagram.len();
    if datagram[0] & 0x20 != 0 {
        end = end.checked_sub(*datagram.last()? as usize)?;
    }
    if offset > end {
        return None;
    }
    Some(Incoming {
        payload_type: datagram[1] & 0x7f,
        marker: datagram[1] & 0x80 != 0,
        timestamp: u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]),
        payload: &datagram[offset..end],
    })
}

/// Whether a video payload belongs to a frame a player can start from.
///
/// H.264 (RFC 6184): IDR, SPS and PPS, also inside STAP-A and the first
/// FU-A fragment. H.265 (RFC 7798): IRAP pictures and parameter sets,
/// also inside AP and the first FU.
pub fn video_frame_type(codec: VideoCodec, payload: &[u8]) -> FrameType {
    let Some(&first) = payload.first() else {
        return FrameType::Video;
    };
    let key = match codec {
        VideoCodec::H264 => {
            let h264_key = |t: u8| matches!(t, 5 | 7 | 8);
            match first & 0x1f {
                24 => payload.get(3).is_some_and(|b| h264_key(b & 0x1f)),
                28 => payload
                    .get(1)
                    .is_some_and(|b| b & 0x80 != 0 && h264_key(b & 0x1f)),
                t => h264_key(t),
            }
        }
        VideoCodec::H265 => {
            let h265_key = |t: u8| matches!(t, 16..=21 | 32..=34);
            match (first >> 1) & 0x3f {
                48 => payload.get(4).is_some_and(|b| h265_key((b >> 1) & 0x3f)),
                49 => payload
                    .get(2)
                    .is_some_and(|b| b & 0x80 != 0 && h265_key(b & 0x3f)),
                t => h265_key(t),
            }
        }
    };
    if key { FrameType::VideoKey } else { FrameType::Video }
}

/// Running relay; stops when dropped.
pub struct Ingest {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Ingest {
    pub fn spawn(
        server: Arc<RtspServer>,
        session: MediaSessionId,
        addr: SocketAddr,
        video: Option<(VideoCodec, u8)>,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr).with_context(|| format!("binding ingest socket {addr}"))?;
        socket.set_read_timeout(Some(Duration::from_millis(200)))?;
        let stop = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name(format!("ingest-{session}"))
            .spawn(move || relay(&socket, &server, session, video, &flag))?;
        tracing::info!(%addr, session, "ingesting RTP");
        Ok(Ingest {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for Ingest {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn relay(
    socket: &UdpSocket,
    server: &RtspServer,
    session: MediaSessionId,
    video: Option<(VideoCodec, u8)>,
    stop: &AtomicBool,
) {
    let mut buf = vec![0u8; 65536];
    while !stop.load(Ordering::Relaxed) {
        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "ingest receive failed");
                continue;
            }
        };
        let Some(incoming) = parse_rtp(&buf[..n]) else {
            tracing::trace!(bytes = n, "ignoring non-RTP datagram");
            continue;
        };

        let (channel, frame_type) = match video {
            Some((codec, pt)) if pt == incoming.payload_type => {
                (MediaChannelId::Channel0, video_frame_type(codec, incoming.payload))
            }
            _ => (MediaChannelId::Channel1, FrameType::Audio),
        };
        let packet = RtpPacket::new(incoming.payload.to_vec(), incoming.timestamp, frame_type)
            .with_marker(incoming.marker);
        server.push_frame(session, channel, packet);
    }
}
