//! Socket plumbing underneath the reactor.
//!
//! - **TCP** ([`tcp`]): RTSP signaling. Each client connection is a
//!   non-blocking [`TcpConnection`] owned by one scheduler, with buffered
//!   reads and a bounded write queue. Interleaved RTP (RFC 2326 §10.12)
//!   shares this stream.
//!
//! - **UDP** ([`udp`]): RTP/RTCP socket pairs on even/odd ports, plus
//!   multicast senders.
//!
//! - **Wake-up pipe** ([`pipe`]): lets other threads interrupt a scheduler
//!   blocked in its poller.

pub mod pipe;
pub mod tcp;
pub mod udp;

pub use tcp::{ReadStatus, TcpConnection};
pub use udp::RtpSocketPair;
