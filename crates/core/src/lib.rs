//! Embedded RTSP server and pusher built on a small multi-threaded reactor.
//!
//! An [`EventLoop`] runs one [`net::TaskScheduler`] per worker thread. An
//! [`RtspServer`] accepts players on it and streams the packets handed to
//! [`RtspServer::push_frame`]; an [`RtspPusher`] publishes to a remote server
//! with ANNOUNCE/RECORD.

pub mod connection;
pub mod error;
pub mod media;
pub mod mount;
pub mod net;
pub mod protocol;
pub mod pusher;
pub mod server;
pub mod transport;

pub use error::{Result, RtspError};
pub use media::{FrameType, MediaChannelId, MediaSource, RtpPacket};
pub use mount::{MediaSession, MediaSessionId};
pub use net::{EventLoop, EventLoopConfig, PollerKind};
pub use pusher::{PusherConfig, RtspPusher};
pub use server::{AuthConfig, RtspServer, ServerConfig};
