//! Per-client protocol state.
//!
//! An [`RtspConnection`] drives the RTSP dialogue on one TCP socket and owns
//! an [`RtpConnection`] for the media transport it negotiates. Both live on a
//! single scheduler thread: they are kept in that scheduler's
//! [`ConnectionTable`] and every channel callback reaches them through a weak
//! reference, so a closed connection is simply absent.

pub mod rtp;
pub mod rtsp;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub use rtp::{RtpConnection, SessionId, SessionIdAllocator, TransportMode};
pub use rtsp::{ConnectionMode, ConnectionState, RtspConnection};

use crate::mount::MediaSession;
use crate::protocol::DigestAuthentication;
use crate::protocol::message::DEFAULT_AGENT;

/// Process-wide unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type ConnectionPtr = Rc<RefCell<RtspConnection>>;

/// Live connections of one scheduler. Obtained with
/// [`TaskScheduler::local`](crate::net::TaskScheduler::local).
#[derive(Default)]
pub struct ConnectionTable {
    connections: RefCell<HashMap<ConnectionId, ConnectionPtr>>,
}

impl ConnectionTable {
    pub fn insert(&self, id: ConnectionId, connection: ConnectionPtr) {
        self.connections.borrow_mut().insert(id, connection);
    }

    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionPtr> {
        self.connections.borrow_mut().remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionPtr> {
        self.connections.borrow().get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.borrow().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.borrow().is_empty()
    }
}

/// What a connection needs from the server or pusher that owns it.
///
/// Connections hold this as a `Weak`; once the owner is gone they still
/// close cleanly but resolve no media sessions.
pub trait RtspContext: Send + Sync {
    /// Media session served under `suffix`.
    fn lookup_media_session(&self, suffix: &str) -> Option<Arc<MediaSession>>;

    /// Credentials to check (server) or present (pusher).
    fn authentication(&self) -> Option<&DigestAuthentication>;

    /// SDP for `session` as seen by a peer connected to `local_ip`.
    fn session_description(&self, session: &MediaSession, local_ip: IpAddr) -> String;

    /// The connection finished closing.
    fn on_connection_closed(&self, _id: ConnectionId) {}

    /// A pusher connection received 200 to RECORD.
    fn on_recording(&self, _id: ConnectionId) {}
}

/// Limits and identity shared by every connection of one owner.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// `Server` header (server mode) or `User-Agent` (pusher mode).
    pub agent: String,
    pub session_timeout: Duration,
    pub max_message_size: usize,
    pub write_queue_limit: usize,
    pub rtp_port_range: RangeInclusive<u16>,
    pub session_ids: Arc<SessionIdAllocator>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            agent: DEFAULT_AGENT.to_string(),
            session_timeout: Duration::from_secs(60),
            max_message_size: 64 * 1024,
            write_queue_limit: 4 * 1024 * 1024,
            rtp_port_range: 10000..=60000,
            session_ids: Arc::new(SessionIdAllocator::default()),
        }
    }
}
