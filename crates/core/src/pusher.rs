use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::connection::{ConnectionConfig, ConnectionId, ConnectionTable, RtspConnection, RtspContext};
use crate::error::{Result, RtspError};
use crate::media::{MediaChannelId, RtpPacket};
use crate::mount::MediaSession;
use crate::net::{EventLoop, SchedulerHandle};
use crate::protocol::message::DEFAULT_AGENT;
use crate::protocol::sdp::generate_sdp;
use crate::protocol::{DigestAuthentication, RtspUrl};
use crate::server::AuthConfig;
use crate::transport::tcp;

#[derive(Debug, Clone)]
pub struct PusherConfig {
    /// Value of the `User-Agent` header.
    pub agent: String,
    /// Answer a digest challenge with these credentials.
    pub auth: Option<AuthConfig>,
    /// Bound on the TCP handshake only.
    pub connect_timeout: Duration,
}

impl Default for PusherConfig {
    fn default() -> Self {
        Self {
            agent: DEFAULT_AGENT.to_string(),
            auth: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushStatus {
    Idle,
    Connecting,
    Recording,
    Closed,
}

struct PusherShared {
    auth: Option<DigestAuthentication>,
    session: RwLock<Option<Arc<MediaSession>>>,
    connection: Mutex<Option<(SchedulerHandle, ConnectionId)>>,
    status: Mutex<PushStatus>,
    changed: Condvar,
}

impl PusherShared {
    fn set_status(&self, status: PushStatus) {
        *self.status.lock() = status;
        self.changed.notify_all();
    }

    fn is_current(&self, id: ConnectionId) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|(_, current)| *current == id)
    }
}

impl RtspContext for PusherShared {
    /// A pusher announces its single session whatever the URL path.
    fn lookup_media_session(&self, _suffix: &str) -> Option<Arc<MediaSession>> {
        self.session.read().clone()
    }

    fn authentication(&self) -> Option<&DigestAuthentication> {
        self.auth.as_ref()
    }

    fn session_description(&self, session: &MediaSession, local_ip: IpAddr) -> String {
        generate_sdp(session, &local_ip.to_string(), "0", "0", "-", session.suffix())
    }

    fn on_connection_closed(&self, id: ConnectionId) {
        if self.is_current(id) {
            *self.connection.lock() = None;
            self.set_status(PushStatus::Closed);
        }
    }

    fn on_recording(&self, id: ConnectionId) {
        if self.is_current(id) {
            self.set_status(PushStatus::Recording);
        }
    }
}

/// RTSP client that publishes one media session to a remote server with
/// ANNOUNCE and RECORD, sending RTP interleaved on the RTSP connection.
pub struct RtspPusher {
    event_loop: Arc<EventLoop>,
    config: PusherConfig,
    shared: Arc<PusherShared>,
}

impl RtspPusher {
    pub fn new(event_loop: Arc<EventLoop>, config: PusherConfig) -> Self {
        let shared = PusherShared {
            auth: config.auth.as_ref().map(AuthConfig::authentication),
            session: RwLock::new(None),
            connection: Mutex::new(None),
            status: Mutex::new(PushStatus::Idle),
            changed: Condvar::new(),
        };
        Self {
            event_loop,
            config,
            shared: Arc::new(shared),
        }
    }

    /// Set the session to announce. Replaces any previous one.
    pub fn add_session(&self, session: MediaSession) -> Arc<MediaSession> {
        session.assign_id(1);
        let session = Arc::new(session);
        *self.shared.session.write() = Some(Arc::clone(&session));
        session
    }

    /// Connect to `url` and run the dialogue up to RECORD.
    ///
    /// Returns once the server accepted RECORD, or fails with
    /// [`RtspError::ConnectionClosed`] if it refused, or with a timed-out
    /// I/O error if `timeout` elapsed first.
    pub fn open_url(&self, url: &str, timeout: Duration) -> Result<()> {
        if self.is_connected() {
            self.close();
        }

        let parsed = RtspUrl::parse(url)?;
        if self.shared.session.read().is_none() {
            return Err(RtspError::MediaSessionNotFound(parsed.suffix));
        }
        let addr = (parsed.host.as_str(), parsed.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {}", parsed.host)))?;
        let stream = tcp::connect(addr, Some(self.config.connect_timeout))?;
        tracing::info!(%url, %addr, "connected");

        let scheduler = self.event_loop.get_task_scheduler();
        let id = ConnectionId::next();
        *self.shared.connection.lock() = Some((scheduler.clone(), id));
        self.shared.set_status(PushStatus::Connecting);

        let config = ConnectionConfig {
            agent: self.config.agent.clone(),
            ..ConnectionConfig::default()
        };
        let weak = Arc::downgrade(&self.shared);
        let conn_url = url.to_string();
        let posted = scheduler.add_trigger_event(move |sched| {
            let context: Weak<dyn RtspContext> = weak.clone();
            match RtspConnection::connect(sched, id, stream, &conn_url, context, config) {
                Ok(connection) => connection.borrow_mut().send_options(sched),
                Err(e) => {
                    tracing::warn!(url = %conn_url, error = %e, "failed to set up connection");
                    if let Some(shared) = weak.upgrade() {
                        shared.on_connection_closed(id);
                    }
                }
            }
        });
        if let Err(e) = posted {
            *self.shared.connection.lock() = None;
            self.shared.set_status(PushStatus::Closed);
            return Err(e);
        }

        let deadline = Instant::now() + timeout;
        let mut status = self.shared.status.lock();
        loop {
            match *status {
                PushStatus::Recording => return Ok(()),
                PushStatus::Closed | PushStatus::Idle => return Err(RtspError::ConnectionClosed),
                PushStatus::Connecting => {}
            }
            if self.shared.changed.wait_until(&mut status, deadline).timed_out() {
                break;
            }
        }
        drop(status);

        tracing::warn!(%url, ?timeout, "push setup timed out");
        self.close();
        Err(io::Error::new(io::ErrorKind::TimedOut, "RTSP push setup timed out").into())
    }

    /// Send TEARDOWN and close once it is written. Idempotent.
    pub fn close(&self) {
        let Some((scheduler, id)) = self.shared.connection.lock().take() else {
            return;
        };
        self.shared.set_status(PushStatus::Idle);
        let result = scheduler.add_trigger_event(move |sched| {
            if let Some(connection) = sched.local::<ConnectionTable>().get(id) {
                let mut connection = connection.borrow_mut();
                connection.send_teardown(sched);
                connection.close_when_flushed(sched);
            }
        });
        if let Err(e) = result {
            tracing::warn!(conn = %id, error = %e, "could not post close");
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            *self.shared.status.lock(),
            PushStatus::Connecting | PushStatus::Recording
        )
    }

    pub fn is_recording(&self) -> bool {
        *self.shared.status.lock() == PushStatus::Recording
    }

    /// Queue one packet for the pushing connection. Returns `false` when
    /// not recording or the scheduler's mailbox is full.
    pub fn push_frame(&self, channel: MediaChannelId, packet: RtpPacket) -> bool {
        if !self.is_recording() {
            return false;
        }
        let Some((scheduler, id)) = self.shared.connection.lock().clone() else {
            return false;
        };
        let result = scheduler.add_trigger_event(move |sched| {
            let Some(connection) = sched.local::<ConnectionTable>().get(id) else {
                return;
            };
            if let Err(e) = connection.borrow_mut().send_rtp_packet(sched, channel, &packet) {
                tracing::debug!(conn = %id, %channel, error = %e, "packet dropped");
            }
        });
        result.is_ok()
    }
}

impl Drop for RtspPusher {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RtspPusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtspPusher")
            .field("status", &*self.shared.status.lock())
            .finish()
    }
}
