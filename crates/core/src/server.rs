use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::connection::{
    ConnectionConfig, ConnectionId, ConnectionTable, RtspConnection, RtspContext,
    SessionIdAllocator,
};
use crate::error::{Result, RtspError};
use crate::media::{MediaChannelId, RtpPacket};
use crate::mount::{MediaSession, MediaSessionId, MediaSessionRegistry};
use crate::net::{Acceptor, EventLoop, SchedulerHandle, TaskScheduler, TimerId};
use crate::protocol::DigestAuthentication;
use crate::protocol::message::DEFAULT_AGENT;
use crate::protocol::sdp::generate_sdp;

/// Digest credentials. A server challenges clients with them, a pusher
/// answers challenges with them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub realm: String,
    pub username: String,
    pub password: String,
}

impl AuthConfig {
    pub fn authentication(&self) -> DigestAuthentication {
        DigestAuthentication::new(&self.realm, &self.username, &self.password)
    }
}

/// Server-level configuration used by every connection it accepts.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Value of the `Server` header.
    pub server_agent: String,
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, the local address of each connection is used.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
    /// Require digest authentication for everything but OPTIONS.
    pub auth: Option<AuthConfig>,
    /// Advertised in `Session: <id>;timeout=<secs>`.
    pub session_timeout: Duration,
    /// Period of the liveness check. A connection that sent no request and
    /// no RTCP during one period is closed.
    pub alive_check_interval: Duration,
    pub max_connections: Option<usize>,
    /// Local ports for UDP transport, allocated as even/odd pairs.
    pub rtp_port_range: RangeInclusive<u16>,
    pub max_message_size: usize,
    /// Bytes queued per connection before sends fail with back-pressure.
    pub write_queue_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let connection = ConnectionConfig::default();
        Self {
            server_agent: DEFAULT_AGENT.to_string(),
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Stream".to_string(),
            auth: None,
            session_timeout: connection.session_timeout,
            alive_check_interval: connection.session_timeout,
            max_connections: None,
            rtp_port_range: connection.rtp_port_range,
            max_message_size: connection.max_message_size,
            write_queue_limit: connection.write_queue_limit,
        }
    }
}

/// State shared between the server handle, the acceptor callback and the
/// connections (as their [`RtspContext`]).
struct ServerShared {
    config: ServerConfig,
    auth: Option<DigestAuthentication>,
    sessions: MediaSessionRegistry,
    /// Live connections and the scheduler each one runs on.
    connections: Mutex<HashMap<ConnectionId, SchedulerHandle>>,
    connection_config: ConnectionConfig,
}

impl ServerShared {
    fn new(config: ServerConfig) -> Self {
        let connection_config = ConnectionConfig {
            agent: config.server_agent.clone(),
            session_timeout: config.session_timeout,
            max_message_size: config.max_message_size,
            write_queue_limit: config.write_queue_limit,
            rtp_port_range: config.rtp_port_range.clone(),
            session_ids: Arc::new(SessionIdAllocator::default()),
        };
        Self {
            auth: config.auth.as_ref().map(AuthConfig::authentication),
            sessions: MediaSessionRegistry::new(),
            connections: Mutex::new(HashMap::new()),
            connection_config,
            config,
        }
    }

    fn on_new_connection(self: &Arc<Self>, event_loop: &EventLoop, stream: TcpStream, peer: SocketAddr) {
        {
            let connections = self.connections.lock();
            if let Some(max) = self.config.max_connections {
                if connections.len() >= max {
                    tracing::warn!(%peer, max, "connection limit reached, refusing");
                    return;
                }
            }
        }

        let scheduler = event_loop.get_task_scheduler();
        let id = ConnectionId::next();
        self.connections.lock().insert(id, scheduler.clone());

        let weak = Arc::downgrade(self);
        let result = scheduler.add_trigger_event(move |sched| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let context: Weak<dyn RtspContext> = weak;
            let config = shared.connection_config.clone();
            if let Err(e) = RtspConnection::accept(sched, id, stream, context, config) {
                tracing::warn!(%peer, error = %e, "failed to set up connection");
                shared.connections.lock().remove(&id);
            }
        });
        if let Err(e) = result {
            tracing::warn!(%peer, error = %e, "dropping connection");
            self.connections.lock().remove(&id);
        }
    }

    /// Liveness pass over this server's connections on `sched`.
    fn check_alive(&self, sched: &TaskScheduler) {
        let ids: Vec<ConnectionId> = self
            .connections
            .lock()
            .iter()
            .filter(|(_, scheduler)| scheduler.id() == sched.id())
            .map(|(id, _)| *id)
            .collect();

        let table = sched.local::<ConnectionTable>();
        for id in ids {
            let Some(connection) = table.get(id) else {
                continue;
            };
            let mut connection = connection.borrow_mut();
            if connection.is_alive() {
                connection.reset_alive_count();
            } else {
                tracing::info!(conn = %id, peer = ?connection.peer_addr(), "session timed out");
                connection.handle_close(sched);
            }
        }
    }

    fn close_connections(&self, groups: Vec<(SchedulerHandle, Vec<ConnectionId>)>) {
        for (scheduler, ids) in groups {
            let result = scheduler.add_trigger_event(move |sched| {
                let table = sched.local::<ConnectionTable>();
                for id in ids {
                    if let Some(connection) = table.get(id) {
                        connection.borrow_mut().handle_close(sched);
                    }
                }
            });
            if let Err(e) = result {
                tracing::warn!(scheduler = scheduler.id(), error = %e, "could not post close");
            }
        }
    }
}

impl RtspContext for ServerShared {
    fn lookup_media_session(&self, suffix: &str) -> Option<Arc<MediaSession>> {
        self.sessions.lookup(suffix)
    }

    fn authentication(&self) -> Option<&DigestAuthentication> {
        self.auth.as_ref()
    }

    fn session_description(&self, session: &MediaSession, local_ip: IpAddr) -> String {
        let host = self
            .config
            .public_host
            .clone()
            .unwrap_or_else(|| local_ip.to_string());
        generate_sdp(
            session,
            &host,
            &self.config.sdp_session_id,
            &self.config.sdp_session_version,
            &self.config.sdp_username,
            &self.config.sdp_session_name,
        )
    }

    fn on_connection_closed(&self, id: ConnectionId) {
        self.connections.lock().remove(&id);
    }
}

/// RTSP server on top of an [`EventLoop`].
///
/// Listens on one scheduler and spreads accepted connections round-robin
/// over all of them. Media enters through [`push_frame`](Self::push_frame),
/// which may be called from any thread; packets are marshalled to the
/// schedulers that own the session's clients.
///
/// Several servers may share one event loop.
pub struct RtspServer {
    event_loop: Arc<EventLoop>,
    shared: Arc<ServerShared>,
    acceptor: Mutex<Option<Acceptor>>,
    reapers: Mutex<Vec<(SchedulerHandle, TimerId)>>,
}

impl RtspServer {
    pub fn new(event_loop: Arc<EventLoop>, config: ServerConfig) -> Self {
        Self {
            event_loop,
            shared: Arc::new(ServerShared::new(config)),
            acceptor: Mutex::new(None),
            reapers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Listen on `ip:port` (port 0 picks a free one) and return the bound
    /// address.
    pub fn start(&self, ip: &str, port: u16) -> Result<SocketAddr> {
        let mut slot = self.acceptor.lock();
        if slot.is_some() {
            return Err(RtspError::AlreadyRunning);
        }

        let shared = Arc::downgrade(&self.shared);
        let event_loop = Arc::downgrade(&self.event_loop);
        let acceptor = Acceptor::new(self.event_loop.get_task_scheduler(), move |stream, peer| {
            if let (Some(shared), Some(event_loop)) = (shared.upgrade(), event_loop.upgrade()) {
                shared.on_new_connection(&event_loop, stream, peer);
            }
        });
        acceptor.listen(ip, port)?;
        let local_addr = acceptor.local_addr().ok_or(RtspError::NotStarted)?;
        *slot = Some(acceptor);

        let interval = self.shared.config.alive_check_interval;
        let mut reapers = self.reapers.lock();
        for scheduler in self.event_loop.schedulers() {
            let shared = Arc::downgrade(&self.shared);
            let timer = scheduler.add_timer(interval, move |sched| match shared.upgrade() {
                Some(shared) => {
                    shared.check_alive(sched);
                    true
                }
                None => false,
            });
            reapers.push((scheduler.clone(), timer));
        }

        tracing::info!(
            %local_addr,
            auth = self.shared.auth.is_some(),
            threads = self.event_loop.num_threads(),
            "RTSP server listening"
        );
        Ok(local_addr)
    }

    /// Stop listening and close every connection. Idempotent.
    pub fn stop(&self) {
        let Some(acceptor) = self.acceptor.lock().take() else {
            return;
        };
        acceptor.close();
        for (scheduler, timer) in self.reapers.lock().drain(..) {
            scheduler.remove_timer(timer);
        }

        let mut groups: Vec<(SchedulerHandle, Vec<ConnectionId>)> = Vec::new();
        for (id, scheduler) in self.shared.connections.lock().iter() {
            match groups.iter_mut().find(|(s, _)| s.id() == scheduler.id()) {
                Some((_, ids)) => ids.push(*id),
                None => groups.push((scheduler.clone(), vec![*id])),
            }
        }
        self.shared.close_connections(groups);
        tracing::info!("server stopping");
    }

    pub fn is_running(&self) -> bool {
        self.acceptor.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.lock().as_ref().and_then(Acceptor::local_addr)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Register a media session. A session already served under the same
    /// suffix is replaced.
    pub fn add_session(&self, session: MediaSession) -> MediaSessionId {
        self.shared.sessions.add(session).id()
    }

    /// Unregister a session and close the connections attached to it.
    pub fn remove_session(&self, id: MediaSessionId) -> bool {
        match self.shared.sessions.remove(id) {
            Some(session) => {
                self.shared.close_connections(session.clients_by_scheduler());
                true
            }
            None => false,
        }
    }

    pub fn session(&self, id: MediaSessionId) -> Option<Arc<MediaSession>> {
        self.shared.sessions.get(id)
    }

    /// Deliver one packet to every playing client of `session_id`.
    ///
    /// Multicast sessions send once to the group. Otherwise one trigger is
    /// posted per scheduler serving the session. Returns `false` if the
    /// session is unknown or nothing could be handed over.
    pub fn push_frame(&self, session_id: MediaSessionId, channel: MediaChannelId, packet: RtpPacket) -> bool {
        let Some(session) = self.shared.sessions.get(session_id) else {
            return false;
        };

        if session.is_multicast() {
            return match session.send_multicast(channel, &packet) {
                Ok(_) => true,
                Err(e) => {
                    tracing::debug!(session = session_id, %channel, error = %e, "multicast send failed");
                    false
                }
            };
        }

        let mut delivered = false;
        for (scheduler, ids) in session.clients_by_scheduler() {
            let packet = packet.clone();
            let result = scheduler.add_trigger_event(move |sched| {
                let table = sched.local::<ConnectionTable>();
                for id in ids {
                    let Some(connection) = table.get(id) else {
                        continue;
                    };
                    let mut connection = connection.borrow_mut();
                    if !connection.is_playing() {
                        continue;
                    }
                    if let Err(e) = connection.send_rtp_packet(sched, channel, &packet) {
                        tracing::debug!(conn = %id, %channel, error = %e, "packet dropped");
                    }
                }
            });
            match result {
                Ok(()) => delivered = true,
                Err(e) => {
                    tracing::warn!(session = session_id, scheduler = scheduler.id(), error = %e, "frame dropped")
                }
            }
        }
        delivered
    }
}

impl Drop for RtspServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for RtspServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtspServer")
            .field("local_addr", &self.local_addr())
            .field("sessions", &self.shared.sessions.len())
            .field("connections", &self.connection_count())
            .finish()
    }
}
