use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use super::{ConnectionConfig, ConnectionId, ConnectionPtr, ConnectionTable, RtpConnection, RtspContext};
use crate::error::{Result, RtspError};
use crate::media::{MediaChannelId, RtpPacket};
use crate::mount::{MULTICAST_TTL, MediaSession};
use crate::protocol::{
    DigestChallenge, InterleavedFrame, Method, ParseOutcome, RtspMessage, RtspRequest,
    RtspResponse, TransportHeader,
};
use crate::net::TaskScheduler;
use crate::transport::TcpConnection;

/// Longest wait for queued output before a lingering close gives up.
const CLOSE_LINGER: Duration = Duration::from_secs(2);

/// Which side of the RTSP dialogue this connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Accepted from a player; parses requests.
    Server,
    /// Dialled out to push media; parses responses.
    Pusher,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Negotiating, or torn down.
    Connect,
    /// PLAY accepted; media flows to the peer.
    Play,
    /// RECORD accepted; media flows from this side.
    Push,
}

/// RTSP protocol state machine for one TCP connection.
///
/// ```text
///            SETUP+PLAY                      ANNOUNCE+SETUP+RECORD
/// Connect ─────────────▶ Play     Connect ─────────────────────────▶ Push
///    ▲                     │
///    └───── TEARDOWN ──────┘
/// ```
///
/// Input is parsed incrementally; every complete message in the read
/// buffer is handled before the callback returns, each response written
/// before the next request is looked at. A parse error loses framing and
/// closes the connection.
///
/// Lives in its scheduler's [`ConnectionTable`]. Closing removes it from
/// the table, from the poller and from its media session.
pub struct RtspConnection {
    id: ConnectionId,
    mode: ConnectionMode,
    state: ConnectionState,
    tcp: TcpConnection,
    context: std::sync::Weak<dyn RtspContext>,
    config: ConnectionConfig,
    weak_self: Weak<RefCell<RtspConnection>>,

    request: RtspRequest,
    response: RtspResponse,
    rtp: RtpConnection,
    media_session: Option<Arc<MediaSession>>,

    alive_count: u32,
    has_auth: bool,
    nonce: Option<String>,

    challenge: Option<DigestChallenge>,
    auth_retried: bool,
    pending_setup: Vec<MediaChannelId>,

    close_on_flush: bool,
    closed: bool,
}

impl RtspConnection {
    /// Wrap an accepted socket and start reading requests.
    pub fn accept(
        scheduler: &TaskScheduler,
        id: ConnectionId,
        stream: TcpStream,
        context: std::sync::Weak<dyn RtspContext>,
        config: ConnectionConfig,
    ) -> Result<ConnectionPtr> {
        Self::create(scheduler, id, stream, ConnectionMode::Server, "", context, config)
    }

    /// Wrap a connected socket for pushing to `url`. Call
    /// [`send_options`](Self::send_options) to start the dialogue.
    pub fn connect(
        scheduler: &TaskScheduler,
        id: ConnectionId,
        stream: TcpStream,
        url: &str,
        context: std::sync::Weak<dyn RtspContext>,
        config: ConnectionConfig,
    ) -> Result<ConnectionPtr> {
        Self::create(scheduler, id, stream, ConnectionMode::Pusher, url, context, config)
    }

    fn create(
        scheduler: &TaskScheduler,
        id: ConnectionId,
        stream: TcpStream,
        mode: ConnectionMode,
        url: &str,
        context: std::sync::Weak<dyn RtspContext>,
        config: ConnectionConfig,
    ) -> Result<ConnectionPtr> {
        let tcp = TcpConnection::new(stream, config.write_queue_limit)?;
        let unspecified = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let local_ip = tcp.local_addr().map_or(unspecified, |a| a.ip());
        let peer_ip = tcp.peer_addr().map_or(unspecified, |a| a.ip());
        let rtp = RtpConnection::new(
            Arc::clone(&config.session_ids),
            local_ip,
            peer_ip,
            config.rtp_port_range.clone(),
        );

        let has_auth = match mode {
            ConnectionMode::Server => context
                .upgrade()
                .is_none_or(|ctx| ctx.authentication().is_none()),
            ConnectionMode::Pusher => true,
        };

        let connection = Rc::new_cyclic(|weak_self| {
            RefCell::new(RtspConnection {
                id,
                mode,
                state: ConnectionState::Connect,
                request: RtspRequest::new(config.max_message_size),
                response: RtspResponse::new(url, config.max_message_size),
                tcp,
                context,
                config,
                weak_self: weak_self.clone(),
                rtp,
                media_session: None,
                alive_count: 1,
                has_auth,
                nonce: None,
                challenge: None,
                auth_retried: false,
                pending_setup: Vec::new(),
                close_on_flush: false,
                closed: false,
            })
        });

        let channel = Rc::clone(connection.borrow().tcp.channel());
        let weak = Rc::downgrade(&connection);
        channel.set_read_callback(with_connection(&weak, |conn, sched| conn.on_read(sched)));
        channel.set_write_callback(with_connection(&weak, |conn, sched| conn.on_write(sched)));
        channel.set_close_callback(with_connection(&weak, |conn, sched| {
            tracing::debug!(conn = %conn.id, "peer hung up");
            conn.handle_close(sched);
        }));
        channel.set_error_callback(with_connection(&weak, |conn, sched| {
            tracing::warn!(conn = %conn.id, "socket error");
            conn.handle_close(sched);
        }));
        channel.enable_reading();
        scheduler.update_channel(&channel)?;

        scheduler
            .local::<ConnectionTable>()
            .insert(id, Rc::clone(&connection));
        {
            let conn = connection.borrow();
            tracing::info!(
                conn = %id,
                peer = ?conn.peer_addr(),
                mode = ?mode,
                scheduler = scheduler.id(),
                "connection opened"
            );
        }
        Ok(connection)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.tcp.peer_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// RTSP `Session` id of this connection, assigned by its first SETUP.
    pub fn session_id(&self) -> Option<u32> {
        self.rtp.session_id()
    }

    pub fn rtp(&self) -> &RtpConnection {
        &self.rtp
    }

    pub fn media_session(&self) -> Option<&Arc<MediaSession>> {
        self.media_session.as_ref()
    }

    pub fn is_playing(&self) -> bool {
        self.state == ConnectionState::Play
    }

    pub fn is_recording(&self) -> bool {
        self.state == ConnectionState::Push
    }

    /// Record a sign of life (request or RTCP).
    pub fn keep_alive(&mut self) {
        self.alive_count = self.alive_count.saturating_add(1);
    }

    /// Multicast viewers send nothing, so they never time out.
    pub fn is_alive(&self) -> bool {
        if self.closed {
            return false;
        }
        self.rtp.is_multicast() || self.alive_count > 0
    }

    pub fn reset_alive_count(&mut self) {
        self.alive_count = 0;
    }

    pub fn alive_count(&self) -> u32 {
        self.alive_count
    }

    fn local_ip(&self) -> IpAddr {
        self.tcp
            .local_addr()
            .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |a| a.ip())
    }

    /// Stamp and send one packet on `channel`.
    pub fn send_rtp_packet(
        &mut self,
        scheduler: &TaskScheduler,
        channel: MediaChannelId,
        packet: &RtpPacket,
    ) -> Result<usize> {
        if self.closed {
            return Err(RtspError::ConnectionClosed);
        }
        self.rtp
            .send_rtp_packet(scheduler, &mut self.tcp, channel, packet)
    }

    fn on_read(&mut self, scheduler: &TaskScheduler) {
        if self.closed {
            return;
        }
        match self.tcp.read_available() {
            Ok(status) => {
                if status.bytes > 0 {
                    self.process_input(scheduler);
                }
                if status.eof && !self.closed {
                    tracing::debug!(conn = %self.id, "peer closed the connection");
                    self.handle_close(scheduler);
                }
            }
            Err(e) => {
                tracing::warn!(conn = %self.id, error = %e, "read failed");
                self.handle_close(scheduler);
            }
        }
    }

    fn on_write(&mut self, scheduler: &TaskScheduler) {
        if let Err(e) = self.tcp.flush(scheduler) {
            tracing::warn!(conn = %self.id, error = %e, "write failed");
            self.handle_close(scheduler);
        } else if self.close_on_flush && self.tcp.queued_bytes() == 0 {
            self.handle_close(scheduler);
        }
    }

    fn process_input(&mut self, scheduler: &TaskScheduler) {
        while !self.closed {
            let outcome = match self.mode {
                ConnectionMode::Server => self.request.parse_request(self.tcp.read_buffer()),
                ConnectionMode::Pusher => self.response.parse_response(self.tcp.read_buffer()),
            };
            match outcome {
                Ok(ParseOutcome::NeedMore) => return,
                Ok(ParseOutcome::Interleaved(frame)) => self.handle_interleaved(frame),
                Ok(ParseOutcome::Complete) => {
                    self.keep_alive();
                    match self.mode {
                        ConnectionMode::Server => {
                            self.handle_rtsp_request(scheduler);
                            self.request.reset();
                        }
                        ConnectionMode::Pusher => {
                            self.handle_rtsp_response(scheduler);
                            self.response.reset();
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(conn = %self.id, error = %e, "malformed RTSP message");
                    if self.mode == ConnectionMode::Server {
                        let message = self.request.build_bad_request_res();
                        self.send_message(scheduler, message);
                    }
                    self.handle_close(scheduler);
                    return;
                }
            }
        }
    }

    fn handle_interleaved(&mut self, frame: InterleavedFrame) {
        if frame.channel % 2 == 1 || self.rtp.is_rtcp_channel(frame.channel) {
            tracing::trace!(conn = %self.id, channel = frame.channel, bytes = frame.payload.len(), "interleaved rtcp");
            self.keep_alive();
        } else {
            tracing::trace!(conn = %self.id, channel = frame.channel, "ignoring interleaved data");
        }
    }

    fn send_message(&mut self, scheduler: &TaskScheduler, message: RtspMessage) {
        let agent_header = match self.mode {
            ConnectionMode::Server => "Server",
            ConnectionMode::Pusher => "User-Agent",
        };
        let message = message.add_header(agent_header, &self.config.agent);
        tracing::debug!(conn = %self.id, line = %message.start_line(), "sending");

        let data = match message.encode(self.config.max_message_size) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(conn = %self.id, error = %e, "dropping oversized message");
                return;
            }
        };
        if let Err(e) = self.tcp.send(scheduler, data) {
            tracing::warn!(conn = %self.id, error = %e, "send failed");
            self.handle_close(scheduler);
        }
    }

    fn handle_rtsp_request(&mut self, scheduler: &TaskScheduler) {
        tracing::debug!(
            conn = %self.id,
            method = %self.request.method_name(),
            uri = %self.request.uri(),
            cseq = ?self.request.cseq(),
            "request"
        );

        if self.request.cseq().is_none() {
            let message = self.request.build_bad_request_res();
            self.send_message(scheduler, message);
            return;
        }

        match self.request.method() {
            Method::Options => self.handle_cmd_option(scheduler),
            Method::Describe => self.handle_cmd_describe(scheduler),
            Method::Setup => self.handle_cmd_setup(scheduler),
            Method::Play => self.handle_cmd_play(scheduler),
            Method::Teardown => self.handle_cmd_teardown(scheduler),
            Method::GetParameter => self.handle_cmd_get_parameter(scheduler),
            _ => {
                let message = self.request.build_not_implemented_res();
                self.send_message(scheduler, message);
            }
        }
    }

    /// Returns `false` after answering 401. Once a client has authenticated,
    /// the connection stays authenticated.
    fn handle_authentication(&mut self, scheduler: &TaskScheduler) -> bool {
        if self.has_auth {
            return true;
        }
        let Some(ctx) = self.context.upgrade() else {
            return true;
        };
        let Some(auth) = ctx.authentication() else {
            self.has_auth = true;
            return true;
        };

        if let (Some(nonce), Some(credentials)) = (&self.nonce, self.request.credentials()) {
            if auth.verify(credentials, self.request.method_name(), nonce) {
                tracing::info!(conn = %self.id, user = %credentials.username, "client authenticated");
                self.nonce = None;
                self.has_auth = true;
                return true;
            }
            tracing::warn!(conn = %self.id, user = %credentials.username, "digest authentication failed");
        }

        let nonce = auth.get_nonce();
        let message = self.request.build_unauthorized_res(auth.realm(), &nonce);
        self.nonce = Some(nonce);
        self.send_message(scheduler, message);
        false
    }

    /// `false` (after answering 454) when the request names another session.
    fn check_session(&mut self, scheduler: &TaskScheduler) -> bool {
        let matches = match self.request.session() {
            Some(id) => self
                .rtp
                .session_id()
                .is_some_and(|current| id.parse::<u32>().ok() == Some(current)),
            None => true,
        };
        if !matches {
            tracing::debug!(conn = %self.id, session = ?self.request.session(), "unknown session");
            let message = self.request.build_session_not_found_res();
            self.send_message(scheduler, message);
        }
        matches
    }

    fn resolve_media_session(&mut self) -> Option<Arc<MediaSession>> {
        let suffix = self.request.url_suffix();
        if let Some(session) = &self.media_session {
            if session.suffix() == suffix {
                return Some(Arc::clone(session));
            }
        }
        let session = self.context.upgrade()?.lookup_media_session(suffix)?;
        for (channel, source) in session.sources() {
            self.rtp.set_media_source(channel, &source);
        }
        Some(session)
    }

    fn handle_cmd_option(&mut self, scheduler: &TaskScheduler) {
        let message = self.request.build_option_res();
        self.send_message(scheduler, message);
    }

    fn handle_cmd_describe(&mut self, scheduler: &TaskScheduler) {
        if !self.handle_authentication(scheduler) {
            return;
        }

        let (Some(ctx), Some(session)) = (self.context.upgrade(), self.resolve_media_session())
        else {
            tracing::info!(conn = %self.id, suffix = %self.request.url_suffix(), "no such media session");
            let message = self.request.build_not_found_res();
            self.send_message(scheduler, message);
            return;
        };

        let message = if !self.request.accepts_sdp() {
            tracing::debug!(conn = %self.id, accept = ?self.request.accept(), "client does not accept SDP");
            self.request.build_not_acceptable_res()
        } else if session.sources().is_empty() {
            self.request.build_server_error_res()
        } else {
            let sdp = ctx.session_description(&session, self.local_ip());
            self.request.build_describe_res(sdp)
        };
        self.media_session = Some(session);
        self.send_message(scheduler, message);
    }

    fn handle_cmd_setup(&mut self, scheduler: &TaskScheduler) {
        if !self.handle_authentication(scheduler) || !self.check_session(scheduler) {
            return;
        }

        let channel = self.request.channel();
        let session = match self.resolve_media_session() {
            Some(session) if session.source(channel).is_some() => session,
            _ => {
                let message = self.request.build_not_found_res();
                self.send_message(scheduler, message);
                return;
            }
        };

        let message = match self.setup_transport(scheduler, &session, channel) {
            Ok(message) => {
                if let Some(peer) = self.peer_addr() {
                    session.add_client(self.id, scheduler.handle(), peer);
                }
                self.media_session = Some(session);
                message
            }
            Err(message) => message,
        };
        self.send_message(scheduler, message);
    }

    /// The SETUP reply on success, the error reply otherwise.
    fn setup_transport(
        &mut self,
        scheduler: &TaskScheduler,
        session: &MediaSession,
        channel: MediaChannelId,
    ) -> std::result::Result<RtspMessage, RtspMessage> {
        let timeout = self.config.session_timeout.as_secs();
        let session_id = self.rtp.assign_session_id();
        let transport = self.request.transport().cloned();

        let result = match (session.is_multicast(), transport) {
            (true, Some(TransportHeader::Multicast { .. })) => {
                let (Some(group), Some(port)) =
                    (session.multicast_address(), session.multicast_port(channel))
                else {
                    return Err(self.request.build_server_error_res());
                };
                let source = self.local_ip().to_string();
                self.rtp
                    .setup_rtp_over_multicast(channel, group, port)
                    .map(|()| {
                        self.request.build_setup_multicast_res(
                            group,
                            &source,
                            port,
                            MULTICAST_TTL,
                            session_id,
                            timeout,
                        )
                    })
            }
            (false, Some(TransportHeader::Tcp { rtp_channel, rtcp_channel })) => self
                .rtp
                .setup_rtp_over_tcp(channel, rtp_channel, rtcp_channel)
                .map(|()| {
                    self.request
                        .build_setup_tcp_res(rtp_channel, rtcp_channel, session_id, timeout)
                }),
            (false, Some(TransportHeader::Udp { client_rtp_port, client_rtcp_port })) => {
                let weak = self.weak_self.clone();
                self.rtp
                    .setup_rtp_over_udp(scheduler, channel, client_rtp_port, client_rtcp_port, move |_| {
                        if let Some(conn) = weak.upgrade() {
                            if let Ok(mut conn) = conn.try_borrow_mut() {
                                conn.keep_alive();
                            }
                        }
                    })
                    .and_then(|()| {
                        let server_ports = self
                            .rtp
                            .get_rtp_port(channel)
                            .zip(self.rtp.get_rtcp_port(channel))
                            .ok_or(RtspError::ChannelNotSetup(channel.index()))?;
                        Ok(self.request.build_setup_udp_res(
                            (client_rtp_port, client_rtcp_port),
                            server_ports,
                            session_id,
                            timeout,
                        ))
                    })
            }
            (multicast, transport) => {
                tracing::info!(conn = %self.id, multicast, ?transport, "unsupported transport");
                return Err(self.request.build_unsupported_res());
            }
        };

        result.map_err(|e| {
            tracing::warn!(conn = %self.id, %channel, error = %e, "transport setup failed");
            self.request.build_server_error_res()
        })
    }

    fn handle_cmd_play(&mut self, scheduler: &TaskScheduler) {
        if !self.handle_authentication(scheduler) || !self.check_session(scheduler) {
            return;
        }
        if !self.rtp.any_setup() {
            let message = self.request.build_method_not_valid_res();
            self.send_message(scheduler, message);
            return;
        }

        self.state = ConnectionState::Play;
        self.rtp.play();
        let session_id = self.rtp.assign_session_id();
        tracing::info!(conn = %self.id, session = session_id, mode = ?self.rtp.transport_mode(), "playing");

        let rtp_info = self.rtp.get_rtp_info(self.request.base_url());
        let message = self.request.build_play_res(
            &rtp_info,
            session_id,
            self.config.session_timeout.as_secs(),
        );
        self.send_message(scheduler, message);
    }

    fn handle_cmd_teardown(&mut self, scheduler: &TaskScheduler) {
        if !self.handle_authentication(scheduler) || !self.check_session(scheduler) {
            return;
        }

        self.rtp.teardown(scheduler);
        self.state = ConnectionState::Connect;
        if let Some(session) = self.media_session.take() {
            session.remove_client(self.id);
        }
        tracing::info!(conn = %self.id, session = ?self.rtp.session_id(), "teardown");

        let message = self.request.build_teardown_res(self.rtp.session_id());
        self.send_message(scheduler, message);
    }

    fn handle_cmd_get_parameter(&mut self, scheduler: &TaskScheduler) {
        if !self.handle_authentication(scheduler) || !self.check_session(scheduler) {
            return;
        }
        let message = self.request.build_get_parameter_res(self.rtp.session_id());
        self.send_message(scheduler, message);
    }

    /// Begin the pusher dialogue with OPTIONS.
    pub fn send_options(&mut self, scheduler: &TaskScheduler) {
        let message = self.response.build_option_req();
        self.send_request(scheduler, message);
    }

    pub fn send_teardown(&mut self, scheduler: &TaskScheduler) {
        let message = self.response.build_teardown_req();
        self.send_request(scheduler, message);
    }

    fn send_announce(&mut self, scheduler: &TaskScheduler) {
        let suffix = crate::mount::extract_session_suffix(self.response.url()).0.to_string();
        let session = self
            .context
            .upgrade()
            .and_then(|ctx| ctx.lookup_media_session(&suffix).map(|s| (ctx, s)));
        let Some((ctx, session)) = session else {
            tracing::warn!(conn = %self.id, "no media session to announce");
            self.handle_close(scheduler);
            return;
        };

        self.pending_setup.clear();
        for (channel, source) in session.sources() {
            self.rtp.set_media_source(channel, &source);
            self.pending_setup.push(channel);
        }
        let sdp = ctx.session_description(&session, self.local_ip());
        self.media_session = Some(session);

        let message = self.response.build_announce_req(sdp);
        self.send_request(scheduler, message);
    }

    fn send_next_setup(&mut self, scheduler: &TaskScheduler) {
        let message = match self.pending_setup.first() {
            Some(&channel) => self.response.build_setup_tcp_req(channel),
            None => self.response.build_record_req(),
        };
        self.send_request(scheduler, message);
    }

    /// Add credentials when the server has challenged us.
    fn send_request(&mut self, scheduler: &TaskScheduler, message: RtspMessage) {
        let authorization = match (&self.challenge, self.context.upgrade()) {
            (Some(challenge), Some(ctx)) => ctx.authentication().map(|auth| {
                auth.authorization(
                    challenge,
                    self.response.method().as_str(),
                    self.response.request_uri(),
                )
            }),
            _ => None,
        };
        self.send_message(scheduler, message.add_optional_header("Authorization", authorization));
    }

    fn resend_last_request(&mut self, scheduler: &TaskScheduler) {
        match self.response.method() {
            Method::Options => self.send_options(scheduler),
            Method::Announce => self.send_announce(scheduler),
            Method::Setup | Method::Record => self.send_next_setup(scheduler),
            Method::Teardown => self.send_teardown(scheduler),
            method => {
                tracing::warn!(conn = %self.id, %method, "cannot retry request");
                self.handle_close(scheduler);
            }
        }
    }

    fn handle_rtsp_response(&mut self, scheduler: &TaskScheduler) {
        let status = self.response.status_code();
        let method = self.response.method();
        tracing::debug!(
            conn = %self.id,
            %method,
            status,
            cseq = ?self.response.response_cseq(),
            "response"
        );

        if status == 401 && !self.auth_retried {
            let can_answer = self
                .context
                .upgrade()
                .is_some_and(|ctx| ctx.authentication().is_some());
            if let (true, Some(challenge)) = (can_answer, self.response.challenge().cloned()) {
                tracing::debug!(conn = %self.id, realm = %challenge.realm, "answering digest challenge");
                self.auth_retried = true;
                self.challenge = Some(challenge);
                self.resend_last_request(scheduler);
                return;
            }
        }

        if !(200..300).contains(&status) {
            tracing::warn!(
                conn = %self.id,
                %method,
                status,
                reason = %self.response.status_text(),
                "server rejected request"
            );
            self.handle_close(scheduler);
            return;
        }

        match method {
            Method::Options => self.send_announce(scheduler),
            Method::Announce => self.send_next_setup(scheduler),
            Method::Setup => {
                if !self.pending_setup.is_empty() {
                    let channel = self.pending_setup.remove(0);
                    let rtp_channel = (channel.index() * 2) as u8;
                    if let Err(e) = self.rtp.setup_rtp_over_tcp(channel, rtp_channel, rtp_channel + 1) {
                        tracing::warn!(conn = %self.id, error = %e, "transport setup failed");
                        self.handle_close(scheduler);
                        return;
                    }
                }
                self.send_next_setup(scheduler);
            }
            Method::Record => {
                self.state = ConnectionState::Push;
                self.rtp.record();
                tracing::info!(conn = %self.id, url = %self.response.url(), "recording");
                if let Some(ctx) = self.context.upgrade() {
                    ctx.on_recording(self.id);
                }
            }
            Method::Teardown => self.handle_close(scheduler),
            _ => {}
        }
    }

    /// Close once queued output (e.g. a final TEARDOWN) has reached the
    /// socket, or after [`CLOSE_LINGER`] if the peer stops reading.
    pub fn close_when_flushed(&mut self, scheduler: &TaskScheduler) {
        if self.closed {
            return;
        }
        if self.tcp.queued_bytes() == 0 {
            self.handle_close(scheduler);
            return;
        }
        tracing::debug!(conn = %self.id, queued = self.tcp.queued_bytes(), "closing after flush");
        self.close_on_flush = true;
        let id = self.id;
        scheduler.add_timer(CLOSE_LINGER, move |sched| {
            if let Some(connection) = sched.local::<ConnectionTable>().get(id) {
                connection.borrow_mut().handle_close(sched);
            }
            false
        });
    }

    /// Release transport, socket and session membership. Idempotent.
    pub fn handle_close(&mut self, scheduler: &TaskScheduler) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::info!(conn = %self.id, peer = ?self.peer_addr(), "connection closed");

        self.rtp.teardown(scheduler);
        self.tcp.close(scheduler);
        if let Some(session) = self.media_session.take() {
            session.remove_client(self.id);
        }
        if let Some(ctx) = self.context.upgrade() {
            ctx.on_connection_closed(self.id);
        }
        let removed = scheduler.local::<ConnectionTable>().remove(self.id);
        drop(removed);
    }
}

impl std::fmt::Debug for RtspConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtspConnection")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("tcp", &self.tcp)
            .field("rtp", &self.rtp)
            .finish()
    }
}

/// Channel callback that runs `f` on the connection if it still exists.
fn with_connection<F>(
    weak: &Weak<RefCell<RtspConnection>>,
    f: F,
) -> impl Fn(&TaskScheduler) + 'static
where
    F: Fn(&mut RtspConnection, &TaskScheduler) + 'static,
{
    let weak = weak.clone();
    move |scheduler: &TaskScheduler| {
        if let Some(connection) = weak.upgrade() {
            f(&mut connection.borrow_mut(), scheduler);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    use super::*;
    use crate::media::{FrameType, MediaSource};
    use crate::mount::MediaSessionRegistry;
    use crate::net::{EventLoopConfig, PollerKind};
    use crate::protocol::DigestAuthentication;
    use crate::protocol::sdp::generate_sdp;

    struct TestContext {
        sessions: MediaSessionRegistry,
        auth: Option<DigestAuthentication>,
    }

    impl RtspContext for TestContext {
        fn lookup_media_session(&self, suffix: &str) -> Option<Arc<MediaSession>> {
            self.sessions.lookup(suffix)
        }

        fn authentication(&self) -> Option<&DigestAuthentication> {
            self.auth.as_ref()
        }

        fn session_description(&self, session: &MediaSession, local_ip: IpAddr) -> String {
            generate_sdp(session, &local_ip.to_string(), "0", "0", "-", "test")
        }
    }

    struct Fixture {
        scheduler: TaskScheduler,
        context: Arc<TestContext>,
        client: TcpStream,
        connection: ConnectionPtr,
    }

    impl Fixture {
        fn new(auth: Option<DigestAuthentication>) -> Self {
            let scheduler = TaskScheduler::new(
                0,
                &EventLoopConfig {
                    poller: PollerKind::Select,
                    ..Default::default()
                },
            )
            .unwrap();
            let sessions = MediaSessionRegistry::new();
            sessions.add(
                MediaSession::new("live").with_source(MediaChannelId::Channel0, MediaSource::h264()),
            );
            let context = Arc::new(TestContext { sessions, auth });

            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
            client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let (server, _) = listener.accept().unwrap();

            let weak: std::sync::Weak<dyn RtspContext> = Arc::downgrade(&context) as std::sync::Weak<dyn RtspContext>;
            let connection = RtspConnection::accept(
                &scheduler,
                ConnectionId::next(),
                server,
                weak,
                ConnectionConfig::default(),
            )
            .unwrap();
            Fixture {
                scheduler,
                context,
                client,
                connection,
            }
        }

        /// Send `request`, run the reactor, return the full response.
        fn exchange(&mut self, request: &str) -> String {
            self.client.write_all(request.as_bytes()).unwrap();
            self.read_response()
        }

        fn read_response(&mut self) -> String {
            let mut response = Vec::new();
            let mut buf = [0u8; 4096];
            for _ in 0..50 {
                self.scheduler.handle_event(Some(Duration::from_millis(20)));
                self.client
                    .set_read_timeout(Some(Duration::from_millis(20)))
                    .unwrap();
                match self.client.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => response.extend_from_slice(&buf[..n]),
                    Err(_) if !response.is_empty() => break,
                    Err(_) => {}
                }
            }
            String::from_utf8(response).unwrap()
        }
    }

    fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
        response.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }

    #[test]
    fn options_lists_methods() {
        let mut fx = Fixture::new(None);
        let res = fx.exchange("OPTIONS rtsp://127.0.0.1/live RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        assert!(res.starts_with("RTSP/1.0 200 OK\r\n"));
        assert_eq!(header(&res, "CSeq"), Some("1"));
        assert!(header(&res, "Public").unwrap().contains("DESCRIBE"));
        assert!(header(&res, "Server").is_some());
        assert_eq!(fx.scheduler.local::<ConnectionTable>().len(), 1);
    }

    #[test]
    fn session_id_assigned_by_first_setup() {
        let mut fx = Fixture::new(None);
        let res = fx.exchange("OPTIONS rtsp://127.0.0.1/live RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        assert!(res.starts_with("RTSP/1.0 200 OK\r\n"));
        let res = fx.exchange("GET_PARAMETER rtsp://127.0.0.1/live RTSP/1.0\r\nCSeq: 2\r\n\r\n");
        assert!(res.starts_with("RTSP/1.0 200 OK\r\n"));
        assert_eq!(header(&res, "Session"), None);
        assert_eq!(fx.connection.borrow().session_id(), None);

        let res = fx.exchange(
            "SETUP rtsp://127.0.0.1/live/track0 RTSP/1.0\r\nCSeq: 3\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
        );
        let id = fx.connection.borrow().session_id().unwrap();
        let session = header(&res, "Session").unwrap().split(';').next().unwrap();
        assert_eq!(session, id.to_string());
    }

    #[test]
    fn describe_without_sdp_in_accept_is_406() {
        let mut fx = Fixture::new(None);
        let res = fx.exchange(
            "DESCRIBE rtsp://127.0.0.1/live RTSP/1.0\r\nCSeq: 2\r\nAccept: application/mheg\r\n\r\n",
        );
        assert!(res.starts_with("RTSP/1.0 406 Not Acceptable\r\n"), "{res}");
        assert_eq!(header(&res, "Content-Type"), None);

        let res = fx.exchange(
            "DESCRIBE rtsp://127.0.0.1/live RTSP/1.0\r\nCSeq: 3\r\nAccept: application/sdp\r\n\r\n",
        );
        assert!(res.starts_with("RTSP/1.0 200 OK\r\n"), "{res}");
        assert_eq!(header(&res, "Content-Type"), Some("application/sdp"));
    }

    #[test]
    fn describe_unknown_session_is_404() {
        let mut fx = Fixture::new(None);
        let res = fx.exchange("DESCRIBE rtsp://127.0.0.1/nothing RTSP/1.0\r\nCSeq: 2\r\n\r\n");
        assert!(res.starts_with("RTSP/1.0 404 Not Found\r\n"));
        assert!(!fx.connection.borrow().is_closed());
    }

    #[test]
    fn tcp_setup_play_sends_interleaved() {
        let mut fx = Fixture::new(None);
        let res = fx.exchange(
            "SETUP rtsp://127.0.0.1/live/track0 RTSP/1.0\r\nCSeq: 3\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
        );
        assert!(res.starts_with("RTSP/1.0 200 OK\r\n"), "{res}");
        assert_eq!(
            header(&res, "Transport"),
            Some("RTP/AVP/TCP;unicast;interleaved=0-1")
        );
        let session = header(&res, "Session").unwrap().split(';').next().unwrap().to_string();

        let res = fx.exchange(&format!(
            "PLAY rtsp://127.0.0.1/live RTSP/1.0\r\nCSeq: 4\r\nSession: {session}\r\n\r\n"
        ));
        assert!(res.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(header(&res, "RTP-Info").unwrap().starts_with("url=rtsp://127.0.0.1/live/track0;seq="));
        assert!(fx.connection.borrow().is_playing());

        let sent = fx
            .connection
            .borrow_mut()
            .send_rtp_packet(
                &fx.scheduler,
                MediaChannelId::Channel0,
                &RtpPacket::new(vec![7u8; 16], 90000, FrameType::VideoKey),
            )
            .unwrap();
        assert_eq!(sent, 4 + 12 + 16);
        let mut frame = [0u8; 32];
        fx.client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        fx.client.read_exact(&mut frame).unwrap();
        assert_eq!(&frame[..4], &[b'$', 0, 0, 28]);
        assert_eq!(&frame[16..], &[7u8; 16]);
    }

    #[test]
    fn close_when_flushed_waits_for_queued_output() {
        let mut fx = Fixture::new(None);
        let res = fx.exchange(
            "SETUP rtsp://127.0.0.1/live/track0 RTSP/1.0\r\nCSeq: 3\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
        );
        let session = header(&res, "Session").unwrap().split(';').next().unwrap().to_string();
        fx.exchange(&format!(
            "PLAY rtsp://127.0.0.1/live RTSP/1.0\r\nCSeq: 4\r\nSession: {session}\r\n\r\n"
        ));

        // The client does not read, so the socket buffer fills and output queues.
        let packet = RtpPacket::new(vec![1u8; 1400], 90000, FrameType::VideoKey);
        let mut sent = 0usize;
        while fx.connection.borrow().tcp.queued_bytes() == 0 {
            sent += fx
                .connection
                .borrow_mut()
                .send_rtp_packet(&fx.scheduler, MediaChannelId::Channel0, &packet)
                .unwrap();
        }

        fx.connection.borrow_mut().close_when_flushed(&fx.scheduler);
        assert!(!fx.connection.borrow().is_closed());

        let mut received = 0usize;
        let mut buf = vec![0u8; 64 * 1024];
        fx.client.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        for _ in 0..500 {
            fx.scheduler.handle_event(Some(Duration::from_millis(5)));
            match fx.client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(_) => {}
            }
        }
        assert!(fx.connection.borrow().is_closed());
        assert_eq!(received, sent);
    }

    #[test]
    fn play_before_setup_is_455() {
        let mut fx = Fixture::new(None);
        let res = fx.exchange("PLAY rtsp://127.0.0.1/live RTSP/1.0\r\nCSeq: 5\r\n\r\n");
        assert!(res.starts_with("RTSP/1.0 455 "), "{res}");
    }

    #[test]
    fn wrong_session_is_454() {
        let mut fx = Fixture::new(None);
        let res = fx.exchange(
            "GET_PARAMETER rtsp://127.0.0.1/live RTSP/1.0\r\nCSeq: 6\r\nSession: 1\r\n\r\n",
        );
        assert!(res.starts_with("RTSP/1.0 454 Session Not Found\r\n"), "{res}");
    }

    #[test]
    fn multicast_transport_on_unicast_session_is_461() {
        let mut fx = Fixture::new(None);
        let res = fx.exchange(
            "SETUP rtsp://127.0.0.1/live/track0 RTSP/1.0\r\nCSeq: 3\r\n\
             Transport: RTP/AVP;multicast\r\n\r\n",
        );
        assert!(res.starts_with("RTSP/1.0 461 Unsupported Transport\r\n"), "{res}");
    }

    #[test]
    fn interleaved_channel_without_rtcp_pair_is_461() {
        let mut fx = Fixture::new(None);
        let res = fx.exchange(
            "SETUP rtsp://127.0.0.1/live/track0 RTSP/1.0\r\nCSeq: 3\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=255\r\n\r\n",
        );
        assert!(res.starts_with("RTSP/1.0 461 Unsupported Transport\r\n"), "{res}");
    }

    #[test]
    fn unmodelled_method_is_501() {
        let mut fx = Fixture::new(None);
        let res = fx.exchange("PAUSE rtsp://127.0.0.1/live RTSP/1.0\r\nCSeq: 7\r\n\r\n");
        assert!(res.starts_with("RTSP/1.0 501 Not Implemented\r\n"));
        assert_eq!(header(&res, "CSeq"), Some("7"));
    }

    #[test]
    fn garbage_closes_connection() {
        let mut fx = Fixture::new(None);
        let res = fx.exchange("HELLO\r\n\r\n");
        assert!(res.starts_with("RTSP/1.0 400 Bad Request\r\n"));
        assert!(fx.connection.borrow().is_closed());
        assert!(fx.scheduler.local::<ConnectionTable>().is_empty());
    }

    #[test]
    fn digest_challenge_then_success() {
        let auth = DigestAuthentication::new("cam", "admin", "secret");
        let mut fx = Fixture::new(Some(auth.clone()));

        let res = fx.exchange("DESCRIBE rtsp://127.0.0.1/live RTSP/1.0\r\nCSeq: 2\r\n\r\n");
        assert!(res.starts_with("RTSP/1.0 401 Unauthorized\r\n"), "{res}");
        let challenge = DigestChallenge::parse(header(&res, "WWW-Authenticate").unwrap()).unwrap();
        assert_eq!(challenge.realm, "cam");

        let authorization = auth.authorization(&challenge, "DESCRIBE", "rtsp://127.0.0.1/live");
        let res = fx.exchange(&format!(
            "DESCRIBE rtsp://127.0.0.1/live RTSP/1.0\r\nCSeq: 3\r\nAuthorization: {authorization}\r\n\r\n"
        ));
        assert!(res.starts_with("RTSP/1.0 200 OK\r\n"), "{res}");
        assert!(res.contains("m=video"));

        // Authenticated for the rest of the connection.
        let res = fx.exchange("GET_PARAMETER rtsp://127.0.0.1/live RTSP/1.0\r\nCSeq: 4\r\n\r\n");
        assert!(res.starts_with("RTSP/1.0 200 OK\r\n"));
    }

    #[test]
    fn wrong_password_gets_fresh_nonce() {
        let mut fx = Fixture::new(Some(DigestAuthentication::new("cam", "admin", "secret")));
        let res = fx.exchange("DESCRIBE rtsp://127.0.0.1/live RTSP/1.0\r\nCSeq: 2\r\n\r\n");
        let first = DigestChallenge::parse(header(&res, "WWW-Authenticate").unwrap()).unwrap();

        let wrong = DigestAuthentication::new("cam", "admin", "guess");
        let authorization = wrong.authorization(&first, "DESCRIBE", "rtsp://127.0.0.1/live");
        let res = fx.exchange(&format!(
            "DESCRIBE rtsp://127.0.0.1/live RTSP/1.0\r\nCSeq: 3\r\nAuthorization: {authorization}\r\n\r\n"
        ));
        assert!(res.starts_with("RTSP/1.0 401 Unauthorized\r\n"));
        let second = DigestChallenge::parse(header(&res, "WWW-Authenticate").unwrap()).unwrap();
        assert_ne!(first.nonce, second.nonce);

        // OPTIONS is never challenged.
        let res = fx.exchange("OPTIONS * RTSP/1.0\r\nCSeq: 4\r\n\r\n");
        assert!(res.starts_with("RTSP/1.0 200 OK\r\n"));
    }

    #[test]
    fn liveness_counting() {
        let mut fx = Fixture::new(None);
        {
            let mut conn = fx.connection.borrow_mut();
            assert!(conn.is_alive());
            conn.reset_alive_count();
            assert!(!conn.is_alive());
        }
        fx.exchange("OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        assert!(fx.connection.borrow().is_alive());

        fx.connection.borrow_mut().reset_alive_count();
        fx.client.write_all(&[b'$', 1, 0, 2, 0x80, 0xc9]).unwrap();
        for _ in 0..10 {
            fx.scheduler.handle_event(Some(Duration::from_millis(20)));
        }
        assert_eq!(fx.connection.borrow().alive_count(), 1);
    }

    #[test]
    fn peer_close_removes_connection() {
        let fx = Fixture::new(None);
        let Fixture {
            scheduler,
            client,
            connection,
            context: _context,
        } = fx;
        drop(client);
        for _ in 0..10 {
            scheduler.handle_event(Some(Duration::from_millis(20)));
        }
        assert!(connection.borrow().is_closed());
        assert!(scheduler.local::<ConnectionTable>().is_empty());
    }
}
