use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::ops::RangeInclusive;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::{Result, RtspError};
use crate::media::rtp::{INTERLEAVED_PREFIX_SIZE, RTP_HEADER_SIZE, RtpHeader, interleaved_prefix};
use crate::media::{MAX_MEDIA_CHANNEL, MediaChannelId, MediaSource, RtpPacket};
use crate::net::{Channel, ChannelPtr, TaskScheduler};
use crate::transport::{RtpSocketPair, TcpConnection};

/// Hands out RTSP `Session` ids: random, non-zero and unique among the
/// live ones.
#[derive(Debug, Default)]
pub struct SessionIdAllocator {
    live: Mutex<HashSet<u32>>,
}

impl SessionIdAllocator {
    pub fn allocate(self: &Arc<Self>) -> SessionId {
        let mut live = self.live.lock();
        loop {
            let value: u32 = rand::random();
            if value != 0 && live.insert(value) {
                return SessionId {
                    value,
                    allocator: Arc::clone(self),
                };
            }
        }
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }
}

/// A live session id. Released when dropped.
pub struct SessionId {
    value: u32,
    allocator: Arc<SessionIdAllocator>,
}

impl SessionId {
    pub fn get(&self) -> u32 {
        self.value
    }
}

impl Drop for SessionId {
    fn drop(&mut self) {
        self.allocator.live.lock().remove(&self.value);
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// How RTP reaches the peer. Fixed by the first SETUP of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Udp,
    Tcp,
    Multicast,
}

enum ChannelTransport {
    Udp {
        rtp: Rc<UdpSocket>,
        rtp_port: u16,
        rtcp_port: u16,
        peer_rtp: SocketAddr,
        rtcp_channel: ChannelPtr,
    },
    Tcp {
        rtp_channel: u8,
        rtcp_channel: u8,
    },
    Multicast {
        group: Ipv4Addr,
        port: u16,
    },
}

struct MediaChannelInfo {
    header: RtpHeader,
    clock_rate: u32,
    transport: Option<ChannelTransport>,
    is_play: bool,
    is_record: bool,
}

impl MediaChannelInfo {
    fn new() -> Self {
        Self {
            header: RtpHeader::with_random_ssrc(96),
            clock_rate: 90000,
            transport: None,
            is_play: false,
            is_record: false,
        }
    }
}

/// Media transport of one RTSP connection.
///
/// Holds up to [`MAX_MEDIA_CHANNEL`] sub-channels, each set up over UDP,
/// interleaved TCP or a multicast group, and stamps the RTP header for
/// every packet sent. Sequence numbers keep counting across PLAY requests.
///
/// Nothing is sent until the connection has seen a key frame or audio, so
/// a player never starts mid-GOP.
pub struct RtpConnection {
    session_ids: Arc<SessionIdAllocator>,
    session_id: Option<SessionId>,
    mode: Option<TransportMode>,
    channels: [MediaChannelInfo; MAX_MEDIA_CHANNEL],
    local_ip: IpAddr,
    peer_ip: IpAddr,
    port_range: RangeInclusive<u16>,
    has_key_frame: bool,
}

impl RtpConnection {
    pub fn new(
        session_ids: Arc<SessionIdAllocator>,
        local_ip: IpAddr,
        peer_ip: IpAddr,
        port_range: RangeInclusive<u16>,
    ) -> Self {
        Self {
            session_ids,
            session_id: None,
            mode: None,
            channels: [MediaChannelInfo::new(), MediaChannelInfo::new()],
            local_ip,
            peer_ip,
            port_range,
            has_key_frame: false,
        }
    }

    /// RTSP `Session` id, once one has been assigned.
    pub fn session_id(&self) -> Option<u32> {
        self.session_id.as_ref().map(SessionId::get)
    }

    /// The session id, allocating it on first use (the first SETUP).
    pub fn assign_session_id(&mut self) -> u32 {
        self.session_id
            .get_or_insert_with(|| self.session_ids.allocate())
            .get()
    }

    pub fn transport_mode(&self) -> Option<TransportMode> {
        self.mode
    }

    pub fn is_multicast(&self) -> bool {
        self.mode == Some(TransportMode::Multicast)
    }

    /// Take payload type and clock rate from the channel's source.
    pub fn set_media_source(&mut self, channel: MediaChannelId, source: &MediaSource) {
        let info = &mut self.channels[channel.index()];
        info.header.pt = source.payload_type & 0x7f;
        info.clock_rate = source.clock_rate;
    }

    pub fn clock_rate(&self, channel: MediaChannelId) -> u32 {
        self.channels[channel.index()].clock_rate
    }

    fn check_mode(&mut self, mode: TransportMode) -> Result<()> {
        match self.mode {
            Some(current) if current != mode => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("transport already set up as {:?}", current),
            )
            .into()),
            _ => {
                self.mode = Some(mode);
                Ok(())
            }
        }
    }

    pub fn setup_rtp_over_tcp(
        &mut self,
        channel: MediaChannelId,
        rtp_channel: u8,
        rtcp_channel: u8,
    ) -> Result<()> {
        self.check_mode(TransportMode::Tcp)?;
        self.channels[channel.index()].transport = Some(ChannelTransport::Tcp {
            rtp_channel,
            rtcp_channel,
        });
        tracing::debug!(session = ?self.session_id(), %channel, rtp_channel, rtcp_channel, "rtp over tcp");
        Ok(())
    }

    /// Bind a server port pair and register its RTCP socket for reading.
    /// `on_rtcp` runs for every RTCP datagram received.
    pub fn setup_rtp_over_udp<F>(
        &mut self,
        scheduler: &TaskScheduler,
        channel: MediaChannelId,
        client_rtp_port: u16,
        client_rtcp_port: u16,
        on_rtcp: F,
    ) -> Result<()>
    where
        F: Fn(&TaskScheduler) + 'static,
    {
        self.check_mode(TransportMode::Udp)?;
        if self.channels[channel.index()].transport.is_some() {
            self.release_channel(scheduler, channel);
        }

        let pair = RtpSocketPair::bind_in_range(self.local_ip, &self.port_range)?;
        let rtp = Rc::new(pair.rtp);
        let socket = pair.rtcp;

        // The RTCP socket lives in its channel and closes with it.
        let rtcp_channel = Rc::new(Channel::new(socket.as_raw_fd()));
        rtcp_channel.set_read_callback(move |sched| {
            let mut buf = [0u8; 2048];
            let mut received = false;
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((n, from)) => {
                        tracing::trace!(%from, bytes = n, "rtcp received");
                        received = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            if received {
                on_rtcp(sched);
            }
        });
        rtcp_channel.enable_reading();
        scheduler.update_channel(&rtcp_channel)?;

        tracing::debug!(
            session = ?self.session_id(),
            %channel,
            client_rtp_port,
            client_rtcp_port,
            server_rtp_port = pair.rtp_port,
            "rtp over udp"
        );
        self.channels[channel.index()].transport = Some(ChannelTransport::Udp {
            rtp,
            rtp_port: pair.rtp_port,
            rtcp_port: pair.rtcp_port,
            peer_rtp: SocketAddr::new(self.peer_ip, client_rtp_port),
            rtcp_channel,
        });
        Ok(())
    }

    /// Record the group the session sends to. Delivery itself happens once
    /// per media session, not per connection.
    pub fn setup_rtp_over_multicast(
        &mut self,
        channel: MediaChannelId,
        group: Ipv4Addr,
        port: u16,
    ) -> Result<()> {
        self.check_mode(TransportMode::Multicast)?;
        self.channels[channel.index()].transport = Some(ChannelTransport::Multicast { group, port });
        tracing::debug!(session = ?self.session_id(), %channel, %group, port, "rtp over multicast");
        Ok(())
    }

    pub fn is_setup(&self, channel: MediaChannelId) -> bool {
        self.channels[channel.index()].transport.is_some()
    }

    pub fn any_setup(&self) -> bool {
        self.channels.iter().any(|c| c.transport.is_some())
    }

    /// Server RTP port of a UDP channel.
    pub fn get_rtp_port(&self, channel: MediaChannelId) -> Option<u16> {
        match &self.channels[channel.index()].transport {
            Some(ChannelTransport::Udp { rtp_port, .. }) => Some(*rtp_port),
            _ => None,
        }
    }

    /// Server RTCP port of a UDP channel.
    pub fn get_rtcp_port(&self, channel: MediaChannelId) -> Option<u16> {
        match &self.channels[channel.index()].transport {
            Some(ChannelTransport::Udp { rtcp_port, .. }) => Some(*rtcp_port),
            _ => None,
        }
    }

    /// Group and port of a multicast channel.
    pub fn multicast_destination(&self, channel: MediaChannelId) -> Option<(Ipv4Addr, u16)> {
        match &self.channels[channel.index()].transport {
            Some(ChannelTransport::Multicast { group, port }) => Some((*group, *port)),
            _ => None,
        }
    }

    /// Interleaved channel pair of a TCP channel.
    pub fn interleaved_channels(&self, channel: MediaChannelId) -> Option<(u8, u8)> {
        match &self.channels[channel.index()].transport {
            Some(ChannelTransport::Tcp {
                rtp_channel,
                rtcp_channel,
            }) => Some((*rtp_channel, *rtcp_channel)),
            _ => None,
        }
    }

    /// Whether `channel` is the RTCP channel of an interleaved setup.
    pub fn is_rtcp_channel(&self, interleaved: u8) -> bool {
        self.channels.iter().any(|c| {
            matches!(c.transport, Some(ChannelTransport::Tcp { rtcp_channel, .. }) if rtcp_channel == interleaved)
        })
    }

    pub fn play(&mut self) {
        for info in self.channels.iter_mut().filter(|c| c.transport.is_some()) {
            info.is_play = true;
        }
    }

    pub fn record(&mut self) {
        for info in self.channels.iter_mut().filter(|c| c.transport.is_some()) {
            info.is_record = true;
        }
    }

    pub fn is_playing(&self) -> bool {
        self.channels.iter().any(|c| c.is_play)
    }

    pub fn is_recording(&self) -> bool {
        self.channels.iter().any(|c| c.is_record)
    }

    fn release_channel(&mut self, scheduler: &TaskScheduler, channel: MediaChannelId) {
        let info = &mut self.channels[channel.index()];
        if let Some(ChannelTransport::Udp { rtcp_channel, .. }) = &info.transport {
            rtcp_channel.disable_all();
            scheduler.remove_channel(rtcp_channel);
        }
        info.transport = None;
        info.is_play = false;
        info.is_record = false;
    }

    /// Stop delivery and close every server-side socket.
    pub fn teardown(&mut self, scheduler: &TaskScheduler) {
        for channel in MediaChannelId::ALL {
            self.release_channel(scheduler, channel);
        }
        self.mode = None;
        self.has_key_frame = false;
    }

    /// `RTP-Info` value for PLAY (RFC 2326 §12.33): one entry per set-up
    /// channel with the next sequence number and last timestamp.
    pub fn get_rtp_info(&self, url: &str) -> String {
        let url = url.trim_end_matches('/');
        MediaChannelId::ALL
            .iter()
            .filter(|ch| self.is_setup(**ch))
            .map(|ch| {
                let header = &self.channels[ch.index()].header;
                format!(
                    "url={}/{};seq={};rtptime={}",
                    url,
                    ch.track_name(),
                    header.sequence(),
                    header.timestamp()
                )
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Stamp and send one packet. Returns the bytes handed to the socket,
    /// 0 when the packet was gated or dropped.
    pub fn send_rtp_packet(
        &mut self,
        scheduler: &TaskScheduler,
        tcp: &mut TcpConnection,
        channel: MediaChannelId,
        packet: &RtpPacket,
    ) -> Result<usize> {
        let index = channel.index();
        if !self.is_setup(channel) {
            return Err(RtspError::ChannelNotSetup(index));
        }
        let info = &self.channels[index];
        if !(info.is_play || info.is_record) {
            return Ok(0);
        }
        if !self.has_key_frame {
            if !packet.frame_type.starts_stream() {
                return Ok(0);
            }
            self.has_key_frame = true;
        }

        let size = RTP_HEADER_SIZE + packet.payload.len();
        let info = &mut self.channels[index];
        match &info.transport {
            Some(ChannelTransport::Tcp { rtp_channel, .. }) => {
                let len = u16::try_from(size).map_err(|_| RtspError::MessageTooLarge {
                    size,
                    limit: u16::MAX as usize,
                })?;
                let rtp_channel = *rtp_channel;
                let header = info.header.write(packet.marker, packet.timestamp);
                let mut buf = BytesMut::with_capacity(INTERLEAVED_PREFIX_SIZE + size);
                buf.extend_from_slice(&interleaved_prefix(rtp_channel, len));
                buf.extend_from_slice(&header);
                buf.extend_from_slice(&packet.payload);
                tcp.send(scheduler, buf.freeze())?;
                tracing::trace!(%channel, bytes = size, "rtp over tcp sent");
                Ok(INTERLEAVED_PREFIX_SIZE + size)
            }
            Some(ChannelTransport::Udp { rtp, peer_rtp, .. }) => {
                let rtp = Rc::clone(rtp);
                let peer = *peer_rtp;
                let header = info.header.write(packet.marker, packet.timestamp);
                let buf = concat(&header, &packet.payload);
                match rtp.send_to(&buf, peer) {
                    Ok(n) => {
                        tracing::trace!(%channel, %peer, bytes = n, "rtp over udp sent");
                        Ok(n)
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        tracing::trace!(%channel, %peer, "udp send would block, dropping");
                        Ok(0)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Some(ChannelTransport::Multicast { .. }) | None => Ok(0),
        }
    }
}

fn concat(header: &[u8], payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(header.len() + payload.len());
    buf.extend_from_slice(header);
    buf.extend_from_slice(payload);
    buf.freeze()
}

impl fmt::Debug for RtpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpConnection")
            .field("session_id", &self.session_id())
            .field("mode", &self.mode)
            .field("playing", &self.is_playing())
            .field("recording", &self.is_recording())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    use super::*;
    use crate::media::FrameType;
    use crate::net::{EventLoopConfig, PollerKind};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn scheduler() -> TaskScheduler {
        TaskScheduler::new(
            0,
            &EventLoopConfig {
                poller: PollerKind::Select,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn rtp() -> RtpConnection {
        let ids = Arc::new(SessionIdAllocator::default());
        RtpConnection::new(ids, LOCALHOST, LOCALHOST, 20000..=40000)
    }

    fn tcp_pair() -> (TcpStream, TcpConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, TcpConnection::new(server, 1 << 20).unwrap())
    }

    #[test]
    fn session_id_assigned_on_first_use() {
        let ids = Arc::new(SessionIdAllocator::default());
        let mut rtp = RtpConnection::new(Arc::clone(&ids), LOCALHOST, LOCALHOST, 20000..=40000);
        assert_eq!(rtp.session_id(), None);
        assert!(ids.is_empty());

        let id = rtp.assign_session_id();
        assert_eq!(rtp.assign_session_id(), id);
        assert_eq!(rtp.session_id(), Some(id));
        assert_eq!(ids.len(), 1);

        drop(rtp);
        assert!(ids.is_empty());
    }

    #[test]
    fn session_ids_unique_and_released() {
        let ids = Arc::new(SessionIdAllocator::default());
        let a = ids.allocate();
        let b = ids.allocate();
        assert_ne!(a.get(), 0);
        assert_ne!(a.get(), b.get());
        assert_eq!(ids.len(), 2);
        drop(a);
        assert_eq!(ids.len(), 1);
        drop(b);
        assert!(ids.is_empty());
    }

    #[test]
    fn send_requires_setup() {
        let sched = scheduler();
        let (_client, mut tcp) = tcp_pair();
        let mut conn = rtp();
        let pkt = RtpPacket::new(vec![0u8; 4], 0, FrameType::VideoKey);
        assert!(matches!(
            conn.send_rtp_packet(&sched, &mut tcp, MediaChannelId::Channel0, &pkt),
            Err(RtspError::ChannelNotSetup(0))
        ));
    }

    #[test]
    fn tcp_interleaved_framing_and_key_frame_gate() {
        let sched = scheduler();
        let (mut client, mut tcp) = tcp_pair();
        let mut conn = rtp();
        conn.set_media_source(MediaChannelId::Channel0, &MediaSource::h264());
        conn.setup_rtp_over_tcp(MediaChannelId::Channel0, 0, 1).unwrap();
        assert!(conn.is_rtcp_channel(1));
        assert!(!conn.is_rtcp_channel(0));

        let delta = RtpPacket::new(vec![1u8; 8], 3000, FrameType::Video);
        // Not playing yet.
        assert_eq!(
            conn.send_rtp_packet(&sched, &mut tcp, MediaChannelId::Channel0, &delta).unwrap(),
            0
        );
        conn.play();
        // Gated until a key frame.
        assert_eq!(
            conn.send_rtp_packet(&sched, &mut tcp, MediaChannelId::Channel0, &delta).unwrap(),
            0
        );

        let key = RtpPacket::new(vec![2u8; 8], 6000, FrameType::VideoKey).with_marker(true);
        let n = conn
            .send_rtp_packet(&sched, &mut tcp, MediaChannelId::Channel0, &key)
            .unwrap();
        assert_eq!(n, 4 + 12 + 8);

        let mut frame = [0u8; 24];
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.read_exact(&mut frame).unwrap();
        assert_eq!(&frame[..4], &[b'$', 0, 0, 20]);
        assert_eq!(frame[4] >> 6, 2);
        assert_eq!(frame[5], 0x80 | 96);
        assert_eq!(u32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]), 6000);
        assert_eq!(&frame[16..], &[2u8; 8]);
    }

    #[test]
    fn sequence_continues_across_play() {
        let sched = scheduler();
        let (_client, mut tcp) = tcp_pair();
        let mut conn = rtp();
        conn.setup_rtp_over_tcp(MediaChannelId::Channel0, 0, 1).unwrap();
        conn.play();
        let pkt = RtpPacket::new(vec![0u8; 4], 0, FrameType::Audio);
        conn.send_rtp_packet(&sched, &mut tcp, MediaChannelId::Channel0, &pkt).unwrap();
        let before = conn.channels[0].header.sequence();
        conn.play();
        conn.send_rtp_packet(&sched, &mut tcp, MediaChannelId::Channel0, &pkt).unwrap();
        assert_eq!(conn.channels[0].header.sequence(), before.wrapping_add(1));
    }

    #[test]
    fn udp_setup_send_and_teardown() {
        let sched = scheduler();
        let (_client, mut tcp) = tcp_pair();
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let client_port = receiver.local_addr().unwrap().port();

        let mut conn = rtp();
        conn.setup_rtp_over_udp(&sched, MediaChannelId::Channel0, client_port, client_port + 1, |_| {})
            .unwrap();
        let rtp_port = conn.get_rtp_port(MediaChannelId::Channel0).unwrap();
        let rtcp_port = conn.get_rtcp_port(MediaChannelId::Channel0).unwrap();
        assert_eq!(rtp_port % 2, 0);
        assert_eq!(rtcp_port, rtp_port + 1);
        assert!((20000..=40000).contains(&rtp_port));
        assert_eq!(sched.channel_count(), 1);

        conn.play();
        let pkt = RtpPacket::new(vec![9u8; 10], 1234, FrameType::VideoKey);
        let sent = conn
            .send_rtp_packet(&sched, &mut tcp, MediaChannelId::Channel0, &pkt)
            .unwrap();
        assert_eq!(sent, 22);
        let mut buf = [0u8; 64];
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(n, 22);
        assert_eq!(from.port(), rtp_port);

        let info = conn.get_rtp_info("rtsp://h/live/");
        assert!(info.starts_with("url=rtsp://h/live/track0;seq="));
        assert!(info.ends_with(";rtptime=1234"));

        conn.teardown(&sched);
        assert!(!conn.is_setup(MediaChannelId::Channel0));
        assert_eq!(conn.get_rtp_port(MediaChannelId::Channel0), None);
        assert_eq!(sched.channel_count(), 0);
        // The port is free again once the sockets are gone.
        assert!(UdpSocket::bind(("127.0.0.1", rtp_port)).is_ok());
    }

    #[test]
    fn transport_mode_is_fixed() {
        let mut conn = rtp();
        conn.setup_rtp_over_tcp(MediaChannelId::Channel0, 0, 1).unwrap();
        assert!(
            conn.setup_rtp_over_multicast(MediaChannelId::Channel1, Ipv4Addr::new(232, 0, 0, 1), 5000)
                .is_err()
        );
        assert_eq!(conn.transport_mode(), Some(TransportMode::Tcp));
    }

    #[test]
    fn multicast_send_is_session_level() {
        let sched = scheduler();
        let (_client, mut tcp) = tcp_pair();
        let mut conn = rtp();
        conn.setup_rtp_over_multicast(MediaChannelId::Channel0, Ipv4Addr::new(232, 0, 0, 1), 5000)
            .unwrap();
        assert!(conn.is_multicast());
        assert_eq!(
            conn.multicast_destination(MediaChannelId::Channel0),
            Some((Ipv4Addr::new(232, 0, 0, 1), 5000))
        );
        conn.play();
        let pkt = RtpPacket::new(vec![0u8; 4], 0, FrameType::VideoKey);
        assert_eq!(
            conn.send_rtp_packet(&sched, &mut tcp, MediaChannelId::Channel0, &pkt).unwrap(),
            0
        );
    }
}
