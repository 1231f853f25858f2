use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};

use crate::connection::ConnectionId;
use crate::error::{Result, RtspError};
use crate::media::rtp::{RTP_HEADER_SIZE, RtpHeader};
use crate::media::{MAX_MEDIA_CHANNEL, MediaChannelId, MediaSource, RtpPacket};
use crate::net::SchedulerHandle;
use crate::transport::udp;

/// Identifier of a registered media session. Never 0.
pub type MediaSessionId = u32;

/// TTL advertised and used for multicast delivery.
pub const MULTICAST_TTL: u32 = 255;

/// Called with the session id and the client's RTSP address.
pub type NotifyCallback = Arc<dyn Fn(MediaSessionId, SocketAddr) + Send + Sync>;

struct MulticastGroup {
    address: Ipv4Addr,
    ports: [u16; MAX_MEDIA_CHANNEL],
    socket: UdpSocket,
    headers: Mutex<[RtpHeader; MAX_MEDIA_CHANNEL]>,
}

#[derive(Clone)]
struct Client {
    scheduler: SchedulerHandle,
    peer: SocketAddr,
}

/// A named stream endpoint (e.g. `live`, `camera1/main`) with up to
/// [`MAX_MEDIA_CHANNEL`] media sources.
///
/// Tracks which connections are attached so frames pushed by the media
/// pipeline reach only the schedulers that serve them. Optionally delivers
/// to a multicast group instead of per-client sockets.
pub struct MediaSession {
    id: AtomicU32,
    suffix: String,
    sources: RwLock<[Option<MediaSource>; MAX_MEDIA_CHANNEL]>,
    multicast: RwLock<Option<MulticastGroup>>,
    clients: RwLock<HashMap<ConnectionId, Client>>,
    on_connect: RwLock<Option<NotifyCallback>>,
    on_disconnect: RwLock<Option<NotifyCallback>>,
}

impl MediaSession {
    /// `suffix` is the URL path the session is served under, slashes trimmed.
    pub fn new(suffix: &str) -> Self {
        Self {
            id: AtomicU32::new(0),
            suffix: suffix.trim_matches('/').to_string(),
            sources: RwLock::new([None, None]),
            multicast: RwLock::new(None),
            clients: RwLock::new(HashMap::new()),
            on_connect: RwLock::new(None),
            on_disconnect: RwLock::new(None),
        }
    }

    /// Builder form of [`add_source`](Self::add_source).
    pub fn with_source(self, channel: MediaChannelId, source: MediaSource) -> Self {
        self.add_source(channel, source);
        self
    }

    /// Attach (or replace) the source on `channel`.
    pub fn add_source(&self, channel: MediaChannelId, source: MediaSource) {
        self.sources.write()[channel.index()] = Some(source);
    }

    /// 0 until the session is registered with a server or pusher.
    pub fn id(&self) -> MediaSessionId {
        self.id.load(Ordering::Acquire)
    }

    pub(crate) fn assign_id(&self, id: MediaSessionId) {
        self.id.store(id, Ordering::Release);
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn source(&self, channel: MediaChannelId) -> Option<MediaSource> {
        self.sources.read()[channel.index()].clone()
    }

    /// Configured channels in index order.
    pub fn sources(&self) -> Vec<(MediaChannelId, MediaSource)> {
        let sources = self.sources.read();
        MediaChannelId::ALL
            .iter()
            .filter_map(|&ch| sources[ch.index()].clone().map(|s| (ch, s)))
            .collect()
    }

    /// Switch delivery to a random `232.x.x.x` group with one even port per
    /// channel. Idempotent.
    pub fn start_multicast(&self) -> Result<()> {
        let mut multicast = self.multicast.write();
        if multicast.is_some() {
            return Ok(());
        }

        let address = Ipv4Addr::new(
            232,
            rand::random_range(1..=254),
            rand::random_range(1..=254),
            rand::random_range(1..=254),
        );
        let base = rand::random_range(15000u16..=60000) & !1;
        let ports = [base, base + 2];
        let socket = udp::multicast_sender(MULTICAST_TTL)?;
        let headers = Mutex::new(MediaChannelId::ALL.map(|ch| {
            let pt = self.sources.read()[ch.index()]
                .as_ref()
                .map(|s| s.payload_type)
                .unwrap_or_default();
            RtpHeader::with_random_ssrc(pt)
        }));

        tracing::info!(suffix = %self.suffix, group = %address, ?ports, "multicast enabled");
        *multicast = Some(MulticastGroup {
            address,
            ports,
            socket,
            headers,
        });
        Ok(())
    }

    pub fn is_multicast(&self) -> bool {
        self.multicast.read().is_some()
    }

    pub fn multicast_address(&self) -> Option<Ipv4Addr> {
        self.multicast.read().as_ref().map(|m| m.address)
    }

    pub fn multicast_port(&self, channel: MediaChannelId) -> Option<u16> {
        self.multicast
            .read()
            .as_ref()
            .map(|m| m.ports[channel.index()])
    }

    /// Send one packet to the multicast group. Returns bytes sent, 0 when
    /// the socket buffer is full.
    pub fn send_multicast(&self, channel: MediaChannelId, packet: &RtpPacket) -> Result<usize> {
        let multicast = self.multicast.read();
        let Some(group) = multicast.as_ref() else {
            return Err(RtspError::ChannelNotSetup(channel.index()));
        };

        let header = group.headers.lock()[channel.index()].write(packet.marker, packet.timestamp);
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + packet.payload.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&packet.payload);

        let dest = SocketAddr::new(IpAddr::V4(group.address), group.ports[channel.index()]);
        match group.socket.send_to(&buf, dest) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::trace!(suffix = %self.suffix, "multicast send would block, dropping");
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Attach a connection. Returns `false` if it was already attached.
    pub fn add_client(&self, id: ConnectionId, scheduler: SchedulerHandle, peer: SocketAddr) -> bool {
        let inserted = {
            let mut clients = self.clients.write();
            if clients.contains_key(&id) {
                false
            } else {
                clients.insert(id, Client { scheduler, peer });
                true
            }
        };
        if inserted {
            tracing::debug!(suffix = %self.suffix, conn = %id, %peer, "client attached");
            if let Some(cb) = self.on_connect.read().clone() {
                cb(self.id(), peer);
            }
        }
        inserted
    }

    pub fn remove_client(&self, id: ConnectionId) -> bool {
        let removed = self.clients.write().remove(&id);
        match removed {
            Some(client) => {
                tracing::debug!(suffix = %self.suffix, conn = %id, "client detached");
                if let Some(cb) = self.on_disconnect.read().clone() {
                    cb(self.id(), client.peer);
                }
                true
            }
            None => false,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Attached connections grouped by the scheduler that owns them.
    pub fn clients_by_scheduler(&self) -> Vec<(SchedulerHandle, Vec<ConnectionId>)> {
        let clients = self.clients.read();
        let mut groups: Vec<(SchedulerHandle, Vec<ConnectionId>)> = Vec::new();
        for (&id, client) in clients.iter() {
            match groups
                .iter_mut()
                .find(|(s, _)| s.id() == client.scheduler.id())
            {
                Some((_, ids)) => ids.push(id),
                None => groups.push((client.scheduler.clone(), vec![id])),
            }
        }
        groups
    }

    pub fn set_notify_connected<F>(&self, callback: F)
    where
        F: Fn(MediaSessionId, SocketAddr) + Send + Sync + 'static,
    {
        *self.on_connect.write() = Some(Arc::new(callback));
    }

    pub fn set_notify_disconnected<F>(&self, callback: F)
    where
        F: Fn(MediaSessionId, SocketAddr) + Send + Sync + 'static,
    {
        *self.on_disconnect.write() = Some(Arc::new(callback));
    }
}

/// Registered media sessions, by id and by URL suffix.
#[derive(Default)]
pub struct MediaSessionRegistry {
    next_id: AtomicU32,
    sessions: RwLock<HashMap<MediaSessionId, Arc<MediaSession>>>,
}

impl MediaSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under a fresh id. A session with the same suffix
    /// is replaced.
    pub fn add(&self, session: MediaSession) -> Arc<MediaSession> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        session.assign_id(id);
        let session = Arc::new(session);

        let mut sessions = self.sessions.write();
        sessions.retain(|_, s| s.suffix() != session.suffix());
        sessions.insert(id, session.clone());
        tracing::info!(id, suffix = %session.suffix(), "media session registered");
        session
    }

    pub fn remove(&self, id: MediaSessionId) -> Option<Arc<MediaSession>> {
        let removed = self.sessions.write().remove(&id);
        if let Some(session) = &removed {
            tracing::info!(id, suffix = %session.suffix(), "media session removed");
        }
        removed
    }

    pub fn get(&self, id: MediaSessionId) -> Option<Arc<MediaSession>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Look up by URL suffix (`live`, not `/live/track0`).
    pub fn lookup(&self, suffix: &str) -> Option<Arc<MediaSession>> {
        let suffix = suffix.trim_matches('/');
        self.sessions
            .read()
            .values()
            .find(|s| s.suffix() == suffix)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Detach a connection from every session.
    pub fn remove_client_everywhere(&self, id: ConnectionId) {
        for session in self.sessions.read().values() {
            session.remove_client(id);
        }
    }
}

/// Split an RTSP URI into its session suffix and addressed channel.
///
/// `rtsp://host:8554/live/track1` → (`live`, Some(Channel1))
/// `rtsp://host:8554/live`        → (`live`, None)
/// `rtsp://host:8554`             → (``, None)
/// `*`                            → (``, None)
pub fn extract_session_suffix(uri: &str) -> (&str, Option<MediaChannelId>) {
    let path = match uri.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("rtsp://") => {
            let after = &uri[7..];
            after.find('/').map(|slash| &after[slash..]).unwrap_or("")
        }
        _ if uri.starts_with('/') => uri,
        _ => "",
    };
    let path = path.trim_matches('/');

    match path.rsplit_once('/') {
        Some((head, last)) => match MediaChannelId::from_track_name(last) {
            Some(channel) => (head, Some(channel)),
            None => (path, None),
        },
        None => match MediaChannelId::from_track_name(path) {
            Some(channel) => ("", Some(channel)),
            None => (path, None),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{EventLoopConfig, PollerKind, TaskScheduler};

    #[test]
    fn extract_suffix_full_uri() {
        assert_eq!(
            extract_session_suffix("rtsp://localhost:8554/stream"),
            ("stream", None)
        );
        assert_eq!(
            extract_session_suffix("rtsp://10.0.0.1:8554/camera1/main/track1"),
            ("camera1/main", Some(MediaChannelId::Channel1))
        );
    }

    #[test]
    fn extract_suffix_edge_cases() {
        assert_eq!(extract_session_suffix("rtsp://localhost:8554"), ("", None));
        assert_eq!(extract_session_suffix("rtsp://localhost:8554/"), ("", None));
        assert_eq!(extract_session_suffix("*"), ("", None));
        assert_eq!(extract_session_suffix("/camera1/"), ("camera1", None));
        assert_eq!(
            extract_session_suffix("rtsp://h/track0"),
            ("", Some(MediaChannelId::Channel0))
        );
        // Not a valid channel index, so part of the suffix.
        assert_eq!(
            extract_session_suffix("rtsp://h/live/track7"),
            ("live/track7", None)
        );
    }

    #[test]
    fn registry_add_and_lookup() {
        let registry = MediaSessionRegistry::new();
        let a = registry.add(MediaSession::new("/live/"));
        let b = registry.add(MediaSession::new("cam2"));
        assert_ne!(a.id(), 0);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.suffix(), "live");

        assert!(registry.lookup("live").is_some());
        assert!(registry.lookup("/live").is_some());
        assert!(registry.lookup("other").is_none());
        assert_eq!(registry.get(b.id()).unwrap().suffix(), "cam2");

        assert!(registry.remove(a.id()).is_some());
        assert!(registry.lookup("live").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn same_suffix_replaces() {
        let registry = MediaSessionRegistry::new();
        let first = registry.add(MediaSession::new("live"));
        let second = registry.add(MediaSession::new("live"));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(first.id()).is_none());
        assert_eq!(registry.lookup("live").unwrap().id(), second.id());
    }

    #[test]
    fn sources_in_channel_order() {
        let session = MediaSession::new("live")
            .with_source(MediaChannelId::Channel1, MediaSource::g711a())
            .with_source(MediaChannelId::Channel0, MediaSource::h264());
        let sources = session.sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].0, MediaChannelId::Channel0);
        assert_eq!(sources[1].1.encoding, "PCMA");
    }

    #[test]
    fn clients_notify_and_group() {
        let scheduler =
            TaskScheduler::new(3, &EventLoopConfig { poller: PollerKind::Select, ..Default::default() })
                .unwrap();
        let session = MediaSession::new("live");
        session.assign_id(9);

        let events = Arc::new(Mutex::new(Vec::new()));
        let connected = events.clone();
        session.set_notify_connected(move |id, peer| connected.lock().push(("up", id, peer)));
        let disconnected = events.clone();
        session.set_notify_disconnected(move |id, peer| disconnected.lock().push(("down", id, peer)));

        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert!(session.add_client(a, scheduler.handle(), peer));
        assert!(!session.add_client(a, scheduler.handle(), peer));
        assert!(session.add_client(b, scheduler.handle(), peer));
        assert_eq!(session.client_count(), 2);

        let groups = session.clients_by_scheduler();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0.id(), 3);
        assert_eq!(groups[0].1.len(), 2);

        assert!(session.remove_client(a));
        assert!(!session.remove_client(a));
        let events = events.lock();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ("up", 9, peer));
        assert_eq!(events[2], ("down", 9, peer));
    }

    #[test]
    fn multicast_group_and_ports() {
        let session = MediaSession::new("live").with_source(MediaChannelId::Channel0, MediaSource::h264());
        assert!(!session.is_multicast());
        assert!(session.send_multicast(MediaChannelId::Channel0, &RtpPacket::new(vec![1u8], 0, crate::media::FrameType::VideoKey)).is_err());

        session.start_multicast().unwrap();
        let group = session.multicast_address().unwrap();
        assert_eq!(group.octets()[0], 232);
        let p0 = session.multicast_port(MediaChannelId::Channel0).unwrap();
        let p1 = session.multicast_port(MediaChannelId::Channel1).unwrap();
        assert_eq!(p0 % 2, 0);
        assert_ne!(p0, p1);

        session.start_multicast().unwrap();
        assert_eq!(session.multicast_address(), Some(group));
    }
}
