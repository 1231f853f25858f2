use std::net::Ipv4Addr;

/// Client-requested transport from the RTSP `Transport` header
/// (RFC 2326 §12.39).
///
/// ## Wire format examples
///
/// ```text
/// Transport: RTP/AVP;unicast;client_port=8000-8001
/// Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// Transport: RTP/AVP;multicast;destination=232.0.1.2;port=5000-5001
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportHeader {
    /// RTP over UDP to the client's port pair.
    Udp {
        client_rtp_port: u16,
        client_rtcp_port: u16,
    },
    /// RTP interleaved on the RTSP TCP connection (RFC 2326 §10.12).
    Tcp { rtp_channel: u8, rtcp_channel: u8 },
    /// Client asks to join the session's multicast group.
    Multicast {
        destination: Option<Ipv4Addr>,
        port: Option<u16>,
    },
}

impl TransportHeader {
    /// Parse the `Transport` header value.
    ///
    /// Only the first transport spec of a comma-separated list is considered.
    /// Returns `None` when the profile is not RTP/AVP or required
    /// parameters are missing.
    ///
    /// ## Examples
    ///
    /// ```
    /// use rtsp::protocol::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(th, TransportHeader::Udp { client_rtp_port: 8000, client_rtcp_port: 8001 });
    ///
    /// let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=2-3").unwrap();
    /// assert_eq!(th, TransportHeader::Tcp { rtp_channel: 2, rtcp_channel: 3 });
    ///
    /// assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        let spec = header.split(',').next()?.trim();
        let mut parts = spec.split(';').map(str::trim);
        let profile = parts.next()?.to_ascii_uppercase();

        let tcp = match profile.as_str() {
            "RTP/AVP" | "RTP/AVP/UDP" => false,
            "RTP/AVP/TCP" => true,
            _ => return None,
        };

        let mut multicast = false;
        let mut client_port = None;
        let mut interleaved = None;
        let mut destination = None;
        let mut port = None;

        for part in parts {
            let (name, value) = match part.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim())),
                None => (part, None),
            };
            match (name.to_ascii_lowercase().as_str(), value) {
                ("multicast", None) => multicast = true,
                // A malformed pair rejects the header rather than defaulting.
                ("client_port", Some(v)) => client_port = Some(parse_pair::<u16>(v)?),
                ("interleaved", Some(v)) => interleaved = Some(parse_pair::<u8>(v)?),
                ("destination", Some(v)) => destination = Some(v.parse().ok()?),
                ("port", Some(v)) => port = Some(parse_pair::<u16>(v)?.0),
                _ => {}
            }
        }

        if tcp {
            // Channels default to 0-1 when the client omits them.
            let (rtp_channel, rtcp_channel) = interleaved.unwrap_or((0, 1));
            return Some(TransportHeader::Tcp {
                rtp_channel,
                rtcp_channel,
            });
        }
        if multicast {
            return Some(TransportHeader::Multicast { destination, port });
        }
        let (client_rtp_port, client_rtcp_port) = client_port?;
        Some(TransportHeader::Udp {
            client_rtp_port,
            client_rtcp_port,
        })
    }
}

/// `a-b` or a lone `a` (the second value then follows the first).
fn parse_pair<T>(value: &str) -> Option<(T, T)>
where
    T: std::str::FromStr + Copy + TryFrom<u32> + Into<u32>,
{
    match value.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let a: T = value.trim().parse().ok()?;
            let b = T::try_from(a.into() + 1).ok()?;
            Some((a, b))
        }
    }
}
