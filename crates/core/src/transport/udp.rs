use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::ops::RangeInclusive;

use socket2::{Domain, Protocol, Socket, Type};

/// Attempts at finding a free even/odd port pair before giving up.
const BIND_ATTEMPTS: usize = 10;
const SEND_BUFFER_SIZE: usize = 512 * 1024;

/// Bind one non-blocking UDP socket. Port 0 picks an ephemeral port.
pub fn bind(ip: IpAddr, port: u16) -> io::Result<UdpSocket> {
    let addr = SocketAddr::new(ip, port);
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    let _ = socket.set_send_buffer_size(SEND_BUFFER_SIZE);
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Socket configured for sending to a multicast group.
pub fn multicast_sender(ttl: u32) -> io::Result<UdpSocket> {
    let socket = bind(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)?;
    socket.set_multicast_ttl_v4(ttl)?;
    Ok(socket)
}

/// An RTP socket on an even port and its RTCP companion on the next port
/// (RFC 3550 §11).
#[derive(Debug)]
pub struct RtpSocketPair {
    pub rtp: UdpSocket,
    pub rtcp: UdpSocket,
    pub rtp_port: u16,
    pub rtcp_port: u16,
}

impl RtpSocketPair {
    /// Bind a pair on a random even port within `range`.
    pub fn bind_in_range(ip: IpAddr, range: &RangeInclusive<u16>) -> io::Result<Self> {
        let low = (*range.start()).max(2);
        let high = (*range.end()).saturating_sub(1);
        if low > high {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "RTP port range too small",
            ));
        }

        let mut last_err = None;
        for _ in 0..BIND_ATTEMPTS {
            let rtp_port = rand::random_range(low..=high) & !1;
            if rtp_port < low {
                continue;
            }
            let rtp = match bind(ip, rtp_port) {
                Ok(socket) => socket,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            match bind(ip, rtp_port + 1) {
                Ok(rtcp) => {
                    return Ok(Self {
                        rtp,
                        rtcp,
                        rtp_port,
                        rtcp_port: rtp_port + 1,
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrInUse, "no free RTP port pair")
        }))
    }
}
