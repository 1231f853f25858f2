//! Integration tests: real sockets against a running [`RtspServer`], and an
//! [`RtspPusher`] against a scripted server.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rtsp::protocol::{DigestAuthentication, DigestChallenge, DigestCredentials};
use rtsp::{
    AuthConfig, EventLoop, FrameType, MediaChannelId, MediaSession, MediaSessionId, MediaSource,
    PusherConfig, RtpPacket, RtspPusher, RtspServer, ServerConfig,
};

fn rtsp_request(stream: &mut TcpStream, request: &str) -> std::io::Result<String> {
    stream.write_all(request.as_bytes())?;
    stream.flush()?;
    read_response(stream)
}

/// Read one response, including its `Content-Length` body.
fn read_response(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut response = String::new();
    loop {
        let line = read_line(stream)?;
        if line.is_empty() {
            break;
        }
        response.push_str(&line);
        if line == "\r\n" {
            break;
        }
    }

    if let Some(len) = header(&response, "Content-Length").and_then(|v| v.parse::<usize>().ok()) {
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body)?;
        response.push_str(&String::from_utf8_lossy(&body));
    }
    Ok(response)
}

/// Byte-at-a-time so nothing after the response is consumed.
fn read_line(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while !line.ends_with(b"\n") {
        if stream.read(&mut byte)? == 0 {
            break;
        }
        line.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    response.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

fn session_header(response: &str) -> String {
    header(response, "Session")
        .and_then(|v| v.split(';').next())
        .expect("Session header")
        .to_string()
}

struct TestServer {
    server: RtspServer,
    addr: SocketAddr,
    session: MediaSessionId,
}

impl TestServer {
    fn start(config: ServerConfig) -> Self {
        let event_loop = Arc::new(EventLoop::new(2).expect("event loop"));
        let server = RtspServer::new(event_loop, config);
        let session = server.add_session(
            MediaSession::new("stream")
                .with_source(MediaChannelId::Channel0, MediaSource::h264())
                .with_source(MediaChannelId::Channel1, MediaSource::aac(44100, 2)),
        );
        let addr = server.start("127.0.0.1", 0).expect("server start");
        TestServer {
            server,
            addr,
            session,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect_timeout(&self.addr, Duration::from_secs(2))
            .expect("connect to server");
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
    }

    fn url(&self) -> String {
        format!("rtsp://{}/stream", self.addr)
    }
}

#[test]
fn options_round_trip() {
    let srv = TestServer::start(ServerConfig::default());
    let mut stream = srv.connect();

    let resp = rtsp_request(
        &mut stream,
        &format!("OPTIONS {} RTSP/1.0\r\nCSeq: 1\r\n\r\n", srv.url()),
    )
    .expect("OPTIONS response");
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "got: {resp}");
    assert_eq!(header(&resp, "CSeq"), Some("1"));
    let public = header(&resp, "Public").expect("Public header");
    for method in ["OPTIONS", "DESCRIBE", "SETUP", "PLAY", "TEARDOWN"] {
        assert!(public.contains(method), "Public lacks {method}: {public}");
    }
}

#[test]
fn describe_setup_play_teardown_over_udp() {
    let srv = TestServer::start(ServerConfig::default());
    let mut stream = srv.connect();
    let url = srv.url();

    let resp = rtsp_request(
        &mut stream,
        &format!("DESCRIBE {url} RTSP/1.0\r\nCSeq: 2\r\nAccept: application/sdp\r\n\r\n"),
    )
    .unwrap();
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "got: {resp}");
    assert_eq!(header(&resp, "Content-Type"), Some("application/sdp"));
    assert!(resp.contains("m=video 0 RTP/AVP 96"));
    assert!(resp.contains("m=audio 0 RTP/AVP 97"));
    assert!(resp.contains("a=control:track1"));

    let rtp = UdpSocket::bind("127.0.0.1:0").unwrap();
    let rtcp = UdpSocket::bind("127.0.0.1:0").unwrap();
    rtp.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let client_rtp = rtp.local_addr().unwrap().port();
    let client_rtcp = rtcp.local_addr().unwrap().port();

    let resp = rtsp_request(
        &mut stream,
        &format!(
            "SETUP {url}/track0 RTSP/1.0\r\nCSeq: 3\r\n\
             Transport: RTP/AVP;unicast;client_port={client_rtp}-{client_rtcp}\r\n\r\n"
        ),
    )
    .unwrap();
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "got: {resp}");
    let transport = header(&resp, "Transport").unwrap();
    assert!(transport.contains(&format!("client_port={client_rtp}-{client_rtcp}")));
    let server_ports = transport
        .split(';')
        .find_map(|p| p.strip_prefix("server_port="))
        .expect("server_port");
    let (server_rtp, server_rtcp) = server_ports.split_once('-').unwrap();
    let server_rtp: u16 = server_rtp.parse().unwrap();
    let server_rtcp: u16 = server_rtcp.parse().unwrap();
    assert_eq!(server_rtp % 2, 0);
    assert_eq!(server_rtcp, server_rtp + 1);
    let session = session_header(&resp);

    let resp = rtsp_request(
        &mut stream,
        &format!("PLAY {url} RTSP/1.0\r\nCSeq: 4\r\nSession: {session}\r\n\r\n"),
    )
    .unwrap();
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "got: {resp}");
    assert!(header(&resp, "RTP-Info").unwrap().contains("/track0;seq="));

    // Predicted frames are held back until a key frame arrives.
    assert!(srv.server.push_frame(
        srv.session,
        MediaChannelId::Channel0,
        RtpPacket::new(vec![0xee; 8], 1000, FrameType::Video),
    ));
    assert!(srv.server.push_frame(
        srv.session,
        MediaChannelId::Channel0,
        RtpPacket::new(vec![0x65; 20], 3000, FrameType::VideoKey).with_marker(true),
    ));

    let mut buf = [0u8; 1500];
    let (n, from) = rtp.recv_from(&mut buf).expect("RTP datagram");
    assert_eq!(from.port(), server_rtp);
    assert_eq!(n, 12 + 20);
    assert_eq!(buf[0], 0x80);
    assert_eq!(buf[1], 0x80 | 96);
    assert_eq!(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]), 3000);
    assert_eq!(&buf[12..n], &[0x65; 20]);

    // RTCP from the client is accepted on the server's odd port.
    rtcp.send_to(&[0x80, 0xc9, 0, 1, 0, 0, 0, 0], ("127.0.0.1", server_rtcp))
        .unwrap();

    let resp = rtsp_request(
        &mut stream,
        &format!("TEARDOWN {url} RTSP/1.0\r\nCSeq: 5\r\nSession: {session}\r\n\r\n"),
    )
    .unwrap();
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "got: {resp}");
    assert_eq!(header(&resp, "CSeq"), Some("5"));

    // Torn down: nothing is delivered any more.
    srv.server.push_frame(
        srv.session,
        MediaChannelId::Channel0,
        RtpPacket::new(vec![0x65; 20], 6000, FrameType::VideoKey),
    );
    rtp.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    assert!(rtp.recv_from(&mut buf).is_err());
}

#[test]
fn tcp_interleaved_sequence_numbers_increase() {
    let srv = TestServer::start(ServerConfig::default());
    let mut stream = srv.connect();
    let url = srv.url();

    let resp = rtsp_request(
        &mut stream,
        &format!(
            "SETUP {url}/track1 RTSP/1.0\r\nCSeq: 1\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=2-3\r\n\r\n"
        ),
    )
    .unwrap();
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "got: {resp}");
    assert_eq!(
        header(&resp, "Transport"),
        Some("RTP/AVP/TCP;unicast;interleaved=2-3")
    );
    let session = session_header(&resp);

    let resp = rtsp_request(
        &mut stream,
        &format!("PLAY {url} RTSP/1.0\r\nCSeq: 2\r\nSession: {session}\r\n\r\n"),
    )
    .unwrap();
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "got: {resp}");

    for i in 0..3u32 {
        assert!(srv.server.push_frame(
            srv.session,
            MediaChannelId::Channel1,
            RtpPacket::new(vec![i as u8; 10], i * 1024, FrameType::Audio),
        ));
    }

    let mut last_seq: Option<u16> = None;
    for i in 0..3u8 {
        let mut prefix = [0u8; 4];
        stream.read_exact(&mut prefix).unwrap();
        assert_eq!(prefix[0], b'$');
        assert_eq!(prefix[1], 2);
        let len = u16::from_be_bytes([prefix[2], prefix[3]]) as usize;
        assert_eq!(len, 12 + 10);
        let mut packet = vec![0u8; len];
        stream.read_exact(&mut packet).unwrap();
        assert_eq!(packet[1] & 0x7f, 97);
        assert_eq!(&packet[12..], &[i; 10]);

        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        if let Some(last) = last_seq {
            assert_eq!(seq, last.wrapping_add(1));
        }
        last_seq = Some(seq);
    }
}

#[test]
fn unauthorized_then_digest_succeeds() {
    let auth = AuthConfig {
        realm: "test-realm".to_string(),
        username: "admin".to_string(),
        password: "secret".to_string(),
    };
    let srv = TestServer::start(ServerConfig {
        auth: Some(auth.clone()),
        ..Default::default()
    });
    let mut stream = srv.connect();
    let url = srv.url();

    let resp = rtsp_request(
        &mut stream,
        &format!("DESCRIBE {url} RTSP/1.0\r\nCSeq: 1\r\n\r\n"),
    )
    .unwrap();
    assert!(resp.starts_with("RTSP/1.0 401 Unauthorized"), "got: {resp}");
    let www = header(&resp, "WWW-Authenticate").expect("challenge");
    assert!(www.starts_with("Digest realm=\"test-realm\", nonce=\""));
    let challenge = DigestChallenge::parse(www).unwrap();

    let client = DigestAuthentication::new(&auth.realm, &auth.username, &auth.password);
    let authorization = client.authorization(&challenge, "DESCRIBE", &url);
    let credentials = DigestCredentials::parse(&authorization).unwrap();
    assert_eq!(
        credentials.response,
        client.get_response(&challenge.nonce, "DESCRIBE", &url)
    );

    let resp = rtsp_request(
        &mut stream,
        &format!("DESCRIBE {url} RTSP/1.0\r\nCSeq: 2\r\nAuthorization: {authorization}\r\n\r\n"),
    )
    .unwrap();
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "got: {resp}");
    assert!(resp.contains("v=0"));
}

#[test]
fn pipelined_requests_answered_in_order() {
    let srv = TestServer::start(ServerConfig::default());
    let mut stream = srv.connect();
    let url = srv.url();

    let batch = format!(
        "OPTIONS {url} RTSP/1.0\r\nCSeq: 1\r\n\r\n\
         GET_PARAMETER {url} RTSP/1.0\r\nCSeq: 2\r\n\r\n\
         DESCRIBE {url}/missing RTSP/1.0\r\nCSeq: 3\r\n\r\n\
         OPTIONS {url} RTSP/1.0\r\nCSeq: 4\r\n\r\n"
    );
    stream.write_all(batch.as_bytes()).unwrap();

    let expected = [(1, "200"), (2, "200"), (3, "404"), (4, "200")];
    for (cseq, status) in expected {
        let resp = read_response(&mut stream).unwrap();
        assert!(
            resp.starts_with(&format!("RTSP/1.0 {status}")),
            "CSeq {cseq}: got {resp}"
        );
        assert_eq!(header(&resp, "CSeq"), Some(cseq.to_string().as_str()));
    }
}

#[test]
fn request_split_across_writes() {
    let srv = TestServer::start(ServerConfig::default());
    let mut stream = srv.connect();

    let request = format!("OPTIONS {} RTSP/1.0\r\nCSeq: 9\r\nUser-Agent: test\r\n\r\n", srv.url());
    for chunk in request.as_bytes().chunks(5) {
        stream.write_all(chunk).unwrap();
        thread::sleep(Duration::from_millis(2));
    }
    let resp = read_response(&mut stream).unwrap();
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "got: {resp}");
    assert_eq!(header(&resp, "CSeq"), Some("9"));
}

#[test]
fn unknown_headers_are_ignored() {
    let srv = TestServer::start(ServerConfig::default());
    let mut stream = srv.connect();

    let resp = rtsp_request(
        &mut stream,
        &format!(
            "OPTIONS {} RTSP/1.0\r\nCSeq: 7\r\nX-Custom: foo\r\nnot a header\r\n\r\n",
            srv.url()
        ),
    )
    .unwrap();
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "got: {resp}");
    assert_eq!(header(&resp, "CSeq"), Some("7"));
}

#[test]
fn multicast_session_setup() {
    let srv = TestServer::start(ServerConfig::default());
    let session = srv.server.session(srv.session).unwrap();
    session.start_multicast().unwrap();
    let group = session.multicast_address().unwrap();
    let port = session.multicast_port(MediaChannelId::Channel0).unwrap();

    let mut stream = srv.connect();
    let url = srv.url();

    let resp = rtsp_request(
        &mut stream,
        &format!("SETUP {url}/track0 RTSP/1.0\r\nCSeq: 1\r\nTransport: RTP/AVP;unicast;client_port=6000-6001\r\n\r\n"),
    )
    .unwrap();
    assert!(resp.starts_with("RTSP/1.0 461"), "got: {resp}");

    let resp = rtsp_request(
        &mut stream,
        &format!("SETUP {url}/track0 RTSP/1.0\r\nCSeq: 2\r\nTransport: RTP/AVP;multicast\r\n\r\n"),
    )
    .unwrap();
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "got: {resp}");
    let transport = header(&resp, "Transport").unwrap();
    assert!(transport.contains(&format!("destination={group}")));
    assert!(transport.contains(&format!("port={}-{}", port, port + 1)));
    assert!(transport.contains("ttl=255"));
}

/// Read one request head and body from a scripted peer.
fn read_request(reader: &mut BufReader<TcpStream>) -> Option<(String, String)> {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 {
            return None;
        }
        head.push_str(&line);
        if line == "\r\n" {
            break;
        }
    }
    let len = header(&head, "Content-Length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).ok()?;
    Some((head, String::from_utf8_lossy(&body).into_owned()))
}

#[test]
fn pusher_announces_and_records_with_digest() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server_auth = DigestAuthentication::new("mock", "pub", "pw");

    let mock = thread::spawn(move || {
        let (socket, _) = listener.accept().unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut writer = socket.try_clone().unwrap();
        let mut reader = BufReader::new(socket);
        let mut methods = Vec::new();
        let mut announced_sdp = String::new();

        while let Some((head, body)) = read_request(&mut reader) {
            let method = head.split(' ').next().unwrap_or_default().to_string();
            let cseq = header(&head, "CSeq").unwrap_or("0").to_string();
            methods.push(method.clone());

            let authorized = header(&head, "Authorization")
                .and_then(DigestCredentials::parse)
                .is_some_and(|c| server_auth.verify(&c, &method, "n0nce"));
            let reply = if method == "OPTIONS" {
                format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nPublic: ANNOUNCE, SETUP, RECORD\r\n\r\n")
            } else if !authorized {
                format!(
                    "RTSP/1.0 401 Unauthorized\r\nCSeq: {cseq}\r\n\
                     WWW-Authenticate: Digest realm=\"mock\", nonce=\"n0nce\"\r\n\r\n"
                )
            } else {
                match method.as_str() {
                    "ANNOUNCE" => {
                        announced_sdp = body;
                        format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n\r\n")
                    }
                    "SETUP" => {
                        assert!(head.contains("interleaved=0-1"), "{head}");
                        assert!(head.contains("mode=record"), "{head}");
                        format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nSession: 4242;timeout=60\r\n\r\n")
                    }
                    "RECORD" => {
                        assert_eq!(header(&head, "Session"), Some("4242"));
                        writer
                            .write_all(format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n\r\n").as_bytes())
                            .unwrap();
                        break;
                    }
                    _ => format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n\r\n"),
                }
            };
            writer.write_all(reply.as_bytes()).unwrap();
        }

        let mut prefix = [0u8; 4];
        reader.read_exact(&mut prefix).unwrap();
        let len = u16::from_be_bytes([prefix[2], prefix[3]]) as usize;
        let mut packet = vec![0u8; len];
        reader.read_exact(&mut packet).unwrap();
        (methods, announced_sdp, prefix[1], packet)
    });

    let event_loop = Arc::new(EventLoop::new(1).unwrap());
    let pusher = RtspPusher::new(
        event_loop,
        PusherConfig {
            auth: Some(AuthConfig {
                realm: "mock".to_string(),
                username: "pub".to_string(),
                password: "pw".to_string(),
            }),
            ..Default::default()
        },
    );
    pusher.add_session(
        MediaSession::new("push").with_source(MediaChannelId::Channel0, MediaSource::h264()),
    );
    pusher
        .open_url(&format!("rtsp://{addr}/push"), Duration::from_secs(5))
        .expect("push setup");
    assert!(pusher.is_recording());

    assert!(pusher.push_frame(
        MediaChannelId::Channel0,
        RtpPacket::new(vec![0x65; 30], 9000, FrameType::VideoKey),
    ));

    let (methods, sdp, channel, packet) = mock.join().unwrap();
    assert_eq!(
        methods,
        ["OPTIONS", "ANNOUNCE", "ANNOUNCE", "SETUP", "RECORD"]
    );
    assert!(sdp.contains("m=video 0 RTP/AVP 96"), "{sdp}");
    assert_eq!(channel, 0);
    assert_eq!(packet.len(), 12 + 30);
    assert_eq!(&packet[12..], &[0x65; 30]);

    pusher.close();
    assert!(!pusher.is_connected());
}

#[test]
fn pusher_gives_up_on_rejection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let mock = thread::spawn(move || {
        let (socket, _) = listener.accept().unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut writer = socket.try_clone().unwrap();
        let mut reader = BufReader::new(socket);
        if let Some((head, _)) = read_request(&mut reader) {
            let cseq = header(&head, "CSeq").unwrap_or("0").to_string();
            let _ = writer.write_all(format!("RTSP/1.0 403 Forbidden\r\nCSeq: {cseq}\r\n\r\n").as_bytes());
        }
        // Wait for the pusher to hang up.
        let mut rest = Vec::new();
        let _ = reader.read_to_end(&mut rest);
    });

    let event_loop = Arc::new(EventLoop::new(1).unwrap());
    let pusher = RtspPusher::new(event_loop, PusherConfig::default());
    pusher.add_session(
        MediaSession::new("push").with_source(MediaChannelId::Channel0, MediaSource::h264()),
    );
    let result = pusher.open_url(&format!("rtsp://{addr}/push"), Duration::from_secs(5));
    assert!(matches!(result, Err(rtsp::RtspError::ConnectionClosed)), "{result:?}");
    assert!(!pusher.is_recording());
    mock.join().unwrap();
}
