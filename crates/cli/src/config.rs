//! Command-line flags and the optional TOML configuration file.
//!
//! Flags override values from the file; anything set in neither falls back
//! to the library defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use serde::Deserialize;

use rtsp::{AuthConfig, EventLoopConfig, MediaChannelId, MediaSession, MediaSource, PollerKind, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "rtsp-server", version, about = "Standalone reactor-based RTSP server")]
pub struct Args {
    /// TOML configuration file
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Bind address (host:port) [default: 0.0.0.0:8554]
    #[arg(long, short)]
    pub bind: Option<String>,

    /// Scheduler threads [default: 1]
    #[arg(long, short)]
    pub threads: Option<usize>,

    /// Readiness back-end: epoll or select
    #[arg(long)]
    pub poller: Option<PollerKind>,

    /// Host advertised in SDP instead of the connection's local address
    #[arg(long)]
    pub public_host: Option<String>,

    /// Stream path to serve as H.264 video (repeatable) [default: live]
    #[arg(long = "stream", short = 's')]
    pub streams: Vec<String>,

    /// Deliver the streams given with --stream over multicast
    #[arg(long)]
    pub multicast: bool,

    /// Digest realm
    #[arg(long, requires = "username")]
    pub realm: Option<String>,

    /// Require digest authentication with this user name
    #[arg(long, requires = "password")]
    pub username: Option<String>,

    #[arg(long, requires = "username")]
    pub password: Option<String>,

    /// Session timeout in seconds
    #[arg(long)]
    pub session_timeout: Option<u64>,

    #[arg(long)]
    pub max_connections: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Pcma,
    Pcmu,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_realm")]
    pub realm: String,
    pub username: String,
    pub password: String,
}

fn default_realm() -> String {
    "rtsp-reactor".to_string()
}

/// One `[[streams]]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    /// URL path, e.g. `live` for `rtsp://host:8554/live`.
    pub name: String,
    #[serde(default = "default_video")]
    pub video: Option<VideoCodec>,
    pub audio: Option<AudioCodec>,
    #[serde(default = "default_audio_rate")]
    pub audio_rate: u32,
    #[serde(default = "default_audio_channels")]
    pub audio_channels: u8,
    #[serde(default)]
    pub multicast: bool,
    /// UDP address to receive RTP for this stream on.
    pub ingest: Option<SocketAddr>,
}

fn default_video() -> Option<VideoCodec> {
    Some(VideoCodec::H264)
}

fn default_audio_rate() -> u32 {
    44100
}

fn default_audio_channels() -> u8 {
    2
}

impl StreamConfig {
    fn h264(name: &str, multicast: bool) -> Self {
        Self {
            name: name.to_string(),
            video: default_video(),
            audio: None,
            audio_rate: default_audio_rate(),
            audio_channels: default_audio_channels(),
            multicast,
            ingest: None,
        }
    }

    pub fn media_session(&self) -> MediaSession {
        let session = MediaSession::new(&self.name);
        match self.video {
            Some(VideoCodec::H264) => session.add_source(MediaChannelId::Channel0, MediaSource::h264()),
            Some(VideoCodec::H265) => session.add_source(MediaChannelId::Channel0, MediaSource::h265()),
            None => {}
        }
        let audio = match self.audio {
            Some(AudioCodec::Aac) => Some(MediaSource::aac(self.audio_rate, self.audio_channels)),
            Some(AudioCodec::Pcma) => Some(MediaSource::g711a()),
            Some(AudioCodec::Pcmu) => Some(MediaSource::g711u()),
            None => None,
        };
        if let Some(audio) = audio {
            session.add_source(MediaChannelId::Channel1, audio);
        }
        session
    }
}

/// Contents of the TOML file. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub bind: Option<String>,
    pub threads: Option<usize>,
    pub poller: Option<String>,
    pub public_host: Option<String>,
    pub session_timeout_secs: Option<u64>,
    pub alive_check_secs: Option<u64>,
    pub max_connections: Option<usize>,
    pub rtp_port_min: Option<u16>,
    pub rtp_port_max: Option<u16>,
    pub auth: Option<AuthSection>,
    pub streams: Vec<StreamConfig>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Effective settings after merging flags over the file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub event_loop: EventLoopConfig,
    pub server: ServerConfig,
    pub streams: Vec<StreamConfig>,
}

impl Settings {
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };
        Self::merge(args, file)
    }

    pub fn merge(args: &Args, file: FileConfig) -> anyhow::Result<Self> {
        let bind = args
            .bind
            .clone()
            .or(file.bind)
            .unwrap_or_else(|| "0.0.0.0:8554".to_string());
        let (host, port) = bind
            .rsplit_once(':')
            .with_context(|| format!("bind address '{bind}' lacks a port"))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid port in '{bind}'"))?;

        let poller = match (args.poller, file.poller) {
            (Some(poller), _) => poller,
            (None, Some(name)) => name.parse::<PollerKind>().map_err(anyhow::Error::msg)?,
            (None, None) => PollerKind::default(),
        };
        let event_loop = EventLoopConfig {
            num_threads: args.threads.or(file.threads).unwrap_or(1),
            poller,
            ..EventLoopConfig::default()
        };

        let mut server = ServerConfig {
            public_host: args.public_host.clone().or(file.public_host),
            max_connections: args.max_connections.or(file.max_connections),
            ..ServerConfig::default()
        };
        if let Some(secs) = args.session_timeout.or(file.session_timeout_secs) {
            server.session_timeout = Duration::from_secs(secs);
            server.alive_check_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.alive_check_secs {
            server.alive_check_interval = Duration::from_secs(secs);
        }
        let port_min = file.rtp_port_min.unwrap_or(*server.rtp_port_range.start());
        let port_max = file.rtp_port_max.unwrap_or(*server.rtp_port_range.end());
        if port_max <= port_min {
            bail!("rtp port range {port_min}-{port_max} is empty");
        }
        server.rtp_port_range = port_min..=port_max;

        server.auth = match (&args.username, &args.password, file.auth) {
            (Some(username), Some(password), file_auth) => Some(AuthConfig {
                realm: args
                    .realm
                    .clone()
                    .or(file_auth.map(|a| a.realm))
                    .unwrap_or_else(default_realm),
                username: username.clone(),
                password: password.clone(),
            }),
            (_, _, Some(section)) => Some(AuthConfig {
                realm: section.realm,
                username: section.username,
                password: section.password,
            }),
            _ => None,
        };

        let mut streams: Vec<StreamConfig> = args
            .streams
            .iter()
            .map(|name| StreamConfig::h264(name, args.multicast))
            .collect();
        if streams.is_empty() {
            streams = file.streams;
        }
        if streams.is_empty() {
            streams.push(StreamConfig::h264("live", args.multicast));
        }

        Ok(Settings {
            host: host.to_string(),
            port,
            event_loop,
            server,
            streams,
        })
    }
}
