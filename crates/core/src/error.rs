//! Error types for the RTSP reactor library.

use std::fmt;

/// Errors that can occur in the RTSP reactor library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Transport**: [`Io`](Self::Io), [`ConnectionClosed`](Self::ConnectionClosed),
///   [`Backpressure`](Self::Backpressure).
/// - **Reactor**: [`PollerCapacity`](Self::PollerCapacity),
///   [`TriggerQueueFull`](Self::TriggerQueueFull).
/// - **Protocol**: [`Parse`](Self::Parse), [`MessageTooLarge`](Self::MessageTooLarge),
///   [`InvalidUrl`](Self::InvalidUrl).
/// - **Session**: [`MediaSessionNotFound`](Self::MediaSessionNotFound),
///   [`ChannelNotSetup`](Self::ChannelNotSetup).
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The poller cannot watch this descriptor (select's `FD_SETSIZE` ceiling).
    #[error("poller capacity exceeded: fd {fd} is outside the limit of {limit}")]
    PollerCapacity { fd: i32, limit: usize },

    /// The scheduler's trigger mailbox is full; the caller should drop or defer.
    #[error("trigger queue is full ({capacity} pending events)")]
    TriggerQueueFull { capacity: usize },

    /// Failed to parse an RTSP message (RFC 2326 §6/§7).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// A serialized message exceeded the configured size limit.
    #[error("RTSP message of {size} bytes exceeds the limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    /// The URL is not of the form `rtsp://host[:port]/suffix`.
    #[error("invalid RTSP url: {0}")]
    InvalidUrl(String),

    /// No media session with the given id or suffix is registered.
    #[error("media session not found: {0}")]
    MediaSessionNotFound(String),

    /// SETUP has not been completed for this media channel.
    #[error("media channel {0} is not set up")]
    ChannelNotSetup(usize),

    /// The connection has already been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The outbound queue of a connection is over its limit.
    #[error("write queue over limit ({queued} bytes queued)")]
    Backpressure { queued: usize },

    /// [`RtspServer::start`](crate::RtspServer::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`RtspServer::start`](crate::RtspServer::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

/// Specific kind of RTSP parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Request line did not have the expected `Method URI RTSP/x.y` format.
    InvalidRequestLine,
    /// Status line did not have the expected `RTSP/x.y Code Reason` format.
    InvalidStatusLine,
    /// A line grew beyond the maximum message size without a CRLF.
    LineTooLong,
    /// `Content-Length` was present but not a number.
    InvalidContentLength,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::LineTooLong => write!(f, "line too long"),
            Self::InvalidContentLength => write!(f, "invalid content length"),
        }
    }
}

impl RtspError {
    pub(crate) fn parse(kind: ParseErrorKind) -> Self {
        RtspError::Parse { kind }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
