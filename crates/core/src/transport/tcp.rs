use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Result, RtspError};
use crate::net::{Channel, ChannelPtr, TaskScheduler};

const READ_CHUNK: usize = 4096;
/// Upper bound on bytes pulled from one socket per reactor pass, so one busy
/// peer cannot starve the rest of the scheduler.
const MAX_READ_PER_PASS: usize = 256 * 1024;

/// Bind a non-blocking listening socket with `SO_REUSEADDR`.
pub fn listen(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// Blocking connect with an optional deadline.
pub fn connect(addr: SocketAddr, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    match timeout {
        Some(timeout) => socket.connect_timeout(&addr.into(), timeout)?,
        None => socket.connect(&addr.into())?,
    }
    socket.set_nodelay(true)?;
    Ok(socket.into())
}

/// Outcome of draining a readable socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadStatus {
    pub bytes: usize,
    pub eof: bool,
}

/// A non-blocking TCP stream bound to one scheduler channel, with an
/// inbound byte buffer and a bounded outbound queue.
///
/// Writes that cannot complete immediately are queued and the channel gains
/// write interest until the queue drains.
pub struct TcpConnection {
    stream: TcpStream,
    channel: ChannelPtr,
    peer_addr: Option<SocketAddr>,
    read_buffer: BytesMut,
    write_queue: VecDeque<Bytes>,
    queued_bytes: usize,
    write_limit: usize,
    closed: bool,
}

impl TcpConnection {
    pub fn new(stream: TcpStream, write_limit: usize) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);
        let peer_addr = stream.peer_addr().ok();
        let channel = Rc::new(Channel::new(stream.as_raw_fd()));
        Ok(Self {
            stream,
            channel,
            peer_addr,
            read_buffer: BytesMut::with_capacity(READ_CHUNK),
            write_queue: VecDeque::new(),
            queued_bytes: 0,
            write_limit,
            closed: false,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn channel(&self) -> &ChannelPtr {
        &self.channel
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }

    pub fn read_buffer(&mut self) -> &mut BytesMut {
        &mut self.read_buffer
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Append everything currently readable to the read buffer.
    pub fn read_available(&mut self) -> io::Result<ReadStatus> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut status = ReadStatus {
            bytes: 0,
            eof: false,
        };
        while status.bytes < MAX_READ_PER_PASS {
            match (&self.stream).read(&mut chunk) {
                Ok(0) => {
                    status.eof = true;
                    break;
                }
                Ok(n) => {
                    self.read_buffer.extend_from_slice(&chunk[..n]);
                    status.bytes += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(status)
    }

    /// Queue `data` and try to flush. Fails with [`RtspError::Backpressure`]
    /// if the queue is already over its limit; the data is not queued then.
    pub fn send(&mut self, scheduler: &TaskScheduler, data: Bytes) -> Result<()> {
        if self.closed {
            return Err(RtspError::ConnectionClosed);
        }
        if !self.write_queue.is_empty() && self.queued_bytes + data.len() > self.write_limit {
            return Err(RtspError::Backpressure {
                queued: self.queued_bytes,
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        self.queued_bytes += data.len();
        self.write_queue.push_back(data);
        self.flush(scheduler)
    }

    /// Write as much of the queue as the socket accepts, then adjust write
    /// interest to match what is left.
    pub fn flush(&mut self, scheduler: &TaskScheduler) -> Result<()> {
        while let Some(front) = self.write_queue.front_mut() {
            match (&self.stream).write(front) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.queued_bytes -= n;
                    if n == front.len() {
                        self.write_queue.pop_front();
                    } else {
                        front.advance(n);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let want_write = !self.write_queue.is_empty();
        if want_write != self.channel.is_writing() {
            if want_write {
                self.channel.enable_writing();
            } else {
                self.channel.disable_writing();
            }
            scheduler.update_channel(&self.channel)?;
        }
        Ok(())
    }

    /// Unregister the channel and shut the socket down. Idempotent.
    pub fn close(&mut self, scheduler: &TaskScheduler) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.channel.disable_all();
        scheduler.remove_channel(&self.channel);
        self.write_queue.clear();
        self.queued_bytes = 0;
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("fd", &self.fd())
            .field("peer", &self.peer_addr)
            .field("queued", &self.queued_bytes)
            .field("closed", &self.closed)
            .finish()
    }
}
