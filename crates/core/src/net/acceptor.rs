use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel;
use parking_lot::Mutex;

use super::{Channel, ChannelPtr, SchedulerHandle, TaskScheduler};
use crate::error::{Result, RtspError};
use crate::transport::tcp;

const LISTEN_BACKLOG: i32 = 1024;
const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause after an accept failure such as EMFILE before polling the listener again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(200);

/// Called on the acceptor's scheduler thread for every accepted stream.
pub type NewConnectionCallback = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

/// Listener channels taken out of the poller while accepting backs off.
#[derive(Default)]
struct PausedListeners(RefCell<HashMap<RawFd, ChannelPtr>>);

#[derive(Debug, Clone, Copy)]
struct Listening {
    fd: RawFd,
    local_addr: SocketAddr,
}

/// Listening socket driven by one scheduler.
///
/// Accepted streams are handed to the callback non-blocking; the callback
/// decides which scheduler owns the new connection.
pub struct Acceptor {
    scheduler: SchedulerHandle,
    callback: NewConnectionCallback,
    listening: Mutex<Option<Listening>>,
}

impl Acceptor {
    pub fn new<F>(scheduler: SchedulerHandle, callback: F) -> Self
    where
        F: Fn(TcpStream, SocketAddr) + Send + Sync + 'static,
    {
        Self {
            scheduler,
            callback: Arc::new(callback),
            listening: Mutex::new(None),
        }
    }

    /// Bind, listen and register the socket with the scheduler.
    /// Returns the listening descriptor.
    ///
    /// Blocks until the scheduler has registered the listener, so it must
    /// not be called from that scheduler's own thread. A registration
    /// failure (e.g. [`RtspError::PollerCapacity`]) is returned and the
    /// socket is closed.
    pub fn listen(&self, ip: &str, port: u16) -> Result<RawFd> {
        let mut listening = self.listening.lock();
        if listening.is_some() {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "acceptor already listening").into());
        }

        let addr = (ip, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("cannot resolve {ip}"))
        })?;
        let listener = tcp::listen(addr, LISTEN_BACKLOG)?;
        let fd = listener.as_raw_fd();
        let local_addr = listener.local_addr()?;

        let (reply_tx, reply_rx) = channel::bounded::<Result<()>>(1);
        let callback = Arc::clone(&self.callback);
        self.scheduler.add_trigger_event(move |sched| {
            let channel = Rc::new(Channel::new(fd));
            let weak = Rc::downgrade(&channel);
            channel.set_read_callback(move |sched| accept_pending(sched, &weak, &listener, &callback));
            channel.enable_reading();
            // On failure the channel, and the listener it owns, is dropped here.
            let _ = reply_tx.send(sched.update_channel(&channel));
        })?;

        match reply_rx.recv_timeout(REGISTER_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(%local_addr, error = %e, "failed to register listener");
                return Err(e);
            }
            Err(_) => {
                tracing::error!(%local_addr, "scheduler did not register listener");
                return Err(RtspError::NotStarted);
            }
        }

        tracing::info!(%local_addr, "listening");
        *listening = Some(Listening { fd, local_addr });
        Ok(fd)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listening.lock().map(|l| l.local_addr)
    }

    /// Stop accepting and release the socket. Idempotent.
    pub fn close(&self) {
        let Some(listening) = self.listening.lock().take() else {
            return;
        };
        // The listener lives in the channel's callback; removing the channel
        // on its own thread closes it.
        let result = self.scheduler.add_trigger_event(move |sched| {
            if let Some(channel) = sched.channel(listening.fd) {
                sched.remove_channel(&channel);
            }
            let paused = sched.local::<PausedListeners>().0.borrow_mut().remove(&listening.fd);
            drop(paused);
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, "could not post listener removal");
        }
        tracing::info!(local_addr = %listening.local_addr, "listener closed");
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_pending(
    sched: &TaskScheduler,
    channel: &Weak<Channel>,
    listener: &TcpListener,
    callback: &NewConnectionCallback,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    tracing::warn!(%peer, error = %e, "dropping accepted stream");
                    continue;
                }
                tracing::debug!(%peer, "accepted");
                callback(stream, peer);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, backoff = ?ACCEPT_BACKOFF, "accept failed");
                if let Some(channel) = channel.upgrade() {
                    pause_listener(sched, channel);
                }
                break;
            }
        }
    }
}

/// Take a level-triggered listener out of the poller until the backoff
/// timer puts it back, so a persistent accept error does not spin the loop.
fn pause_listener(sched: &TaskScheduler, channel: ChannelPtr) {
    let fd = channel.fd();
    sched
        .local::<PausedListeners>()
        .0
        .borrow_mut()
        .insert(fd, Rc::clone(&channel));
    channel.disable_reading();
    if let Err(e) = sched.update_channel(&channel) {
        tracing::warn!(fd, error = %e, "failed to pause listener");
    }

    sched.add_timer(ACCEPT_BACKOFF, move |sched| {
        let resumed = sched.local::<PausedListeners>().0.borrow_mut().remove(&fd);
        // Absent when the acceptor was closed meanwhile.
        if let Some(channel) = resumed {
            channel.enable_reading();
            if let Err(e) = sched.update_channel(&channel) {
                tracing::error!(fd, error = %e, "failed to resume listener");
            }
        }
        false
    });
}
