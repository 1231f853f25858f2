use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::error::Result;
use crate::net::EventMask;

const MAX_EVENTS: usize = 512;

/// Level-triggered epoll back-end. Unbounded descriptor count.
#[derive(Debug)]
pub struct EpollPoller {
    epfd: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl EpollPoller {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: Vec::with_capacity(MAX_EVENTS),
        })
    }

    pub fn add(&mut self, fd: RawFd, events: EventMask) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub fn modify(&mut self, fd: RawFd, events: EventMask) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn delete(&mut self, fd: RawFd) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, EventMask::NONE)
    }

    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, EventMask)>> {
        let timeout_ms = match timeout {
            // Round up so a sub-millisecond timer does not spin.
            Some(d) => d.as_micros().div_ceil(1000).min(i32::MAX as u128) as i32,
            None => -1,
        };

        let n = loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd.as_raw_fd(),
                    self.events.as_mut_ptr(),
                    MAX_EVENTS as i32,
                    timeout_ms,
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        };
        unsafe { self.events.set_len(n) };

        Ok(self
            .events
            .iter()
            .map(|ev| {
                let bits = ev.events;
                let data = ev.u64;
                (data as RawFd, from_epoll(bits))
            })
            .collect())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: EventMask) -> Result<()> {
        let mut event = libc::epoll_event {
            events: to_epoll(events),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

fn to_epoll(events: EventMask) -> u32 {
    let mut bits = 0u32;
    if events.contains(EventMask::READ) {
        bits |= libc::EPOLLIN as u32;
    }
    if events.contains(EventMask::PRI) {
        bits |= libc::EPOLLPRI as u32;
    }
    if events.contains(EventMask::WRITE) {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

fn from_epoll(bits: u32) -> EventMask {
    let mut events = EventMask::NONE;
    if bits & libc::EPOLLIN as u32 != 0 {
        events |= EventMask::READ;
    }
    if bits & libc::EPOLLPRI as u32 != 0 {
        events |= EventMask::PRI;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        events |= EventMask::WRITE;
    }
    if bits & libc::EPOLLERR as u32 != 0 {
        events |= EventMask::ERROR;
    }
    if bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
        events |= EventMask::HUP;
    }
    events
}
