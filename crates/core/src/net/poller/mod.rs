//! Readiness back-ends for the task scheduler.
//!
//! Both back-ends are level-triggered: a descriptor with unread input keeps
//! being reported until it is drained or its interest is removed.

#[cfg(target_os = "linux")]
mod epoll;
mod select;

use std::os::unix::io::RawFd;
use std::time::Duration;

#[cfg(target_os = "linux")]
pub use epoll::EpollPoller;
pub use select::{SELECT_CAPACITY, SelectPoller};

use super::EventMask;
use crate::error::Result;

/// Which readiness back-end a scheduler uses. Chosen once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerKind {
    #[cfg(target_os = "linux")]
    Epoll,
    Select,
}

impl PollerKind {
    /// Upper bound on descriptor values this back-end can watch.
    pub fn capacity(self) -> Option<usize> {
        match self {
            #[cfg(target_os = "linux")]
            PollerKind::Epoll => None,
            PollerKind::Select => Some(SELECT_CAPACITY),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            #[cfg(target_os = "linux")]
            PollerKind::Epoll => "epoll",
            PollerKind::Select => "select",
        }
    }
}

impl Default for PollerKind {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        {
            PollerKind::Epoll
        }
        #[cfg(not(target_os = "linux"))]
        {
            PollerKind::Select
        }
    }
}

impl std::str::FromStr for PollerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            #[cfg(target_os = "linux")]
            "epoll" => Ok(PollerKind::Epoll),
            "select" => Ok(PollerKind::Select),
            other => Err(format!("unknown poller '{other}'")),
        }
    }
}

/// A readiness multiplexer owned by exactly one scheduler thread.
#[derive(Debug)]
pub enum Poller {
    #[cfg(target_os = "linux")]
    Epoll(EpollPoller),
    Select(SelectPoller),
}

impl Poller {
    pub fn new(kind: PollerKind) -> Result<Self> {
        Ok(match kind {
            #[cfg(target_os = "linux")]
            PollerKind::Epoll => Poller::Epoll(EpollPoller::new()?),
            PollerKind::Select => Poller::Select(SelectPoller::new()),
        })
    }

    pub fn kind(&self) -> PollerKind {
        match self {
            #[cfg(target_os = "linux")]
            Poller::Epoll(_) => PollerKind::Epoll,
            Poller::Select(_) => PollerKind::Select,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.kind().capacity()
    }

    pub fn add(&mut self, fd: RawFd, events: EventMask) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Poller::Epoll(p) => p.add(fd, events),
            Poller::Select(p) => p.add(fd, events),
        }
    }

    pub fn modify(&mut self, fd: RawFd, events: EventMask) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Poller::Epoll(p) => p.modify(fd, events),
            Poller::Select(p) => p.modify(fd, events),
        }
    }

    pub fn delete(&mut self, fd: RawFd) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Poller::Epoll(p) => p.delete(fd),
            Poller::Select(p) => p.delete(fd),
        }
    }

    /// Block until at least one descriptor is ready or `timeout` elapses.
    /// `None` waits indefinitely. Interrupted waits are retried.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, EventMask)>> {
        match self {
            #[cfg(target_os = "linux")]
            Poller::Epoll(p) => p.wait(timeout),
            Poller::Select(p) => p.wait(timeout),
        }
    }
}
