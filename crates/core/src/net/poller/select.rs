use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use crate::error::{Result, RtspError};
use crate::net::EventMask;

/// Descriptor values at or above this cannot be placed in an `fd_set`.
pub const SELECT_CAPACITY: usize = libc::FD_SETSIZE as usize;

/// Portable `select(2)` back-end, bounded by [`SELECT_CAPACITY`].
#[derive(Debug, Default)]
pub struct SelectPoller {
    interests: BTreeMap<RawFd, EventMask>,
}

impl SelectPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, fd: RawFd, events: EventMask) -> Result<()> {
        check_capacity(fd)?;
        self.interests.insert(fd, events);
        Ok(())
    }

    pub fn modify(&mut self, fd: RawFd, events: EventMask) -> Result<()> {
        check_capacity(fd)?;
        match self.interests.get_mut(&fd) {
            Some(slot) => {
                *slot = events;
                Ok(())
            }
            None => Err(io::Error::from_raw_os_error(libc::ENOENT).into()),
        }
    }

    pub fn delete(&mut self, fd: RawFd) -> Result<()> {
        self.interests.remove(&fd);
        Ok(())
    }

    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, EventMask)>> {
        loop {
            let mut read_set: libc::fd_set = unsafe { mem::zeroed() };
            let mut write_set: libc::fd_set = unsafe { mem::zeroed() };
            let mut except_set: libc::fd_set = unsafe { mem::zeroed() };
            unsafe {
                libc::FD_ZERO(&mut read_set);
                libc::FD_ZERO(&mut write_set);
                libc::FD_ZERO(&mut except_set);
            }

            let mut max_fd = -1;
            for (&fd, &events) in &self.interests {
                unsafe {
                    if events.contains(EventMask::READ) {
                        libc::FD_SET(fd, &mut read_set);
                    }
                    if events.contains(EventMask::WRITE) {
                        libc::FD_SET(fd, &mut write_set);
                    }
                    libc::FD_SET(fd, &mut except_set);
                }
                max_fd = max_fd.max(fd);
            }

            // select() rewrites the timeval on Linux, so rebuild it per attempt.
            let mut tv = timeout.map(|d| libc::timeval {
                tv_sec: d.as_secs() as libc::time_t,
                tv_usec: d.subsec_micros() as libc::suseconds_t,
            });
            let tv_ptr = match tv.as_mut() {
                Some(tv) => tv as *mut libc::timeval,
                None => ptr::null_mut(),
            };

            let rc = unsafe {
                libc::select(
                    max_fd + 1,
                    &mut read_set,
                    &mut write_set,
                    &mut except_set,
                    tv_ptr,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            if rc == 0 {
                return Ok(Vec::new());
            }

            let mut ready = Vec::with_capacity(rc as usize);
            for &fd in self.interests.keys() {
                let mut events = EventMask::NONE;
                unsafe {
                    if libc::FD_ISSET(fd, &read_set) {
                        events |= EventMask::READ;
                    }
                    if libc::FD_ISSET(fd, &write_set) {
                        events |= EventMask::WRITE;
                    }
                    if libc::FD_ISSET(fd, &except_set) {
                        events |= EventMask::PRI;
                    }
                }
                if !events.is_empty() {
                    ready.push((fd, events));
                }
            }
            return Ok(ready);
        }
    }
}

fn check_capacity(fd: RawFd) -> Result<()> {
    if fd < 0 || fd as usize >= SELECT_CAPACITY {
        return Err(RtspError::PollerCapacity {
            fd,
            limit: SELECT_CAPACITY,
        });
    }
    Ok(())
}
