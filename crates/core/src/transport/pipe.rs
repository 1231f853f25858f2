use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// Open a non-blocking self-pipe used to interrupt a blocked poller wait.
///
/// The sender side is shared with other threads; the receiver stays
/// registered with one scheduler's poller.
pub fn wakeup_pipe() -> io::Result<(WakeupSender, WakeupReceiver)> {
    let (tx, rx) = UnixStream::pair()?;
    tx.set_nonblocking(true)?;
    rx.set_nonblocking(true)?;
    Ok((WakeupSender { stream: tx }, WakeupReceiver { stream: rx }))
}

#[derive(Debug)]
pub struct WakeupSender {
    stream: UnixStream,
}

impl WakeupSender {
    /// Write one byte. A full pipe already guarantees a pending wake-up.
    pub fn wake(&self) -> io::Result<()> {
        loop {
            match (&self.stream).write(&[1]) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug)]
pub struct WakeupReceiver {
    stream: UnixStream,
}

impl WakeupReceiver {
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Consume every pending wake-up byte. Returns how many were read.
    pub fn drain(&self) -> usize {
        let mut buf = [0u8; 256];
        let mut total = 0;
        loop {
            match (&self.stream).read(&mut buf) {
                Ok(0) => return total,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return total,
            }
        }
    }
}
