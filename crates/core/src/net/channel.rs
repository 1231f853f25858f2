use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use super::TaskScheduler;

/// Readiness bits a [`Channel`] is interested in, or that a poller reported.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct EventMask(u32);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const READ: EventMask = EventMask(1);
    /// Urgent/out-of-band data; dispatched to the read callback.
    pub const PRI: EventMask = EventMask(1 << 1);
    pub const WRITE: EventMask = EventMask(1 << 2);
    pub const ERROR: EventMask = EventMask(1 << 3);
    /// Peer hang-up. Reported by the poller only, never requested.
    pub const HUP: EventMask = EventMask(1 << 4);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set in `self`.
    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit of `other` is set in `self`.
    pub fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn without(self, other: EventMask) -> EventMask {
        EventMask(self.0 & !other.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventMask {
    type Output = EventMask;

    fn bitand(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 & rhs.0)
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (EventMask::READ, "READ"),
            (EventMask::PRI, "PRI"),
            (EventMask::WRITE, "WRITE"),
            (EventMask::ERROR, "ERROR"),
            (EventMask::HUP, "HUP"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", set.join("|"))
        }
    }
}

/// Callback invoked on the scheduler thread when a channel becomes ready.
pub type EventCallback = Rc<dyn Fn(&TaskScheduler)>;

/// Shared handle to a channel. The scheduler's registry holds one clone, the
/// component that installed the channel holds another.
pub type ChannelPtr = Rc<Channel>;

/// One file descriptor's registration with a [`TaskScheduler`]: the interest
/// mask plus the callbacks to run for each kind of readiness.
///
/// Channels never leave the thread of the scheduler they are registered with.
/// Interest changes only take effect after
/// [`TaskScheduler::update_channel`] is called again.
pub struct Channel {
    fd: RawFd,
    events: Cell<EventMask>,
    read_callback: RefCell<Option<EventCallback>>,
    write_callback: RefCell<Option<EventCallback>>,
    close_callback: RefCell<Option<EventCallback>>,
    error_callback: RefCell<Option<EventCallback>>,
}

impl Channel {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            events: Cell::new(EventMask::NONE),
            read_callback: RefCell::new(None),
            write_callback: RefCell::new(None),
            close_callback: RefCell::new(None),
            error_callback: RefCell::new(None),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> EventMask {
        self.events.get()
    }

    pub fn set_events(&self, events: EventMask) {
        self.events.set(events);
    }

    pub fn set_read_callback(&self, callback: impl Fn(&TaskScheduler) + 'static) {
        *self.read_callback.borrow_mut() = Some(Rc::new(callback));
    }

    pub fn set_write_callback(&self, callback: impl Fn(&TaskScheduler) + 'static) {
        *self.write_callback.borrow_mut() = Some(Rc::new(callback));
    }

    pub fn set_close_callback(&self, callback: impl Fn(&TaskScheduler) + 'static) {
        *self.close_callback.borrow_mut() = Some(Rc::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl Fn(&TaskScheduler) + 'static) {
        *self.error_callback.borrow_mut() = Some(Rc::new(callback));
    }

    pub fn enable_reading(&self) {
        self.events.set(self.events.get() | EventMask::READ);
    }

    pub fn enable_writing(&self) {
        self.events.set(self.events.get() | EventMask::WRITE);
    }

    pub fn disable_reading(&self) {
        self.events.set(self.events.get().without(EventMask::READ));
    }

    pub fn disable_writing(&self) {
        self.events.set(self.events.get().without(EventMask::WRITE));
    }

    pub fn disable_all(&self) {
        self.events.set(EventMask::NONE);
    }

    pub fn is_none_event(&self) -> bool {
        self.events.get().is_empty()
    }

    pub fn is_reading(&self) -> bool {
        self.events.get().contains(EventMask::READ)
    }

    pub fn is_writing(&self) -> bool {
        self.events.get().contains(EventMask::WRITE)
    }

    /// Dispatch reported readiness to the installed callbacks.
    ///
    /// Order is read, write, then hang-up. A hang-up ends dispatch, so the
    /// error callback only runs for errors without a hang-up.
    pub fn handle_event(&self, events: EventMask, scheduler: &TaskScheduler) {
        if events.intersects(EventMask::READ | EventMask::PRI) {
            Self::invoke(&self.read_callback, scheduler);
        }
        if events.contains(EventMask::WRITE) {
            Self::invoke(&self.write_callback, scheduler);
        }
        if events.contains(EventMask::HUP) {
            Self::invoke(&self.close_callback, scheduler);
            return;
        }
        if events.contains(EventMask::ERROR) {
            Self::invoke(&self.error_callback, scheduler);
        }
    }

    fn invoke(slot: &RefCell<Option<EventCallback>>, scheduler: &TaskScheduler) {
        // Clone out first: the callback may replace itself or touch this channel.
        let callback = slot.borrow().clone();
        if let Some(callback) = callback {
            callback(scheduler);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &self.events.get())
            .finish()
    }
}
