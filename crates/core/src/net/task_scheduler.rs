use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;

use super::poller::Poller;
use super::timer::{TimerEvent, TimerId, TimerQueue};
use super::{ChannelPtr, EventLoopConfig};
use crate::error::{Result, RtspError};
use crate::transport::pipe::{WakeupReceiver, WakeupSender, wakeup_pipe};

/// Work posted to a scheduler from any thread. Runs once on the scheduler thread.
pub type TriggerEvent = Box<dyn FnOnce(&TaskScheduler) + Send + 'static>;

struct Shared {
    id: usize,
    shutdown: AtomicBool,
    wakeup: WakeupSender,
    triggers: ArrayQueue<TriggerEvent>,
    timers: Mutex<TimerQueue>,
}

/// Thread-safe handle to one [`TaskScheduler`].
///
/// Everything that must happen on the scheduler thread (channel updates,
/// connection I/O) is posted through [`add_trigger_event`](Self::add_trigger_event).
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Queue `event` and wake the scheduler.
    ///
    /// Fails with [`RtspError::TriggerQueueFull`] when the mailbox is at
    /// capacity; the event is dropped in that case.
    pub fn add_trigger_event<F>(&self, event: F) -> Result<()>
    where
        F: FnOnce(&TaskScheduler) + Send + 'static,
    {
        if self.shared.triggers.push(Box::new(event)).is_err() {
            return Err(RtspError::TriggerQueueFull {
                capacity: self.shared.triggers.capacity(),
            });
        }
        self.wakeup();
        Ok(())
    }

    /// Arm a timer on this scheduler. The callback returns `true` to repeat.
    pub fn add_timer<F>(&self, interval: Duration, event: F) -> TimerId
    where
        F: FnMut(&TaskScheduler) -> bool + Send + 'static,
    {
        let id = self.shared.timers.lock().add_timer(interval, Box::new(event));
        // The poller may be sleeping on a later deadline.
        self.wakeup();
        id
    }

    pub fn remove_timer(&self, id: TimerId) -> bool {
        self.shared.timers.lock().remove_timer(id)
    }

    /// Ask the scheduler loop to exit after its current pass.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.wakeup();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    pub fn pending_triggers(&self) -> usize {
        self.shared.triggers.len()
    }

    fn wakeup(&self) {
        if let Err(e) = self.shared.wakeup.wake() {
            tracing::warn!(scheduler = self.shared.id, error = %e, "wakeup write failed");
        }
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("id", &self.shared.id)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Everything a scheduler needs, built on the spawning thread and moved into
/// the worker before the thread-bound parts are assembled.
pub(crate) struct SchedulerParts {
    handle: SchedulerHandle,
    poller: Poller,
    receiver: WakeupReceiver,
}

impl SchedulerParts {
    pub(crate) fn new(id: usize, config: &EventLoopConfig) -> Result<Self> {
        let (sender, receiver) = wakeup_pipe()?;
        let mut poller = Poller::new(config.poller)?;
        poller.add(receiver.fd(), super::EventMask::READ)?;

        let shared = Arc::new(Shared {
            id,
            shutdown: AtomicBool::new(false),
            wakeup: sender,
            triggers: ArrayQueue::new(config.trigger_capacity.max(1)),
            timers: Mutex::new(TimerQueue::new()),
        });

        Ok(Self {
            handle: SchedulerHandle { shared },
            poller,
            receiver,
        })
    }

    pub(crate) fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub(crate) fn into_scheduler(self) -> TaskScheduler {
        TaskScheduler {
            handle: self.handle,
            poller: RefCell::new(self.poller),
            receiver: self.receiver,
            channels: RefCell::new(HashMap::new()),
            locals: RefCell::new(HashMap::new()),
        }
    }
}

/// Single-threaded reactor: one poller, the channels registered with it, a
/// trigger mailbox and a timer queue.
///
/// A `TaskScheduler` is pinned to the thread that runs it. Other threads
/// reach it through its [`SchedulerHandle`].
pub struct TaskScheduler {
    handle: SchedulerHandle,
    poller: RefCell<Poller>,
    receiver: WakeupReceiver,
    channels: RefCell<HashMap<RawFd, ChannelPtr>>,
    locals: RefCell<HashMap<TypeId, Rc<dyn Any>>>,
}

impl TaskScheduler {
    /// Build a scheduler to be driven by the calling thread.
    pub fn new(id: usize, config: &EventLoopConfig) -> Result<Self> {
        Ok(SchedulerParts::new(id, config)?.into_scheduler())
    }

    pub fn id(&self) -> usize {
        self.handle.id()
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn poller_capacity(&self) -> Option<usize> {
        self.poller.borrow().capacity()
    }

    /// Synchronise the poller with `channel`'s current interest mask.
    ///
    /// Unknown channels with a non-empty mask are added, known channels are
    /// modified, and known channels whose mask is empty are removed.
    pub fn update_channel(&self, channel: &ChannelPtr) -> Result<()> {
        let fd = channel.fd();
        let events = channel.events();
        let mut removed = None;

        let result = {
            let mut channels = self.channels.borrow_mut();
            let mut poller = self.poller.borrow_mut();
            if channels.contains_key(&fd) {
                if events.is_empty() {
                    removed = channels.remove(&fd);
                    poller.delete(fd)
                } else {
                    let result = poller.modify(fd, events);
                    removed = channels.insert(fd, Rc::clone(channel));
                    result
                }
            } else if !events.is_empty() {
                let result = poller.add(fd, events);
                if result.is_ok() {
                    channels.insert(fd, Rc::clone(channel));
                }
                result
            } else {
                Ok(())
            }
        };

        // Dropped outside the borrows: channel callbacks may own resources.
        drop(removed);
        result
    }

    /// Unregister `channel` if it is the one registered for its descriptor.
    pub fn remove_channel(&self, channel: &ChannelPtr) {
        let fd = channel.fd();
        let removed = {
            let mut channels = self.channels.borrow_mut();
            match channels.get(&fd) {
                Some(current) if Rc::ptr_eq(current, channel) => {
                    if let Err(e) = self.poller.borrow_mut().delete(fd) {
                        tracing::debug!(fd, error = %e, "poller delete failed");
                    }
                    channels.remove(&fd)
                }
                _ => None,
            }
        };
        drop(removed);
    }

    /// The channel registered for `fd`, if any.
    pub fn channel(&self, fd: RawFd) -> Option<ChannelPtr> {
        self.channels.borrow().get(&fd).cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.borrow().len()
    }

    /// Per-scheduler state keyed by type, created on first use.
    pub fn local<T: Default + 'static>(&self) -> Rc<T> {
        let mut locals = self.locals.borrow_mut();
        let slot = locals
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Rc::new(T::default()) as Rc<dyn Any>);
        match Rc::clone(slot).downcast::<T>() {
            Ok(value) => value,
            Err(_) => unreachable!("local slot keyed by its own TypeId"),
        }
    }

    /// Forward to this scheduler's handle.
    pub fn add_trigger_event<F>(&self, event: F) -> Result<()>
    where
        F: FnOnce(&TaskScheduler) + Send + 'static,
    {
        self.handle.add_trigger_event(event)
    }

    pub fn add_timer<F>(&self, interval: Duration, event: F) -> TimerId
    where
        F: FnMut(&TaskScheduler) -> bool + Send + 'static,
    {
        self.handle.add_timer(interval, event)
    }

    pub fn remove_timer(&self, id: TimerId) -> bool {
        self.handle.remove_timer(id)
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Run passes until [`stop`](Self::stop) is requested.
    pub fn start(&self) {
        tracing::debug!(scheduler = self.id(), "task scheduler started");
        while self.handle_event(None) {}
        tracing::debug!(scheduler = self.id(), "task scheduler stopped");
    }

    /// One reactor pass. Returns `false` once shutdown was requested.
    ///
    /// The wait is capped by `timeout` and by the nearest timer deadline.
    /// After it returns: the wake-up pipe is drained, queued triggers run,
    /// due timers fire, then ready channels are dispatched.
    pub fn handle_event(&self, timeout: Option<Duration>) -> bool {
        if self.handle.is_shutdown() {
            return false;
        }

        let timer_wait = self.handle.shared.timers.lock().time_remaining(Instant::now());
        let wait = match (timeout, timer_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let ready = match self.poller.borrow_mut().wait(wait) {
            Ok(ready) => ready,
            Err(e) => {
                tracing::warn!(scheduler = self.id(), error = %e, "poller wait failed");
                Vec::new()
            }
        };

        let wakeup_fd = self.receiver.fd();
        if ready.iter().any(|(fd, _)| *fd == wakeup_fd) {
            self.receiver.drain();
        }

        self.handle_trigger_events();
        self.handle_timer_events();

        for (fd, events) in ready {
            if fd == wakeup_fd {
                continue;
            }
            // A callback earlier in this pass may have removed the channel.
            let channel = self.channels.borrow().get(&fd).cloned();
            if let Some(channel) = channel {
                channel.handle_event(events, self);
            }
        }

        !self.handle.is_shutdown()
    }

    fn handle_trigger_events(&self) {
        // Events queued by the triggers themselves wait for the next pass.
        let pending = self.handle.shared.triggers.len();
        for _ in 0..pending {
            match self.handle.shared.triggers.pop() {
                Some(event) => event(self),
                None => break,
            }
        }
    }

    fn handle_timer_events(&self) {
        let expired = self.handle.shared.timers.lock().take_expired(Instant::now());
        for (id, mut event) in expired {
            let repeat = event(self);
            self.restore_timer(id, event, repeat);
        }
    }

    fn restore_timer(&self, id: TimerId, event: TimerEvent, repeat: bool) {
        self.handle
            .shared
            .timers
            .lock()
            .restore(id, event, repeat, Instant::now());
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("id", &self.id())
            .field("channels", &self.channel_count())
            .finish()
    }
}
