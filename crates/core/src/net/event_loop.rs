use std::os::unix::io::RawFd;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use super::task_scheduler::SchedulerParts;
use super::timer::TimerId;
use super::{ChannelPtr, PollerKind, SchedulerHandle, TaskScheduler};
use crate::error::{Result, RtspError};

/// Default size of each scheduler's trigger mailbox.
pub const DEFAULT_TRIGGER_CAPACITY: usize = 50_000;

/// Sizing of an [`EventLoop`].
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Number of scheduler threads. Zero is treated as one.
    pub num_threads: usize,
    pub poller: PollerKind,
    pub trigger_capacity: usize,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            num_threads: 1,
            poller: PollerKind::default(),
            trigger_capacity: DEFAULT_TRIGGER_CAPACITY,
        }
    }
}

/// A pool of [`TaskScheduler`]s, one per worker thread.
///
/// New connections are spread across schedulers round-robin. Loop-wide
/// timers and triggers go to the first scheduler. Dropping the loop stops
/// and joins every worker.
pub struct EventLoop {
    config: EventLoopConfig,
    schedulers: Vec<SchedulerHandle>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    index: Mutex<usize>,
}

impl EventLoop {
    pub fn new(num_threads: usize) -> Result<Self> {
        Self::with_config(EventLoopConfig {
            num_threads,
            ..EventLoopConfig::default()
        })
    }

    pub fn with_config(mut config: EventLoopConfig) -> Result<Self> {
        config.num_threads = config.num_threads.max(1);

        let event_loop = EventLoop {
            schedulers: Vec::with_capacity(config.num_threads),
            threads: Mutex::new(Vec::with_capacity(config.num_threads)),
            index: Mutex::new(0),
            config,
        };
        event_loop.spawn_schedulers()
    }

    fn spawn_schedulers(mut self) -> Result<Self> {
        for id in 0..self.config.num_threads {
            // On failure `self` drops here, which stops and joins earlier workers.
            let parts = SchedulerParts::new(id, &self.config)?;
            let handle = parts.handle();
            let thread = thread::Builder::new()
                .name(format!("rtsp-sched-{id}"))
                .spawn(move || parts.into_scheduler().start())
                .map_err(RtspError::Io)?;
            self.schedulers.push(handle);
            self.threads.lock().push(thread);
        }

        tracing::info!(
            threads = self.config.num_threads,
            poller = self.config.poller.name(),
            "event loop started"
        );
        Ok(self)
    }

    pub fn config(&self) -> &EventLoopConfig {
        &self.config
    }

    pub fn num_threads(&self) -> usize {
        self.schedulers.len()
    }

    /// Next scheduler in round-robin order.
    pub fn get_task_scheduler(&self) -> SchedulerHandle {
        let mut index = self.index.lock();
        let scheduler = self.schedulers[*index].clone();
        *index = (*index + 1) % self.schedulers.len();
        scheduler
    }

    pub fn scheduler(&self, id: usize) -> Option<&SchedulerHandle> {
        self.schedulers.get(id)
    }

    pub fn schedulers(&self) -> &[SchedulerHandle] {
        &self.schedulers
    }

    pub fn poller_capacity(&self) -> Option<usize> {
        self.config.poller.capacity()
    }

    pub fn add_timer<F>(&self, interval: Duration, event: F) -> TimerId
    where
        F: FnMut(&TaskScheduler) -> bool + Send + 'static,
    {
        self.schedulers[0].add_timer(interval, event)
    }

    pub fn remove_timer(&self, id: TimerId) -> bool {
        self.schedulers[0].remove_timer(id)
    }

    pub fn add_trigger_event<F>(&self, event: F) -> Result<()>
    where
        F: FnOnce(&TaskScheduler) + Send + 'static,
    {
        self.schedulers[0].add_trigger_event(event)
    }

    /// Build a channel on the next scheduler's thread and register it there.
    /// Returns the id of the chosen scheduler.
    pub fn register_channel<F>(&self, make: F) -> Result<usize>
    where
        F: FnOnce(&TaskScheduler) -> ChannelPtr + Send + 'static,
    {
        let scheduler = self.get_task_scheduler();
        scheduler.add_trigger_event(move |sched| {
            let channel = make(sched);
            if let Err(e) = sched.update_channel(&channel) {
                tracing::warn!(fd = channel.fd(), error = %e, "channel registration failed");
            }
        })?;
        Ok(scheduler.id())
    }

    /// Drop whatever channel scheduler `id` has registered for `fd`.
    pub fn remove_channel(&self, id: usize, fd: RawFd) -> Result<()> {
        let scheduler = self.scheduler(id).ok_or_else(|| {
            RtspError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no scheduler with id {id}"),
            ))
        })?;
        scheduler.add_trigger_event(move |sched| {
            if let Some(channel) = sched.channel(fd) {
                sched.remove_channel(&channel);
            }
        })
    }

    /// Stop every scheduler and join its thread. Idempotent.
    ///
    /// A scheduler thread calling this does not join itself.
    pub fn quit(&self) {
        for scheduler in &self.schedulers {
            scheduler.stop();
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        if threads.is_empty() {
            return;
        }
        let current = thread::current().id();
        for thread in threads {
            if thread.thread().id() == current {
                continue;
            }
            if thread.join().is_err() {
                tracing::error!("scheduler thread panicked");
            }
        }
        tracing::info!("event loop stopped");
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.quit();
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("config", &self.config)
            .field("schedulers", &self.schedulers.len())
            .finish()
    }
}
