//! Reactor core: readiness polling, per-thread schedulers and the pool that
//! runs them.
//!
//! Each [`TaskScheduler`] owns a poller and the [`Channel`]s registered with
//! it, and never leaves its thread. Other threads talk to it through a
//! [`SchedulerHandle`], which carries a bounded trigger mailbox, a timer
//! queue and a wake-up pipe. An [`EventLoop`] spawns one scheduler per
//! worker thread; an [`Acceptor`] feeds new TCP connections into it.

mod acceptor;
mod channel;
mod event_loop;
pub mod poller;
mod task_scheduler;
mod timer;

pub use acceptor::{Acceptor, NewConnectionCallback};
pub use channel::{Channel, ChannelPtr, EventCallback, EventMask};
pub use event_loop::{DEFAULT_TRIGGER_CAPACITY, EventLoop, EventLoopConfig};
pub use poller::{Poller, PollerKind};
pub use task_scheduler::{SchedulerHandle, TaskScheduler, TriggerEvent};
pub use timer::{TimerEvent, TimerId, TimerQueue};
