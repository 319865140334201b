/*!
 * Periodic timers
 * timerfd-backed readiness sources fanning ticks out to listeners,
 * cached so every distinct interval costs one kernel timer
 */

use std::cell::RefCell;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use tracing::warn;

use crate::event_loop::{EventLoop, Widget};

pub trait TimerListener {
    fn on_tick(&self);
}

/// A monotonic interval timer. Renders nothing; it only wakes the loop
/// and notifies its listeners.
pub struct PeriodicTimer {
    timer: TimerFd,
    listeners: RefCell<Vec<Rc<dyn TimerListener>>>,
}

impl PeriodicTimer {
    pub fn new(interval: Duration) -> Result<Self> {
        let timer = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_NONBLOCK)
            .context("create interval timer")?;
        timer
            .set(
                Expiration::Interval(TimeSpec::from_duration(interval)),
                TimerSetTimeFlags::empty(),
            )
            .context("arm interval timer")?;
        Ok(Self {
            timer,
            listeners: RefCell::new(Vec::new()),
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.timer.as_fd().as_raw_fd()
    }

    pub fn add_listener(&self, listener: Rc<dyn TimerListener>) {
        self.listeners.borrow_mut().push(listener);
    }
}

impl Widget for PeriodicTimer {
    fn on_ready(&self) {
        match self.timer.wait() {
            Ok(()) | Err(Errno::EAGAIN) => {}
            Err(err) => warn!("failed to drain timer: {}", err),
        }
        for listener in self.listeners.borrow().iter() {
            listener.on_tick();
        }
    }
}

/// Hands out one shared `PeriodicTimer` per distinct interval.
pub struct TimerManager {
    timers: BTreeMap<Duration, Rc<PeriodicTimer>>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            timers: BTreeMap::new(),
        }
    }

    /// Subscribes `listener` to the timer for `interval`, creating the
    /// timer and wiring it into the loop on first use of the interval.
    pub fn register_listener(
        &mut self,
        event_loop: &mut EventLoop,
        interval: Duration,
        listener: Rc<dyn TimerListener>,
    ) -> Result<()> {
        let timer = match self.timers.entry(interval) {
            Entry::Occupied(slot) => Rc::clone(slot.get()),
            Entry::Vacant(slot) => {
                let timer = Rc::new(PeriodicTimer::new(interval)?);
                event_loop.register_source(timer.clone(), timer.raw_fd())?;
                Rc::clone(slot.insert(timer))
            }
        };
        timer.add_listener(listener);
        Ok(())
    }
}
