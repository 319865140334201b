//! Wall-clock widget driven by its own one-second timerfd.

use std::cell::RefCell;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use tracing::warn;

use super::Block;
use crate::event_loop::Widget;

const CLOCK_FORMAT: &str = "%a %d %b %H:%M:%S";

pub struct ClockWidget {
    timer: TimerFd,
    text: RefCell<String>,
}

impl ClockWidget {
    pub fn new() -> Result<Self> {
        let timer = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_NONBLOCK)
            .context("create clock timer")?;
        timer
            .set(
                Expiration::Interval(TimeSpec::from_duration(Duration::from_secs(1))),
                TimerSetTimeFlags::empty(),
            )
            .context("arm clock timer")?;

        let widget = Self {
            timer,
            text: RefCell::new(String::new()),
        };
        widget.update();
        Ok(widget)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.timer.as_fd().as_raw_fd()
    }

    fn update(&self) {
        *self.text.borrow_mut() = Local::now().format(CLOCK_FORMAT).to_string();
    }
}

impl Widget for ClockWidget {
    fn on_ready(&self) {
        match self.timer.wait() {
            Ok(()) | Err(Errno::EAGAIN) => {}
            Err(err) => warn!("failed to drain clock timer: {}", err),
        }
        self.update();
    }

    fn render(&self) -> Option<String> {
        let text = self.text.borrow();
        Block {
            name: "clock",
            instance: None,
            full_text: text.as_str(),
        }
        .render()
    }
}
