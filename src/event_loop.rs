/*!
 * Readiness loop
 * Multiplexes descriptor-driven widgets over epoll and frames one
 * status record per wake onto the output stream
 */

use std::io::{self, Write};
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use tracing::warn;

const MAX_EVENTS: usize = 8;

/// Anything the loop can drive: woken through `on_ready` when its
/// registered descriptor is readable, asked for its block via `render`.
pub trait Widget {
    fn on_ready(&self) {}

    /// Current block text, or `None` to stay out of the record.
    fn render(&self) -> Option<String> {
        None
    }
}

pub struct EventLoop {
    epoll: Epoll,
    /// Readiness sources; the epoll token is an index into this list.
    sources: Vec<Rc<dyn Widget>>,
    /// Render set, in registration order.
    widgets: Vec<Rc<dyn Widget>>,
    output: Box<dyn Write>,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        Self::with_output(Box::new(io::stdout()))
    }

    pub fn with_output(output: Box<dyn Write>) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::empty()).context("create epoll instance")?;
        Ok(Self {
            epoll,
            sources: Vec::new(),
            widgets: Vec::new(),
            output,
        })
    }

    /// Arms `fd` for read readiness and ties it to `widget`, which also
    /// joins the render set. Widgets stay registered for the lifetime
    /// of the process.
    pub fn register_source(&mut self, widget: Rc<dyn Widget>, fd: RawFd) -> Result<()> {
        let token = self.sources.len() as u64;
        // SAFETY: the registering widget owns the descriptor and is kept
        // alive in `sources` for as long as this loop exists
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, token))
            .context("register descriptor with readiness loop")?;
        self.sources.push(widget.clone());
        self.widgets.push(widget);
        Ok(())
    }

    /// Adds a widget that only renders and has no descriptor of its own.
    pub fn register_widget(&mut self, widget: Rc<dyn Widget>) {
        self.widgets.push(widget);
    }

    /// Emits the stream header and serves wakes forever.
    pub fn run(&mut self) -> Result<()> {
        writeln!(self.output, "{}", serde_json::json!({ "version": 1 }))
            .context("write protocol header")?;
        writeln!(self.output, "[").context("open record stream")?;
        self.output.flush().context("flush output")?;

        loop {
            self.turn()?;
        }
    }

    /// One blocking iteration: wait, dispatch every ready source, then
    /// emit a single record if anything was ready.
    fn turn(&mut self) -> Result<()> {
        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        let ready = loop {
            match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(count) => break count,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("wait for ready descriptors"),
            }
        };

        for event in &events[..ready] {
            let token = event.data() as usize;
            match self.sources.get(token) {
                Some(widget) => widget.on_ready(),
                None => warn!("ready event for unregistered source {}", token),
            }
        }

        if ready > 0 {
            self.emit_record()?;
        }
        Ok(())
    }

    /// Renders every widget in registration order into one
    /// comma-suffixed array line, leaving out empty blocks.
    fn emit_record(&mut self) -> Result<()> {
        let mut record = String::from("[");
        let mut first = true;
        for widget in &self.widgets {
            let Some(text) = widget.render() else {
                continue;
            };
            if text.is_empty() {
                continue;
            }
            if !first {
                record.push(',');
            }
            first = false;
            record.push_str(&text);
        }
        record.push_str("],");

        writeln!(self.output, "{}", record).context("write record")?;
        self.output.flush().context("flush record")?;
        Ok(())
    }
}
