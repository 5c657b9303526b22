use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::event::{EventLoop, Inner};
use crate::pqueue::NULL_INDEX;

/// Enablement state of a source, mirroring the three-way switch in the spec.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Enabled {
    Off,
    On,
    OneShot,
}

impl Enabled {
    pub fn is_enabled(self) -> bool {
        !matches!(self, Enabled::Off)
    }
}

/// Readiness bits an `Io` source can request or observe, modelled after the
/// `epoll` event mask (kept narrow rather than exposing the full raw `u32`,
/// since only a documented subset is a legal request per the spec).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct IoEvents(pub(crate) u32);

impl IoEvents {
    pub const READABLE: IoEvents = IoEvents(libc::EPOLLIN as u32);
    pub const WRITABLE: IoEvents = IoEvents(libc::EPOLLOUT as u32);
    pub const PRIORITY: IoEvents = IoEvents(libc::EPOLLPRI as u32);
    pub const REMOTE_HANGUP: IoEvents = IoEvents(libc::EPOLLRDHUP as u32);
    pub const ERROR: IoEvents = IoEvents(libc::EPOLLERR as u32);
    pub const HANGUP: IoEvents = IoEvents(libc::EPOLLHUP as u32);
    pub const EDGE_TRIGGERED: IoEvents = IoEvents(libc::EPOLLET as u32);

    const VALID: u32 = Self::READABLE.0
        | Self::WRITABLE.0
        | Self::PRIORITY.0
        | Self::REMOTE_HANGUP.0
        | Self::ERROR.0
        | Self::HANGUP.0
        | Self::EDGE_TRIGGERED.0;

    pub fn empty() -> Self {
        IoEvents(0)
    }

    pub fn contains(self, other: IoEvents) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_subset_of_valid(self) -> bool {
        self.0 & !Self::VALID == 0
    }
}

impl std::ops::BitOr for IoEvents {
    type Output = IoEvents;
    fn bitor(self, rhs: IoEvents) -> IoEvents {
        IoEvents(self.0 | rhs.0)
    }
}

impl fmt::Debug for IoData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoData").field("fd", &self.fd).finish()
    }
}

pub struct IoData {
    pub fd: Cell<std::os::fd::RawFd>,
    pub requested: Cell<IoEvents>,
    pub last_seen: Cell<IoEvents>,
    pub registered: Cell<bool>,
}

pub struct TimeData {
    pub clock: Clock,
    pub next_usec: Cell<u64>,
    pub accuracy_usec: Cell<u64>,
    pub earliest_index: Cell<usize>,
    pub latest_index: Cell<usize>,
}

pub struct SignalData {
    pub signo: Cell<i32>,
    pub last_info: RefCell<Option<libc::signalfd_siginfo>>,
}

pub struct ChildData {
    pub pid: Cell<libc::pid_t>,
    pub wait_options: Cell<i32>,
    pub last_status: RefCell<Option<libc::siginfo_t>>,
    /// Set once the child is a confirmed zombie awaiting the post-callback reap.
    pub needs_reap: Cell<bool>,
}

pub enum Kind {
    Io(IoData),
    Time(TimeData),
    Signal(SignalData),
    Child(ChildData),
    Defer,
    Post,
    Exit { exit_index: Cell<usize> },
}

impl Kind {
    pub fn name(&self) -> &'static str {
        match self {
            Kind::Io(_) => "io",
            Kind::Time(t) => match t.clock {
                Clock::Realtime => "time-realtime",
                Clock::Boottime => "time-boottime",
                Clock::Monotonic => "time-monotonic",
                Clock::RealtimeAlarm => "time-realtime-alarm",
                Clock::BoottimeAlarm => "time-boottime-alarm",
            },
            Kind::Signal(_) => "signal",
            Kind::Child(_) => "child",
            Kind::Defer => "defer",
            Kind::Post => "post",
            Kind::Exit { .. } => "exit",
        }
    }
}

/// Payload handed to a source's callback alongside the source handle itself.
pub enum Payload<'a> {
    None,
    Io(IoEvents),
    Time(u64),
    Signal(&'a libc::signalfd_siginfo),
    Child(&'a libc::siginfo_t),
}

pub type Callback = Box<dyn FnMut(&Source, Payload) -> Result<()>>;
pub type PrepareCallback = Box<dyn FnMut(&Source) -> Result<()>>;

pub struct SourceData {
    pub kind: Kind,
    /// Always present: lets a source reach back into the loop's indices.
    pub loop_ref: Weak<RefCell<Inner>>,
    /// Present only for non-floating sources: keeps the owning loop alive
    /// for as long as the source itself is alive (see DESIGN.md).
    pub loop_strong: RefCell<Option<EventLoop>>,

    pub ext_refs: Cell<u32>,
    pub floating: Cell<bool>,
    pub attached: Cell<bool>,

    pub enabled: Cell<Enabled>,
    pub priority: Cell<i64>,
    pub description: RefCell<Option<String>>,
    pub pending: Cell<bool>,
    pub dispatching: Cell<bool>,
    pub pending_iteration: Cell<u64>,
    pub prepare_iteration: Cell<u64>,

    pub pending_index: Cell<usize>,
    pub prepare_index: Cell<usize>,

    pub prepare_cb: RefCell<Option<PrepareCallback>>,
    pub callback: RefCell<Option<Callback>>,
}

impl SourceData {
    pub fn time_data(&self) -> &TimeData {
        match &self.kind {
            Kind::Time(t) => t,
            _ => unreachable!("not a time source"),
        }
    }

    pub fn io_data(&self) -> &IoData {
        match &self.kind {
            Kind::Io(io) => io,
            _ => unreachable!("not an io source"),
        }
    }

    pub fn signal_data(&self) -> &SignalData {
        match &self.kind {
            Kind::Signal(s) => s,
            _ => unreachable!("not a signal source"),
        }
    }

    pub fn child_data(&self) -> &ChildData {
        match &self.kind {
            Kind::Child(c) => c,
            _ => unreachable!("not a child source"),
        }
    }

    pub fn exit_index_cell(&self) -> &Cell<usize> {
        match &self.kind {
            Kind::Exit { exit_index } => exit_index,
            _ => unreachable!("not an exit source"),
        }
    }

    pub fn new(kind: Kind, loop_ref: Weak<RefCell<Inner>>) -> Self {
        Self {
            kind,
            loop_ref,
            loop_strong: RefCell::new(None),
            ext_refs: Cell::new(1),
            floating: Cell::new(false),
            attached: Cell::new(true),
            enabled: Cell::new(Enabled::Off),
            priority: Cell::new(0),
            description: RefCell::new(None),
            pending: Cell::new(false),
            dispatching: Cell::new(false),
            pending_iteration: Cell::new(0),
            prepare_iteration: Cell::new(0),
            pending_index: Cell::new(NULL_INDEX),
            prepare_index: Cell::new(NULL_INDEX),
            prepare_cb: RefCell::new(None),
            callback: RefCell::new(None),
        }
    }
}

/// A handle to a registered event source.
///
/// Cloning a `Source` is the `ref` operation from the spec's public
/// contract; dropping the last clone of a non-floating source's external
/// handle is the `unref` operation, performed automatically (Rust's `Drop`
/// stands in for the explicit call the original API exposes; [`Source::unref`]
/// is also provided directly for parity, and is what the reentrant
/// drop-during-dispatch scenario in the spec exercises).
pub struct Source(pub(crate) Rc<RefCell<SourceData>>);

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.0.borrow();
        f.debug_struct("Source")
            .field("kind", &d.kind.name())
            .field("enabled", &d.enabled.get())
            .field("priority", &d.priority.get())
            .finish()
    }
}

impl Source {
    pub(crate) fn from_rc(rc: Rc<RefCell<SourceData>>) -> Self {
        rc.borrow().ext_refs.set(rc.borrow().ext_refs.get() + 1);
        Source(rc)
    }

    pub fn kind_name(&self) -> &'static str {
        self.0.borrow().kind.name()
    }

    pub fn description(&self) -> Option<String> {
        self.0.borrow().description.borrow().clone()
    }

    pub fn set_description(&self, description: impl Into<String>) {
        *self.0.borrow().description.borrow_mut() = Some(description.into());
    }

    pub fn priority(&self) -> i64 {
        self.0.borrow().priority.get()
    }

    pub fn enabled(&self) -> Enabled {
        self.0.borrow().enabled.get()
    }

    pub fn is_pending(&self) -> bool {
        self.0.borrow().pending.get()
    }

    /// True while this source's callback is currently executing, i.e. when
    /// called reentrantly from inside that same callback.
    pub fn is_dispatching(&self) -> bool {
        self.0.borrow().dispatching.get()
    }

    pub fn is_floating(&self) -> bool {
        self.0.borrow().floating.get()
    }

    /// Opts a source into (or out of) floating status after creation. A
    /// floating source is owned outright by the loop and survives this
    /// handle (and every clone of it) being dropped; see DESIGN.md.
    pub fn set_floating(&self, floating: bool) -> Result<()> {
        crate::event::source_set_floating(&self.0, floating)
    }

    /// Explicit reference-count bump, mirroring the spec's public `ref`.
    pub fn add_ref(&self) -> Source {
        Source::from_rc(Rc::clone(&self.0))
    }

    /// Explicit unref. See the struct docs for why this exists alongside `Drop`.
    pub fn unref(&self) {
        crate::event::unref_source(&self.0);
    }

    /// Detaches a floating source from its loop, freeing it. Non-floating
    /// sources are detached by driving their external references to zero
    /// instead (see DESIGN.md).
    pub fn remove(&self) -> Result<()> {
        crate::event::remove_source(&self.0)
    }

    pub fn set_enabled(&self, state: Enabled) -> Result<()> {
        crate::event::source_set_enabled(&self.0, state)
    }

    pub fn set_priority(&self, priority: i64) -> Result<()> {
        crate::event::source_set_priority(&self.0, priority)
    }

    pub fn set_prepare(&self, cb: Option<PrepareCallback>) {
        crate::event::source_set_prepare(&self.0, cb);
    }

    pub fn set_io_events(&self, events: IoEvents) -> Result<()> {
        crate::event::source_set_io_events(&self.0, events)
    }

    pub fn set_io_fd(&self, fd: std::os::fd::RawFd) -> Result<()> {
        crate::event::source_set_io_fd(&self.0, fd)
    }

    pub fn io_revents(&self) -> Result<IoEvents> {
        let data = self.0.borrow();
        if !data.pending.get() {
            return Err(Error::NoData("get_io_revents while not pending"));
        }
        match &data.kind {
            Kind::Io(io) => Ok(io.last_seen.get()),
            _ => Err(Error::InvalidArgument("not an io source")),
        }
    }

    pub fn set_time(&self, usec: u64) -> Result<()> {
        crate::event::source_set_time(&self.0, usec)
    }

    pub fn set_time_accuracy(&self, usec: u64) -> Result<()> {
        crate::event::source_set_time_accuracy(&self.0, usec)
    }
}

impl Clone for Source {
    fn clone(&self) -> Self {
        self.add_ref()
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        crate::event::unref_source(&self.0);
    }
}
