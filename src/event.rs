use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

use log::{debug, trace, warn};

use crate::clock::{self, Clock};
use crate::error::{Error, Result};
use crate::ffi::{syscall, Tag};
use crate::pqueue::{IndexedHeap, NULL_INDEX};
use crate::source::{
    Callback, ChildData, Enabled, IoData, IoEvents, Kind, Payload, PrepareCallback, Source,
    SourceData, SignalData, TimeData,
};
use crate::watchdog::Watchdog;

/// Run state of the loop, mirroring the public state machine in the spec.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    Initial,
    Armed,
    Pending,
    Running,
    Exiting,
    Finished,
}

struct ClockData {
    timer_fd: RefCell<Option<OwnedFd>>,
    earliest: RefCell<IndexedHeap<Rc<RefCell<SourceData>>>>,
    latest: RefCell<IndexedHeap<Rc<RefCell<SourceData>>>>,
    needs_rearm: Cell<bool>,
    armed_at_usec: Cell<Option<u64>>,
}

impl ClockData {
    fn new(_clock: Clock) -> Self {
        ClockData {
            timer_fd: RefCell::new(None),
            earliest: RefCell::new(IndexedHeap::new(
                move |a: &Rc<RefCell<SourceData>>, b: &Rc<RefCell<SourceData>>| earliest_cmp(a, b),
                |s: &Rc<RefCell<SourceData>>, i: usize| {
                    s.borrow().time_data().earliest_index.set(i)
                },
            )),
            latest: RefCell::new(IndexedHeap::new(
                move |a: &Rc<RefCell<SourceData>>, b: &Rc<RefCell<SourceData>>| latest_cmp(a, b),
                |s: &Rc<RefCell<SourceData>>, i: usize| s.borrow().time_data().latest_index.set(i),
            )),
            needs_rearm: Cell::new(false),
            armed_at_usec: Cell::new(None),
        }
    }

    fn tag(clock: Clock) -> Tag {
        match clock {
            Clock::Realtime => crate::ffi::TAG_CLOCK_REALTIME,
            Clock::Boottime => crate::ffi::TAG_CLOCK_BOOTTIME,
            Clock::Monotonic => crate::ffi::TAG_CLOCK_MONOTONIC,
            Clock::RealtimeAlarm => crate::ffi::TAG_CLOCK_REALTIME_ALARM,
            Clock::BoottimeAlarm => crate::ffi::TAG_CLOCK_BOOTTIME_ALARM,
        }
    }
}

fn enabled_rank(e: Enabled) -> u8 {
    if matches!(e, Enabled::Off) {
        1
    } else {
        0
    }
}

fn identity_cmp(a: &Rc<RefCell<SourceData>>, b: &Rc<RefCell<SourceData>>) -> Ordering {
    (Rc::as_ptr(a) as usize).cmp(&(Rc::as_ptr(b) as usize))
}

fn pending_cmp(a: &Rc<RefCell<SourceData>>, b: &Rc<RefCell<SourceData>>) -> Ordering {
    let (ea, pa, ia) = {
        let d = a.borrow();
        (d.enabled.get(), d.priority.get(), d.pending_iteration.get())
    };
    let (eb, pb, ib) = {
        let d = b.borrow();
        (d.enabled.get(), d.priority.get(), d.pending_iteration.get())
    };
    enabled_rank(ea)
        .cmp(&enabled_rank(eb))
        .then(pa.cmp(&pb))
        .then(ia.cmp(&ib))
        .then_with(|| identity_cmp(a, b))
}

fn prepare_cmp(a: &Rc<RefCell<SourceData>>, b: &Rc<RefCell<SourceData>>) -> Ordering {
    let (ea, pa, ia) = {
        let d = a.borrow();
        (d.enabled.get(), d.priority.get(), d.prepare_iteration.get())
    };
    let (eb, pb, ib) = {
        let d = b.borrow();
        (d.enabled.get(), d.priority.get(), d.prepare_iteration.get())
    };
    ia.cmp(&ib)
        .then_with(|| enabled_rank(ea).cmp(&enabled_rank(eb)))
        .then(pa.cmp(&pb))
        .then_with(|| identity_cmp(a, b))
}

fn exit_cmp(a: &Rc<RefCell<SourceData>>, b: &Rc<RefCell<SourceData>>) -> Ordering {
    let (ea, pa) = {
        let d = a.borrow();
        (d.enabled.get(), d.priority.get())
    };
    let (eb, pb) = {
        let d = b.borrow();
        (d.enabled.get(), d.priority.get())
    };
    enabled_rank(ea)
        .cmp(&enabled_rank(eb))
        .then(pa.cmp(&pb))
        .then_with(|| identity_cmp(a, b))
}

fn earliest_cmp(a: &Rc<RefCell<SourceData>>, b: &Rc<RefCell<SourceData>>) -> Ordering {
    let (ea, pend_a, na) = {
        let d = a.borrow();
        (d.enabled.get(), d.pending.get(), d.time_data().next_usec.get())
    };
    let (eb, pend_b, nb) = {
        let d = b.borrow();
        (d.enabled.get(), d.pending.get(), d.time_data().next_usec.get())
    };
    enabled_rank(ea)
        .cmp(&enabled_rank(eb))
        .then((pend_a as u8).cmp(&(pend_b as u8)))
        .then(na.cmp(&nb))
        .then_with(|| identity_cmp(a, b))
}

fn latest_cmp(a: &Rc<RefCell<SourceData>>, b: &Rc<RefCell<SourceData>>) -> Ordering {
    let (ea, pend_a, la) = {
        let d = a.borrow();
        let t = d.time_data();
        (d.enabled.get(), d.pending.get(), t.next_usec.get() + t.accuracy_usec.get())
    };
    let (eb, pend_b, lb) = {
        let d = b.borrow();
        let t = d.time_data();
        (d.enabled.get(), d.pending.get(), t.next_usec.get() + t.accuracy_usec.get())
    };
    enabled_rank(ea)
        .cmp(&enabled_rank(eb))
        .then((pend_a as u8).cmp(&(pend_b as u8)))
        .then(la.cmp(&lb))
        .then_with(|| identity_cmp(a, b))
}

fn pending_index_set(s: &Rc<RefCell<SourceData>>, i: usize) {
    s.borrow().pending_index.set(i);
}
fn prepare_index_set(s: &Rc<RefCell<SourceData>>, i: usize) {
    s.borrow().prepare_index.set(i);
}
fn exit_index_set(s: &Rc<RefCell<SourceData>>, i: usize) {
    s.borrow().exit_index_cell().set(i);
}

pub(crate) struct Inner {
    epoll: OwnedFd,
    clocks: [ClockData; 5],
    pending: RefCell<IndexedHeap<Rc<RefCell<SourceData>>>>,
    prepare: RefCell<IndexedHeap<Rc<RefCell<SourceData>>>>,
    exit_queue: RefCell<IndexedHeap<Rc<RefCell<SourceData>>>>,
    io_sources: RefCell<HashMap<RawFd, Rc<RefCell<SourceData>>>>,
    signal_sources: RefCell<HashMap<i32, Rc<RefCell<SourceData>>>>,
    child_sources: RefCell<HashMap<libc::pid_t, Rc<RefCell<SourceData>>>>,
    post_sources: RefCell<Vec<Rc<RefCell<SourceData>>>>,
    floating_sources: RefCell<Vec<Rc<RefCell<SourceData>>>>,
    signal_mask: Cell<libc::sigset_t>,
    signal_fd: RefCell<Option<OwnedFd>>,
    enabled_child_count: Cell<usize>,
    pending_iteration: Cell<u64>,
    prepare_iteration: Cell<u64>,
    state: Cell<State>,
    exit_requested: Cell<bool>,
    exit_code: Cell<i32>,
    pid_at_creation: libc::pid_t,
    watchdog: Watchdog,
    watchdog_fd: RefCell<Option<OwnedFd>>,
    self_weak: RefCell<Weak<RefCell<Inner>>>,
}

/// A single-threaded priority event loop multiplexing I/O readiness, timers
/// on five clocks, Unix signals and child-process exits behind one `epoll`
/// descriptor.
///
/// Cloning an `EventLoop` is cheap (it's a reference-counted handle onto the
/// shared state); the loop itself is torn down when the last clone and every
/// non-floating source attached to it are gone.
#[derive(Clone)]
pub struct EventLoop(pub(crate) Rc<RefCell<Inner>>);

thread_local! {
    static DEFAULT: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

impl EventLoop {
    pub fn new() -> Result<EventLoop> {
        let epoll = syscall::epoll_create1()?;
        let inner = Inner {
            epoll,
            clocks: Clock::ALL.map(ClockData::new),
            pending: RefCell::new(IndexedHeap::new(pending_cmp, pending_index_set)),
            prepare: RefCell::new(IndexedHeap::new(prepare_cmp, prepare_index_set)),
            exit_queue: RefCell::new(IndexedHeap::new(exit_cmp, exit_index_set)),
            io_sources: RefCell::new(HashMap::new()),
            signal_sources: RefCell::new(HashMap::new()),
            child_sources: RefCell::new(HashMap::new()),
            post_sources: RefCell::new(Vec::new()),
            floating_sources: RefCell::new(Vec::new()),
            signal_mask: Cell::new(syscall::sigemptyset()),
            signal_fd: RefCell::new(None),
            enabled_child_count: Cell::new(0),
            pending_iteration: Cell::new(0),
            prepare_iteration: Cell::new(0),
            state: Cell::new(State::Initial),
            exit_requested: Cell::new(false),
            exit_code: Cell::new(0),
            pid_at_creation: unsafe { libc::getpid() },
            watchdog: Watchdog::from_env(),
            watchdog_fd: RefCell::new(None),
            self_weak: RefCell::new(Weak::new()),
        };
        let rc = Rc::new(RefCell::new(inner));
        *rc.borrow().self_weak.borrow_mut() = Rc::downgrade(&rc);
        Ok(EventLoop(rc))
    }

    /// Returns this thread's lazily-created default loop, creating one on
    /// first call. Each thread gets its own (sources are never shared across
    /// threads), so subsequent calls on the same thread return the same handle.
    pub fn shared() -> Result<EventLoop> {
        DEFAULT.with(|slot| {
            if let Some(existing) = slot.borrow().as_ref() {
                return Ok(existing.clone());
            }
            let created = EventLoop::new()?;
            *slot.borrow_mut() = Some(created.clone());
            Ok(created)
        })
    }

    pub fn get_fd(&self) -> RawFd {
        self.0.borrow().epoll.as_raw_fd()
    }

    pub fn get_state(&self) -> State {
        self.0.borrow().state.get()
    }

    pub fn get_exit_code(&self) -> Option<i32> {
        let inner = self.0.borrow();
        if inner.exit_requested.get() {
            Some(inner.exit_code.get())
        } else {
            None
        }
    }

    pub fn get_tid(&self) -> libc::pid_t {
        self.0.borrow().pid_at_creation
    }

    pub fn now(&self, clock: Clock) -> Result<u64> {
        Ok(syscall::now(clock.as_libc())?.as_micros() as u64)
    }

    /// Mirrors `sd_event_get_watchdog`: whether the caller has turned
    /// watchdog notification on.
    pub fn get_watchdog(&self) -> bool {
        self.0.borrow().watchdog.is_active()
    }

    /// Mirrors `sd_event_set_watchdog`: turns periodic `WATCHDOG=1`
    /// notification on or off. Enabling pings immediately, arms the
    /// watchdog timer and registers it in the readiness multiplexer;
    /// disabling tears both down. Returns the resulting state, which is
    /// `false` on enable if the host runtime never advertised a watchdog
    /// period (`WATCHDOG_USEC`/`NOTIFY_SOCKET`).
    pub fn set_watchdog(&self, enable: bool) -> Result<bool> {
        self.check_process()?;
        let currently = self.0.borrow().watchdog.is_active();
        if currently == enable {
            return Ok(currently);
        }
        if enable {
            if !self.0.borrow().watchdog.available() {
                return Ok(false);
            }
            let now = self.now(Clock::Monotonic)?;
            self.0.borrow().watchdog.set_active(true);
            self.0.borrow().watchdog.ping(now).map_err(Error::Kernel)?;
            let fd = syscall::timerfd_create(libc::CLOCK_MONOTONIC)?;
            syscall::epoll_add(self.epoll_fd(), fd.as_raw_fd(), crate::ffi::TAG_WATCHDOG, libc::EPOLLIN as u32)?;
            *self.0.borrow().watchdog_fd.borrow_mut() = Some(fd);
            self.rearm_watchdog()?;
        } else {
            let fd = self.0.borrow().watchdog_fd.borrow_mut().take();
            if let Some(fd) = fd {
                let _ = syscall::epoll_del(self.epoll_fd(), fd.as_raw_fd());
            }
            self.0.borrow().watchdog.set_active(false);
        }
        Ok(self.0.borrow().watchdog.is_active())
    }

    /// Arms the watchdog timer to fire somewhere in the `[W/2, 3W/4]` window
    /// past the last ping, coalesced the same way clock sources are.
    fn rearm_watchdog(&self) -> Result<()> {
        let now = self.now(Clock::Monotonic)?;
        let Some((earliest, latest)) = self.0.borrow().watchdog.fire_window(now) else {
            return Ok(());
        };
        let perturb = clock::derive_perturb();
        let at = clock::coalesce(earliest, latest, perturb);
        let inner = self.0.borrow();
        let fd = inner.watchdog_fd.borrow();
        let Some(fd) = fd.as_ref() else { return Ok(()) };
        syscall::timerfd_settime_absolute(fd.as_fd(), at * 1_000)?;
        Ok(())
    }

    fn handle_watchdog_ready(&self) -> Result<()> {
        {
            let inner = self.0.borrow();
            let fd = inner.watchdog_fd.borrow();
            if let Some(fd) = fd.as_ref() {
                let _ = syscall::timerfd_read(fd.as_fd());
            }
        }
        let now = self.now(Clock::Monotonic)?;
        self.0.borrow().watchdog.ping(now).map_err(Error::Kernel)?;
        self.rearm_watchdog()
    }

    /// Number of sources currently queued for dispatch. Mostly useful for tests.
    pub fn pending_count(&self) -> usize {
        self.0.borrow().pending.borrow().len()
    }

    pub fn exit(&self, code: i32) -> Result<()> {
        self.check_process()?;
        let inner = self.0.borrow();
        inner.exit_requested.set(true);
        inner.exit_code.set(code);
        inner.state.set(State::Exiting);
        Ok(())
    }

    fn check_process(&self) -> Result<()> {
        if unsafe { libc::getpid() } != self.0.borrow().pid_at_creation {
            return Err(Error::WrongProcess);
        }
        Ok(())
    }

    fn new_source(&self, kind: Kind, enabled: Enabled, floating: bool) -> Rc<RefCell<SourceData>> {
        let data = SourceData::new(kind, Rc::downgrade(&self.0));
        data.enabled.set(enabled);
        data.floating.set(floating);
        if !floating {
            *data.loop_strong.borrow_mut() = Some(self.clone());
        }
        Rc::new(RefCell::new(data))
    }

    fn attach_floating(&self, rc: &Rc<RefCell<SourceData>>) {
        self.0.borrow().floating_sources.borrow_mut().push(Rc::clone(rc));
    }

    pub fn add_io(
        &self,
        fd: RawFd,
        events: IoEvents,
        callback: Callback,
    ) -> Result<Source> {
        self.check_process()?;
        if !events.is_subset_of_valid() {
            return Err(Error::InvalidArgument("io events contain unknown bits"));
        }
        if self.0.borrow().io_sources.borrow().contains_key(&fd) {
            return Err(Error::Busy("fd already registered on this loop"));
        }
        let rc = self.new_source(
            Kind::Io(IoData {
                fd: Cell::new(fd),
                requested: Cell::new(events),
                last_seen: Cell::new(IoEvents::empty()),
                registered: Cell::new(false),
            }),
            Enabled::On,
            false,
        );
        *rc.borrow().callback.borrow_mut() = Some(callback);
        syscall::epoll_add(self.epoll_fd(), fd, fd as Tag, events.0)?;
        rc.borrow().io_data().registered.set(true);
        self.0.borrow().io_sources.borrow_mut().insert(fd, Rc::clone(&rc));
        Ok(Source::from_rc(rc))
    }

    pub fn add_time(
        &self,
        clock: Clock,
        usec: u64,
        accuracy_usec: u64,
        callback: Callback,
    ) -> Result<Source> {
        self.check_process()?;
        let accuracy = if accuracy_usec == 0 {
            crate::clock::DEFAULT_ACCURACY_USEC
        } else {
            accuracy_usec
        };
        let rc = self.new_source(
            Kind::Time(TimeData {
                clock,
                next_usec: Cell::new(usec),
                accuracy_usec: Cell::new(accuracy),
                earliest_index: Cell::new(NULL_INDEX),
                latest_index: Cell::new(NULL_INDEX),
            }),
            Enabled::OneShot,
            false,
        );
        *rc.borrow().callback.borrow_mut() = Some(callback);
        let inner = self.0.borrow();
        let cd = &inner.clocks[clock.index()];
        cd.earliest.borrow_mut().put(Rc::clone(&rc));
        cd.latest.borrow_mut().put(Rc::clone(&rc));
        cd.needs_rearm.set(true);
        drop(inner);
        Ok(Source::from_rc(rc))
    }

    pub fn add_signal(&self, signo: i32, callback: Callback) -> Result<Source> {
        self.check_process()?;
        if self.0.borrow().signal_sources.borrow().contains_key(&signo) {
            return Err(Error::Busy("signal already registered on this loop"));
        }
        self.ensure_signal_blocked(signo)?;
        let rc = self.new_source(
            Kind::Signal(SignalData {
                signo: Cell::new(signo),
                last_info: RefCell::new(None),
            }),
            Enabled::On,
            false,
        );
        *rc.borrow().callback.borrow_mut() = Some(callback);
        self.0.borrow().signal_sources.borrow_mut().insert(signo, Rc::clone(&rc));
        Ok(Source::from_rc(rc))
    }

    pub fn add_child(&self, pid: libc::pid_t, options: i32, callback: Callback) -> Result<Source> {
        self.check_process()?;
        if pid <= 1 {
            return Err(Error::InvalidArgument("child pid must be > 1"));
        }
        const VALID: i32 = libc::WEXITED | libc::WSTOPPED | libc::WCONTINUED;
        if options == 0 || options & !VALID != 0 {
            return Err(Error::InvalidArgument("invalid waitid options"));
        }
        if self.0.borrow().child_sources.borrow().contains_key(&pid) {
            return Err(Error::Busy("pid already registered on this loop"));
        }
        self.ensure_signal_blocked(libc::SIGCHLD)?;
        {
            let inner = self.0.borrow();
            inner.enabled_child_count.set(inner.enabled_child_count.get() + 1);
        }
        let rc = self.new_source(
            Kind::Child(ChildData {
                pid: Cell::new(pid),
                wait_options: Cell::new(options),
                last_status: RefCell::new(None),
                needs_reap: Cell::new(false),
            }),
            Enabled::OneShot,
            false,
        );
        *rc.borrow().callback.borrow_mut() = Some(callback);
        self.0.borrow().child_sources.borrow_mut().insert(pid, Rc::clone(&rc));
        Ok(Source::from_rc(rc))
    }

    pub fn add_defer(&self, callback: Callback) -> Result<Source> {
        self.check_process()?;
        let rc = self.new_source(Kind::Defer, Enabled::OneShot, false);
        *rc.borrow().callback.borrow_mut() = Some(callback);
        self.mark_pending(&rc);
        Ok(Source::from_rc(rc))
    }

    pub fn add_post(&self, callback: Callback) -> Result<Source> {
        self.check_process()?;
        let rc = self.new_source(Kind::Post, Enabled::On, false);
        *rc.borrow().callback.borrow_mut() = Some(callback);
        self.0.borrow().post_sources.borrow_mut().push(Rc::clone(&rc));
        Ok(Source::from_rc(rc))
    }

    pub fn add_exit(&self, callback: Callback) -> Result<Source> {
        self.check_process()?;
        let rc = self.new_source(
            Kind::Exit {
                exit_index: Cell::new(NULL_INDEX),
            },
            Enabled::OneShot,
            false,
        );
        *rc.borrow().callback.borrow_mut() = Some(callback);
        self.0.borrow().exit_queue.borrow_mut().put(Rc::clone(&rc));
        Ok(Source::from_rc(rc))
    }

    fn epoll_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: borrowed only for the duration of this call, the epoll fd
        // outlives every source registered against it.
        unsafe { BorrowedFd::borrow_raw(self.0.borrow().epoll.as_raw_fd()) }
    }

    /// Requires `signo` to already be blocked in the process's own signal
    /// mask: blocking is process-wide and would step on other threads'
    /// dispositions if the loop did it unasked, so the caller must do it
    /// (typically once, at startup, via `libc::sigprocmask`).
    fn ensure_signal_blocked(&self, signo: i32) -> Result<()> {
        let current = syscall::sigprocmask_current()?;
        if !syscall::sigismember(&current, signo) {
            return Err(Error::Busy(
                "signal must be blocked via sigprocmask before registering a source for it",
            ));
        }
        self.add_signal_to_mask(signo)
    }

    /// Whether anything still needs `signo` delivered via `signalfd`: an
    /// enabled signal source claiming it (other than `exclude`, which is
    /// mid-transition and hasn't had its own `enabled` field updated yet), or,
    /// for `SIGCHLD`, at least one enabled child source.
    fn need_signal(&self, signo: i32, exclude: Option<&Rc<RefCell<SourceData>>>) -> bool {
        let inner = self.0.borrow();
        let via_signal = inner
            .signal_sources
            .borrow()
            .get(&signo)
            .map(|s| {
                let excluded = exclude.is_some_and(|e| Rc::ptr_eq(e, s));
                !excluded && s.borrow().enabled.get().is_enabled()
            })
            .unwrap_or(false);
        let via_child = signo == libc::SIGCHLD && inner.enabled_child_count.get() > 0;
        via_signal || via_child
    }

    /// Adds `signo` to the managed signal set, creating the `signalfd` if this
    /// is the first signal tracked, or rebinding it in place otherwise.
    /// Idempotent.
    fn add_signal_to_mask(&self, signo: i32) -> Result<()> {
        let inner = self.0.borrow();
        let mut mask = inner.signal_mask.get();
        if syscall::sigismember(&mask, signo) {
            return Ok(());
        }
        syscall::sigaddset(&mut mask, signo);
        let existing_fd = inner.signal_fd.borrow().as_ref().map(|f| f.as_raw_fd());
        match existing_fd {
            Some(fd) => syscall::signalfd_update(fd, &mask)?,
            None => {
                let new_fd = syscall::signalfd_create(&mask)?;
                syscall::epoll_add(self.epoll_fd(), new_fd.as_raw_fd(), crate::ffi::TAG_SIGNAL, libc::EPOLLIN as u32)?;
                *inner.signal_fd.borrow_mut() = Some(new_fd);
            }
        }
        inner.signal_mask.set(mask);
        Ok(())
    }

    /// Removes `signo` from the managed signal set and rebinds the
    /// `signalfd` in place. No-op if `signo` isn't currently tracked.
    fn remove_signal_from_mask(&self, signo: i32) {
        let inner = self.0.borrow();
        let mut mask = inner.signal_mask.get();
        if !syscall::sigismember(&mask, signo) {
            return;
        }
        syscall::sigdelset(&mut mask, signo);
        inner.signal_mask.set(mask);
        let fd = inner.signal_fd.borrow().as_ref().map(|f| f.as_raw_fd());
        if let Some(fd) = fd {
            let _ = syscall::signalfd_update(fd, &mask);
        }
    }

    fn mark_pending(&self, rc: &Rc<RefCell<SourceData>>) {
        let already = rc.borrow().pending.get();
        if already {
            return;
        }
        let inner = self.0.borrow();
        let iter = inner.pending_iteration.get();
        {
            let d = rc.borrow();
            d.pending.set(true);
            d.pending_iteration.set(iter);
        }
        inner.pending.borrow_mut().put(Rc::clone(rc));
    }

    /// Runs every registered prepare callback, then rearms any clock whose
    /// queues changed since the last rearm.
    pub fn prepare(&self) -> Result<()> {
        self.check_process()?;
        self.0.borrow().prepare_iteration.set(self.0.borrow().prepare_iteration.get() + 1);
        let snapshot: Vec<Rc<RefCell<SourceData>>> = {
            let inner = self.0.borrow();
            let items: Vec<_> = inner.prepare.borrow().iter().cloned().collect();
            items
        };
        for rc in snapshot {
            if !rc.borrow().enabled.get().is_enabled() {
                continue;
            }
            let cb = rc.borrow().prepare_cb.borrow_mut().take();
            if let Some(mut cb) = cb {
                let source = Source::from_rc(Rc::clone(&rc));
                let result = cb(&source);
                if rc.borrow().prepare_cb.borrow().is_none() {
                    *rc.borrow().prepare_cb.borrow_mut() = Some(cb);
                }
                if let Err(err) = result {
                    warn!("prepare callback failed: {err}");
                }
            }
        }
        for clock in Clock::ALL {
            self.rearm_clock(clock)?;
        }
        self.0.borrow().state.set(if self.0.borrow().pending.borrow().is_empty() {
            State::Armed
        } else {
            State::Pending
        });
        Ok(())
    }

    fn rearm_clock(&self, clock: Clock) -> Result<()> {
        let inner = self.0.borrow();
        let cd = &inner.clocks[clock.index()];
        if !cd.needs_rearm.get() {
            return Ok(());
        }
        let earliest = cd.earliest.borrow().peek().map(|s| s.borrow().time_data().next_usec.get());
        let latest = cd
            .latest
            .borrow()
            .peek()
            .map(|s| {
                let d = s.borrow();
                let t = d.time_data();
                t.next_usec.get() + t.accuracy_usec.get()
            });
        let (Some(earliest), Some(latest)) = (earliest, latest) else {
            cd.needs_rearm.set(false);
            return Ok(());
        };
        let perturb = clock::derive_perturb();
        let at = clock::coalesce(earliest, latest, perturb);
        if cd.timer_fd.borrow().is_none() {
            let fd = syscall::timerfd_create(clock.as_libc())?;
            syscall::epoll_add(self.epoll_fd(), fd.as_raw_fd(), ClockData::tag(clock), libc::EPOLLIN as u32)?;
            *cd.timer_fd.borrow_mut() = Some(fd);
        }
        let fd = cd.timer_fd.borrow();
        let fd = fd.as_ref().unwrap();
        syscall::timerfd_settime_absolute(fd.as_fd(), at * 1_000)?;
        cd.armed_at_usec.set(Some(at));
        cd.needs_rearm.set(false);
        Ok(())
    }

    fn timeout_ms(&self) -> i32 {
        let inner = self.0.borrow();
        if !inner.pending.borrow().is_empty() || inner.exit_requested.get() {
            return 0;
        }
        let mut min_wait: Option<u64> = None;
        for clock in Clock::ALL {
            if let Some(at) = inner.clocks[clock.index()].armed_at_usec.get() {
                if let Ok(now) = syscall::now(clock.as_libc()) {
                    let now_usec = now.as_micros() as u64;
                    let remaining = at.saturating_sub(now_usec);
                    min_wait = Some(min_wait.map_or(remaining, |m: u64| m.min(remaining)));
                }
            }
        }
        match min_wait {
            Some(usec) => usec.div_ceil(1000).min(i32::MAX as u64) as i32,
            None => -1,
        }
    }

    /// Blocks in `epoll_wait` for at most the next scheduled deadline and
    /// routes whatever became ready into the pending queue.
    pub fn wait(&self) -> Result<()> {
        self.check_process()?;
        let timeout = self.timeout_ms();
        let epoll = self.epoll_fd();
        let mut buf = vec![libc::epoll_event { events: 0, u64: 0 }; 64];
        let ready = match syscall::epoll_wait(epoll, &mut buf, timeout) {
            Ok(r) => r,
            // On EINTR the wait is treated as having observed nothing; state
            // is left exactly as `prepare()` set it.
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => return Ok(()),
            Err(e) => return Err(Error::Kernel(e)),
        };
        for r in ready {
            self.handle_ready(r.tag, r.events)?;
        }
        if !self.0.borrow().exit_requested.get() {
            let has_pending = !self.0.borrow().pending.borrow().is_empty();
            self.0.borrow().state.set(if has_pending { State::Pending } else { State::Initial });
        }
        Ok(())
    }

    fn handle_ready(&self, tag: Tag, events: u32) -> Result<()> {
        match tag {
            crate::ffi::TAG_SIGNAL => self.handle_signal_ready(),
            crate::ffi::TAG_WATCHDOG => self.handle_watchdog_ready(),
            crate::ffi::TAG_CLOCK_REALTIME => self.handle_clock_ready(Clock::Realtime),
            crate::ffi::TAG_CLOCK_BOOTTIME => self.handle_clock_ready(Clock::Boottime),
            crate::ffi::TAG_CLOCK_MONOTONIC => self.handle_clock_ready(Clock::Monotonic),
            crate::ffi::TAG_CLOCK_REALTIME_ALARM => self.handle_clock_ready(Clock::RealtimeAlarm),
            crate::ffi::TAG_CLOCK_BOOTTIME_ALARM => self.handle_clock_ready(Clock::BoottimeAlarm),
            fd => self.handle_io_ready(fd as RawFd, events),
        }
    }

    fn handle_io_ready(&self, fd: RawFd, events: u32) -> Result<()> {
        let rc = { self.0.borrow().io_sources.borrow().get(&fd).cloned() };
        if let Some(rc) = rc {
            rc.borrow().io_data().last_seen.set(IoEvents(events));
            self.mark_pending(&rc);
        }
        Ok(())
    }

    fn handle_clock_ready(&self, clock: Clock) -> Result<()> {
        let inner = self.0.borrow();
        let cd = &inner.clocks[clock.index()];
        if let Some(fd) = cd.timer_fd.borrow().as_ref() {
            let _ = syscall::timerfd_read(fd.as_fd());
        }
        let now_usec = syscall::now(clock.as_libc())?.as_micros() as u64;
        drop(inner);
        loop {
            let candidate = {
                let inner = self.0.borrow();
                let found = inner.clocks[clock.index()]
                    .earliest
                    .borrow()
                    .peek()
                    .filter(|s| s.borrow().time_data().next_usec.get() <= now_usec)
                    .cloned();
                found
            };
            let Some(rc) = candidate else { break };
            {
                let inner = self.0.borrow();
                let cd = &inner.clocks[clock.index()];
                let idx = rc.borrow().time_data().earliest_index.get();
                if idx != NULL_INDEX {
                    cd.earliest.borrow_mut().remove_at(idx);
                }
                let idx = rc.borrow().time_data().latest_index.get();
                if idx != NULL_INDEX {
                    cd.latest.borrow_mut().remove_at(idx);
                }
                cd.needs_rearm.set(true);
            }
            self.mark_pending(&rc);
        }
        Ok(())
    }

    fn handle_signal_ready(&self) -> Result<()> {
        let fd_raw = {
            self.0
                .borrow()
                .signal_fd
                .borrow()
                .as_ref()
                .map(|f| f.as_raw_fd())
        };
        let Some(fd_raw) = fd_raw else { return Ok(()) };
        let fd = unsafe { BorrowedFd::borrow_raw(fd_raw) };
        let infos = syscall::signalfd_read(fd)?;
        for info in infos {
            if info.ssi_signo as i32 == libc::SIGCHLD {
                self.reap_zombies()?;
            } else {
                let rc = {
                    self.0
                        .borrow()
                        .signal_sources
                        .borrow()
                        .get(&(info.ssi_signo as i32))
                        .cloned()
                };
                if let Some(rc) = rc {
                    *rc.borrow().signal_data().last_info.borrow_mut() = Some(info);
                    self.mark_pending(&rc);
                }
            }
        }
        Ok(())
    }

    fn reap_zombies(&self) -> Result<()> {
        let children: Vec<Rc<RefCell<SourceData>>> = self
            .0
            .borrow()
            .child_sources
            .borrow()
            .values()
            .cloned()
            .collect();
        for rc in children {
            let (pid, options) = {
                let d = rc.borrow();
                let c = d.child_data();
                (c.pid.get(), c.wait_options.get())
            };
            if let Some(info) = syscall::waitid_probe(pid, options, true)? {
                {
                    let d = rc.borrow();
                    let c = d.child_data();
                    *c.last_status.borrow_mut() = Some(info);
                    c.needs_reap.set(true);
                }
                self.mark_pending(&rc);
            }
        }
        Ok(())
    }

    /// Dispatches exactly one ready source, returning whether anything ran.
    pub fn dispatch(&self) -> Result<bool> {
        self.check_process()?;
        let exit_requested = self.0.borrow().exit_requested.get();
        let popped = if exit_requested && self.0.borrow().pending.borrow().is_empty() {
            let rc = self.0.borrow().exit_queue.borrow_mut().pop();
            rc
        } else {
            self.0.borrow().pending.borrow_mut().pop()
        };
        let Some(rc) = popped else { return Ok(false) };
        self.0.borrow().state.set(State::Running);
        self.0.borrow().pending_iteration.set(self.0.borrow().pending_iteration.get() + 1);
        {
            let d = rc.borrow();
            d.pending.set(false);
        }

        let is_post = matches!(rc.borrow().kind, Kind::Post);
        if !is_post {
            let posts: Vec<Rc<RefCell<SourceData>>> = self
                .0
                .borrow()
                .post_sources
                .borrow()
                .iter()
                .filter(|p| p.borrow().enabled.get().is_enabled())
                .cloned()
                .collect();
            for p in posts {
                self.mark_pending(&p);
            }
        }

        if rc.borrow().enabled.get() == Enabled::OneShot {
            self.disable_kernel_registration(&rc);
            rc.borrow().enabled.set(Enabled::Off);
        }

        enum Snapshot {
            None,
            Io(IoEvents),
            Time(u64),
            Signal(libc::signalfd_siginfo),
            Child(libc::siginfo_t),
        }
        let snapshot = {
            let d = rc.borrow();
            match &d.kind {
                Kind::Io(io) => Snapshot::Io(io.last_seen.get()),
                Kind::Time(t) => Snapshot::Time(t.next_usec.get()),
                Kind::Signal(s) => s
                    .last_info
                    .borrow()
                    .as_ref()
                    .map(|i| Snapshot::Signal(*i))
                    .unwrap_or(Snapshot::None),
                Kind::Child(c) => c
                    .last_status
                    .borrow()
                    .as_ref()
                    .map(|i| Snapshot::Child(*i))
                    .unwrap_or(Snapshot::None),
                Kind::Defer | Kind::Post | Kind::Exit { .. } => Snapshot::None,
            }
        };

        let cb = rc.borrow().callback.borrow_mut().take();
        if let Some(mut cb) = cb {
            rc.borrow().dispatching.set(true);
            let source = Source::from_rc(Rc::clone(&rc));
            let payload = match &snapshot {
                Snapshot::None => Payload::None,
                Snapshot::Io(e) => Payload::Io(*e),
                Snapshot::Time(t) => Payload::Time(*t),
                Snapshot::Signal(info) => Payload::Signal(info),
                Snapshot::Child(info) => Payload::Child(info),
            };
            let result = cb(&source, payload);
            rc.borrow().dispatching.set(false);
            // A self-mutating callback may install a new callback itself; only
            // restore the original if the slot is still empty.
            if rc.borrow().callback.borrow().is_none() {
                *rc.borrow().callback.borrow_mut() = Some(cb);
            }
            if let Err(err) = result {
                warn!("{} callback failed, disabling source: {err}", rc.borrow().kind.name());
                self.disable_kernel_registration(&rc);
                rc.borrow().enabled.set(Enabled::Off);
            }
        }

        let needs_reap = matches!(&rc.borrow().kind, Kind::Child(c) if c.needs_reap.get());
        if needs_reap {
            let (pid, options) = {
                let d = rc.borrow();
                let c = d.child_data();
                (c.pid.get(), c.wait_options.get())
            };
            let _ = syscall::waitid_probe(pid, options, false);
            rc.borrow().child_data().needs_reap.set(false);
        }

        trace!("dispatched {} source", rc.borrow().kind.name());
        self.0.borrow().state.set(if exit_requested { State::Exiting } else { State::Initial });
        Ok(true)
    }

    /// Tears down whatever kernel-side plumbing backs `rc`, expected to be
    /// called while `rc`'s own `enabled` field still holds its pre-disable
    /// value (signal/child bookkeeping reads it to decide whether anything
    /// *else* still needs the same signal, excluding `rc` itself).
    fn disable_kernel_registration(&self, rc: &Rc<RefCell<SourceData>>) {
        let d = rc.borrow();
        match &d.kind {
            Kind::Io(io) if io.registered.get() => {
                let _ = syscall::epoll_del(self.epoll_fd(), io.fd.get());
                io.registered.set(false);
            }
            Kind::Io(_) => {}
            Kind::Time(_) => {
                drop(d);
                let inner = self.0.borrow();
                let clock = rc.borrow().time_data().clock;
                let cd = &inner.clocks[clock.index()];
                let ei = rc.borrow().time_data().earliest_index.get();
                if ei != NULL_INDEX {
                    cd.earliest.borrow_mut().remove_at(ei);
                }
                let li = rc.borrow().time_data().latest_index.get();
                if li != NULL_INDEX {
                    cd.latest.borrow_mut().remove_at(li);
                }
            }
            Kind::Signal(s) => {
                let signo = s.signo.get();
                drop(d);
                if !self.need_signal(signo, Some(rc)) {
                    self.remove_signal_from_mask(signo);
                }
            }
            Kind::Child(_) => {
                let was_enabled = d.enabled.get() != Enabled::Off;
                drop(d);
                if was_enabled {
                    let inner = self.0.borrow();
                    inner
                        .enabled_child_count
                        .set(inner.enabled_child_count.get().saturating_sub(1));
                }
                if !self.need_signal(libc::SIGCHLD, None) {
                    self.remove_signal_from_mask(libc::SIGCHLD);
                }
            }
            _ => {}
        }
    }

    /// Runs the loop until `exit()` has been called and every exit-priority
    /// source has been dispatched, returning the exit code.
    pub fn run(&self) -> Result<i32> {
        self.check_process()?;
        loop {
            self.prepare()?;
            let finished = {
                let inner = self.0.borrow();
                inner.exit_requested.get()
                    && inner.pending.borrow().is_empty()
                    && inner.exit_queue.borrow().is_empty()
            };
            if finished {
                self.0.borrow().state.set(State::Finished);
                break;
            }
            self.wait()?;
            while self.dispatch()? {}
        }
        Ok(self.0.borrow().exit_code.get())
    }
}

pub(crate) fn unref_source(rc: &Rc<RefCell<SourceData>>) {
    let new_count = {
        let d = rc.borrow();
        let n = d.ext_refs.get().saturating_sub(1);
        d.ext_refs.set(n);
        n
    };
    if new_count == 0 && !rc.borrow().floating.get() {
        teardown(rc);
        *rc.borrow().loop_strong.borrow_mut() = None;
    }
}

/// Converts a source between floating and non-floating after creation,
/// mirroring `sd_event_source_set_floating`. Going floating hands ownership
/// to the loop's own registry and drops the strong back-reference to the
/// loop; going non-floating does the reverse.
pub(crate) fn source_set_floating(rc: &Rc<RefCell<SourceData>>, floating: bool) -> Result<()> {
    let was_floating = rc.borrow().floating.get();
    if was_floating == floating {
        return Ok(());
    }
    let inner_rc = rc.borrow().loop_ref.upgrade().ok_or(Error::Stale)?;
    let ev = EventLoop(inner_rc);
    rc.borrow().floating.set(floating);
    if floating {
        *rc.borrow().loop_strong.borrow_mut() = None;
        ev.attach_floating(rc);
    } else {
        ev.0.borrow().floating_sources.borrow_mut().retain(|s| !Rc::ptr_eq(s, rc));
        *rc.borrow().loop_strong.borrow_mut() = Some(ev);
    }
    Ok(())
}

pub(crate) fn remove_source(rc: &Rc<RefCell<SourceData>>) -> Result<()> {
    teardown(rc);
    if let Some(inner) = rc.borrow().loop_ref.upgrade() {
        inner
            .borrow()
            .floating_sources
            .borrow_mut()
            .retain(|s| !Rc::ptr_eq(s, rc));
    }
    rc.borrow().attached.set(false);
    Ok(())
}

fn teardown(rc: &Rc<RefCell<SourceData>>) {
    let Some(inner_rc) = rc.borrow().loop_ref.upgrade() else {
        return;
    };
    let ev = EventLoop(inner_rc);
    ev.disable_kernel_registration(rc);
    let inner = ev.0.borrow();
    let kind_is_io = matches!(rc.borrow().kind, Kind::Io(_));
    if kind_is_io {
        let fd = rc.borrow().io_data().fd.get();
        inner.io_sources.borrow_mut().remove(&fd);
    }
    if matches!(rc.borrow().kind, Kind::Signal(_)) {
        let signo = rc.borrow().signal_data().signo.get();
        inner.signal_sources.borrow_mut().remove(&signo);
    }
    if matches!(rc.borrow().kind, Kind::Child(_)) {
        let pid = rc.borrow().child_data().pid.get();
        inner.child_sources.borrow_mut().remove(&pid);
    }
    inner.post_sources.borrow_mut().retain(|s| !Rc::ptr_eq(s, rc));
    let pidx = rc.borrow().pending_index.get();
    if pidx != NULL_INDEX {
        inner.pending.borrow_mut().remove_at(pidx);
    }
    let prepidx = rc.borrow().prepare_index.get();
    if prepidx != NULL_INDEX {
        inner.prepare.borrow_mut().remove_at(prepidx);
    }
    if matches!(rc.borrow().kind, Kind::Exit { .. }) {
        let eidx = rc.borrow().exit_index_cell().get();
        if eidx != NULL_INDEX {
            inner.exit_queue.borrow_mut().remove_at(eidx);
        }
    }
    rc.borrow().attached.set(false);
}

/// Mirrors `sd_event_source_set_enabled`'s per-kind (dis)installation and the
/// unconditional `pending`/`prepare` reshuffle that follows every transition,
/// since both comparators rank by `enabled` first.
pub(crate) fn source_set_enabled(rc: &Rc<RefCell<SourceData>>, state: Enabled) -> Result<()> {
    let old = rc.borrow().enabled.get();
    if old == state {
        return Ok(());
    }
    let Some(inner_rc) = rc.borrow().loop_ref.upgrade() else {
        rc.borrow().enabled.set(state);
        return Ok(());
    };
    let ev = EventLoop(inner_rc);

    if state == Enabled::Off {
        ev.disable_kernel_registration(rc);
        rc.borrow().enabled.set(Enabled::Off);
    } else if old == Enabled::Off {
        let io = match &rc.borrow().kind {
            Kind::Io(io) => Some((io.fd.get(), io.requested.get(), io.registered.get())),
            _ => None,
        };
        if let Some((fd, events, registered)) = io {
            if !registered {
                syscall::epoll_add(ev.epoll_fd(), fd, fd as Tag, events.0)?;
                rc.borrow().io_data().registered.set(true);
            }
        }
        if matches!(rc.borrow().kind, Kind::Time(_)) {
            let inner = ev.0.borrow();
            let clock = rc.borrow().time_data().clock;
            let cd = &inner.clocks[clock.index()];
            if rc.borrow().time_data().earliest_index.get() == NULL_INDEX {
                cd.earliest.borrow_mut().put(Rc::clone(rc));
                cd.latest.borrow_mut().put(Rc::clone(rc));
            }
            cd.needs_rearm.set(true);
        }
        let signal_signo = match &rc.borrow().kind {
            Kind::Signal(s) => Some(s.signo.get()),
            _ => None,
        };
        if let Some(signo) = signal_signo {
            ev.add_signal_to_mask(signo)?;
        }
        if matches!(rc.borrow().kind, Kind::Child(_)) {
            {
                let inner = ev.0.borrow();
                inner.enabled_child_count.set(inner.enabled_child_count.get() + 1);
            }
            ev.add_signal_to_mask(libc::SIGCHLD)?;
        }
        rc.borrow().enabled.set(state);
    } else {
        // Neither end is `Off` (e.g. `On` <-> `OneShot`): already installed,
        // nothing kernel-side to touch.
        rc.borrow().enabled.set(state);
    }

    let inner = ev.0.borrow();
    let idx = rc.borrow().pending_index.get();
    if idx != NULL_INDEX {
        inner.pending.borrow_mut().reshuffle(idx);
    }
    let idx = rc.borrow().prepare_index.get();
    if idx != NULL_INDEX {
        inner.prepare.borrow_mut().reshuffle(idx);
    }
    Ok(())
}

pub(crate) fn source_set_priority(rc: &Rc<RefCell<SourceData>>, priority: i64) -> Result<()> {
    rc.borrow().priority.set(priority);
    if let Some(inner_rc) = rc.borrow().loop_ref.upgrade() {
        let inner = inner_rc.borrow();
        let idx = rc.borrow().pending_index.get();
        if idx != NULL_INDEX {
            inner.pending.borrow_mut().reshuffle(idx);
        }
        let idx = rc.borrow().prepare_index.get();
        if idx != NULL_INDEX {
            inner.prepare.borrow_mut().reshuffle(idx);
        }
        if matches!(rc.borrow().kind, Kind::Exit { .. }) {
            let idx = rc.borrow().exit_index_cell().get();
            if idx != NULL_INDEX {
                inner.exit_queue.borrow_mut().reshuffle(idx);
            }
        }
    }
    Ok(())
}

pub(crate) fn source_set_prepare(rc: &Rc<RefCell<SourceData>>, cb: Option<PrepareCallback>) {
    let had_prepare = rc.borrow().prepare_cb.borrow().is_some();
    let has_prepare = cb.is_some();
    *rc.borrow().prepare_cb.borrow_mut() = cb;
    let Some(inner_rc) = rc.borrow().loop_ref.upgrade() else {
        return;
    };
    let inner = inner_rc.borrow();
    if has_prepare && !had_prepare {
        inner.prepare.borrow_mut().put(Rc::clone(rc));
    } else if !has_prepare && had_prepare {
        let idx = rc.borrow().prepare_index.get();
        if idx != NULL_INDEX {
            inner.prepare.borrow_mut().remove_at(idx);
        }
    }
}

pub(crate) fn source_set_io_events(rc: &Rc<RefCell<SourceData>>, events: IoEvents) -> Result<()> {
    if !events.is_subset_of_valid() {
        return Err(Error::InvalidArgument("io events contain unknown bits"));
    }
    let fd = {
        let d = rc.borrow();
        let io = d.io_data();
        io.requested.set(events);
        io.fd.get()
    };
    if let Some(inner_rc) = rc.borrow().loop_ref.upgrade() {
        let ev = EventLoop(inner_rc);
        syscall::epoll_mod(ev.epoll_fd(), fd, fd as Tag, events.0)?;
    }
    Ok(())
}

/// Swaps a source's underlying descriptor. Installs the new fd before
/// removing the old one, so a failed `epoll_add` leaves the original
/// registration intact; only touches `epoll` at all if the source is
/// currently enabled and actually registered.
pub(crate) fn source_set_io_fd(rc: &Rc<RefCell<SourceData>>, fd: RawFd) -> Result<()> {
    let (old_fd, events, registered) = {
        let d = rc.borrow();
        let io = d.io_data();
        (io.fd.get(), io.requested.get(), io.registered.get())
    };
    if old_fd == fd {
        return Ok(());
    }
    if let Some(inner_rc) = rc.borrow().loop_ref.upgrade() {
        let ev = EventLoop(inner_rc.clone());
        if registered {
            syscall::epoll_add(ev.epoll_fd(), fd, fd as Tag, events.0)?;
            syscall::epoll_del(ev.epoll_fd(), old_fd)?;
        }
        let inner = inner_rc.borrow();
        let entry = inner.io_sources.borrow_mut().remove(&old_fd);
        if let Some(entry) = entry {
            inner.io_sources.borrow_mut().insert(fd, entry);
        }
    }
    rc.borrow().io_data().fd.set(fd);
    Ok(())
}

pub(crate) fn source_set_time(rc: &Rc<RefCell<SourceData>>, usec: u64) -> Result<()> {
    rc.borrow().time_data().next_usec.set(usec);
    rehome_time_source(rc)
}

pub(crate) fn source_set_time_accuracy(rc: &Rc<RefCell<SourceData>>, usec: u64) -> Result<()> {
    let accuracy = if usec == 0 {
        crate::clock::DEFAULT_ACCURACY_USEC
    } else {
        usec
    };
    rc.borrow().time_data().accuracy_usec.set(accuracy);
    rehome_time_source(rc)
}

fn rehome_time_source(rc: &Rc<RefCell<SourceData>>) -> Result<()> {
    let Some(inner_rc) = rc.borrow().loop_ref.upgrade() else {
        return Ok(());
    };
    let inner = inner_rc.borrow();
    let clock = rc.borrow().time_data().clock;
    let cd = &inner.clocks[clock.index()];
    let ei = rc.borrow().time_data().earliest_index.get();
    if ei != NULL_INDEX {
        cd.earliest.borrow_mut().reshuffle(ei);
    }
    let li = rc.borrow().time_data().latest_index.get();
    if li != NULL_INDEX {
        cd.latest.borrow_mut().reshuffle(li);
    }
    cd.needs_rearm.set(true);
    Ok(())
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("event loop dropped after {} pending-queue iterations", self.pending_iteration.get());
    }
}
