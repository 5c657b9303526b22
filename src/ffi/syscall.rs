use std::io::{Error, Result};
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use libc::{c_int, epoll_event, itimerspec, sigset_t, timespec};

use super::Tag;

pub fn epoll_create1() -> Result<OwnedFd> {
    let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if fd != -1 {
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    } else {
        Err(Error::last_os_error())
    }
}

fn epoll_event_for(tag: Tag, events: u32) -> epoll_event {
    epoll_event {
        events,
        u64: tag as u64,
    }
}

pub fn epoll_add(epoll: BorrowedFd, fd: RawFd, tag: Tag, events: u32) -> Result<()> {
    let mut ev = epoll_event_for(tag, events);
    let r = unsafe { libc::epoll_ctl(epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev) };
    if r != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn epoll_mod(epoll: BorrowedFd, fd: RawFd, tag: Tag, events: u32) -> Result<()> {
    let mut ev = epoll_event_for(tag, events);
    let r = unsafe { libc::epoll_ctl(epoll.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut ev) };
    if r != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn epoll_del(epoll: BorrowedFd, fd: RawFd) -> Result<()> {
    let r = unsafe {
        libc::epoll_ctl(
            epoll.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut(),
        )
    };
    if r != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// A single readiness record returned by [`epoll_wait`], demultiplexed by `tag`.
pub struct Ready {
    pub tag: Tag,
    pub events: u32,
}

/// Waits for readiness. `timeout_ms = -1` blocks forever, `0` returns immediately.
///
/// Retrying on `EINTR` is left to the caller: the loop's `wait()` treats
/// `EINTR` as "no readiness observed", per the state machine in the spec.
pub fn epoll_wait(epoll: BorrowedFd, buf: &mut [epoll_event], timeout_ms: i32) -> Result<Vec<Ready>> {
    let n = unsafe {
        libc::epoll_wait(
            epoll.as_raw_fd(),
            buf.as_mut_ptr(),
            buf.len() as c_int,
            timeout_ms,
        )
    };
    if n == -1 {
        return Err(Error::last_os_error());
    }
    Ok(buf[..n as usize]
        .iter()
        .map(|e| Ready {
            tag: e.u64 as i64,
            events: e.events,
        })
        .collect())
}

pub fn timerfd_create(clock_id: c_int) -> Result<OwnedFd> {
    let fd = unsafe { libc::timerfd_create(clock_id, libc::TFD_CLOEXEC | libc::TFD_NONBLOCK) };
    if fd != -1 {
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    } else {
        Err(Error::last_os_error())
    }
}

pub fn nsec_to_timespec(nsec: u64) -> timespec {
    timespec {
        tv_sec: (nsec / 1_000_000_000) as libc::time_t,
        tv_nsec: (nsec % 1_000_000_000) as i64,
    }
}

/// Arms `fd` to fire once at the absolute time `at_nsec` (in the timer's clock epoch).
pub fn timerfd_settime_absolute(fd: BorrowedFd, at_nsec: u64) -> Result<()> {
    let spec = itimerspec {
        it_interval: timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: nsec_to_timespec(at_nsec),
    };
    let r = unsafe {
        libc::timerfd_settime(
            fd.as_raw_fd(),
            libc::TFD_TIMER_ABSTIME,
            &spec,
            std::ptr::null_mut(),
        )
    };
    if r != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// Drains a readable timer descriptor's expiration counter.
pub fn timerfd_read(fd: BorrowedFd) -> Result<u64> {
    let mut buf = [0u8; 8];
    let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, 8) };
    if n == 8 {
        Ok(u64::from_ne_bytes(buf))
    } else if n == -1 {
        Err(Error::last_os_error())
    } else {
        Ok(0)
    }
}

pub fn sigemptyset() -> sigset_t {
    let mut set = MaybeUninit::<sigset_t>::uninit();
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        set.assume_init()
    }
}

pub fn sigaddset(set: &mut sigset_t, signo: c_int) {
    unsafe { libc::sigaddset(set, signo) };
}

pub fn sigdelset(set: &mut sigset_t, signo: c_int) {
    unsafe { libc::sigdelset(set, signo) };
}

pub fn sigismember(set: &sigset_t, signo: c_int) -> bool {
    unsafe { libc::sigismember(set, signo) == 1 }
}

/// Returns the process's current signal mask without changing it.
pub fn sigprocmask_current() -> Result<sigset_t> {
    let mut cur = MaybeUninit::<sigset_t>::uninit();
    let empty = sigemptyset();
    let r = unsafe { libc::sigprocmask(libc::SIG_BLOCK, &empty, cur.as_mut_ptr()) };
    if r == 0 {
        Ok(unsafe { cur.assume_init() })
    } else {
        Err(Error::last_os_error())
    }
}

/// Creates a brand new `signalfd` bound to `mask`.
pub fn signalfd_create(mask: &sigset_t) -> Result<OwnedFd> {
    let flags = libc::SFD_CLOEXEC | libc::SFD_NONBLOCK;
    let fd = unsafe { libc::signalfd(-1, mask, flags) };
    if fd != -1 {
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    } else {
        Err(Error::last_os_error())
    }
}

/// Rebinds an already-open `signalfd` to a new mask in place (no new descriptor
/// is allocated, so the caller keeps owning `fd` exactly as before).
pub fn signalfd_update(fd: RawFd, mask: &sigset_t) -> Result<()> {
    let flags = libc::SFD_CLOEXEC | libc::SFD_NONBLOCK;
    let r = unsafe { libc::signalfd(fd, mask, flags) };
    if r != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn signalfd_read(fd: BorrowedFd) -> Result<Vec<libc::signalfd_siginfo>> {
    let mut out = Vec::new();
    loop {
        let mut info = MaybeUninit::<libc::signalfd_siginfo>::uninit();
        let n = unsafe {
            libc::read(
                fd.as_raw_fd(),
                info.as_mut_ptr() as *mut _,
                size_of::<libc::signalfd_siginfo>(),
            )
        };
        if n == size_of::<libc::signalfd_siginfo>() as isize {
            out.push(unsafe { info.assume_init() });
        } else {
            break;
        }
    }
    Ok(out)
}

/// Probes a child's status without necessarily reaping it.
///
/// `nowait` maps to `WNOHANG | WNOWAIT` (peek only), otherwise `WNOHANG` alone
/// (peek-and-reap for a true zombie).
pub fn waitid_probe(
    pid: libc::pid_t,
    wait_options: c_int,
    nowait: bool,
) -> Result<Option<libc::siginfo_t>> {
    let mut info: libc::siginfo_t = unsafe { MaybeUninit::zeroed().assume_init() };
    let mut flags = libc::WNOHANG | wait_options;
    if nowait {
        flags |= libc::WNOWAIT;
    }
    let r = unsafe { libc::waitid(libc::P_PID, pid as libc::id_t, &mut info, flags) };
    if r == -1 {
        return Err(Error::last_os_error());
    }
    // si_pid stays 0 when nothing is ready yet.
    if unsafe { info.si_pid() } == 0 {
        Ok(None)
    } else {
        Ok(Some(info))
    }
}

pub fn now(clock_id: c_int) -> Result<Duration> {
    let mut ts = MaybeUninit::<timespec>::uninit();
    let r = unsafe { libc::clock_gettime(clock_id, ts.as_mut_ptr()) };
    if r == -1 {
        return Err(Error::last_os_error());
    }
    let ts = unsafe { ts.assume_init() };
    Ok(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
}
