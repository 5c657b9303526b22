//! A single-threaded, priority-ordered event loop that multiplexes I/O
//! readiness, timers on five clocks, Unix signal delivery and child-process
//! exits behind one `epoll` descriptor.
//!
//! ## Example
//!
//! ```no_run
//! use reactor_core::{EventLoop, Clock};
//!
//! let loop_ = EventLoop::new().unwrap();
//! let _timer = loop_
//!     .add_time(Clock::Monotonic, loop_.now(Clock::Monotonic).unwrap() + 1_000_000, 0, Box::new(|_src, _payload| {
//!         println!("one second elapsed");
//!         Ok(())
//!     }))
//!     .unwrap();
//! loop_.exit(0).unwrap();
//! loop_.run().unwrap();
//! ```
//!
//! ## Ownership model
//!
//! Every constructor (`add_io`, `add_time`, ...) returns a [`Source`] handle
//! whose `Drop`/[`Source::unref`] drives the usual reference-counted
//! lifecycle; see `DESIGN.md` for how floating and non-floating sources
//! interact with the owning [`EventLoop`].

mod clock;
mod error;
mod ffi;
mod pqueue;
mod source;
mod event;
mod watchdog;

pub use clock::{Clock, DEFAULT_ACCURACY_USEC};
pub use error::{Error, Result};
pub use event::{EventLoop, State};
pub use source::{
    Callback, ChildData, Enabled, IoData, IoEvents, Kind, Payload, PrepareCallback, SignalData,
    Source, TimeData,
};
pub use watchdog::Watchdog;
