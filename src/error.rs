use thiserror::Error;

/// Error taxonomy for every fallible operation on the event loop.
///
/// Kernel-level failures (`epoll`, `timerfd`, `signalfd`, `waitid`) are
/// wrapped as [`Error::Kernel`]; every other variant describes a contract
/// violation the caller made (bad argument, wrong state, stale handle).
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("busy: {0}")]
    Busy(&'static str),

    #[error("event loop is finished")]
    Stale,

    #[error("no data available: {0}")]
    NoData(&'static str),

    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("event loop used from a different process than the one that created it")]
    WrongProcess,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("kernel error: {0}")]
    Kernel(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
