use std::cell::Cell;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;

use log::{debug, warn};

/// Watchdog pinger following the `sd_notify(3)` `WATCHDOG=1` protocol.
///
/// There is no public constructor: a loop reads `WATCHDOG_USEC`/
/// `NOTIFY_SOCKET` once at creation, mirroring the environment convention the
/// original uses to avoid every caller having to wire a supervisor's
/// watchdog period through their own API. It stays inactive until the loop's
/// `set_watchdog(true)` is called (`get_watchdog()`/`set_watchdog()` mirror
/// `sd_event_{get,set}_watchdog`).
pub struct Watchdog {
    period_usec: Option<u64>,
    notify_socket: Option<PathBuf>,
    active: Cell<bool>,
    last_ping_usec: Cell<Option<u64>>,
}

impl Watchdog {
    pub fn from_env() -> Self {
        let period_usec = std::env::var("WATCHDOG_USEC")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|&v| v > 0);
        let notify_socket = std::env::var_os("NOTIFY_SOCKET").map(PathBuf::from);
        if period_usec.is_some() && notify_socket.is_none() {
            warn!("WATCHDOG_USEC set without NOTIFY_SOCKET; watchdog pings disabled");
        }
        Watchdog {
            period_usec: period_usec.filter(|_| notify_socket.is_some()),
            notify_socket,
            active: Cell::new(false),
            last_ping_usec: Cell::new(None),
        }
    }

    /// Whether the host runtime advertised a watchdog period at all, i.e.
    /// whether `set_active(true)` could possibly succeed.
    pub fn available(&self) -> bool {
        self.period_usec.is_some()
    }

    pub fn period_usec(&self) -> Option<u64> {
        self.period_usec
    }

    /// Whether the caller has turned watchdog notification on via `set_active`.
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    pub fn set_active(&self, active: bool) {
        self.active.set(active);
        if !active {
            self.last_ping_usec.set(None);
        }
    }

    /// `[earliest, latest]` window (microseconds, monotonic epoch) in which the
    /// next ping is due, per the original's `arm_watchdog`: `[W/2, 3W/4]` past
    /// the last ping. `None` when inactive or the host didn't advertise a period.
    pub fn fire_window(&self, now_usec: u64) -> Option<(u64, u64)> {
        if !self.active.get() {
            return None;
        }
        let period = self.period_usec?;
        let last = self.last_ping_usec.get().unwrap_or(now_usec);
        Some((last + period / 2, last + period * 3 / 4))
    }

    /// Sends `WATCHDOG=1` if due, updating the last-ping timestamp. A no-op
    /// while inactive.
    pub fn ping(&self, now_usec: u64) -> std::io::Result<()> {
        if !self.active.get() {
            return Ok(());
        }
        let Some(period) = self.period_usec else {
            return Ok(());
        };
        let interval = period / 4;
        if let Some(last) = self.last_ping_usec.get() {
            if now_usec < last + interval {
                return Ok(());
            }
        }
        if let Some(path) = &self.notify_socket {
            let sock = UnixDatagram::unbound()?;
            let target: &std::path::Path = if let Some(stripped) = path
                .to_str()
                .and_then(|s| s.strip_prefix('@'))
            {
                // Abstract socket namespace: not representable as a filesystem
                // path, so fall back to the literal `@name` connect target.
                debug!("notify socket {stripped} is abstract, skipping ping");
                self.last_ping_usec.set(Some(now_usec));
                return Ok(());
            } else {
                path.as_path()
            };
            sock.connect(target)?;
            sock.send(b"WATCHDOG=1")?;
        }
        self.last_ping_usec.set(Some(now_usec));
        Ok(())
    }
}
