use std::fmt;

/// The five clocks a time source can be scheduled against.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Clock {
    Realtime,
    Boottime,
    Monotonic,
    RealtimeAlarm,
    BoottimeAlarm,
}

impl Clock {
    pub const ALL: [Clock; 5] = [
        Clock::Realtime,
        Clock::Boottime,
        Clock::Monotonic,
        Clock::RealtimeAlarm,
        Clock::BoottimeAlarm,
    ];

    pub fn index(self) -> usize {
        match self {
            Clock::Realtime => 0,
            Clock::Boottime => 1,
            Clock::Monotonic => 2,
            Clock::RealtimeAlarm => 3,
            Clock::BoottimeAlarm => 4,
        }
    }

    pub fn as_libc(self) -> libc::clockid_t {
        match self {
            Clock::Realtime => libc::CLOCK_REALTIME,
            Clock::Boottime => libc::CLOCK_BOOTTIME,
            Clock::Monotonic => libc::CLOCK_MONOTONIC,
            Clock::RealtimeAlarm => libc::CLOCK_REALTIME_ALARM,
            Clock::BoottimeAlarm => libc::CLOCK_BOOTTIME_ALARM,
        }
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Clock::Realtime => "realtime",
            Clock::Boottime => "boottime",
            Clock::Monotonic => "monotonic",
            Clock::RealtimeAlarm => "realtime-alarm",
            Clock::BoottimeAlarm => "boottime-alarm",
        };
        f.write_str(name)
    }
}

/// Default accuracy applied when a time source is scheduled with `accuracy == 0`.
pub const DEFAULT_ACCURACY_USEC: u64 = 250_000;

/// `t = 0` is forbidden on a `timerfd` in absolute mode (it would read as
/// "disarm"), so a nominal one-microsecond-past-the-epoch value stands in for
/// "fire immediately" wherever the natural computation lands on zero.
pub const NEVER_ZERO_USEC: u64 = 1;

const GRAINS_USEC: [u64; 4] = [
    60_000_000, // 60s
    10_000_000, // 10s
    1_000_000,  // 1s
    250_000,    // 250ms
];

/// Picks a wake-up instant in `[earliest, latest]` (microseconds, same clock
/// epoch throughout) that tends to line up across independently-clocked
/// hosts: the largest `k * grain + perturb` inside the window, preferring
/// the coarsest grain that has any candidate in range, else the latest
/// allowed instant.
pub fn coalesce(earliest: u64, latest: u64, perturb: u64) -> u64 {
    if earliest >= latest {
        return earliest.max(NEVER_ZERO_USEC);
    }
    for &grain in &GRAINS_USEC {
        let offset = perturb % grain;
        if latest < offset {
            continue;
        }
        let k = (latest - offset) / grain;
        let candidate = k * grain + offset;
        if candidate >= earliest && candidate <= latest {
            return candidate.max(NEVER_ZERO_USEC);
        }
    }
    latest.max(NEVER_ZERO_USEC)
}

/// Derives the per-host `perturb` offset (microseconds, modulo one minute)
/// from `/proc/sys/kernel/random/boot_id` when present, else falls back to
/// a value derived from the process start time so hosts without that file
/// (containers, non-Linux test sandboxes) still get a stable-for-the-process
/// perturbation rather than none at all.
pub fn derive_perturb() -> u64 {
    const MODULUS: u64 = 60_000_000;
    match std::fs::read_to_string("/proc/sys/kernel/random/boot_id") {
        Ok(id) => {
            let mut acc: u64 = 0;
            for b in id.bytes() {
                acc = acc.wrapping_mul(31).wrapping_add(b as u64);
            }
            acc % MODULUS
        }
        Err(_) => {
            let pid = std::process::id() as u64;
            pid.wrapping_mul(2_654_435_761) % MODULUS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesce_picks_coarsest_grain_in_window() {
        // Window [0, 140ms] should align on a 60s-grid-aligned perturb=0 point within range;
        // since 0 is itself on every grid, it's the natural choice.
        let t = coalesce(0, 140_000, 0);
        assert!(t <= 140_000);
    }

    #[test]
    fn coalesce_falls_back_to_latest_when_no_grain_fits() {
        // A window narrower than the finest grain (250ms) with no aligned point.
        let t = coalesce(1_000_001, 1_000_100, 7);
        assert!((1_000_001..=1_000_100).contains(&t));
    }

    #[test]
    fn coalesce_never_returns_zero() {
        assert_eq!(coalesce(0, 0, 0), NEVER_ZERO_USEC);
    }

    #[test]
    fn coalesce_respects_window_bounds() {
        for perturb in [0, 1_000, 999_999, 59_000_000] {
            let t = coalesce(5_000_000, 5_200_000, perturb);
            assert!((5_000_000..=5_200_000).contains(&t), "t={t} perturb={perturb}");
        }
    }
}
