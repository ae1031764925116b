use std::fmt;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

/// Monotonic time source used by a [`MessageQueue`] to decide when messages
/// are due.
///
/// Due times are plain milliseconds so that callers can compute absolute
/// deadlines (`now + delay`) and compare them without carrying `Instant`s
/// across threads.
///
/// [`MessageQueue`]: crate::MessageQueue
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds elapsed since an arbitrary, fixed origin. Never goes
    /// backwards.
    fn uptime_millis(&self) -> u64;
}

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Default clock: milliseconds since the first time any looper asked for the
/// time in this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn uptime_millis(&self) -> u64 {
        uptime_millis()
    }
}

/// Process uptime in milliseconds, in the same time base as [`SystemClock`].
pub fn uptime_millis() -> u64 {
    duration_to_millis(EPOCH.elapsed())
}

/// Saturating conversion of a delay into the millisecond time base.
pub(crate) fn duration_to_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(SystemClock: Clock, Send, Sync);

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock;
        let a = clock.uptime_millis();
        std::thread::sleep(Duration::from_millis(5));
        let b = clock.uptime_millis();

        assert!(b >= a + 5, "a={a} b={b}");
    }

    #[test]
    fn test_duration_to_millis_saturates() {
        assert_eq!(duration_to_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_to_millis(Duration::MAX), u64::MAX);
    }
}
