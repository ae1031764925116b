use crate::clock::{Clock, SystemClock, duration_to_millis};
use crate::errors::LooperError;
use crate::looper::{Looper, registry};
use crate::printer::Printer;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configures and prepares a [`Looper`] on the current thread.
///
/// ```ignore
/// let looper = Builder::new()
///     .slow_dispatch_threshold(Duration::from_millis(100))
///     .try_prepare()?;
/// ```
#[derive(Clone)]
pub struct Builder {
    /// Whether `quit()` / `quit_safely()` are permitted.
    ///
    /// Defaults to `true`. The main looper is prepared with `false`.
    quit_allowed: bool,

    /// Time source for due times. Defaults to [`SystemClock`].
    clock: Arc<dyn Clock>,

    /// Warn when a single dispatch takes longer than this. Off by default.
    slow_dispatch_threshold: Option<Duration>,

    /// Warn when a message is dispatched this long after it was due. Off by
    /// default.
    slow_delivery_threshold: Option<Duration>,

    /// Initial message logging sink.
    printer: Option<Arc<dyn Printer>>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            quit_allowed: true,
            clock: Arc::new(SystemClock),
            slow_dispatch_threshold: None,
            slow_delivery_threshold: None,
            printer: None,
        }
    }

    pub fn quit_allowed(&mut self, val: bool) -> &mut Self {
        self.quit_allowed = val;
        self
    }

    pub fn clock(&mut self, clock: Arc<dyn Clock>) -> &mut Self {
        self.clock = clock;
        self
    }

    /// # Panics
    ///
    /// If `val` is zero.
    #[track_caller]
    pub fn slow_dispatch_threshold(&mut self, val: Duration) -> &mut Self {
        assert!(!val.is_zero(), "slow_dispatch_threshold must be greater than 0");
        self.slow_dispatch_threshold = Some(val);
        self
    }

    /// # Panics
    ///
    /// If `val` is zero.
    #[track_caller]
    pub fn slow_delivery_threshold(&mut self, val: Duration) -> &mut Self {
        assert!(!val.is_zero(), "slow_delivery_threshold must be greater than 0");
        self.slow_delivery_threshold = Some(val);
        self
    }

    pub fn message_logging(&mut self, printer: Arc<dyn Printer>) -> &mut Self {
        self.printer = Some(printer);
        self
    }

    /// Creates a looper for the current thread and registers it.
    ///
    /// Fails with [`LooperError::AlreadyPrepared`] if this thread already has
    /// one.
    pub fn try_prepare(&self) -> Result<Looper, LooperError> {
        registry::register(self.build_for_current_thread())
    }

    /// Like [`try_prepare`](Builder::try_prepare), and also designates the new
    /// looper as the process-wide main looper.
    pub fn try_prepare_main(&self) -> Result<Looper, LooperError> {
        registry::register_main(self.build_for_current_thread())
    }

    pub(crate) fn build_for_current_thread(&self) -> Looper {
        Looper::new(LooperConfig::from(self), std::thread::current(), self.printer.clone())
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("quit_allowed", &self.quit_allowed)
            .field("clock", &self.clock)
            .field("slow_dispatch_threshold", &self.slow_dispatch_threshold)
            .field("slow_delivery_threshold", &self.slow_delivery_threshold)
            .field("has_printer", &self.printer.is_some())
            .finish()
    }
}

// Immutable view of the builder consumed by the looper and its queue.
#[derive(Debug, Clone)]
pub(crate) struct LooperConfig {
    pub(crate) quit_allowed: bool,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) slow_dispatch_threshold_ms: Option<u64>,
    pub(crate) slow_delivery_threshold_ms: Option<u64>,
}

impl Default for LooperConfig {
    fn default() -> Self {
        LooperConfig::from(&Builder::new())
    }
}

impl From<&Builder> for LooperConfig {
    fn from(builder: &Builder) -> Self {
        LooperConfig {
            quit_allowed: builder.quit_allowed,
            clock: Arc::clone(&builder.clock),
            slow_dispatch_threshold_ms: builder.slow_dispatch_threshold.map(duration_to_millis),
            slow_delivery_threshold_ms: builder.slow_delivery_threshold.map(duration_to_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ManualClock;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let cfg = LooperConfig::default();

        assert!(cfg.quit_allowed);
        assert_eq!(cfg.slow_dispatch_threshold_ms, None);
        assert_eq!(cfg.slow_delivery_threshold_ms, None);
    }

    #[rstest]
    #[case::millis(Duration::from_millis(100), 100)]
    #[case::sub_milli_rounds_down(Duration::from_micros(1_500), 1)]
    #[case::seconds(Duration::from_secs(2), 2_000)]
    fn test_thresholds_in_millis(#[case] threshold: Duration, #[case] expected: u64) {
        let cfg = LooperConfig::from(
            &*Builder::new()
                .slow_dispatch_threshold(threshold)
                .slow_delivery_threshold(threshold),
        );

        assert_eq!(cfg.slow_dispatch_threshold_ms, Some(expected));
        assert_eq!(cfg.slow_delivery_threshold_ms, Some(expected));
    }

    #[test]
    #[should_panic(expected = "slow_dispatch_threshold must be greater than 0")]
    fn test_zero_threshold_panics() {
        Builder::new().slow_dispatch_threshold(Duration::ZERO);
    }

    #[test]
    fn test_custom_clock_reaches_queue() {
        let clock = ManualClock::default();
        clock.set(42);

        let looper = Builder::new()
            .clock(Arc::new(clock.clone()))
            .quit_allowed(false)
            .build_for_current_thread();

        assert_eq!(looper.queue().uptime_millis(), 42);
        assert!(!looper.is_quit_allowed());
    }
}
