//! Per-thread message loop.
//!
//! A thread gets a [`Looper`] with [`Looper::prepare`] (or a configured
//! [`Builder`]), hands out [`Handler`]s bound to it, then calls
//! [`Looper::run`] to process messages until the looper quits.
//!
//! [`Handler`]: crate::Handler

use crate::errors::LooperError;
use crate::message::Message;
use crate::printer::Printer;
use crate::queue::MessageQueue;
use crate::utils::ScopeGuard;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, Thread};

mod builder;
pub use builder::Builder;
pub(crate) use builder::LooperConfig;

mod registry;


/// Once delivery has been flagged slow, it is considered caught up again when
/// a message is dispatched within this many milliseconds of its due time.
const DELIVERY_CAUGHT_UP_MS: u64 = 10;

/// Owner of a thread's [`MessageQueue`] and its dispatch loop.
///
/// Cloning is cheap and clones compare equal.
#[derive(Clone)]
pub struct Looper {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: LooperConfig,

    queue: Arc<MessageQueue>,

    thread: Thread,

    printer: Mutex<Option<Arc<dyn Printer>>>,
}

impl Looper {
    pub(crate) fn new(cfg: LooperConfig, thread: Thread, printer: Option<Arc<dyn Printer>>) -> Self {
        let queue = Arc::new(MessageQueue::new(Arc::clone(&cfg.clock)));

        Self {
            inner: Arc::new(Inner {
                cfg,
                queue,
                thread,
                printer: Mutex::new(printer),
            }),
        }
    }

    /// Prepares a default looper for the current thread.
    pub fn prepare() -> Result<Looper, LooperError> {
        Builder::new().try_prepare()
    }

    /// Prepares the current thread's looper as the process-wide main looper,
    /// which can never quit.
    pub fn prepare_main_looper() -> Result<Looper, LooperError> {
        Builder::new().quit_allowed(false).try_prepare_main()
    }

    pub fn main_looper() -> Option<Looper> {
        registry::main()
    }

    /// The looper registered for the calling thread, if any.
    pub fn my_looper() -> Option<Looper> {
        registry::current()
    }

    pub fn my_queue() -> Result<Arc<MessageQueue>, LooperError> {
        Self::my_looper()
            .map(|looper| Arc::clone(&looper.inner.queue))
            .ok_or(LooperError::NotPrepared)
    }

    /// Runs the current thread's message loop until its looper quits.
    ///
    /// The thread's registration is released when this returns, including
    /// when a target panics and the panic unwinds out of here. A looper that
    /// has run cannot be run again.
    ///
    /// Fails with [`LooperError::HarnessAttached`] while a
    /// [`TestLooperManager`](crate::TestLooperManager) drains the queue, the
    /// looper stays prepared.
    pub fn run() -> Result<(), LooperError> {
        let me = Self::my_looper().ok_or(LooperError::NotPrepared)?;

        // The harness is the queue's only consumer while attached.
        if me.inner.queue.is_harness_attached() {
            return Err(LooperError::HarnessAttached);
        }

        let _registration = ScopeGuard::new(|| registry::deregister(&me));

        tracing::debug!(thread = ?me.inner.thread.name(), "looper running");

        let mut slow_delivery_detected = false;
        while let Some(msg) = me.inner.queue.next() {
            me.dispatch(msg, &mut slow_delivery_detected);
        }

        tracing::debug!(thread = ?me.inner.thread.name(), "looper exited");
        Ok(())
    }

    fn dispatch(&self, msg: Message, slow_delivery_detected: &mut bool) {
        let cfg = &self.inner.cfg;
        let printer = self.inner.printer.lock().clone();

        if let Some(printer) = &printer {
            printer.println(&format!(
                ">>>>> Dispatching to {} {}: {}",
                describe_target(&msg),
                describe_callback(&msg),
                msg.what
            ));
        }

        let when = msg.when();
        let dispatch_start = cfg.clock.uptime_millis();

        tracing::trace!(when, what = msg.what, "dispatching message");
        msg.dispatch();

        let dispatch_end = cfg.clock.uptime_millis();

        if let Some(threshold) = cfg.slow_delivery_threshold_ms {
            let lateness = dispatch_start.saturating_sub(when);

            if *slow_delivery_detected {
                if lateness <= DELIVERY_CAUGHT_UP_MS {
                    tracing::debug!("message delivery caught up");
                    *slow_delivery_detected = false;
                }
            } else if when != 0 && lateness > threshold {
                // Front-of-queue messages have no meaningful due time.
                tracing::warn!(
                    late_ms = lateness,
                    handler = %describe_target(&msg),
                    what = msg.what,
                    "slow delivery"
                );
                *slow_delivery_detected = true;
            }
        }

        if let Some(threshold) = cfg.slow_dispatch_threshold_ms {
            let took = dispatch_end.saturating_sub(dispatch_start);
            if took > threshold {
                tracing::warn!(
                    took_ms = took,
                    handler = %describe_target(&msg),
                    what = msg.what,
                    "slow dispatch"
                );
            }
        }

        if let Some(printer) = &printer {
            printer.println(&format!(
                "<<<<< Finished to {} {}",
                describe_target(&msg),
                describe_callback(&msg)
            ));
        }

        msg.recycle();
    }

    /// Drops this looper's registration if it is still the one held for its
    /// thread.
    pub(crate) fn deregister(&self) {
        registry::deregister(self);
    }

    #[cfg(test)]
    pub(crate) fn is_registered(&self) -> bool {
        registry::is_registered(self)
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.inner.queue
    }

    pub fn thread(&self) -> &Thread {
        &self.inner.thread
    }

    pub fn is_current_thread(&self) -> bool {
        self.inner.thread.id() == thread::current().id()
    }

    pub fn is_quit_allowed(&self) -> bool {
        self.inner.cfg.quit_allowed
    }

    /// Stops the loop as soon as possible, discarding every pending message.
    pub fn quit(&self) -> Result<(), LooperError> {
        self.quit_inner(false)
    }

    /// Stops the loop once every message already due has been processed.
    /// Messages due later are discarded.
    pub fn quit_safely(&self) -> Result<(), LooperError> {
        self.quit_inner(true)
    }

    fn quit_inner(&self, safe: bool) -> Result<(), LooperError> {
        if !self.inner.cfg.quit_allowed {
            return Err(LooperError::QuitNotAllowed);
        }

        self.inner.queue.quit(safe);
        Ok(())
    }

    /// Sets (or clears) the sink receiving a line before and after every
    /// dispatch.
    pub fn set_message_logging(&self, printer: Option<Arc<dyn Printer>>) {
        *self.inner.printer.lock() = printer;
    }

    pub fn dump(&self, printer: &dyn Printer, prefix: &str) {
        printer.println(&format!("{prefix}{self:?}"));
        self.inner.queue.dump(printer, &format!("{prefix}  "), None);
    }
}

fn describe_target(msg: &Message) -> String {
    msg.target()
        .map_or_else(|| String::from("<barrier>"), ToString::to_string)
}

fn describe_callback(msg: &Message) -> String {
    msg.callback()
        .map_or_else(|| String::from("-"), ToString::to_string)
}

impl PartialEq for Looper {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Looper {}

impl fmt::Debug for Looper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Looper")
            .field("thread", &self.inner.thread.name().unwrap_or("<unnamed>"))
            .field("thread_id", &self.inner.thread.id())
            .field("quit_allowed", &self.inner.cfg.quit_allowed)
            .finish()
    }
}
