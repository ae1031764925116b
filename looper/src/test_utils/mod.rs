use crate::clock::Clock;
use crate::handler::{Callback, Handler};
use crate::looper::{Builder, Looper};
use crate::message::Message;
use crate::printer::Printer;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Default, Clone)]
pub(crate) struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub(crate) fn set(&self, millis: u64) {
        self.0.store(millis, Ordering::SeqCst);
    }

    pub(crate) fn advance(&self, millis: u64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn uptime_millis(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct RecordingPrinter(Arc<Mutex<Vec<String>>>);

impl RecordingPrinter {
    pub(crate) fn lines(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

impl Printer for RecordingPrinter {
    fn println(&self, line: &str) {
        self.0.lock().push(line.to_owned());
    }
}

/// Records the `what` of every message it is handed and claims to handle it.
#[derive(Debug, Default, Clone)]
pub(crate) struct RecordingCallback(Arc<Mutex<Vec<i32>>>);

impl RecordingCallback {
    pub(crate) fn whats(&self) -> Vec<i32> {
        self.0.lock().clone()
    }
}

impl Callback for RecordingCallback {
    fn handle_message(&self, msg: &Message) -> bool {
        self.0.lock().push(msg.what);
        true
    }
}

/// Looper bound to the current thread but left out of the per-thread
/// registry, so tests can create as many as they like and drive the queue by
/// hand. The clock starts at 0.
#[must_use]
pub(crate) fn init_looper() -> (Looper, Handler, ManualClock) {
    let clock = ManualClock::default();
    let looper = Builder::new()
        .clock(Arc::new(clock.clone()))
        .build_for_current_thread();
    let handler = Handler::new(&looper);

    (looper, handler, clock)
}
