//! Due-time ordered, thread-safe message queue with synchronization barriers
//! and idle handlers.
//!
//! Any thread may enqueue. A single consumer, the looper's thread or a
//! [`TestLooperManager`] acting on its behalf, drains the queue.
//!
//! [`TestLooperManager`]: crate::TestLooperManager

use crate::clock::Clock;
use crate::errors::{LooperError, panic_payload_as_str};
use crate::handler::Handler;
use crate::message::{Message, Payload, Runnable};
use crate::printer::Printer;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

mod idle;
pub use idle::IdleHandler;


pub struct MessageQueue {
    clock: Arc<dyn Clock>,

    inner: Mutex<Inner>,

    /// Signalled when the consumer may have something new to look at: a new
    /// head, a removed barrier or a quit request.
    wake: Condvar,
}

#[derive(Default)]
struct Inner {
    /// Sorted by `(when, seq)`.
    messages: VecDeque<Message>,

    next_seq: u64,

    next_barrier_token: i32,

    idle_handlers: Vec<Arc<dyn IdleHandler>>,

    quitting: bool,

    /// The consumer is parked on `wake`.
    blocked: bool,

    harness_attached: bool,
}

enum Lookup {
    Ready(usize),

    /// Nothing deliverable yet. `wait` is the time until the next deliverable
    /// message is due, `None` if there is none.
    Pending { wait: Option<u64> },
}

impl Inner {
    /// Index of the message `next()` would deliver, ignoring due times. A
    /// barrier at the head hides everything but asynchronous messages.
    fn deliverable(&self) -> Option<usize> {
        let head = self.messages.front()?;

        if head.is_barrier() {
            self.messages
                .iter()
                .position(|m| !m.is_barrier() && m.is_asynchronous())
        } else {
            Some(0)
        }
    }

    fn lookup(&self, now: u64) -> Lookup {
        match self.deliverable() {
            Some(idx) => {
                let when = self.messages[idx].when;
                if when <= now {
                    Lookup::Ready(idx)
                } else {
                    Lookup::Pending {
                        wait: Some(when - now),
                    }
                }
            }
            None => Lookup::Pending { wait: None },
        }
    }

    /// Inserts after every message due at or before `when`. Returns whether a
    /// parked consumer must be woken to look at the new message.
    fn insert(&mut self, mut msg: Message, when: u64) -> bool {
        msg.when = when;
        msg.seq = self.next_seq;
        self.next_seq += 1;

        let idx = self.messages.partition_point(|m| m.when <= when);

        // A parked consumer sleeps until the deliverable message is due, so it
        // only needs waking when that message changes. A new head always
        // changes it. Behind a head barrier the deliverable message is the
        // first asynchronous one, so an insert further down only matters if it
        // is asynchronous and lands ahead of every other asynchronous message.
        // A barrier never makes anything deliverable sooner.
        let need_wake = if idx == 0 {
            self.blocked
        } else {
            self.blocked
                && !msg.is_barrier()
                && msg.is_asynchronous()
                && self.messages.front().is_some_and(Message::is_barrier)
                && !self.messages.iter().take(idx).any(Message::is_asynchronous)
        };

        self.messages.insert(idx, msg);
        need_wake
    }

    fn take(&mut self, idx: usize) -> Option<Message> {
        self.messages.remove(idx)
    }

    fn extract_where<F>(&mut self, mut pred: F) -> Vec<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.messages.len());

        for msg in mem::take(&mut self.messages) {
            if !msg.is_barrier() && pred(&msg) {
                removed.push(msg);
            } else {
                kept.push_back(msg);
            }
        }

        self.messages = kept;
        removed
    }
}

impl MessageQueue {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner {
                next_seq: 1,
                ..Default::default()
            }),
            wake: Condvar::new(),
        }
    }

    /// Current time in this queue's clock domain.
    pub fn uptime_millis(&self) -> u64 {
        self.clock.uptime_millis()
    }

    /// Inserts `msg` to be delivered at `when`.
    ///
    /// Returns `false` if the queue is quitting; the message is dropped and the
    /// queue is left untouched.
    ///
    /// # Panics
    ///
    /// If the message has no target or is already in use.
    #[track_caller]
    pub fn enqueue_message(&self, mut msg: Message, when: u64) -> bool {
        assert!(msg.target.is_some(), "Message must have a target.");
        assert!(!msg.is_in_use(), "This message is already in use.");

        let mut inner = self.inner.lock();

        if inner.quitting {
            drop(inner);
            tracing::warn!(
                what = msg.what,
                when,
                "sending message to a Handler on a dead thread"
            );
            msg.recycle();
            return false;
        }

        msg.mark_in_use();
        if inner.insert(msg, when) {
            self.wake.notify_all();
        }

        tracing::trace!(when, pending = inner.messages.len(), "message enqueued");
        true
    }

    /// Blocks until a message is ready and returns it, or returns `None` once
    /// the queue has quit and nothing ready remains.
    ///
    /// Idle handlers run at most once per call, the first time no ready message
    /// is found.
    ///
    /// Only the looper's own loop and an attached [`TestLooperManager`] drain
    /// the queue.
    ///
    /// [`TestLooperManager`]: crate::TestLooperManager
    pub(crate) fn next(&self) -> Option<Message> {
        let mut idle_pass_done = false;
        let mut inner = self.inner.lock();

        loop {
            let now = self.clock.uptime_millis();

            let lookup = inner.lookup(now);
            let wait = match lookup {
                Lookup::Ready(idx) => {
                    if let Some(msg) = inner.take(idx) {
                        tracing::trace!(when = msg.when, seq = msg.seq, "message dequeued");
                        return Some(msg);
                    }
                    continue;
                }
                Lookup::Pending { wait } => wait,
            };

            if inner.quitting {
                let leftovers = mem::take(&mut inner.messages);
                drop(inner);
                recycle_all(leftovers);
                return None;
            }

            if !idle_pass_done {
                idle_pass_done = true;

                if !inner.idle_handlers.is_empty() {
                    let handlers = inner.idle_handlers.clone();
                    let finished =
                        MutexGuard::unlocked(&mut inner, || run_idle_handlers(&handlers));

                    inner
                        .idle_handlers
                        .retain(|h| !finished.iter().any(|f| Arc::ptr_eq(h, f)));

                    // An idle handler may have enqueued work, look again
                    // before sleeping.
                    continue;
                }
            }

            // `blocked` is only ever true while the lock is released inside
            // the wait below. Producers read it under the same lock, so one
            // that sees `false` is guaranteed the consumer will re-run
            // `lookup` before sleeping, and one that sees `true` must notify.
            // Timeouts and spurious wakeups simply loop back to `lookup`.
            inner.blocked = true;
            match wait {
                Some(ms) => {
                    self.wake.wait_for(&mut inner, Duration::from_millis(ms));
                }
                None => self.wake.wait(&mut inner),
            }
            inner.blocked = false;
        }
    }

    /// Non-blocking variant of `next`: returns the next
    /// ready message, or `None` if nothing is ready (or the queue has quit).
    /// Idle handlers are not run.
    pub(crate) fn poll_next(&self) -> Option<Message> {
        let mut inner = self.inner.lock();
        let lookup = inner.lookup(self.clock.uptime_millis());

        match lookup {
            Lookup::Ready(idx) => inner.take(idx),
            Lookup::Pending { .. } => {
                if inner.quitting {
                    let leftovers = mem::take(&mut inner.messages);
                    drop(inner);
                    recycle_all(leftovers);
                }
                None
            }
        }
    }

    /// Stops accepting messages.
    ///
    /// With `safe == false` every pending message is discarded. With
    /// `safe == true` only messages due after now are discarded; the rest stay
    /// available to `next()`.
    pub(crate) fn quit(&self, safe: bool) {
        let mut inner = self.inner.lock();

        if inner.quitting {
            return;
        }
        inner.quitting = true;

        let discarded = if safe {
            let now = self.clock.uptime_millis();
            let idx = inner.messages.partition_point(|m| m.when <= now);
            inner.messages.split_off(idx)
        } else {
            mem::take(&mut inner.messages)
        };

        self.wake.notify_all();
        drop(inner);

        tracing::debug!(safe, discarded = discarded.len(), "message queue quitting");
        recycle_all(discarded);
    }

    pub fn is_quitting(&self) -> bool {
        self.inner.lock().quitting
    }

    /// Posts a synchronization barrier due now. See
    /// [`post_sync_barrier_at`](MessageQueue::post_sync_barrier_at).
    pub fn post_sync_barrier(&self) -> i32 {
        self.post_sync_barrier_at(self.clock.uptime_millis())
    }

    /// Inserts a barrier among messages at `when`. Once it reaches the head of
    /// the queue, only asynchronous messages are delivered until the barrier is
    /// removed with the returned token.
    pub fn post_sync_barrier_at(&self, when: u64) -> i32 {
        let mut barrier = Message::obtain();
        barrier.mark_in_use();

        let mut inner = self.inner.lock();
        inner.next_barrier_token = inner.next_barrier_token.wrapping_add(1);
        let token = inner.next_barrier_token;

        barrier.arg1 = token;
        inner.insert(barrier, when);

        tracing::trace!(token, when, "sync barrier posted");
        token
    }

    /// # Panics
    ///
    /// If no barrier with this token is pending.
    #[track_caller]
    pub fn remove_sync_barrier(&self, token: i32) {
        let mut inner = self.inner.lock();

        let found = inner
            .messages
            .iter()
            .position(|m| m.is_barrier() && m.arg1 == token);

        let Some(idx) = found else {
            drop(inner);
            panic!(
                "The specified message queue synchronization barrier token has not been posted or has already been removed."
            );
        };

        let barrier = inner.take(idx);
        let need_wake = idx == 0
            && !inner.quitting
            && inner.messages.front().is_none_or(|m| !m.is_barrier());

        if need_wake {
            self.wake.notify_all();
        }
        drop(inner);

        tracing::trace!(token, "sync barrier removed");
        recycle_all(barrier);
    }

    pub fn add_idle_handler(&self, handler: Arc<dyn IdleHandler>) {
        self.inner.lock().idle_handlers.push(handler);
    }

    pub fn remove_idle_handler(&self, handler: &Arc<dyn IdleHandler>) {
        self.inner
            .lock()
            .idle_handlers
            .retain(|h| !Arc::ptr_eq(h, handler));
    }

    /// Removes pending messages for `handler` with code `what` and, if `obj` is
    /// given, that exact payload.
    pub fn remove_messages(&self, handler: &Handler, what: i32, obj: Option<&Payload>) {
        self.remove_where(|m| is_for(m, handler) && m.what == what && obj_matches(m, obj));
    }

    /// Removes pending posts of `runnable` to `handler`, restricted to `token`
    /// when given.
    pub fn remove_callbacks(&self, handler: &Handler, runnable: &Runnable, token: Option<&Payload>) {
        self.remove_where(|m| {
            is_for(m, handler) && callback_matches(m, runnable) && obj_matches(m, token)
        });
    }

    /// Removes every pending message and post for `handler` whose payload is
    /// `token`, or all of them when `token` is `None`.
    pub fn remove_callbacks_and_messages(&self, handler: &Handler, token: Option<&Payload>) {
        self.remove_where(|m| is_for(m, handler) && obj_matches(m, token));
    }

    /// Removes every pending message matching `pred` and returns how many were
    /// removed. Barriers are never matched, and messages already handed out by
    /// `next()` are out of reach.
    pub fn remove_where<F>(&self, pred: F) -> usize
    where
        F: FnMut(&Message) -> bool,
    {
        let removed = self.inner.lock().extract_where(pred);
        let n = removed.len();

        if n > 0 {
            tracing::trace!(removed = n, "messages removed");
        }

        recycle_all(removed);
        n
    }

    pub fn has_messages(&self, handler: &Handler, what: i32, obj: Option<&Payload>) -> bool {
        self.has_matching(|m| is_for(m, handler) && m.what == what && obj_matches(m, obj))
    }

    pub fn has_callbacks(&self, handler: &Handler, runnable: &Runnable, token: Option<&Payload>) -> bool {
        self.has_matching(|m| {
            is_for(m, handler) && callback_matches(m, runnable) && obj_matches(m, token)
        })
    }

    /// Whether any pending, non-barrier message matches `pred`.
    pub fn has_matching<F>(&self, pred: F) -> bool
    where
        F: Fn(&Message) -> bool,
    {
        self.inner
            .lock()
            .messages
            .iter()
            .any(|m| !m.is_barrier() && pred(m))
    }

    /// Whether `next()` would have to wait right now.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        matches!(
            inner.lookup(self.clock.uptime_millis()),
            Lookup::Pending { .. }
        )
    }

    /// Whether the consumer is currently parked waiting for messages.
    pub fn is_polling(&self) -> bool {
        let inner = self.inner.lock();
        inner.blocked && !inner.quitting
    }

    /// Whether a barrier at the head is the only reason nothing is ready.
    pub fn is_blocked_on_sync_barrier(&self) -> bool {
        let inner = self.inner.lock();
        inner.messages.front().is_some_and(Message::is_barrier)
            && matches!(
                inner.lookup(self.clock.uptime_millis()),
                Lookup::Pending { .. }
            )
    }

    /// Due time of the message `next()` would deliver, barriers considered.
    pub fn peek_when(&self) -> Option<u64> {
        let inner = self.inner.lock();
        inner.deliverable().map(|idx| inner.messages[idx].when)
    }

    /// Number of pending messages, barriers included.
    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().messages.is_empty()
    }

    /// Prints every pending message, or only those targeting `handler`.
    pub fn dump(&self, printer: &dyn Printer, prefix: &str, handler: Option<&Handler>) {
        let (lines, total, polling, quitting) = {
            let inner = self.inner.lock();
            let now = self.clock.uptime_millis();

            let lines = inner
                .messages
                .iter()
                .enumerate()
                .filter(|(_, m)| handler.is_none_or(|h| is_for(m, h)))
                .map(|(i, m)| format!("{prefix}Message {i}: {}", m.describe(now)))
                .collect::<Vec<_>>();

            let total = lines.len();
            (lines, total, inner.blocked && !inner.quitting, inner.quitting)
        };

        for line in &lines {
            printer.println(line);
        }
        printer.println(&format!(
            "{prefix}(Total messages: {total}, polling={polling}, quitting={quitting})"
        ));
    }

    pub(crate) fn attach_harness(&self) -> Result<(), LooperError> {
        let mut inner = self.inner.lock();

        if inner.harness_attached {
            Err(LooperError::AlreadyAcquired)
        } else if inner.quitting {
            Err(LooperError::Quitting)
        } else {
            inner.harness_attached = true;
            Ok(())
        }
    }

    pub(crate) fn is_harness_attached(&self) -> bool {
        self.inner.lock().harness_attached
    }

    pub(crate) fn detach_harness(&self) {
        self.inner.lock().harness_attached = false;
    }
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MessageQueue")
            .field("clock", &self.clock)
            .field("pending", &inner.messages.len())
            .field("idle_handlers", &inner.idle_handlers.len())
            .field("quitting", &inner.quitting)
            .field("blocked", &inner.blocked)
            .finish()
    }
}

fn is_for(msg: &Message, handler: &Handler) -> bool {
    msg.target.as_ref().is_some_and(|t| t.id() == handler.id())
}

fn obj_matches(msg: &Message, obj: Option<&Payload>) -> bool {
    obj.is_none_or(|obj| msg.obj.as_ref().is_some_and(|o| Arc::ptr_eq(o, obj)))
}

fn callback_matches(msg: &Message, runnable: &Runnable) -> bool {
    msg.callback.as_ref().is_some_and(|c| c.ptr_eq(runnable))
}

// Dropping messages may drop the last reference to a handler, keep it out of
// the queue lock.
fn recycle_all<I>(messages: I)
where
    I: IntoIterator<Item = Message>,
{
    messages.into_iter().for_each(Message::recycle);
}

/// Runs every idle handler and returns those that asked to be removed. A
/// panicking idle handler is logged and removed.
fn run_idle_handlers(handlers: &[Arc<dyn IdleHandler>]) -> Vec<Arc<dyn IdleHandler>> {
    handlers
        .iter()
        .filter(
            |handler| match panic::catch_unwind(AssertUnwindSafe(|| handler.queue_idle())) {
                Ok(keep) => !keep,
                Err(payload) => {
                    tracing::error!(
                        reason = panic_payload_as_str(&*payload).unwrap_or("<non-string panic payload>"),
                        "IdleHandler panicked, removing it"
                    );
                    true
                }
            },
        )
        .cloned()
        .collect()
}
