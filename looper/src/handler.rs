use crate::clock::duration_to_millis;
use crate::errors::LooperError;
use crate::looper::Looper;
use crate::message::{HandlerId, Message, Payload, Runnable};
use crate::printer::Printer;
use crate::queue::MessageQueue;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Receives the messages a [`Handler`] dispatches that do not carry a
/// [`Runnable`].
pub trait Callback: Send + Sync {
    /// Returns `true` if the message was handled.
    fn handle_message(&self, msg: &Message) -> bool;
}

impl<F> Callback for F
where
    F: Fn(&Message) -> bool + Send + Sync,
{
    fn handle_message(&self, msg: &Message) -> bool {
        self(msg)
    }
}

/// Sends messages and runnables to a [`Looper`] and processes them on that
/// looper's thread.
///
/// Cloning is cheap; clones share the same identity, so messages sent through
/// one clone can be removed through another.
#[derive(Clone)]
pub struct Handler {
    inner: Arc<Inner>,
}

struct Inner {
    id: HandlerId,

    looper: Looper,

    callback: Option<Arc<dyn Callback>>,

    /// Every message sent through this handler bypasses sync barriers.
    asynchronous: bool,
}

impl Handler {
    fn build(looper: &Looper, callback: Option<Arc<dyn Callback>>, asynchronous: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: HandlerId::next(),
                looper: looper.clone(),
                callback,
                asynchronous,
            }),
        }
    }

    pub fn new(looper: &Looper) -> Self {
        Self::build(looper, None, false)
    }

    pub fn with_callback<C>(looper: &Looper, callback: C) -> Self
    where
        C: Callback + 'static,
    {
        Self::build(looper, Some(Arc::new(callback)), false)
    }

    /// A handler whose messages are all asynchronous, i.e. never held back by
    /// a sync barrier.
    pub fn create_async(looper: &Looper) -> Self {
        Self::build(looper, None, true)
    }

    pub fn create_async_with_callback<C>(looper: &Looper, callback: C) -> Self
    where
        C: Callback + 'static,
    {
        Self::build(looper, Some(Arc::new(callback)), true)
    }

    /// Handler bound to the current thread's looper.
    pub fn for_current_thread() -> Result<Self, LooperError> {
        Looper::my_looper()
            .map(|looper| Self::new(&looper))
            .ok_or(LooperError::NotPrepared)
    }

    pub fn id(&self) -> HandlerId {
        self.inner.id
    }

    pub fn looper(&self) -> &Looper {
        &self.inner.looper
    }

    pub fn is_asynchronous(&self) -> bool {
        self.inner.asynchronous
    }

    fn queue(&self) -> &MessageQueue {
        self.inner.looper.queue()
    }

    /// A pooled message already targeting this handler.
    pub fn obtain_message(&self) -> Message {
        let mut msg = Message::obtain();
        msg.set_target(self.clone());
        msg
    }

    fn runnable_message(&self, runnable: Runnable, token: Option<Payload>) -> Message {
        let mut msg = Message::obtain();
        msg.callback = Some(runnable);
        msg.obj = token;
        msg
    }

    pub fn post(&self, runnable: impl Into<Runnable>) -> bool {
        self.send_message_delayed(self.runnable_message(runnable.into(), None), Duration::ZERO)
    }

    /// Runs `runnable` once the queue clock reaches `uptime_millis`.
    pub fn post_at_time(&self, runnable: impl Into<Runnable>, uptime_millis: u64) -> bool {
        self.send_message_at_time(self.runnable_message(runnable.into(), None), uptime_millis)
    }

    /// Like [`post_at_time`](Handler::post_at_time); the post can later be
    /// removed by `token` with [`remove_callbacks_and_messages`].
    ///
    /// [`remove_callbacks_and_messages`]: Handler::remove_callbacks_and_messages
    pub fn post_at_time_with_token(
        &self,
        runnable: impl Into<Runnable>,
        token: Payload,
        uptime_millis: u64,
    ) -> bool {
        self.send_message_at_time(
            self.runnable_message(runnable.into(), Some(token)),
            uptime_millis,
        )
    }

    pub fn post_delayed(&self, runnable: impl Into<Runnable>, delay: Duration) -> bool {
        self.send_message_delayed(self.runnable_message(runnable.into(), None), delay)
    }

    pub fn post_delayed_with_token(
        &self,
        runnable: impl Into<Runnable>,
        token: Payload,
        delay: Duration,
    ) -> bool {
        self.send_message_delayed(self.runnable_message(runnable.into(), Some(token)), delay)
    }

    /// Places `runnable` ahead of everything already queued.
    pub fn post_at_front_of_queue(&self, runnable: impl Into<Runnable>) -> bool {
        self.send_message_at_front_of_queue(self.runnable_message(runnable.into(), None))
    }

    pub fn send_message(&self, msg: Message) -> bool {
        self.send_message_delayed(msg, Duration::ZERO)
    }

    pub fn send_empty_message(&self, what: i32) -> bool {
        self.send_empty_message_delayed(what, Duration::ZERO)
    }

    pub fn send_empty_message_delayed(&self, what: i32, delay: Duration) -> bool {
        self.send_message_delayed(Message::obtain().with_what(what), delay)
    }

    pub fn send_empty_message_at_time(&self, what: i32, uptime_millis: u64) -> bool {
        self.send_message_at_time(Message::obtain().with_what(what), uptime_millis)
    }

    pub fn send_message_delayed(&self, msg: Message, delay: Duration) -> bool {
        let when = self
            .queue()
            .uptime_millis()
            .saturating_add(duration_to_millis(delay));
        self.send_message_at_time(msg, when)
    }

    /// Enqueues `msg` for delivery once the queue clock reaches
    /// `uptime_millis`. Returns `false` if the looper is quitting.
    ///
    /// # Panics
    ///
    /// If `msg` was already enqueued or handed out by a looper.
    #[track_caller]
    pub fn send_message_at_time(&self, msg: Message, uptime_millis: u64) -> bool {
        self.enqueue(msg, uptime_millis)
    }

    /// Enqueues `msg` ahead of everything already queued, including earlier
    /// front-of-queue messages.
    #[track_caller]
    pub fn send_message_at_front_of_queue(&self, msg: Message) -> bool {
        self.enqueue(msg, 0)
    }

    #[track_caller]
    fn enqueue(&self, mut msg: Message, when: u64) -> bool {
        msg.set_target(self.clone());
        if self.inner.asynchronous {
            msg.set_asynchronous(true);
        }
        self.queue().enqueue_message(msg, when)
    }

    pub fn remove_callbacks(&self, runnable: &Runnable) {
        self.queue().remove_callbacks(self, runnable, None);
    }

    pub fn remove_callbacks_with_token(&self, runnable: &Runnable, token: &Payload) {
        self.queue().remove_callbacks(self, runnable, Some(token));
    }

    pub fn remove_messages(&self, what: i32) {
        self.queue().remove_messages(self, what, None);
    }

    pub fn remove_messages_with_object(&self, what: i32, obj: &Payload) {
        self.queue().remove_messages(self, what, Some(obj));
    }

    /// Removes every pending post and message whose payload is `token`, or
    /// everything this handler has pending when `token` is `None`.
    pub fn remove_callbacks_and_messages(&self, token: Option<&Payload>) {
        self.queue().remove_callbacks_and_messages(self, token);
    }

    pub fn has_messages(&self, what: i32) -> bool {
        self.queue().has_messages(self, what, None)
    }

    pub fn has_messages_with_object(&self, what: i32, obj: &Payload) -> bool {
        self.queue().has_messages(self, what, Some(obj))
    }

    pub fn has_callbacks(&self, runnable: &Runnable) -> bool {
        self.queue().has_callbacks(self, runnable, None)
    }

    /// Processes `msg` on the calling thread: its runnable if it has one,
    /// otherwise this handler's [`Callback`].
    pub fn dispatch_message(&self, msg: &Message) {
        if let Some(runnable) = msg.callback() {
            runnable.run();
            return;
        }

        let handled = self
            .inner
            .callback
            .as_ref()
            .is_some_and(|callback| callback.handle_message(msg));

        if !handled {
            tracing::trace!(handler = %self.id(), what = msg.what, "message not handled");
        }
    }

    /// Short name for `msg`, used in logs: the runnable or the hex `what`.
    pub fn message_name(&self, msg: &Message) -> String {
        match msg.callback() {
            Some(runnable) => runnable.to_string(),
            None => format!("0x{:x}", msg.what),
        }
    }

    /// Prints this handler followed by its pending messages.
    pub fn dump(&self, printer: &dyn Printer, prefix: &str) {
        printer.println(&format!(
            "{prefix}{self} @ {}",
            self.queue().uptime_millis()
        ));
        self.queue()
            .dump(printer, &format!("{prefix}  "), Some(self));
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Handler {}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handler ({}) {{{}}}",
            self.inner.id,
            self.inner.looper.thread().name().unwrap_or("<unnamed>")
        )
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.inner.id)
            .field("thread", &self.inner.looper.thread().id())
            .field("has_callback", &self.inner.callback.is_some())
            .field("asynchronous", &self.inner.asynchronous)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingCallback, RecordingPrinter, init_looper};
    use static_assertions::assert_impl_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    assert_impl_all!(Handler: Send, Sync, Clone);

    fn drain(looper: &Looper) {
        while let Some(msg) = looper.queue().poll_next() {
            msg.dispatch();
            msg.recycle();
        }
    }

    #[test]
    fn test_post_runs_runnable() {
        let (looper, handler, _clock) = init_looper();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        assert!(handler.post(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        drain(&looper);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        looper.quit().unwrap();
    }

    #[test]
    fn test_runnable_takes_precedence_over_callback() {
        let (looper, _, _clock) = init_looper();
        let callback = RecordingCallback::default();
        let handler = Handler::with_callback(&looper, callback.clone());
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        handler.post(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        handler.send_empty_message(7);

        drain(&looper);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(callback.whats(), vec![7]);
        looper.quit().unwrap();
    }

    #[test]
    fn test_delays_use_queue_clock() {
        let (looper, handler, clock) = init_looper();
        clock.set(1_000);

        handler.send_empty_message_delayed(1, Duration::from_millis(250));
        assert_eq!(looper.queue().peek_when(), Some(1_250));

        handler.send_empty_message_at_time(2, 1_100);
        assert_eq!(looper.queue().peek_when(), Some(1_100));

        handler.send_empty_message_delayed(3, Duration::MAX);
        assert!(handler.has_messages(3));
        looper.quit().unwrap();
    }

    #[test]
    fn test_front_of_queue_is_fifo_among_fronts() {
        let (looper, _, clock) = init_looper();
        let callback = RecordingCallback::default();
        let handler = Handler::with_callback(&looper, callback.clone());
        clock.set(50);

        handler.send_empty_message(1);
        handler.send_message_at_front_of_queue(Message::obtain().with_what(2));
        handler.send_message_at_front_of_queue(Message::obtain().with_what(3));

        drain(&looper);
        assert_eq!(callback.whats(), vec![2, 3, 1]);
        looper.quit().unwrap();
    }

    #[test]
    fn test_remove_callbacks_by_identity_and_token() {
        let (looper, handler, _clock) = init_looper();
        let a = Runnable::new(|| {});
        let b = Runnable::new(|| {});
        let token: Payload = Arc::new("token");

        handler.post(a.clone());
        handler.post_delayed_with_token(a.clone(), Arc::clone(&token), Duration::from_millis(5));
        handler.post(b.clone());

        handler.remove_callbacks_with_token(&a, &token);
        assert!(handler.has_callbacks(&a));
        assert_eq!(looper.queue().len(), 2);

        handler.remove_callbacks(&a);
        assert!(!handler.has_callbacks(&a));
        assert!(handler.has_callbacks(&b));
        looper.quit().unwrap();
    }

    #[test]
    fn test_remove_is_scoped_to_handler() {
        let (looper, first, _clock) = init_looper();
        let second = Handler::new(&looper);
        let obj: Payload = Arc::new(5_u32);

        first.send_empty_message(1);
        first.send_message(Message::obtain().with_what(1).with_obj(Arc::clone(&obj)));
        second.send_empty_message(1);

        assert!(first.has_messages_with_object(1, &obj));
        first.remove_messages_with_object(1, &obj);
        assert!(!first.has_messages_with_object(1, &obj));
        assert!(first.has_messages(1));

        first.remove_callbacks_and_messages(None);
        assert!(!first.has_messages(1));
        assert!(second.has_messages(1));
        looper.quit().unwrap();
    }

    #[test]
    fn test_async_handler_marks_messages() {
        let (looper, _, _clock) = init_looper();
        let handler = Handler::create_async(&looper);

        handler.send_empty_message(1);
        let msg = looper.queue().poll_next().unwrap();
        assert!(msg.is_asynchronous());
        assert_eq!(msg.target(), Some(&handler));

        msg.recycle();
        looper.quit().unwrap();
    }

    #[test]
    fn test_send_after_quit_is_rejected() {
        let (looper, handler, _clock) = init_looper();
        looper.quit().unwrap();

        assert!(!handler.send_empty_message(1));
        assert!(!handler.post(|| {}));
        assert!(looper.queue().is_empty());
    }

    #[test]
    fn test_message_name_and_dump() {
        let (looper, handler, clock) = init_looper();
        clock.set(10);
        let runnable = Runnable::new(|| {});

        let mut msg = handler.obtain_message().with_what(255);
        assert_eq!(handler.message_name(&msg), "0xff");
        msg.callback = Some(runnable.clone());
        assert_eq!(handler.message_name(&msg), runnable.to_string());
        msg.recycle();

        handler.send_empty_message_delayed(4, Duration::from_millis(5));
        let printer = RecordingPrinter::default();
        handler.dump(&printer, "");

        let lines = printer.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Handler ("));
        assert!(lines[1].contains("when=+5ms what=4"));
        assert!(lines[2].contains("Total messages: 1"));
        looper.quit().unwrap();
    }

    #[test]
    fn test_for_current_thread_requires_looper() {
        std::thread::spawn(|| {
            assert!(matches!(
                Handler::for_current_thread(),
                Err(LooperError::NotPrepared)
            ));
        })
        .join()
        .unwrap();
    }
}
