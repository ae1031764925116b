//! A thread that owns a [`Looper`] and publishes it to other threads.

use crate::errors::LooperError;
use crate::handler::Handler;
use crate::looper::{self, Looper};
use crate::utils::ScopeGuard;
use crate::utils::thread::{
    THREAD_PRIORITY_DEFAULT, THREAD_PRIORITY_HIGHEST, THREAD_PRIORITY_LOWEST,
    set_current_thread_priority,
};
use anyhow::{Result, anyhow};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

type OnLooperPrepared = Arc<dyn Fn(&Looper) + Send + Sync + 'static>;

/// Lifecycle of a [`HandlerThread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Not started yet.
    New,

    /// Spawned, the looper is not published yet.
    Starting,

    /// Looper published, the loop is about to start.
    Ready,

    Running,

    QuitRequested,

    /// The loop has exited, or the thread died before publishing its looper.
    Terminated,
}

pub struct Builder {
    name: String,

    /// Nice value, from [`THREAD_PRIORITY_HIGHEST`] to [`THREAD_PRIORITY_LOWEST`].
    priority: i32,

    stack_size: Option<usize>,

    on_looper_prepared: Option<OnLooperPrepared>,

    looper: looper::Builder,
}

impl Builder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: THREAD_PRIORITY_DEFAULT,
            stack_size: None,
            on_looper_prepared: None,
            looper: looper::Builder::new(),
        }
    }

    /// Sets the thread's nice value. Values outside `-20..=19` panic. Failing
    /// to apply it, e.g. for lack of privileges, is logged and ignored.
    #[track_caller]
    pub fn priority(&mut self, nice: i32) -> &mut Self {
        assert!(
            (THREAD_PRIORITY_HIGHEST..=THREAD_PRIORITY_LOWEST).contains(&nice),
            "priority must be between {THREAD_PRIORITY_HIGHEST} and {THREAD_PRIORITY_LOWEST}"
        );
        self.priority = nice;
        self
    }

    pub fn stack_size(&mut self, val: usize) -> &mut Self {
        self.stack_size = Some(val);
        self
    }

    /// Runs on the new thread after its looper is prepared and before that
    /// looper is published to [`HandlerThread::looper`] callers.
    pub fn on_looper_prepared<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&Looper) + Send + Sync + 'static,
    {
        self.on_looper_prepared = Some(Arc::new(f));
        self
    }

    /// Configuration of the looper prepared on the new thread.
    pub fn looper(&mut self, builder: looper::Builder) -> &mut Self {
        self.looper = builder;
        self
    }

    pub fn build(&self) -> HandlerThread {
        HandlerThread {
            name: self.name.clone(),
            priority: self.priority,
            stack_size: self.stack_size,
            on_looper_prepared: self.on_looper_prepared.clone(),
            looper_builder: self.looper.clone(),
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: State::New,
                    thread_id: None,
                    looper: None,
                    handler: None,
                }),
                published: Condvar::new(),
            }),
            join_handle: Mutex::new(None),
        }
    }
}

/// Thread running a message loop, with a looper other threads can wait for.
///
/// ```ignore
/// let thread = HandlerThread::new("worker");
/// thread.start()?;
/// let handler = thread.thread_handler().unwrap();
/// handler.post(|| println!("on worker"));
/// thread.quit_safely();
/// thread.join()?;
/// ```
pub struct HandlerThread {
    name: String,
    priority: i32,
    stack_size: Option<usize>,
    on_looper_prepared: Option<OnLooperPrepared>,
    looper_builder: looper::Builder,

    shared: Arc<Shared>,

    join_handle: Mutex<Option<JoinHandle<()>>>,
}

// State shared with the spawned thread.
struct Shared {
    inner: Mutex<Inner>,

    /// Signalled when the looper is published or the thread terminates.
    published: Condvar,
}

struct Inner {
    state: State,
    thread_id: Option<ThreadId>,
    looper: Option<Looper>,
    handler: Option<Handler>,
}

impl Shared {
    fn publish(&self, looper: Looper) {
        let mut inner = self.inner.lock();
        inner.looper = Some(looper);
        inner.state = State::Ready;
        self.published.notify_all();
    }

    fn transition(&self, from: State, to: State) {
        let mut inner = self.inner.lock();
        if inner.state == from {
            inner.state = to;
        }
    }

    fn terminate(&self) {
        let (looper, handler) = {
            let mut inner = self.inner.lock();
            inner.state = State::Terminated;
            self.published.notify_all();
            (inner.looper.take(), inner.handler.take())
        };

        // Dropped outside the lock, they may release the last queue reference.
        drop(handler);
        drop(looper);
    }
}

impl HandlerThread {
    pub fn new(name: impl Into<String>) -> Self {
        Builder::new(name).build()
    }

    #[track_caller]
    pub fn with_priority(name: impl Into<String>, nice: i32) -> Self {
        Builder::new(name).priority(nice).build()
    }

    pub fn builder(name: impl Into<String>) -> Builder {
        Builder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        self.shared.inner.lock().state
    }

    /// Id of the spawned thread, once started.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.shared.inner.lock().thread_id
    }

    /// Spawns the thread. A handler thread can only be started once.
    pub fn start(&self) -> Result<(), LooperError> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state != State::New {
                return Err(LooperError::AlreadyStarted);
            }
            inner.state = State::Starting;
        }

        let mut builder = thread::Builder::new().name(self.name.clone());
        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let shared = Arc::clone(&self.shared);
        let priority = self.priority;
        let looper_builder = self.looper_builder.clone();
        let on_looper_prepared = self.on_looper_prepared.clone();

        let handle = builder
            .spawn(move || thread_main(shared, priority, looper_builder, on_looper_prepared))
            .inspect_err(|_| self.shared.terminate())?;

        self.shared.inner.lock().thread_id = Some(handle.thread().id());
        *self.join_handle.lock() = Some(handle);

        tracing::debug!(name = %self.name, "handler thread started");
        Ok(())
    }

    /// Blocks until the thread has published its looper.
    ///
    /// Returns `None` if the thread was never started, or has terminated.
    pub fn looper(&self) -> Option<Looper> {
        let mut inner = self.shared.inner.lock();

        loop {
            match inner.state {
                State::New | State::Terminated => return None,
                State::Starting => self.shared.published.wait(&mut inner),
                State::Ready | State::Running | State::QuitRequested => {
                    return inner.looper.clone();
                }
            }
        }
    }

    /// A [`Handler`] bound to this thread's looper, created on first use.
    pub fn thread_handler(&self) -> Option<Handler> {
        let looper = self.looper()?;
        let mut inner = self.shared.inner.lock();

        if inner.state == State::Terminated {
            return None;
        }

        Some(
            inner
                .handler
                .get_or_insert_with(|| Handler::new(&looper))
                .clone(),
        )
    }

    /// Quits the looper, discarding pending messages. Returns `false` if there
    /// is no running looper to quit.
    pub fn quit(&self) -> bool {
        self.request_quit(false)
    }

    /// Quits the looper once the messages already due are processed. Returns
    /// `false` if there is no running looper to quit.
    pub fn quit_safely(&self) -> bool {
        self.request_quit(true)
    }

    fn request_quit(&self, safe: bool) -> bool {
        let Some(looper) = self.looper() else {
            return false;
        };

        let res = if safe { looper.quit_safely() } else { looper.quit() };

        match res {
            Ok(()) => {
                let mut inner = self.shared.inner.lock();
                if matches!(inner.state, State::Ready | State::Running) {
                    inner.state = State::QuitRequested;
                }
                true
            }
            Err(e) => {
                tracing::warn!(name = %self.name, error = %e, "handler thread cannot quit");
                false
            }
        }
    }

    /// Waits for the thread to exit. Errors if the thread panicked.
    pub fn join(&self) -> Result<()> {
        let Some(handle) = self.join_handle.lock().take() else {
            return Ok(());
        };

        handle
            .join()
            .map_err(|_| anyhow!("handler thread {} panicked", self.name))
    }
}

impl Drop for HandlerThread {
    fn drop(&mut self) {
        let started = self.join_handle.get_mut().is_some();
        if started && self.state() != State::Terminated {
            self.quit_safely();
        }
    }
}

impl fmt::Debug for HandlerThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerThread")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.state())
            .finish()
    }
}

fn thread_main(
    shared: Arc<Shared>,
    priority: i32,
    looper_builder: looper::Builder,
    on_looper_prepared: Option<OnLooperPrepared>,
) {
    let _terminated = ScopeGuard::new(|| shared.terminate());

    if priority != THREAD_PRIORITY_DEFAULT {
        if let Err(e) = set_current_thread_priority(priority) {
            tracing::warn!(priority, error = %e, "failed to set handler thread priority");
        }
    }

    let looper = match looper_builder.try_prepare() {
        Ok(looper) => looper,
        Err(e) => {
            tracing::error!(error = %e, "handler thread failed to prepare its looper");
            return;
        }
    };

    // Declared after `_terminated`, so the registration is gone by the time
    // waiters observe `Terminated`, even when the hook panics.
    let registered = looper.clone();
    let _registration = ScopeGuard::new(move || registered.deregister());

    if let Some(hook) = &on_looper_prepared {
        hook(&looper);
    }

    shared.publish(looper);
    shared.transition(State::Ready, State::Running);

    if let Err(e) = Looper::run() {
        tracing::error!(error = %e, "handler thread loop failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    assert_impl_all!(HandlerThread: Send, Sync);

    #[test]
    fn test_looper_published_after_hook() {
        let hook_done = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&hook_done);
        let thread = HandlerThread::builder("hook-first")
            .on_looper_prepared(move |looper| {
                assert_eq!(Looper::my_looper().as_ref(), Some(looper));
                thread::sleep(Duration::from_millis(50));
                flag.store(true, Ordering::SeqCst);
            })
            .build();

        thread.start().unwrap();
        let looper = thread.looper().unwrap();

        assert!(hook_done.load(Ordering::SeqCst));
        assert_eq!(looper.thread().name(), Some("hook-first"));
        assert!(!looper.is_current_thread());

        assert!(thread.quit());
        thread.join().unwrap();
    }

    #[test]
    fn test_lifecycle() {
        let thread = HandlerThread::new("lifecycle");
        assert_eq!(thread.state(), State::New);
        assert!(thread.looper().is_none());
        assert!(thread.thread_handler().is_none());
        assert!(!thread.quit_safely());

        thread.start().unwrap();
        assert!(matches!(thread.start(), Err(LooperError::AlreadyStarted)));

        let handler = thread.thread_handler().unwrap();
        assert_eq!(thread.thread_handler(), Some(handler.clone()));
        assert_eq!(thread.looper().unwrap().thread().id(), thread.thread_id().unwrap());

        let (tx, rx) = mpsc::channel();
        assert!(handler.post(move || {
            tx.send(thread::current().name().map(String::from)).unwrap();
        }));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap().as_deref(),
            Some("lifecycle")
        );

        assert!(thread.quit_safely());
        thread.join().unwrap();

        assert_eq!(thread.state(), State::Terminated);
        assert!(thread.looper().is_none());
        assert!(!handler.post(|| {}));
    }

    #[test]
    fn test_quit_safely_drains_due_messages() {
        let thread = HandlerThread::new("drain");
        thread.start().unwrap();
        let handler = thread.thread_handler().unwrap();

        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            handler.post(move || tx.send(i).unwrap());
        }
        let late = tx.clone();
        handler.post_delayed(move || late.send(99).unwrap(), Duration::from_secs(60));
        drop(tx);

        thread.quit_safely();
        thread.join().unwrap();

        let received = rx.iter().collect::<Vec<_>>();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_hook_panic_terminates() {
        let thread = HandlerThread::builder("hook-panics")
            .on_looper_prepared(|_| panic!("hook failed"))
            .build();

        thread.start().unwrap();

        assert!(thread.looper().is_none());
        assert!(thread.join().is_err());
        assert_eq!(thread.state(), State::Terminated);
    }

    #[test]
    fn test_hook_panic_releases_registration() {
        let prepared = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&prepared);
        let thread = HandlerThread::builder("hook-panics-registered")
            .on_looper_prepared(move |looper| {
                *slot.lock() = Some(looper.clone());
                panic!("hook failed");
            })
            .build();

        thread.start().unwrap();
        assert!(thread.looper().is_none());

        let looper = prepared.lock().take().unwrap();
        assert!(!looper.is_registered());
        assert!(thread.join().is_err());
        assert!(!looper.is_registered());
    }

    #[test]
    fn test_quit_not_allowed() {
        let mut looper_builder = looper::Builder::new();
        looper_builder.quit_allowed(false);

        let thread = HandlerThread::builder("no-quit")
            .looper(looper_builder)
            .build();
        thread.start().unwrap();

        assert!(!thread.quit());
        assert!(matches!(thread.state(), State::Ready | State::Running));
        assert!(!thread.looper().unwrap().queue().is_quitting());
    }

    #[test]
    #[should_panic(expected = "priority must be between")]
    fn test_priority_out_of_range() {
        HandlerThread::with_priority("bad", 20);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_priority_applied() {
        use crate::utils::thread::get_current_thread_priority;

        let thread = HandlerThread::with_priority("nice", 10);
        thread.start().unwrap();

        let (tx, rx) = mpsc::channel();
        thread.thread_handler().unwrap().post(move || {
            tx.send(get_current_thread_priority().unwrap()).unwrap();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 10);
        thread.quit();
        thread.join().unwrap();
    }
}
