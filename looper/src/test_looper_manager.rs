//! Single-step control over a [`Looper`]'s queue, for tests.
//!
//! While a [`TestLooperManager`] is held, the looper thread is parked and the
//! holder pulls messages out of the queue and decides when, and whether, each
//! one is dispatched.

use crate::errors::{DispatchPanic, LooperError};
use crate::handler::Handler;
use crate::looper::Looper;
use crate::message::{Message, Payload};
use crate::queue::MessageQueue;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

pub struct TestLooperManager {
    looper: Looper,

    queue: Arc<MessageQueue>,

    /// Parks the looper thread. `None` when acquired on the looper thread
    /// itself, in which case messages run on the caller.
    holder: Option<Arc<Holder>>,

    released: bool,
}

// Rendezvous between the manager and the parked looper thread.
#[derive(Default)]
struct Holder {
    state: Mutex<HolderState>,
    cond: Condvar,
}

#[derive(Default)]
struct HolderState {
    /// The looper thread is parked in the holder message.
    blocked: bool,

    /// The holder message was dropped without running, e.g. by a quit.
    abandoned: bool,

    released: bool,

    request: Option<Message>,

    response: Option<(Message, thread::Result<()>)>,
}

impl Holder {
    // Runs on the looper thread until released, dispatching what `execute`
    // hands over.
    fn hold(&self) {
        let mut state = self.state.lock();
        state.blocked = true;
        self.cond.notify_all();

        loop {
            if let Some(msg) = state.request.take() {
                let result = MutexGuard::unlocked(&mut state, || {
                    panic::catch_unwind(AssertUnwindSafe(|| msg.dispatch()))
                });
                state.response = Some((msg, result));
                self.cond.notify_all();
                continue;
            }

            if state.released {
                break;
            }

            self.cond.wait(&mut state);
        }

        tracing::debug!("looper thread resumed");
    }

    fn wait_until_blocked(&self) -> bool {
        let mut state = self.state.lock();
        while !state.blocked && !state.abandoned {
            self.cond.wait(&mut state);
        }
        state.blocked
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.released = true;
        self.cond.notify_all();
    }
}

// Owned by the posted holder runnable. Dropping it means the runnable is gone,
// either after running or discarded unexecuted.
struct HolderTicket(Arc<Holder>);

impl Drop for HolderTicket {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.abandoned = true;
        self.0.cond.notify_all();
    }
}

impl TestLooperManager {
    /// Takes control of `looper`'s queue.
    ///
    /// Off the looper thread this waits until the looper has processed
    /// everything queued ahead of the request and parked itself.
    pub fn acquire(looper: &Looper) -> Result<Self, LooperError> {
        let queue = Arc::clone(looper.queue());
        queue.attach_harness()?;

        let holder = if looper.is_current_thread() {
            None
        } else {
            let holder = Arc::new(Holder::default());
            let ticket = HolderTicket(Arc::clone(&holder));

            let posted = Handler::new(looper).post(move || ticket.0.hold());
            if !posted || !holder.wait_until_blocked() {
                queue.detach_harness();
                return Err(LooperError::Quitting);
            }

            Some(holder)
        };

        tracing::debug!(thread = ?looper.thread().name(), "test looper manager acquired");

        Ok(Self {
            looper: looper.clone(),
            queue,
            holder,
            released: false,
        })
    }

    pub fn looper(&self) -> &Looper {
        &self.looper
    }

    pub fn message_queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// Blocks until a message is ready. `None` once the queue has quit.
    pub fn next(&self) -> Option<Message> {
        self.queue.next()
    }

    /// Returns a ready message without blocking.
    pub fn poll(&self) -> Option<Message> {
        self.queue.poll_next()
    }

    /// Due time of the message `next()` would return.
    pub fn peek_when(&self) -> Option<u64> {
        self.queue.peek_when()
    }

    /// Dispatches `msg` on the looper thread and waits for it to finish.
    ///
    /// A panic in the target is caught on the looper thread, which keeps
    /// running, and returned here.
    pub fn execute(&self, msg: &mut Message) -> Result<(), DispatchPanic> {
        let target = msg
            .target()
            .map_or_else(|| String::from("<barrier>"), ToString::to_string);

        let result = match &self.holder {
            None => panic::catch_unwind(AssertUnwindSafe(|| msg.dispatch())),
            Some(holder) => {
                let mut state = holder.state.lock();
                state.request = Some(mem::take(msg));
                holder.cond.notify_all();

                let (back, result) = loop {
                    if let Some(response) = state.response.take() {
                        break response;
                    }
                    holder.cond.wait(&mut state);
                };

                *msg = back;
                result
            }
        };

        result.map_err(|payload| DispatchPanic::new(target, payload))
    }

    pub fn recycle(&self, msg: Message) {
        msg.recycle();
    }

    pub fn has_messages(&self, handler: &Handler, what: i32, obj: Option<&Payload>) -> bool {
        self.queue.has_messages(handler, what, obj)
    }

    /// Gives the queue back to the looper. Also happens on drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if mem::replace(&mut self.released, true) {
            return;
        }

        self.queue.detach_harness();
        if let Some(holder) = &self.holder {
            holder.release();
        }

        tracing::debug!(thread = ?self.looper.thread().name(), "test looper manager released");
    }
}

impl Drop for TestLooperManager {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for TestLooperManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestLooperManager")
            .field("looper", &self.looper)
            .field("on_looper_thread", &self.holder.is_none())
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler_thread::HandlerThread;
    use crate::message::Runnable;
    use crate::test_utils::init_looper;
    use static_assertions::assert_impl_all;
    use std::sync::mpsc;
    use std::time::Duration;

    assert_impl_all!(TestLooperManager: Send, Sync);

    #[test]
    fn test_execute_panic_reaches_caller_and_thread_survives() {
        let thread = HandlerThread::new("harnessed");
        thread.start().unwrap();
        let looper = thread.looper().unwrap();
        let handler = thread.thread_handler().unwrap();

        let manager = TestLooperManager::acquire(&looper).unwrap();
        handler.post(|| panic!("target exploded"));

        let mut msg = manager.next().unwrap();
        let err = manager.execute(&mut msg).unwrap_err();
        assert_eq!(err.reason(), "target exploded");
        assert!(err.target().starts_with("Handler ("));
        manager.recycle(msg);
        manager.release();

        // The looper thread is still dispatching.
        let (tx, rx) = mpsc::channel();
        handler.post(move || tx.send(thread::current().name().map(String::from)).unwrap());
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap().as_deref(),
            Some("harnessed")
        );

        assert!(thread.quit());
        thread.join().unwrap();
    }

    #[test]
    fn test_looper_is_parked_while_held() {
        let thread = HandlerThread::new("parked");
        thread.start().unwrap();
        let looper = thread.looper().unwrap();
        let handler = thread.thread_handler().unwrap();

        let manager = TestLooperManager::acquire(&looper).unwrap();

        let (tx, rx) = mpsc::channel();
        let runnable = Runnable::new(move || tx.send(thread::current().name().map(String::from)).unwrap());
        handler.post(runnable.clone());

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(handler.has_callbacks(&runnable));

        let mut msg = manager.next().unwrap();
        assert!(msg.callback().is_some_and(|c| c.ptr_eq(&runnable)));
        manager.execute(&mut msg).unwrap();
        manager.recycle(msg);

        // Executed on the looper thread, not here.
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap().as_deref(),
            Some("parked")
        );

        drop(manager);
        assert!(thread.quit_safely());
        thread.join().unwrap();
    }

    #[test]
    fn test_acquire_is_exclusive() {
        let (looper, _, _clock) = init_looper();

        let manager = TestLooperManager::acquire(&looper).unwrap();
        assert!(matches!(
            TestLooperManager::acquire(&looper),
            Err(LooperError::AlreadyAcquired)
        ));

        manager.release();
        let again = TestLooperManager::acquire(&looper).unwrap();
        drop(again);

        looper.quit().unwrap();
        assert!(matches!(
            TestLooperManager::acquire(&looper),
            Err(LooperError::Quitting)
        ));
    }

    #[test]
    fn test_on_looper_thread_runs_inline() {
        let (looper, handler, clock) = init_looper();
        clock.set(100);

        let manager = TestLooperManager::acquire(&looper).unwrap();
        handler.send_empty_message_delayed(1, Duration::from_millis(50));
        handler.post(|| panic!("inline"));

        assert_eq!(manager.peek_when(), Some(100));
        let mut msg = manager.poll().unwrap();
        let err = manager.execute(&mut msg).unwrap_err();
        assert_eq!(err.reason(), "inline");
        manager.recycle(msg);

        assert!(manager.poll().is_none());
        assert!(manager.has_messages(&handler, 1, None));

        clock.advance(50);
        let msg = manager.poll().unwrap();
        assert_eq!(msg.what, 1);
        manager.recycle(msg);

        drop(manager);
        looper.quit().unwrap();
    }
}
