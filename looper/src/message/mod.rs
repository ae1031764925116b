use crate::handler::Handler;
use bitflags::bitflags;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

pub mod id;
pub use id::HandlerId;

mod pool;

/// Opaque object attached to a [`Message`]. Queue lookups compare payloads by
/// pointer identity, never by value.
pub type Payload = Arc<dyn Any + Send + Sync>;

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub(crate) struct MessageFlags: u8 {
        /// Owned by a queue, or handed out by `next()` and not yet recycled.
        const IN_USE = 1;

        /// Not subject to synchronization barriers.
        const ASYNCHRONOUS = 1 << 1;
    }
}

/// A closure posted to a [`Handler`]. Cloning is cheap and clones compare
/// equal with [`Runnable::ptr_eq`], which is what `remove_callbacks` and
/// `has_callbacks` rely on.
#[derive(Clone)]
pub struct Runnable(Arc<dyn Fn() + Send + Sync + 'static>);

impl Runnable {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn run(&self) {
        (self.0)()
    }

    pub fn ptr_eq(&self, other: &Runnable) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<F> From<F> for Runnable
where
    F: Fn() + Send + Sync + 'static,
{
    fn from(f: F) -> Self {
        Runnable::new(f)
    }
}

impl fmt::Debug for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Runnable@{:p}", Arc::as_ptr(&self.0).cast::<()>())
    }
}

impl fmt::Display for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Unit of deferred work delivered to a [`Handler`] on its looper's thread.
///
/// A message carries either a [`Runnable`] (see [`Handler::post`]) or the
/// `what`/`arg1`/`arg2`/`obj` payload interpreted by the handler's
/// [`Callback`](crate::Callback).
///
/// Once a message is enqueued the queue owns it. When the looper hands it to
/// its target it stays marked as in use and can never be enqueued again; it
/// may only be [recycled](Message::recycle).
#[derive(Default)]
pub struct Message {
    /// User-defined message code.
    pub what: i32,

    pub arg1: i32,

    pub arg2: i32,

    pub obj: Option<Payload>,

    pub(crate) target: Option<Handler>,

    pub(crate) callback: Option<Runnable>,

    /// Due time in the owning queue's clock domain.
    pub(crate) when: u64,

    /// Insertion order, assigned by the queue.
    pub(crate) seq: u64,

    pub(crate) flags: MessageFlags,
}

impl Message {
    /// Returns a cleared message, reusing one from the global pool if possible.
    pub fn obtain() -> Message {
        pool::take().unwrap_or_default()
    }

    pub fn with_what(mut self, what: i32) -> Self {
        self.what = what;
        self
    }

    pub fn with_args(mut self, arg1: i32, arg2: i32) -> Self {
        self.arg1 = arg1;
        self.arg2 = arg2;
        self
    }

    pub fn with_obj(mut self, obj: Payload) -> Self {
        self.obj = Some(obj);
        self
    }

    /// Downcasts the attached payload.
    pub fn obj_as<T: Any>(&self) -> Option<&T> {
        self.obj.as_deref().and_then(|obj| obj.downcast_ref::<T>())
    }

    pub fn target(&self) -> Option<&Handler> {
        self.target.as_ref()
    }

    pub fn set_target(&mut self, target: Handler) {
        self.target = Some(target);
    }

    pub fn callback(&self) -> Option<&Runnable> {
        self.callback.as_ref()
    }

    /// Due time, valid once the message has been enqueued.
    pub fn when(&self) -> u64 {
        self.when
    }

    /// Position among messages enqueued at the same due time, valid once the
    /// message has been enqueued.
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    pub fn is_asynchronous(&self) -> bool {
        self.flags.contains(MessageFlags::ASYNCHRONOUS)
    }

    /// Asynchronous messages are not held back by synchronization barriers.
    pub fn set_asynchronous(&mut self, asynchronous: bool) {
        self.flags.set(MessageFlags::ASYNCHRONOUS, asynchronous);
    }

    /// Barriers are the only messages a queue holds without a target.
    pub fn is_barrier(&self) -> bool {
        self.target.is_none()
    }

    /// Sends this message to the handler set with [`set_target`].
    ///
    /// Returns `false` when there is no target or its looper is quitting.
    ///
    /// [`set_target`]: Message::set_target
    pub fn send_to_target(self) -> bool {
        match self.target.clone() {
            Some(target) => target.send_message(self),
            None => false,
        }
    }

    /// Clears every field and returns the message to the global pool.
    pub fn recycle(mut self) {
        self.clear();
        pool::give(self);
    }

    pub(crate) fn is_in_use(&self) -> bool {
        self.flags.contains(MessageFlags::IN_USE)
    }

    pub(crate) fn mark_in_use(&mut self) {
        self.flags.insert(MessageFlags::IN_USE);
    }

    /// Delivers the message to its target on the current thread.
    pub(crate) fn dispatch(&self) {
        if let Some(target) = &self.target {
            target.dispatch_message(self);
        }
    }

    fn clear(&mut self) {
        *self = Message::default();
    }

    /// One-line description with the due time relative to `now`.
    pub(crate) fn describe(&self, now: u64) -> String {
        let mut out = String::with_capacity(64);
        out.push_str("{ when=");
        if self.when >= now {
            out.push_str(&format!("+{}ms", self.when - now));
        } else {
            out.push_str(&format!("-{}ms", now - self.when));
        }

        match &self.target {
            Some(target) => {
                if let Some(callback) = &self.callback {
                    out.push_str(&format!(" callback={callback}"));
                } else {
                    out.push_str(&format!(" what={}", self.what));
                }
                if self.arg1 != 0 {
                    out.push_str(&format!(" arg1={}", self.arg1));
                }
                if self.arg2 != 0 {
                    out.push_str(&format!(" arg2={}", self.arg2));
                }
                if self.obj.is_some() {
                    out.push_str(" obj=<payload>");
                }
                out.push_str(&format!(" target={target}"));
            }
            None => out.push_str(&format!(" barrier={}", self.arg1)),
        }

        if self.is_asynchronous() {
            out.push_str(" async");
        }

        out.push_str(" }");
        out
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("what", &self.what)
            .field("arg1", &self.arg1)
            .field("arg2", &self.arg2)
            .field("has_obj", &self.obj.is_some())
            .field("target", &self.target.as_ref().map(Handler::id))
            .field("callback", &self.callback)
            .field("when", &self.when)
            .field("seq", &self.seq)
            .field("flags", &self.flags)
            .finish()
    }
}
