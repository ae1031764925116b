use std::any::Any;
use std::fmt;
use std::io;
use std::panic;

/// Rejected operations on loopers, handler threads and test managers.
///
/// None of these are fatal: the caller asked for something the current state
/// does not allow and nothing was mutated.
#[derive(thiserror::Error, Debug)]
pub enum LooperError {
    #[error("Only one Looper may be created per thread")]
    AlreadyPrepared,

    #[error("The main Looper has already been prepared")]
    MainLooperAlreadyPrepared,

    #[error("No Looper; Looper::prepare() wasn't called on this thread")]
    NotPrepared,

    #[error("Main thread not allowed to quit")]
    QuitNotAllowed,

    #[error("HandlerThread has already been started")]
    AlreadyStarted,

    #[error("TestLooperManager already held for this looper")]
    AlreadyAcquired,

    #[error("A TestLooperManager holds this looper's queue")]
    HarnessAttached,

    #[error("Looper is quitting and no longer accepts messages")]
    Quitting,

    #[error("Failed to spawn thread: {0}")]
    Spawn(#[from] io::Error),
}

/// A panic raised by a message target, captured on the looper thread and
/// handed back to the thread that requested the dispatch.
#[derive(thiserror::Error)]
#[error("dispatch of {target} panicked: {reason}")]
pub struct DispatchPanic {
    target: String,
    reason: String,
    payload: Box<dyn Any + Send + 'static>,
}

impl DispatchPanic {
    pub(crate) fn new(target: String, payload: Box<dyn Any + Send + 'static>) -> Self {
        Self {
            target,
            reason: panic_payload_as_str(&*payload)
                .unwrap_or("<non-string panic payload>")
                .to_owned(),
            payload,
        }
    }

    /// Human readable panic message, when the payload was a string.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Description of the message whose dispatch panicked.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Consumes the error, returning the original panic payload.
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        self.payload
    }

    /// Re-raises the original panic on the current thread.
    pub fn resume(self) -> ! {
        panic::resume_unwind(self.payload)
    }
}

impl fmt::Debug for DispatchPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchPanic")
            .field("target", &self.target)
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

pub(crate) fn panic_payload_as_str(payload: &(dyn Any + Send)) -> Option<&str> {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        Some(s)
    } else {
        payload.downcast_ref::<String>().map(String::as_str)
    }
}
