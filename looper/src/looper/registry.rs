use crate::errors::LooperError;
use crate::looper::Looper;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::{LazyLock, OnceLock};
use std::thread::{self, ThreadId};

// One looper per thread. Entries are added by `prepare` and removed when the
// thread's `run()` returns or unwinds, or at the latest when the thread exits.
static LOOPERS: LazyLock<DashMap<ThreadId, Looper>> = LazyLock::new(DashMap::new);

thread_local! {
    // Armed by the first `register` on a thread. A looper that was prepared
    // but never run would otherwise outlive its thread in `LOOPERS`, keeping
    // its queue and every pending message alive.
    static RELEASE_ON_EXIT: ReleaseOnExit = ReleaseOnExit(thread::current().id());
}

struct ReleaseOnExit(ThreadId);

impl Drop for ReleaseOnExit {
    fn drop(&mut self) {
        // Only this thread registers under its id, so whatever is left is ours.
        // The looper is dropped after the shard lock is released.
        let released = LOOPERS.remove(&self.0);
        drop(released);
    }
}

static MAIN_LOOPER: OnceLock<Looper> = OnceLock::new();

pub(super) fn register(looper: Looper) -> Result<Looper, LooperError> {
    match LOOPERS.entry(looper.thread().id()) {
        Entry::Occupied(_) => Err(LooperError::AlreadyPrepared),
        Entry::Vacant(slot) => {
            slot.insert(looper.clone());
            // Fails only while the thread is already tearing down its locals.
            let _ = RELEASE_ON_EXIT.try_with(|_| ());
            tracing::debug!(thread = ?looper.thread().id(), "looper prepared");
            Ok(looper)
        }
    }
}

pub(super) fn register_main(looper: Looper) -> Result<Looper, LooperError> {
    if MAIN_LOOPER.get().is_some() {
        return Err(LooperError::MainLooperAlreadyPrepared);
    }

    let looper = register(looper)?;

    if MAIN_LOOPER.set(looper.clone()).is_err() {
        // Lost a race against another thread preparing the main looper.
        deregister(&looper);
        return Err(LooperError::MainLooperAlreadyPrepared);
    }

    Ok(looper)
}

pub(super) fn current() -> Option<Looper> {
    LOOPERS
        .get(&thread::current().id())
        .map(|entry| entry.value().clone())
}

pub(super) fn main() -> Option<Looper> {
    MAIN_LOOPER.get().cloned()
}

/// Removes `looper`'s registration, leaving any newer looper on the same
/// thread alone.
pub(super) fn deregister(looper: &Looper) {
    if LOOPERS
        .remove_if(&looper.thread().id(), |_, registered| registered == looper)
        .is_some()
    {
        tracing::debug!(thread = ?looper.thread().id(), "looper released");
    }
}

#[cfg(test)]
pub(super) fn is_registered(looper: &Looper) -> bool {
    LOOPERS
        .get(&looper.thread().id())
        .is_some_and(|entry| entry.value() == looper)
}
