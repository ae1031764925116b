/// Callback invoked when a [`MessageQueue`] runs out of ready messages and is
/// about to wait for more.
///
/// [`MessageQueue`]: crate::MessageQueue
pub trait IdleHandler: Send + Sync {
    /// Called on the consuming thread, outside the queue lock, at most once per
    /// call to `next()`.
    ///
    /// Return `true` to stay registered, `false` to be removed.
    fn queue_idle(&self) -> bool;
}

impl<F> IdleHandler for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn queue_idle(&self) -> bool {
        self()
    }
}
