/// Runs a closure when dropped.
///
/// The closure also runs while unwinding, which is what makes this suitable
/// for releasing per-thread registrations and publishing terminal states.
///
/// ```ignore
/// let mut released = false;
/// {
///     let _guard = ScopeGuard::new(|| released = true);
/// }
/// assert!(released);
/// ```
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // Taken exactly once, by `drop`.
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}
