/// Line oriented logging sink used by [`Looper::set_message_logging`] and the
/// various `dump` methods.
///
/// [`Looper::set_message_logging`]: crate::Looper::set_message_logging
pub trait Printer: Send + Sync {
    fn println(&self, line: &str);
}

impl<F> Printer for F
where
    F: Fn(&str) + Send + Sync,
{
    fn println(&self, line: &str) {
        self(line)
    }
}

/// Forwards every line to `tracing` at `DEBUG` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPrinter;

impl Printer for TracingPrinter {
    fn println(&self, line: &str) {
        tracing::debug!(target: "looper::printer", "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_closure_printer() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let printer: Arc<dyn Printer> = Arc::new(move |line: &str| sink.lock().push(line.to_owned()));

        printer.println("one");
        printer.println("two");
        TracingPrinter.println("ignored without a subscriber");

        assert_eq!(*lines.lock(), vec!["one", "two"]);
    }
}
