//! Per-thread message loops.
//!
//! A [`Looper`] owns a due-time ordered [`MessageQueue`] and runs a loop on
//! its thread that hands each ready [`Message`] to its target [`Handler`].
//! Any thread can send messages or post closures through a handler; only the
//! looper's thread processes them.
//!
//! ```ignore
//! let thread = HandlerThread::new("worker");
//! thread.start()?;
//!
//! let handler = thread.thread_handler().unwrap();
//! handler.post_delayed(|| println!("later, on the worker"), Duration::from_millis(10));
//!
//! thread.quit_safely();
//! thread.join()?;
//! ```

mod clock;
pub use clock::{Clock, SystemClock, uptime_millis};

mod errors;
pub use errors::{DispatchPanic, LooperError};

pub mod handler;
pub use handler::{Callback, Handler};

pub mod handler_thread;
pub use handler_thread::HandlerThread;

mod looper;
pub use looper::{Builder, Looper};

pub mod message;
pub use message::{HandlerId, Message, Payload, Runnable};

mod printer;
pub use printer::{Printer, TracingPrinter};

pub mod queue;
pub use queue::{IdleHandler, MessageQueue};

pub mod test_looper_manager;
pub use test_looper_manager::TestLooperManager;

mod utils;

#[cfg(test)]
mod test_utils;
