//! Buffered non-blocking connections and timer sets for gateway I/O.
//!
//! gwio provides the two concurrency primitives a store-and-forward gateway
//! keeps reaching for:
//!
//! * [`Connection`]: a non-blocking, byte-oriented connection with input and
//!   output buffering, independent read/write locking, and optional
//!   registration with an [`FdSet`] poller for readiness callbacks.
//! * [`TimerSet`] and [`Timer`]: sets of timers sharing a watcher thread
//!   that clones each timer's event onto an output [`Queue`] when the timer
//!   elapses — and takes the clone back if the timer is stopped or restarted
//!   before anyone consumed it.
//!
//! # Examples
//!
//! Scheduling a timer and receiving its event:
//!
//! ```
//! use std::time::Duration;
//! use gwio::{Queue, TimerSet};
//!
//! let events = Queue::new();
//! let timers = TimerSet::new(events.clone());
//!
//! let retry = timers.new_timer();
//! retry.start(Duration::ZERO, Some("retransmit"));
//!
//! let event = events.consume_timeout(Duration::from_secs(2)).unwrap();
//! assert_eq!(*event, "retransmit");
//! ```
//!
//! Line-oriented reading from a socket:
//!
//! ```no_run
//! use gwio::Connection;
//!
//! # fn main() -> std::io::Result<()> {
//! let conn = Connection::open_tcp("smsc.example.net", 2775)?;
//! conn.write(b"LOGIN gateway secret\r\n")?;
//! while conn.wait(None)? == gwio::WaitStatus::Progress {
//!     if let Some(line) = conn.read_line() {
//!         println!("{}", String::from_utf8_lossy(&line));
//!     }
//!     if conn.eof() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![cfg(unix)]

mod conn;
mod fdset;
mod queue;
mod ready;
mod sys;
mod timer;

pub use conn::{Connection, FlushStatus, WaitStatus, WriteStatus};
pub use fdset::FdSet;
pub use queue::Queue;
pub use ready::Ready;
pub use timer::{Timer, TimerSet};
