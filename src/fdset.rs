//! A poller thread that watches file descriptors and dispatches callbacks.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::{error, trace};

use crate::sys::unix::{events_to_poll, revents_from_poll};
use crate::{sys, Ready};

pub(crate) type FdCallback = Box<dyn FnMut(RawFd, Ready) + Send>;

/// A set of file descriptors watched by a dedicated poller thread.
///
/// Each registered descriptor has a requested event mask and a callback.
/// Whenever `poll(2)` reports one of the requested events (or an error
/// condition, which is always reported), the callback runs on the poller
/// thread with the readiness that was seen.
///
/// [`register`], [`listen`], and [`unregister`] hand the poller a control
/// operation and wake it; the table itself is owned by the poller thread.
/// `unregister` additionally waits until the poller has applied the
/// operation, so once it returns no further callback will run for that
/// descriptor. A callback may unregister its own descriptor; the wait is
/// skipped on the poller thread itself.
///
/// Dropping the `FdSet` stops and joins the poller thread.
///
/// [`register`]: FdSet::register
/// [`listen`]: FdSet::listen
/// [`unregister`]: FdSet::unregister
#[derive(Debug)]
pub struct FdSet {
    shared: Arc<Shared>,
    poller: Option<thread::JoinHandle<()>>,
}

#[derive(Debug)]
pub(crate) struct Shared {
    ctl: Mutex<Ctl>,
    cond: Condvar,
    // Wake pipe. The read end lives here rather than on the poller thread
    // so that late wakers never write into a closed pipe.
    wake_tx: OwnedFd,
    wake_rx: OwnedFd,
    poller: OnceLock<ThreadId>,
}

struct Ctl {
    ops: Vec<Op>,
    // Every submitted op gets a sequence number; `applied` trails `next`
    // and lets unregister wait until its op has taken effect.
    next: u64,
    applied: u64,
    stopping: bool,
}

enum Op {
    Register {
        fd: RawFd,
        events: Ready,
        callback: FdCallback,
    },
    Listen {
        fd: RawFd,
        mask: Ready,
        on: bool,
    },
    Unregister {
        fd: RawFd,
    },
}

struct Entry {
    events: Ready,
    callback: FdCallback,
}

impl FdSet {
    /// Create an `FdSet` and spawn its poller thread.
    pub fn new() -> io::Result<FdSet> {
        let (wake_rx, wake_tx) = sys::pipe()?;
        let shared = Arc::new(Shared {
            ctl: Mutex::new(Ctl {
                ops: Vec::new(),
                next: 0,
                applied: 0,
                stopping: false,
            }),
            cond: Condvar::new(),
            wake_tx,
            wake_rx,
            poller: OnceLock::new(),
        });

        let poller = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("fdset-poller".to_owned())
                .spawn(move || event_loop(&shared))?
        };
        shared
            .poller
            .set(poller.thread().id())
            .expect("poller registered twice");

        Ok(FdSet {
            shared,
            poller: Some(poller),
        })
    }

    /// Start watching `fd` for `events`, dispatching `callback` from the
    /// poller thread when any of them (or an error condition) is reported.
    pub fn register<F>(&self, fd: RawFd, events: Ready, callback: F)
    where
        F: FnMut(RawFd, Ready) + Send + 'static,
    {
        self.shared.register(fd, events, Box::new(callback));
    }

    /// Change which of the bits in `mask` are being watched for `fd`:
    /// all of them when `on`, none of them otherwise. Bits outside `mask`
    /// are left alone.
    pub fn listen(&self, fd: RawFd, mask: Ready, on: bool) {
        self.shared.listen(fd, mask, on);
    }

    /// Stop watching `fd`. When this returns, the callback is gone and will
    /// not run again.
    pub fn unregister(&self, fd: RawFd) {
        self.shared.unregister(fd);
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for FdSet {
    fn drop(&mut self) {
        self.shared.stop();
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
    }
}

impl Shared {
    pub(crate) fn register(&self, fd: RawFd, events: Ready, callback: FdCallback) {
        self.submit(Op::Register {
            fd,
            events,
            callback,
        });
    }

    pub(crate) fn listen(&self, fd: RawFd, mask: Ready, on: bool) {
        self.submit(Op::Listen { fd, mask, on });
    }

    pub(crate) fn unregister(&self, fd: RawFd) {
        let seq = self.submit(Op::Unregister { fd });

        // The poller can't apply ops while it is waiting for us, so don't
        // wait for the poller when we *are* the poller.
        if self.poller.get() == Some(&thread::current().id()) {
            return;
        }

        let mut ctl = self.lock();
        while ctl.applied < seq && !ctl.stopping {
            ctl = self.cond.wait(ctl).expect("fdset lock poisoned");
        }
    }

    fn submit(&self, op: Op) -> u64 {
        let mut ctl = self.lock();
        let stopping = ctl.stopping;
        ctl.ops.push(op);
        ctl.next += 1;
        let seq = ctl.next;
        drop(ctl);
        if !stopping {
            self.wake();
        }
        seq
    }

    fn stop(&self) {
        let mut ctl = self.lock();
        ctl.stopping = true;
        drop(ctl);
        self.wake();
    }

    fn wake(&self) {
        // A full pipe already guarantees a pending wakeup.
        let _ = sys::write(self.wake_tx.as_raw_fd(), &[1]);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ctl> {
        self.ctl.lock().expect("fdset lock poisoned")
    }
}

impl std::fmt::Debug for Ctl {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Ctl")
            .field("pending", &self.ops.len())
            .field("applied", &self.applied)
            .field("stopping", &self.stopping)
            .finish()
    }
}

/// Main function for the poller thread.
fn event_loop(shared: &Shared) {
    let wake_fd = shared.wake_rx.as_raw_fd();
    let mut table: HashMap<RawFd, Entry> = HashMap::new();
    let mut pollfds: Vec<libc::pollfd> = Vec::new();

    loop {
        // Apply control operations submitted since the last round.
        {
            let mut ctl = shared.lock();
            let applied = ctl.next;
            let ops: Vec<Op> = ctl.ops.drain(..).collect();
            let stopping = ctl.stopping;
            drop(ctl);

            for op in ops {
                apply(&mut table, op);
            }

            let mut ctl = shared.lock();
            ctl.applied = applied;
            if stopping {
                ctl.applied = u64::MAX;
                drop(ctl);
                shared.cond.notify_all();
                return;
            }
            drop(ctl);
            shared.cond.notify_all();
        }

        // Descriptors with an empty mask are parked: they stay registered
        // but are not polled, so a hung-up peer can't spin this loop.
        pollfds.clear();
        pollfds.push(libc::pollfd {
            fd: wake_fd,
            events: libc::POLLIN,
            revents: 0,
        });
        for (&fd, entry) in &table {
            if !entry.events.is_empty() {
                pollfds.push(libc::pollfd {
                    fd,
                    events: events_to_poll(entry.events),
                    revents: 0,
                });
            }
        }

        let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("fdset poll failed: {}", err);
            thread::sleep(Duration::from_millis(10));
            continue;
        }

        if pollfds[0].revents != 0 {
            drain_wake_pipe(wake_fd);
        }

        for pollfd in &pollfds[1..] {
            if pollfd.revents == 0 {
                continue;
            }
            let revents = revents_from_poll(pollfd.revents);
            trace!("fd {} ready: {:?}", pollfd.fd, revents);
            if let Some(entry) = table.get_mut(&pollfd.fd) {
                (entry.callback)(pollfd.fd, revents);
            }
        }
    }
}

fn apply(table: &mut HashMap<RawFd, Entry>, op: Op) {
    match op {
        Op::Register {
            fd,
            events,
            callback,
        } => {
            table.insert(fd, Entry { events, callback });
        }
        Op::Listen { fd, mask, on } => {
            if let Some(entry) = table.get_mut(&fd) {
                entry.events = if on {
                    entry.events | mask
                } else {
                    entry.events - mask
                };
            }
        }
        Op::Unregister { fd } => {
            table.remove(&fd);
        }
    }
}

fn drain_wake_pipe(fd: RawFd) {
    let mut buf = [0u8; 64];
    while let Ok(n) = sys::read(fd, &mut buf) {
        if n < buf.len() {
            break;
        }
    }
}
