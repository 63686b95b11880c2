//! Buffered non-blocking connections.

use std::fmt;
use std::io;
use std::net;
use std::os::unix::io::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::{error, warn};

use crate::fdset::{self, FdSet};
use crate::{sys, Ready};

// Writes below the buffering threshold linger in the output buffer; 0 keeps
// the connection unbuffered so callers don't have to think about flushing.
const DEFAULT_OUTPUT_BUFFERING: usize = 0;

// How much one non-blocking read attempt pulls off the descriptor.
const READ_CHUNK: usize = 4096;

/// Result of a `write` family call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// Everything was handed to the descriptor.
    Sent,
    /// Some or all of the data is still in the output buffer.
    Buffered,
}

/// Result of [`Connection::flush`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlushStatus {
    /// The output buffer was emptied.
    Drained,
    /// The flush was interrupted before the buffer emptied.
    Interrupted,
}

/// Result of [`Connection::wait`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    /// Data was sent or received, or the wait was interrupted.
    Progress,
    /// The timeout expired first.
    TimedOut,
}

type Callback = Arc<dyn Fn(&Connection) + Send + Sync>;

/// A buffered, non-blocking, byte-oriented connection.
///
/// A `Connection` wraps a non-blocking file descriptor with an input buffer,
/// an output buffer, and independent read/write locking, so that one thread
/// can read while another writes. Writes go through the output buffer and
/// are pushed out as far as the descriptor allows; reads pull whatever the
/// descriptor has into the input buffer, from which the `read_*` helpers
/// carve lines, fixed-size chunks, length-prefixed frames, or delimited
/// packets. None of the operations block, except [`wait`] and [`flush`],
/// which say so.
///
/// A connection can also be [registered] with an [`FdSet`], which calls back
/// on the poller thread whenever new input arrived, after draining as much
/// of the output buffer as the descriptor accepted.
///
/// EOF and read errors are sticky: once set they stay set, the registered
/// poll interest for reading is dropped, and readers return `None` once the
/// buffered data runs out.
///
/// Dropping the connection unregisters it, makes a last attempt to send the
/// output buffer, and closes the descriptor.
///
/// [`wait`]: Connection::wait
/// [`flush`]: Connection::flush
/// [registered]: Connection::register
pub struct Connection {
    // The fd itself is read-only after wrap and needs no locking.
    fd: RawFd,
    claimed: AtomicBool,
    claiming_thread: OnceLock<ThreadId>,
    // Separate locks for the two directions keep readers and writers out
    // of each other's way. When both are needed, acquire `write` first.
    read: Mutex<ReadHalf>,
    write: Mutex<WriteHalf>,
    callback: Mutex<Option<Callback>>,
}

struct ReadHalf {
    buf: Vec<u8>,
    // Start of unread data in `buf`.
    pos: usize,
    eof: bool,
    error: bool,
    registered: Option<Arc<fdset::Shared>>,
    listening_pollin: bool,
}

struct WriteHalf {
    buf: Vec<u8>,
    // Start of unsent data in `buf`.
    pos: usize,
    buffering: usize,
    registered: Option<Arc<fdset::Shared>>,
    listening_pollout: bool,
}

impl ReadHalf {
    fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Cut `len` bytes from the front of the unread data. The caller must
    /// have checked that they are available.
    fn take(&mut self, len: usize) -> Vec<u8> {
        debug_assert!(self.available() >= len);
        let taken = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        taken
    }
}

impl WriteHalf {
    fn pending(&self) -> usize {
        self.buf.len() - self.pos
    }
}

impl Connection {
    /// Open a TCP connection to `host:port`.
    ///
    /// The descriptor is put in non-blocking mode once connected.
    // TODO: issue a non-blocking connect instead of delegating to the
    // blocking one in std.
    pub fn open_tcp(host: &str, port: u16) -> io::Result<Connection> {
        let stream = net::TcpStream::connect((host, port))?;
        Connection::from_stream(stream)
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: net::TcpStream) -> io::Result<Connection> {
        Connection::from_fd(OwnedFd::from(stream))
    }

    /// Wrap a file descriptor, taking ownership of it.
    ///
    /// Fails if the descriptor cannot be put in non-blocking mode.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Connection> {
        sys::set_nonblocking(fd.as_raw_fd())?;
        Ok(Connection {
            fd: fd.into_raw_fd(),
            claimed: AtomicBool::new(false),
            claiming_thread: OnceLock::new(),
            read: Mutex::new(ReadHalf {
                buf: Vec::new(),
                pos: 0,
                eof: false,
                error: false,
                registered: None,
                listening_pollin: false,
            }),
            write: Mutex::new(WriteHalf {
                buf: Vec::new(),
                pos: 0,
                buffering: DEFAULT_OUTPUT_BUFFERING,
                registered: None,
                listening_pollout: false,
            }),
            callback: Mutex::new(None),
        })
    }

    /// Declare that exactly one thread will use this connection from now
    /// on. Lock acquisitions turn into an assertion that the declaration
    /// holds.
    ///
    /// # Panics
    ///
    /// Panics if the connection is claimed twice.
    pub fn claim(&self) {
        if self.claimed.swap(true, Ordering::AcqRel) {
            panic!("connection claimed twice");
        }
        let _ = self.claiming_thread.set(thread::current().id());
    }

    /// Number of unsent bytes in the output buffer.
    pub fn outbuf_len(&self) -> usize {
        self.lock_out().pending()
    }

    /// Number of unread bytes in the input buffer.
    pub fn inbuf_len(&self) -> usize {
        self.lock_in().available()
    }

    /// Whether end-of-file was seen on the read side. Sticky.
    pub fn eof(&self) -> bool {
        self.lock_in().eof
    }

    /// Whether an error was seen on the read side. Sticky.
    pub fn read_error(&self) -> bool {
        self.lock_in().error
    }

    /// Ask for writes to be buffered until there are at least `size` bytes
    /// to send. 0 makes the connection unbuffered. Lowering the threshold
    /// may trigger an immediate send attempt.
    pub fn set_output_buffering(&self, size: usize) {
        let mut write = self.lock_out();
        write.buffering = size;
        let _ = self.unlocked_try_write(&mut write);
    }

    /// Register the connection with `fdset`.
    ///
    /// `callback` runs on the poller thread whenever the descriptor became
    /// readable, after the new input has been pulled into the input buffer.
    /// Writable events drain the output buffer without involving the
    /// callback. No connection lock is held while the callback runs.
    ///
    /// Registering again with the same `fdset` just replaces the callback.
    /// Registering with a different `fdset` while registered is refused.
    pub fn register<F>(conn: &Arc<Connection>, fdset: &FdSet, callback: F) -> io::Result<()>
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        // Registration state is written under both locks.
        let mut write = conn.lock_out();
        let mut read = conn.lock_in();

        if let Some(current) = &write.registered {
            if Arc::ptr_eq(current, fdset.shared()) {
                *conn.lock_callback() = Some(Arc::new(callback));
                return Ok(());
            }
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "connection is registered with another fdset",
            ));
        }

        let mut events = Ready::EMPTY;
        if !read.eof && !read.error {
            events |= Ready::READABLE;
        }
        if write.pending() > 0 {
            events |= Ready::WRITABLE;
        }

        write.registered = Some(Arc::clone(fdset.shared()));
        read.registered = Some(Arc::clone(fdset.shared()));
        read.listening_pollin = events.is_readable();
        write.listening_pollout = events.is_writable();
        *conn.lock_callback() = Some(Arc::new(callback));

        let weak = Arc::downgrade(conn);
        fdset.register(conn.fd, events, move |fd, revents| {
            if let Some(conn) = weak.upgrade() {
                conn.poll_callback(fd, revents);
            }
        });
        Ok(())
    }

    /// Undo [`register`]. When this returns, the callback will not run
    /// again. Unregistering an unregistered connection is a no-op.
    ///
    /// [`register`]: Connection::register
    pub fn unregister(&self) {
        // Registration state is written under both locks. The fdset itself
        // is told after the locks are released, so its poller can finish a
        // callback that is already holding one of them.
        let mut write = self.lock_out();
        let mut read = self.lock_in();

        let registered = match write.registered.take() {
            Some(registered) => registered,
            None => return,
        };
        read.registered = None;
        read.listening_pollin = false;
        write.listening_pollout = false;
        *self.lock_callback() = None;
        drop(read);
        drop(write);

        registered.unregister(self.fd);
    }

    /// Wait at most `timeout` (`None` = forever) for the connection to make
    /// progress in either direction.
    ///
    /// Pending output is sent as far as possible first; if that moved any
    /// bytes, returns [`WaitStatus::Progress`] without polling. Input that
    /// arrives during the wait is pulled into the input buffer before
    /// returning, so callers must consume it with the `read_*` helpers
    /// between waits. An interrupted poll also counts as `Progress`.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<WaitStatus> {
        let mut write = self.lock_out();

        // Push out any data still waiting to be sent.
        if self.unlocked_write(&mut write)? > 0 {
            // Did something useful; no need to poll.
            return Ok(WaitStatus::Progress);
        }

        let mut events = Ready::EMPTY;
        if write.pending() > 0 {
            events |= Ready::WRITABLE;
        }
        // Don't keep the connection locked while waiting.
        drop(write);

        // Block for reading unless it is known that no more data is coming;
        // after eof, poll reports readable forever. If there is nothing to
        // write either, poll for reading anyway: the caller asked to wait,
        // so apparently it doesn't trust the eof.
        let read = self.lock_in();
        if (!read.eof && !read.error) || events.is_empty() {
            events |= Ready::READABLE;
        }
        drop(read);

        let revents = match sys::poll_fd(self.fd, events, timeout) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                return Ok(WaitStatus::Progress)
            }
            Err(err) => {
                error!("wait: poll failed on fd {}: {}", self.fd, err);
                return Err(err);
            }
            Ok(revents) if revents.is_empty() => return Ok(WaitStatus::TimedOut),
            Ok(revents) => revents,
        };

        if revents.is_invalid() {
            error!("wait: fd {} not open", self.fd);
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "fd not open"));
        }

        if revents.is_error() || revents.is_hup() {
            // Read so the specific error gets recorded and handled. It may
            // no longer exist: the connection was unlocked for a while.
            let mut read = self.lock_in();
            self.unlocked_read(&mut read);
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection broken",
            ));
        }

        // POLLOUT on means there was something to write.
        if revents.is_writable() {
            let mut write = self.lock_out();
            let _ = self.unlocked_write(&mut write);
        }

        // We normally poll for reading, so read here; otherwise a caller
        // looping around `wait` without consuming in between would keep
        // polling the same data.
        if revents.is_readable() {
            let mut read = self.lock_in();
            self.unlocked_read(&mut read);
        }

        Ok(WaitStatus::Progress)
    }

    /// Block until the output buffer has been fully sent.
    ///
    /// Returns [`FlushStatus::Interrupted`] if the wait was cut short with
    /// data still pending; call again to keep flushing.
    pub fn flush(&self) -> io::Result<FlushStatus> {
        let mut write = self.lock_out();
        self.unlocked_write(&mut write)?;

        while write.pending() != 0 {
            // The loop condition needs the lock; the poll must not hold it.
            drop(write);

            let revents = match sys::poll_fd(self.fd, Ready::WRITABLE, None) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    return Ok(FlushStatus::Interrupted)
                }
                Err(err) => {
                    error!("flush: poll failed on fd {}: {}", self.fd, err);
                    return Err(err);
                }
                Ok(revents) if revents.is_empty() => return Ok(FlushStatus::Interrupted),
                Ok(revents) => revents,
            };

            if revents.is_invalid() {
                error!("flush: fd {} not open", self.fd);
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "fd not open"));
            }

            write = self.lock_out();
            if revents.is_writable() || revents.is_error() || revents.is_hup() {
                self.unlocked_write(&mut write)?;
            }
        }

        Ok(FlushStatus::Drained)
    }

    /// Append `data` to the output buffer and send as much as the
    /// descriptor accepts without blocking.
    pub fn write(&self, data: &[u8]) -> io::Result<WriteStatus> {
        let mut write = self.lock_out();
        write.buf.extend_from_slice(data);
        self.unlocked_try_write(&mut write)
    }

    /// Like [`write`], but prefixes the data with its length as a 32-bit
    /// big-endian integer.
    ///
    /// # Panics
    ///
    /// Panics if `data` is too long for the length prefix.
    ///
    /// [`write`]: Connection::write
    pub fn write_withlen(&self, data: &[u8]) -> io::Result<WriteStatus> {
        let len = u32::try_from(data.len()).expect("frame too long for its length prefix");
        let mut write = self.lock_out();
        write.buf.extend_from_slice(&len.to_be_bytes());
        write.buf.extend_from_slice(data);
        self.unlocked_try_write(&mut write)
    }

    /// Return all currently available input, or `None` if there is none
    /// even after a read attempt.
    pub fn read_everything(&self) -> Option<Vec<u8>> {
        let mut read = self.lock_in();
        if read.available() == 0 {
            self.unlocked_read(&mut read);
            if read.available() == 0 {
                return None;
            }
        }
        let len = read.available();
        Some(read.take(len))
    }

    /// Return exactly `len` bytes, or `None` if that many are not available
    /// even after a read attempt.
    pub fn read_fixed(&self, len: usize) -> Option<Vec<u8>> {
        let mut read = self.lock_in();
        if read.available() < len {
            self.unlocked_read(&mut read);
            if read.available() < len {
                return None;
            }
        }
        Some(read.take(len))
    }

    /// Return one line without its trailing LF (nor the CR of a CR LF
    /// terminator), or `None` if no complete line is available.
    pub fn read_line(&self) -> Option<Vec<u8>> {
        let mut read = self.lock_in();
        // Search for byte 10 explicitly rather than '\n': this is network
        // data, and the line feed must not depend on the platform.
        let mut lf = find_byte(&read.buf, read.pos, 10);
        if lf.is_none() {
            self.unlocked_read(&mut read);
            lf = find_byte(&read.buf, read.pos, 10);
        }
        let lf = lf?;

        let len = lf - read.pos;
        let mut line = read.take(len);
        // Skip the LF, which was left in the buffer.
        read.pos += 1;

        // A CR LF terminated line still carries the CR.
        if line.last() == Some(&13) {
            line.pop();
        }
        Some(line)
    }

    /// Return one length-prefixed frame (32-bit big-endian length), or
    /// `None` if the frame is still incomplete after one read attempt.
    ///
    /// A prefix with the high bit set cannot be a real length; it is logged,
    /// skipped, and parsing continues behind it.
    pub fn read_withlen(&self) -> Option<Vec<u8>> {
        let mut read = self.lock_in();

        for attempt in 0..2 {
            if attempt > 0 {
                self.unlocked_read(&mut read);
            }

            loop {
                // First the length.
                if read.available() < 4 {
                    break;
                }
                let mut prefix = [0u8; 4];
                prefix.copy_from_slice(&read.buf[read.pos..read.pos + 4]);
                let len = u32::from_be_bytes(prefix);

                if len > i32::MAX as u32 {
                    warn!("read_withlen: got negative length, skipping");
                    read.pos += 4;
                    continue;
                }

                // Then the data.
                if read.available() - 4 < len as usize {
                    break;
                }
                read.pos += 4;
                return Some(read.take(len as usize));
            }
        }
        None
    }

    /// Return the next packet delimited by the `start` and `end` marker
    /// bytes, both included. Data before the start marker is discarded.
    /// `None` if no complete packet is available after one read attempt.
    pub fn read_packet(&self, start: u8, end: u8) -> Option<Vec<u8>> {
        let mut read = self.lock_in();

        for attempt in 0..2 {
            if attempt > 0 {
                self.unlocked_read(&mut read);
            }

            // Find the start marker; everything up to it is discarded to
            // free the buffer.
            match find_byte(&read.buf, read.pos, start) {
                None => {
                    read.pos = read.buf.len();
                    continue;
                }
                Some(start_pos) => read.pos = start_pos,
            }

            // Find the first end marker after it.
            match find_byte(&read.buf, read.pos, end) {
                None => continue,
                Some(end_pos) => {
                    let len = end_pos - read.pos + 1;
                    return Some(read.take(len));
                }
            }
        }
        None
    }

    /// Lock the read direction, unless the connection is claimed.
    fn lock_in(&self) -> MutexGuard<'_, ReadHalf> {
        self.assert_claim();
        self.read.lock().expect("connection read lock poisoned")
    }

    /// Lock the write direction, unless the connection is claimed.
    fn lock_out(&self) -> MutexGuard<'_, WriteHalf> {
        self.assert_claim();
        self.write.lock().expect("connection write lock poisoned")
    }

    fn lock_callback(&self) -> MutexGuard<'_, Option<Callback>> {
        self.callback.lock().expect("connection callback lock poisoned")
    }

    fn assert_claim(&self) {
        if self.claimed.load(Ordering::Acquire) {
            debug_assert_eq!(
                self.claiming_thread.get(),
                Some(&thread::current().id()),
                "claimed connection used from another thread"
            );
        }
    }

    /// Send as much buffered data as fits without blocking. Returns the
    /// number of bytes written.
    fn unlocked_write(&self, write: &mut WriteHalf) -> io::Result<usize> {
        let written = if write.pending() == 0 {
            0
        } else {
            match sys::write(self.fd, &write.buf[write.pos..]) {
                Ok(n) => n,
                Err(err) if is_retriable(&err) => 0,
                Err(err) => return Err(err),
            }
        };
        write.pos += written;

        // Discard the already-written data once it is more than half of the
        // buffer. This keeps the buffer small without spending too many
        // cycles on moving data around.
        if write.pos > write.buf.len() / 2 {
            write.buf.drain(..write.pos);
            write.pos = 0;
        }

        if write.registered.is_some() {
            self.update_pollout(write, write.pending() > 0);
        }

        Ok(written)
    }

    /// Try to empty the output buffer without blocking.
    fn unlocked_try_write(&self, write: &mut WriteHalf) -> io::Result<WriteStatus> {
        let len = write.pending();
        if len == 0 {
            return Ok(WriteStatus::Sent);
        }

        // The buffering threshold is only honored while unregistered, so
        // that a registered connection's POLLOUT interest always reflects
        // data it really wants to send.
        if write.registered.is_none() && len < write.buffering {
            return Ok(WriteStatus::Buffered);
        }

        self.unlocked_write(write)?;

        if write.pending() > 0 {
            Ok(WriteStatus::Buffered)
        } else {
            Ok(WriteStatus::Sent)
        }
    }

    /// Read whatever data is currently available, up to an internal
    /// maximum.
    fn unlocked_read(&self, read: &mut ReadHalf) {
        // The consumed prefix is only dropped here, right before the buffer
        // could grow.
        if read.pos > 0 {
            read.buf.drain(..read.pos);
            read.pos = 0;
        }

        let mut chunk = [0u8; READ_CHUNK];
        match sys::read(self.fd, &mut chunk) {
            Err(err) if is_retriable(&err) => {}
            Err(err) => {
                error!("error reading from fd {}: {}", self.fd, err);
                read.error = true;
                if read.registered.is_some() {
                    self.update_pollin(read, false);
                }
            }
            Ok(0) => {
                read.eof = true;
                if read.registered.is_some() {
                    self.update_pollin(read, false);
                }
            }
            Ok(n) => read.buf.extend_from_slice(&chunk[..n]),
        }
    }

    /// Tell the fdset whether we want readable events, but only when that
    /// changed: re-lodging an unchanged mask would synchronize with the
    /// poller thread for nothing. The read lock must be held.
    fn update_pollin(&self, read: &mut ReadHalf, on: bool) {
        let registered = read.registered.as_ref().expect("connection not registered");
        if on != read.listening_pollin {
            read.listening_pollin = on;
            registered.listen(self.fd, Ready::READABLE, on);
        }
    }

    /// Tell the fdset whether we want writable events, but only when that
    /// changed. The write lock must be held.
    fn update_pollout(&self, write: &mut WriteHalf, on: bool) {
        let registered = write.registered.as_ref().expect("connection not registered");
        if on != write.listening_pollout {
            write.listening_pollout = on;
            registered.listen(self.fd, Ready::WRITABLE, on);
        }
    }

    /// Runs on the poller thread when the registered descriptor is ready.
    fn poll_callback(&self, fd: RawFd, revents: Ready) {
        debug_assert_eq!(fd, self.fd);

        // Draining the whole output buffer also turns POLLOUT interest off.
        if revents.is_writable() {
            let mut write = self.lock_out();
            let _ = self.unlocked_write(&mut write);
        }

        // A read hitting eof or an error turns POLLIN interest off.
        if revents.is_readable() {
            let mut read = self.lock_in();
            self.unlocked_read(&mut read);
            drop(read);

            let callback = self.lock_callback().clone();
            if let Some(callback) = callback {
                // User code never runs with a connection lock held.
                callback(self);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.unregister();

        // Try to flush any remaining data.
        let mut write = self.lock_out();
        let _ = self.unlocked_write(&mut write);
        drop(write);

        if let Err(err) = sys::close(self.fd) {
            error!("error closing fd {}: {}", self.fd, err);
        }
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Connection").field("fd", &self.fd).finish()
    }
}

fn is_retriable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn find_byte(buf: &[u8], from: usize, byte: u8) -> Option<usize> {
    buf[from..].iter().position(|&b| b == byte).map(|at| at + from)
}
