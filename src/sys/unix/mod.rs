use std::io;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::Ready;

/// Helper macro to execute a system call that returns an `io::Result`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// Put a file descriptor in non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    if flags & libc::O_NONBLOCK == 0 {
        syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }
    Ok(())
}

/// Create a non-blocking, close-on-exec pipe. Returns (read end, write end).
#[cfg(not(any(target_os = "ios", target_os = "macos")))]
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1, -1];
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
    // Safety: pipe2 just handed us ownership of both descriptors.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Create a non-blocking, close-on-exec pipe. Returns (read end, write end).
///
/// No `pipe2(2)` here, so the flags are set one fcntl at a time.
#[cfg(any(target_os = "ios", target_os = "macos"))]
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1, -1];
    syscall!(pipe(fds.as_mut_ptr()))?;
    // Safety: pipe just handed us ownership of both descriptors.
    let pair = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in fds {
        syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
        set_nonblocking(fd)?;
    }
    Ok(pair)
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    syscall!(read(fd, buf.as_mut_ptr().cast(), buf.len())).map(|n| n as usize)
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    syscall!(write(fd, buf.as_ptr().cast(), buf.len())).map(|n| n as usize)
}

pub(crate) fn close(fd: RawFd) -> io::Result<()> {
    syscall!(close(fd)).map(|_| ())
}

pub(crate) fn events_to_poll(events: Ready) -> libc::c_short {
    let mut bits = 0;
    if events.is_readable() {
        bits |= libc::POLLIN;
    }
    if events.is_writable() {
        bits |= libc::POLLOUT;
    }
    bits
}

pub(crate) fn revents_from_poll(revents: libc::c_short) -> Ready {
    let mut ready = Ready::EMPTY;
    if revents & libc::POLLIN != 0 {
        ready |= Ready::READABLE;
    }
    if revents & libc::POLLOUT != 0 {
        ready |= Ready::WRITABLE;
    }
    if revents & libc::POLLERR != 0 {
        ready |= Ready::ERROR;
    }
    if revents & libc::POLLHUP != 0 {
        ready |= Ready::HUP;
    }
    if revents & libc::POLLNVAL != 0 {
        ready |= Ready::INVALID;
    }
    ready
}

/// Poll a single file descriptor for `events`, waiting at most `timeout`
/// (`None` means wait forever). Returns the readiness that was reported,
/// [`Ready::EMPTY`] on timeout. An interrupted poll surfaces as
/// `ErrorKind::Interrupted` for the caller to decide on.
pub(crate) fn poll_fd(fd: RawFd, events: Ready, timeout: Option<Duration>) -> io::Result<Ready> {
    let mut pollfd = libc::pollfd {
        fd,
        events: events_to_poll(events),
        revents: 0,
    };

    let timeout_ms: libc::c_int = match timeout {
        // poll(2) takes milliseconds; round up so short waits don't spin.
        Some(timeout) => {
            let mut millis = timeout.as_millis();
            if timeout.subsec_nanos() % 1_000_000 != 0 {
                millis += 1;
            }
            millis.try_into().unwrap_or(libc::c_int::MAX)
        }
        None => -1,
    };

    let n = syscall!(poll(&mut pollfd, 1, timeout_ms))?;
    if n == 0 {
        return Ok(Ready::EMPTY);
    }
    Ok(revents_from_poll(pollfd.revents))
}
