#[cfg(unix)]
pub(crate) use self::unix::{close, pipe, poll_fd, read, set_nonblocking, write};

#[cfg(unix)]
pub(crate) mod unix;
