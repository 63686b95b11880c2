// Not all helpers are used by every test file.
#![allow(dead_code)]

use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use gwio::Connection;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    })
}

pub fn assert_send<T: Send>() {}
pub fn assert_sync<T: Sync>() {}

/// A connection wrapped around one end of a loopback socket pair, plus the
/// peer end as a plain blocking stream.
pub fn connected_pair() -> (Arc<Connection>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("unable to bind listener");
    let addr = listener.local_addr().expect("unable to get local address");
    let peer = TcpStream::connect(addr).expect("unable to connect");
    let (accepted, _) = listener.accept().expect("unable to accept");
    let conn = Connection::from_stream(accepted).expect("unable to wrap stream");
    (Arc::new(conn), peer)
}

/// Drive `conn` until at least `want` bytes sit in its input buffer.
pub fn pump(conn: &Connection, want: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while conn.inbuf_len() < want {
        assert!(
            Instant::now() < deadline,
            "only {} of {} bytes arrived in time",
            conn.inbuf_len(),
            want
        );
        conn.wait(Some(Duration::from_millis(100)))
            .expect("wait failed");
    }
}

/// Keep checking `cond` until it holds, or fail after ~5 seconds.
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(10));
    }
}
