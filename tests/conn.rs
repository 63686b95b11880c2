use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use gwio::{Connection, FdSet, FlushStatus, WaitStatus, WriteStatus};

mod util;
use util::{assert_send, assert_sync, connected_pair, init, pump, wait_until};

#[test]
fn conn_types_are_send_and_sync() {
    assert_send::<Connection>();
    assert_sync::<Connection>();
    assert_send::<FdSet>();
    assert_sync::<FdSet>();
}

#[test]
fn read_line_splits_on_lf() {
    init();
    let (conn, mut peer) = connected_pair();

    peer.write_all(b"abc\ndef").unwrap();
    pump(&conn, 7);

    assert_eq!(&conn.read_line().unwrap()[..], b"abc");
    // No LF yet, so no line yet.
    assert!(conn.read_line().is_none());

    peer.write_all(b"\n").unwrap();
    pump(&conn, 4);
    assert_eq!(&conn.read_line().unwrap()[..], b"def");
}

#[test]
fn read_line_strips_carriage_return() {
    init();
    let (conn, mut peer) = connected_pair();

    peer.write_all(b"HELLO\r\n").unwrap();
    pump(&conn, 7);
    assert_eq!(&conn.read_line().unwrap()[..], b"HELLO");
}

#[test]
fn read_fixed_needs_the_full_amount() {
    init();
    let (conn, mut peer) = connected_pair();

    peer.write_all(b"xyzzy").unwrap();
    pump(&conn, 5);

    assert!(conn.read_fixed(6).is_none());
    assert_eq!(&conn.read_fixed(5).unwrap()[..], b"xyzzy");
    assert!(conn.read_fixed(1).is_none());
}

#[test]
fn read_everything_drains_the_buffer() {
    init();
    let (conn, mut peer) = connected_pair();

    peer.write_all(b"one ").unwrap();
    peer.write_all(b"two").unwrap();
    pump(&conn, 7);

    assert_eq!(&conn.read_everything().unwrap()[..], b"one two");
    assert!(conn.read_everything().is_none());
}

#[test]
fn withlen_round_trip() {
    init();
    let (conn, mut peer) = connected_pair();

    // Connection to peer.
    assert_eq!(conn.write_withlen(b"frame").unwrap(), WriteStatus::Sent);
    let mut got = [0u8; 9];
    peer.read_exact(&mut got).unwrap();
    assert_eq!(&got[..4], &5u32.to_be_bytes());
    assert_eq!(&got[4..], b"frame");

    // Peer to connection.
    peer.write_all(&3u32.to_be_bytes()).unwrap();
    peer.write_all(b"xyz").unwrap();
    pump(&conn, 7);
    assert_eq!(&conn.read_withlen().unwrap()[..], b"xyz");
    assert!(conn.read_withlen().is_none());
}

#[test]
fn withlen_skips_negative_length() {
    init();
    let (conn, mut peer) = connected_pair();

    // A prefix with the high bit set is not a length. The next real frame
    // must come out of the very same call.
    peer.write_all(&0xFFFF_FFFFu32.to_be_bytes()).unwrap();
    peer.write_all(&2u32.to_be_bytes()).unwrap();
    peer.write_all(b"ok").unwrap();
    pump(&conn, 10);

    assert_eq!(&conn.read_withlen().unwrap()[..], b"ok");
}

#[test]
fn read_packet_discards_leading_garbage() {
    init();
    let (conn, mut peer) = connected_pair();

    peer.write_all(b"junk\x02payload\x03tail").unwrap();
    pump(&conn, 17);

    assert_eq!(&conn.read_packet(0x02, 0x03).unwrap()[..], b"\x02payload\x03");
    // "tail" has no start marker; it is discarded while scanning.
    assert!(conn.read_packet(0x02, 0x03).is_none());
    assert_eq!(conn.inbuf_len(), 0);
}

#[test]
fn read_packet_waits_for_end_marker() {
    init();
    let (conn, mut peer) = connected_pair();

    peer.write_all(b"\x02partial").unwrap();
    pump(&conn, 8);
    assert!(conn.read_packet(0x02, 0x03).is_none());

    peer.write_all(b"\x03").unwrap();
    pump(&conn, 9);
    assert_eq!(&conn.read_packet(0x02, 0x03).unwrap()[..], b"\x02partial\x03");
}

#[test]
fn eof_is_sticky() {
    init();
    let (conn, mut peer) = connected_pair();

    peer.write_all(b"tail").unwrap();
    drop(peer);

    pump(&conn, 4);
    assert_eq!(&conn.read_everything().unwrap()[..], b"tail");

    wait_until(|| {
        let _ = conn.wait(Some(Duration::from_millis(50)));
        conn.eof()
    });
    assert!(conn.read_everything().is_none());
    assert!(conn.eof());
    assert!(!conn.read_error());
}

#[test]
fn wait_times_out_when_idle() {
    init();
    let (conn, _peer) = connected_pair();

    assert_eq!(
        conn.wait(Some(Duration::from_millis(100))).unwrap(),
        WaitStatus::TimedOut
    );
}

#[test]
fn wait_reports_progress_on_arrival() {
    init();
    let (conn, mut peer) = connected_pair();

    peer.write_all(b"x").unwrap();
    assert_eq!(conn.wait(None).unwrap(), WaitStatus::Progress);
    // The wait itself pulled the data in.
    wait_until(|| conn.inbuf_len() == 1);
}

#[test]
fn buffered_write_lingers_until_flush() {
    init();
    let (conn, mut peer) = connected_pair();

    conn.set_output_buffering(1024);
    assert_eq!(conn.write(b"hi").unwrap(), WriteStatus::Buffered);
    assert_eq!(conn.outbuf_len(), 2);

    assert_eq!(conn.flush().unwrap(), FlushStatus::Drained);
    assert_eq!(conn.outbuf_len(), 0);

    let mut got = [0u8; 2];
    peer.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"hi");
}

#[test]
fn lowering_the_threshold_writes_out() {
    init();
    let (conn, mut peer) = connected_pair();

    conn.set_output_buffering(1024);
    assert_eq!(conn.write(b"later").unwrap(), WriteStatus::Buffered);

    conn.set_output_buffering(0);
    wait_until(|| conn.outbuf_len() == 0);

    let mut got = [0u8; 5];
    peer.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"later");
}

#[test]
fn flush_pushes_a_megabyte_through_a_slow_peer() {
    init();
    let (conn, mut peer) = connected_pair();
    const TOTAL: usize = 1 << 20;

    let reader = thread::spawn(move || {
        let mut buf = [0u8; 64 * 1024];
        let mut total = 0;
        while total < TOTAL {
            match peer.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    thread::sleep(Duration::from_millis(1));
                }
                Err(err) => panic!("peer read failed: {}", err),
            }
        }
        total
    });

    let data = vec![0xA5u8; TOTAL];
    conn.write(&data).unwrap();
    loop {
        match conn.flush().unwrap() {
            FlushStatus::Drained => break,
            FlushStatus::Interrupted => continue,
        }
    }
    assert_eq!(conn.outbuf_len(), 0);

    assert_eq!(reader.join().unwrap(), TOTAL);
}

#[test]
fn callback_runs_when_data_arrives() {
    init();
    let (conn, mut peer) = connected_pair();
    let fdset = FdSet::new().unwrap();

    let got = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&got);
    Connection::register(&conn, &fdset, move |conn| {
        while let Some(bytes) = conn.read_everything() {
            sink.lock().unwrap().extend_from_slice(&bytes);
        }
    })
    .unwrap();

    peer.write_all(b"hello").unwrap();
    wait_until(|| got.lock().unwrap().len() >= 5);
    assert_eq!(&got.lock().unwrap()[..], b"hello");

    peer.write_all(b" again").unwrap();
    wait_until(|| got.lock().unwrap().len() >= 11);
    assert_eq!(&got.lock().unwrap()[..], b"hello again");

    conn.unregister();
}

#[test]
fn reregister_replaces_the_callback() {
    init();
    let (conn, mut peer) = connected_pair();
    let fdset = FdSet::new().unwrap();

    let first = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&first);
    Connection::register(&conn, &fdset, move |_| {
        *counter.lock().unwrap() += 1;
    })
    .unwrap();

    let second = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&second);
    Connection::register(&conn, &fdset, move |conn| {
        let _ = conn.read_everything();
        *counter.lock().unwrap() += 1;
    })
    .unwrap();

    peer.write_all(b"ding").unwrap();
    wait_until(|| *second.lock().unwrap() > 0);
    assert_eq!(*first.lock().unwrap(), 0);

    conn.unregister();
}

#[test]
fn register_refuses_a_second_fdset() {
    init();
    let (conn, _peer) = connected_pair();
    let fdset = FdSet::new().unwrap();
    let other = FdSet::new().unwrap();

    Connection::register(&conn, &fdset, |_| {}).unwrap();
    assert!(Connection::register(&conn, &other, |_| {}).is_err());

    // After unregistering, the other set is fine.
    conn.unregister();
    Connection::register(&conn, &other, |_| {}).unwrap();
    conn.unregister();
}

#[test]
fn registered_writes_drain_without_flushing() {
    init();
    let (conn, mut peer) = connected_pair();
    let fdset = FdSet::new().unwrap();
    const TOTAL: usize = 1 << 20;

    Connection::register(&conn, &fdset, |_| {}).unwrap();

    let reader = thread::spawn(move || {
        let mut buf = [0u8; 64 * 1024];
        let mut total = 0;
        while total < TOTAL {
            match peer.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(err) => panic!("peer read failed: {}", err),
            }
        }
        total
    });

    // Far more than the socket accepts at once; the poller thread must
    // drain the rest behind our back.
    let data = vec![0x5Au8; TOTAL];
    conn.write(&data).unwrap();
    wait_until(|| conn.outbuf_len() == 0);

    assert_eq!(reader.join().unwrap(), TOTAL);
    conn.unregister();
}

#[test]
fn claimed_connection_works_single_threaded() {
    init();
    let (conn, mut peer) = connected_pair();

    conn.claim();
    conn.write(b"claimed\n").unwrap();
    let mut got = [0u8; 8];
    peer.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"claimed\n");

    peer.write_all(b"reply\n").unwrap();
    pump(&conn, 6);
    assert_eq!(&conn.read_line().unwrap()[..], b"reply");
}
