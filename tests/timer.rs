use std::thread;
use std::time::Duration;

use gwio::{Queue, Timer, TimerSet};

mod util;
use util::{assert_send, assert_sync, init, wait_until};

#[test]
fn timer_types_are_send_and_sync() {
    assert_send::<TimerSet<Vec<u8>>>();
    assert_sync::<TimerSet<Vec<u8>>>();
    assert_send::<Timer<Vec<u8>>>();
    assert_sync::<Timer<Vec<u8>>>();
    assert_send::<Queue<Vec<u8>>>();
    assert_sync::<Queue<Vec<u8>>>();
}

#[test]
fn immediate_elapse() {
    init();
    let output = Queue::new();
    let set = TimerSet::new(output.clone());

    let timer = set.new_timer();
    timer.start(Duration::ZERO, Some("ping"));

    let event = output
        .consume_timeout(Duration::from_secs(2))
        .expect("timer did not elapse");
    assert_eq!(*event, "ping");

    // Exactly one elapse per start.
    assert!(output.try_consume().is_none());
}

#[test]
fn reset_shortens_the_wait() {
    init();
    let output = Queue::new();
    let set = TimerSet::new(output.clone());

    let timer = set.new_timer();
    timer.start(Duration::from_secs(100), Some(1u32));
    timer.start(Duration::from_secs(1), None);

    let event = output
        .consume_timeout(Duration::from_secs(5))
        .expect("reset timer did not elapse early");
    assert_eq!(*event, 1);

    thread::sleep(Duration::from_millis(1500));
    assert!(output.try_consume().is_none());
}

#[test]
fn stop_retracts_queued_elapse() {
    init();
    let output = Queue::new();
    let set = TimerSet::new(output.clone());

    let timer = set.new_timer();
    timer.start(Duration::ZERO, Some("gone"));

    // Let it elapse without consuming the event.
    wait_until(|| output.len() == 1);

    timer.stop();
    assert!(output.is_empty());
}

#[test]
fn restart_retracts_queued_elapse() {
    init();
    let output = Queue::new();
    let set = TimerSet::new(output.clone());

    let timer = set.new_timer();
    timer.start(Duration::ZERO, Some(1u32));
    wait_until(|| output.len() == 1);

    // Restarting hides the unconsumed elapse from the caller.
    timer.start(Duration::from_secs(1), Some(2u32));
    assert!(output.is_empty());

    let event = output
        .consume_timeout(Duration::from_secs(5))
        .expect("restarted timer did not elapse");
    assert_eq!(*event, 2);
    assert!(output.try_consume().is_none());
}

#[test]
fn elapses_arrive_in_order() {
    init();
    let output = Queue::new();
    let set = TimerSet::new(output.clone());

    // Started out of order on purpose.
    let timers: Vec<_> = [2u64, 0, 1]
        .iter()
        .map(|&secs| {
            let timer = set.new_timer();
            timer.start(Duration::from_secs(secs), Some(secs));
            timer
        })
        .collect();

    let mut seen = Vec::new();
    for _ in 0..timers.len() {
        let event = output
            .consume_timeout(Duration::from_secs(5))
            .expect("timer did not elapse");
        seen.push(*event);
    }
    assert_eq!(seen, vec![0, 1, 2]);
}

#[test]
fn stop_is_idempotent() {
    init();
    let output = Queue::new();
    let set = TimerSet::new(output.clone());

    let timer = set.new_timer();
    timer.stop();
    timer.start(Duration::from_secs(30), Some(()));
    timer.stop();
    timer.stop();
    assert!(output.is_empty());
}

#[test]
fn dropping_the_set_stops_pending_timers() {
    init();
    let output: Queue<std::sync::Arc<u8>> = Queue::new();
    let set = TimerSet::new(output.clone());

    let timer = set.new_timer();
    timer.start(Duration::from_secs(100), Some(0));

    drop(set);

    // The set was the only producer, so a consumer is released right away
    // instead of waiting out the 100 seconds.
    assert!(output.consume().is_none());

    // The handle is still safe to use for everything but starting.
    timer.stop();
}

#[test]
#[should_panic(expected = "stopped set")]
fn starting_on_a_dropped_set_panics() {
    let output = Queue::new();
    let set = TimerSet::new(output.clone());
    let timer = set.new_timer();
    drop(set);

    timer.start(Duration::ZERO, Some(0u8));
}
