use nspwheel::channel::{channel, SnapshotRing};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const TOTAL: u64 = 200_000;

#[test]
fn test_ring_preserves_order_across_threads() {
    let (mut producer, mut consumer) = SnapshotRing::<u64, 64>::split();
    let done = Arc::new(AtomicBool::new(false));

    let producer_done = Arc::clone(&done);
    let handle = thread::spawn(move || {
        let mut accepted = 0u64;
        for value in 0..TOTAL {
            if producer.push(value) {
                accepted += 1;
            }
        }
        producer_done.store(true, Ordering::Release);
        (accepted, producer.overflow_count())
    });

    let mut received = Vec::new();
    loop {
        let finished = done.load(Ordering::Acquire);
        while let Some(value) = consumer.pop() {
            received.push(value);
        }
        if finished && consumer.is_empty() {
            break;
        }
        thread::yield_now();
    }

    let (accepted, overflows) = handle.join().unwrap();
    assert_eq!(received.len() as u64, accepted);
    assert_eq!(accepted + u64::from(overflows), TOTAL);
    assert!(received.windows(2).all(|w| w[0] < w[1]), "snapshots reordered");
}

#[test]
fn test_full_ring_drops_newest() {
    let (mut producer, mut consumer) = SnapshotRing::<u32, 4>::split();
    for value in 0..6 {
        producer.push(value);
    }
    assert_eq!(producer.overflow_count(), 2);
    assert_eq!(consumer.len(), 4);
    assert_eq!(consumer.latest(), Some(3));
    assert!(consumer.is_empty());
    assert_eq!(consumer.pop(), None);
}

#[test]
fn test_mailbox_never_tears_under_contention() {
    let (mut comms, mut physics) = channel::<[u64; 8], u8, 4>([0; 8]);
    let done = Arc::new(AtomicBool::new(false));

    let writer_done = Arc::clone(&done);
    let writer = thread::spawn(move || {
        for value in 1..=50_000u64 {
            comms.send([value; 8]);
        }
        writer_done.store(true, Ordering::Release);
    });

    let mut last = 0;
    let mut reads = 0;
    loop {
        let finished = done.load(Ordering::Acquire);
        if let Some(command) = physics.command_update() {
            assert!(command.iter().all(|&v| v == command[0]), "torn read {command:?}");
            assert!(command[0] >= last, "went backwards");
            last = command[0];
            reads += 1;
        }
        if finished {
            break;
        }
    }
    writer.join().unwrap();

    // Most-recent-wins: the final value is always observable.
    assert_eq!(physics.command(), [50_000; 8]);
    assert!(reads > 0);
}

#[test]
fn test_command_update_fires_once_per_write() {
    let (mut comms, mut physics) = channel::<u32, u32, 4>(7);
    assert_eq!(physics.command(), 7);
    assert_eq!(physics.command_update(), None);

    comms.send(8);
    comms.send(9);
    assert_eq!(physics.command_update(), Some(9));
    assert_eq!(physics.command_update(), None);

    assert!(physics.publish(1));
    assert!(physics.publish(2));
    assert_eq!(comms.recv(), Some(1));
    assert_eq!(comms.latest(), Some(2));
    assert_eq!(comms.latest(), None);
}
