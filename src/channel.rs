//! Lock-free channel between the communications context and the physics
//! tick: a single-slot command mailbox one way, a snapshot ring the other.
//!
//! Neither side ever blocks. The ring drops the newest entry when full and
//! counts it; the mailbox is most-recent-wins.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use static_assertions::{assert_impl_all, assert_not_impl_any};

/// Default snapshot ring depth.
pub const RING_CAPACITY: usize = 16;

/// Single-producer/single-consumer ring of `Copy` snapshots.
///
/// The producer writes the slot and then publishes `head` with release
/// ordering; the consumer loads `head` with acquire ordering before reading
/// the slot, so a partially written entry is never observed.
pub struct SnapshotRing<T: Copy, const N: usize> {
    slots: [UnsafeCell<MaybeUninit<T>>; N],
    head: AtomicUsize,
    tail: AtomicUsize,
    overflows: AtomicU32,
}

// SAFETY: slot access is partitioned by the head/tail protocol; the handle
// types guarantee one producer and one consumer.
unsafe impl<T: Copy + Send, const N: usize> Sync for SnapshotRing<T, N> {}

impl<T: Copy, const N: usize> SnapshotRing<T, N> {
    const POWER_OF_TWO: () = assert!(N.is_power_of_two(), "ring capacity must be a power of two");
    const MASK: usize = N - 1;

    fn new() -> Self {
        let () = Self::POWER_OF_TWO;
        Self {
            slots: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            overflows: AtomicU32::new(0),
        }
    }

    /// Split a new ring into its two handles.
    pub fn split() -> (RingProducer<T, N>, RingConsumer<T, N>) {
        let ring = Arc::new(Self::new());
        (
            RingProducer {
                ring: Arc::clone(&ring),
            },
            RingConsumer { ring },
        )
    }

    pub const fn capacity() -> usize {
        N
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overflow_count(&self) -> u32 {
        self.overflows.load(Ordering::Relaxed)
    }

    fn push(&self, value: T) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= N {
            self.overflows.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        // SAFETY: the slot at `head` is outside the consumer's readable
        // window until the release store below publishes it.
        unsafe {
            (*self.slots[head & Self::MASK].get()).write(value);
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    fn pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        // SAFETY: the acquire load of `head` synchronises with the producer's
        // release store, so the slot is fully initialised; T is Copy.
        let value = unsafe { (*self.slots[tail & Self::MASK].get()).assume_init() };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

pub struct RingProducer<T: Copy, const N: usize> {
    ring: Arc<SnapshotRing<T, N>>,
}

impl<T: Copy, const N: usize> RingProducer<T, N> {
    /// Publish a snapshot. Returns false (and counts an overflow) when full.
    pub fn push(&mut self, value: T) -> bool {
        self.ring.push(value)
    }

    pub fn overflow_count(&self) -> u32 {
        self.ring.overflow_count()
    }
}

pub struct RingConsumer<T: Copy, const N: usize> {
    ring: Arc<SnapshotRing<T, N>>,
}

impl<T: Copy, const N: usize> RingConsumer<T, N> {
    pub fn pop(&mut self) -> Option<T> {
        self.ring.pop()
    }

    /// Drain the ring, keeping only the newest entry.
    pub fn latest(&mut self) -> Option<T> {
        let mut newest = None;
        while let Some(value) = self.ring.pop() {
            newest = Some(value);
        }
        newest
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn overflow_count(&self) -> u32 {
        self.ring.overflow_count()
    }
}

/// Single-writer seqlock slot holding the most recent command record.
///
/// The writer bumps the sequence to odd, writes the payload and bumps it
/// back to even. Readers retry while the sequence is odd or changed under
/// them. A copy taken during a write may be torn, so it stays a
/// `MaybeUninit<T>` until the sequence check has accepted it.
pub struct CommandMailbox<T: Copy> {
    seq: AtomicU32,
    data: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: `CommsEndpoint` is the only writer and is not `Clone`, so writes
// never overlap each other. Readers only copy the cell out, never hand out
// references into it, and assume the copy initialised only after the
// sequence shows no write overlapped it.
unsafe impl<T: Copy + Send> Sync for CommandMailbox<T> {}

impl<T: Copy> CommandMailbox<T> {
    pub const fn new(value: T) -> Self {
        Self {
            seq: AtomicU32::new(0),
            data: UnsafeCell::new(MaybeUninit::new(value)),
        }
    }

    fn write(&self, value: T) {
        self.seq.fetch_add(1, Ordering::AcqRel);
        // SAFETY: the pointer comes from our own cell and is aligned. There
        // is one writer, so no other write is in progress. A reader copying
        // concurrently sees an odd or changed sequence afterwards and throws
        // its copy away; the volatile access keeps the compiler from moving
        // the store outside the two sequence bumps.
        unsafe {
            std::ptr::write_volatile(self.data.get(), MaybeUninit::new(value));
        }
        self.seq.fetch_add(1, Ordering::Release);
    }

    /// Read a consistent copy along with the sequence it was published at.
    pub fn read(&self) -> (T, u32) {
        loop {
            let start = self.seq.load(Ordering::Acquire);
            if start & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: the pointer is valid and aligned for the life of
            // `self`. The copy is taken as `MaybeUninit<T>`, so a torn byte
            // pattern is never treated as a `T`.
            let copy = unsafe { std::ptr::read_volatile(self.data.get()) };
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == start {
                // SAFETY: the sequence was even and unchanged across the
                // copy, so no write overlapped it and it holds the complete
                // value published at `start`.
                return (unsafe { copy.assume_init() }, start);
            }
        }
    }

    /// Return the record only if it was written since `last_seq`.
    pub fn read_if_updated(&self, last_seq: &mut u32) -> Option<T> {
        if self.seq.load(Ordering::Acquire) == *last_seq {
            return None;
        }
        let (value, seq) = self.read();
        if seq == *last_seq {
            return None;
        }
        *last_seq = seq;
        Some(value)
    }

    pub fn sequence(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }
}

/// The communications side: writes commands, consumes snapshots.
pub struct CommsEndpoint<C: Copy, S: Copy, const N: usize = RING_CAPACITY> {
    mailbox: Arc<CommandMailbox<C>>,
    snapshots: RingConsumer<S, N>,
}

impl<C: Copy, S: Copy, const N: usize> CommsEndpoint<C, S, N> {
    pub fn send(&mut self, command: C) {
        self.mailbox.write(command);
    }

    pub fn recv(&mut self) -> Option<S> {
        self.snapshots.pop()
    }

    pub fn latest(&mut self) -> Option<S> {
        self.snapshots.latest()
    }

    pub fn overflow_count(&self) -> u32 {
        self.snapshots.overflow_count()
    }
}

/// The physics side: reads commands, publishes snapshots.
pub struct PhysicsEndpoint<C: Copy, S: Copy, const N: usize = RING_CAPACITY> {
    mailbox: Arc<CommandMailbox<C>>,
    last_seq: u32,
    snapshots: RingProducer<S, N>,
}

impl<C: Copy, S: Copy, const N: usize> PhysicsEndpoint<C, S, N> {
    /// The latest command, if one arrived since the previous call.
    pub fn command_update(&mut self) -> Option<C> {
        self.mailbox.read_if_updated(&mut self.last_seq)
    }

    /// The latest command regardless of change.
    pub fn command(&self) -> C {
        self.mailbox.read().0
    }

    pub fn publish(&mut self, snapshot: S) -> bool {
        self.snapshots.push(snapshot)
    }

    pub fn overflow_count(&self) -> u32 {
        self.snapshots.overflow_count()
    }
}

/// Create a connected pair of endpoints, the mailbox primed with `initial`.
pub fn channel<C: Copy, S: Copy, const N: usize>(
    initial: C,
) -> (CommsEndpoint<C, S, N>, PhysicsEndpoint<C, S, N>) {
    let mailbox = Arc::new(CommandMailbox::new(initial));
    let (producer, consumer) = SnapshotRing::<S, N>::split();
    (
        CommsEndpoint {
            mailbox: Arc::clone(&mailbox),
            snapshots: consumer,
        },
        PhysicsEndpoint {
            mailbox,
            last_seq: 0,
            snapshots: producer,
        },
    )
}

assert_impl_all!(CommsEndpoint<u64, [u8; 32]>: Send);
assert_impl_all!(PhysicsEndpoint<u64, [u8; 32]>: Send);
assert_not_impl_any!(CommsEndpoint<u64, [u8; 32]>: Clone);
assert_not_impl_any!(PhysicsEndpoint<u64, [u8; 32]>: Clone);
assert_not_impl_any!(RingProducer<u64, 4>: Clone);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_fifo_order() {
        let (mut tx, mut rx) = SnapshotRing::<u32, 4>::split();
        assert!(tx.push(1));
        assert!(tx.push(2));
        assert_eq!(rx.len(), 2);
        assert_eq!(rx.pop(), Some(1));
        assert_eq!(rx.pop(), Some(2));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_ring_drops_newest_when_full() {
        let (mut tx, mut rx) = SnapshotRing::<u32, 4>::split();
        for i in 0..4 {
            assert!(tx.push(i));
        }
        assert!(!tx.push(99));
        assert_eq!(tx.overflow_count(), 1);
        assert_eq!(rx.latest(), Some(3));
        assert!(rx.is_empty());
    }

    #[test]
    fn test_ring_index_wraps() {
        let (mut tx, mut rx) = SnapshotRing::<u32, 2>::split();
        for i in 0..100 {
            assert!(tx.push(i));
            assert_eq!(rx.pop(), Some(i));
        }
    }

    #[test]
    fn test_mailbox_change_detection() {
        let mailbox = CommandMailbox::new(0u32);
        let mut last = 0;
        assert_eq!(mailbox.read_if_updated(&mut last), None);
        mailbox.write(7);
        assert_eq!(mailbox.read_if_updated(&mut last), Some(7));
        assert_eq!(mailbox.read_if_updated(&mut last), None);
        mailbox.write(8);
        mailbox.write(9);
        assert_eq!(mailbox.read_if_updated(&mut last), Some(9));
    }

    #[test]
    fn test_channel_round_trip() {
        let (mut comms, mut physics) = channel::<u32, u64, 8>(0);
        assert_eq!(physics.command_update(), None);
        comms.send(5);
        assert_eq!(physics.command_update(), Some(5));
        assert_eq!(physics.command(), 5);
        assert!(physics.publish(42));
        assert_eq!(comms.latest(), Some(42));
    }
}
