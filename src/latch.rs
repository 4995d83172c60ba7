//! Per-node reader/writer latch. Traversal couples these root-to-leaf, so
//! the acquisition order is acyclic and tree latches cannot deadlock.

use std::sync::atomic::{AtomicU32, Ordering};

pub trait Latch: Default {
    fn acquire_read(&self);
    fn release_read(&self);
    fn acquire_write(&self);
    fn release_write(&self);
    /// Reader to writer. Fails when any other reader (or a waiting
    /// writer) exists.
    fn attempt_upgrade(&self) -> bool;
    /// Writer to reader, infallible.
    fn downgrade(&self);
    fn has_reader(&self) -> bool;
    fn has_writer(&self) -> bool;
}

const WRITER: u32 = 1 << 31;
/// Claimed by a writer waiting for readers to drain; serializes writers
/// and keeps new readers out while the writer spins.
const PENDING: u32 = 1 << 30;
const READER_MASK: u32 = PENDING - 1;

/// Spinning reader/writer latch in a single word. Readers see the full
/// writes of the previous writer through the acquire/release pairs on
/// `state`.
#[derive(Default)]
pub struct SpinLatch {
    state: AtomicU32,
}

impl Latch for SpinLatch {
    fn acquire_read(&self) {
        loop {
            let s = self.state.load(Ordering::Acquire);
            if s & (WRITER | PENDING) == 0 {
                if self
                    .state
                    .compare_exchange_weak(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            }
            std::hint::spin_loop();
        }
    }

    fn release_read(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(prev & READER_MASK > 0);
    }

    fn acquire_write(&self) {
        loop {
            let s = self.state.load(Ordering::Relaxed);
            if s & (WRITER | PENDING) == 0 {
                if self
                    .state
                    .compare_exchange_weak(s, s | PENDING, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
            std::hint::spin_loop();
        }
        // drain readers
        while self
            .state
            .compare_exchange_weak(PENDING, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn release_write(&self) {
        debug_assert!(self.has_writer());
        self.state.store(0, Ordering::Release);
    }

    fn attempt_upgrade(&self) -> bool {
        self.state
            .compare_exchange(1, WRITER, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    fn downgrade(&self) {
        debug_assert!(self.has_writer());
        self.state.store(1, Ordering::Release);
    }

    fn has_reader(&self) -> bool {
        self.state.load(Ordering::Relaxed) & READER_MASK != 0
    }

    fn has_writer(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }
}

/// No-op stand-in for single-threaded use. Reports itself as held so
/// holder assertions stay meaningful.
#[derive(Default)]
pub struct NoLatch;

impl Latch for NoLatch {
    fn acquire_read(&self) {}
    fn release_read(&self) {}
    fn acquire_write(&self) {}
    fn release_write(&self) {}
    fn attempt_upgrade(&self) -> bool {
        true
    }
    fn downgrade(&self) {}
    fn has_reader(&self) -> bool {
        true
    }
    fn has_writer(&self) -> bool {
        true
    }
}
