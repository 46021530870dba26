//! Atomic primitives shared by every lock word transition.

use std::sync::atomic::{fence, AtomicUsize, Ordering};

/// Compare-and-swap a lock word, returning the value observed before the operation.
///
/// The swap succeeded iff the returned value equals `old`. With `read_before_cas` the word
/// is loaded first and the CAS is skipped when it cannot succeed, which keeps the cache line
/// shared while other threads spin on it.
#[inline(always)]
pub fn compare_and_swap_lockword(
    lockword: &AtomicUsize,
    old: usize,
    new: usize,
    read_before_cas: bool,
) -> usize {
    if read_before_cas {
        let current = lockword.load(Ordering::Relaxed);
        if current != old {
            return current;
        }
    }

    match lockword.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire) {
        Ok(previous) => previous,
        Err(previous) => previous,
    }
}

/// Set bits in a lock word as long as it is not zero. Returns the final word, or zero if the
/// lock was released in the meantime. Inflated words are returned untouched.
pub fn set_bits_while_nonzero(lockword: &AtomicUsize, bits: usize) -> usize {
    let mut lock = lockword.load(Ordering::Relaxed);
    while lock != 0 {
        if lock & bits == bits || lock & super::lockword::OBJECT_HEADER_LOCK_INFLATED != 0 {
            return lock;
        }

        let observed = compare_and_swap_lockword(lockword, lock, lock | bits, false);
        if observed == lock {
            return lock | bits;
        }
        lock = observed;
    }
    0
}

#[inline(always)]
pub fn load_lockword(lockword: &AtomicUsize) -> usize {
    lockword.load(Ordering::Acquire)
}

#[inline(always)]
pub fn read_barrier() {
    fence(Ordering::Acquire);
}

#[inline(always)]
pub fn write_barrier() {
    fence(Ordering::Release);
}

#[inline(always)]
pub fn read_write_barrier() {
    fence(Ordering::SeqCst);
}

#[inline(always)]
pub fn add_atomic(counter: &AtomicUsize, amount: usize) -> usize {
    counter.fetch_add(amount, Ordering::AcqRel) + amount
}

#[inline(always)]
pub fn subtract_atomic(counter: &AtomicUsize, amount: usize) -> usize {
    let previous = counter.fetch_sub(amount, Ordering::AcqRel);
    debug_assert!(previous >= amount, "counter underflow");
    previous - amount
}

/// CPU relaxation hint for busy-wait loops.
#[inline(always)]
pub fn yield_cpu() {
    std::hint::spin_loop();
}

#[inline(always)]
pub fn nop() {
    std::hint::spin_loop();
}

/// Lower the SMT priority of this hardware thread for the duration of a tight spin.
///
/// A no-op on every supported target: only POWER has the priority hint, and stable Rust
/// has no inline assembly for it.
#[inline(always)]
pub fn drop_smt_priority() {}

/// Undo [`drop_smt_priority`]. A no-op for the same reason.
#[inline(always)]
pub fn restore_smt_priority() {}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Give up the rest of this thread's time slice.
        pub fn thread_yield() {
            // SAFETY: sched_yield has no preconditions.
            unsafe {
                libc::sched_yield();
            }
        }
    } else {
        pub fn thread_yield() {
            std::thread::yield_now();
        }
    }
}

/// Yield with escalating cost: OS yields for the first `sequence` values below 32, then
/// a short sleep so that a starved owner gets a chance to run.
pub fn thread_yield_escalating(sequence: usize) {
    if sequence < 32 {
        thread_yield();
    } else {
        std::thread::sleep(std::time::Duration::from_micros(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_reports_observed_value() {
        let word = AtomicUsize::new(0);
        assert_eq!(compare_and_swap_lockword(&word, 0, 0x100, false), 0);
        assert_eq!(word.load(Ordering::Relaxed), 0x100);

        assert_eq!(compare_and_swap_lockword(&word, 0, 0x200, true), 0x100);
        assert_eq!(compare_and_swap_lockword(&word, 0, 0x200, false), 0x100);
        assert_eq!(word.load(Ordering::Relaxed), 0x100);
    }

    #[test]
    fn setting_bits_skips_released_locks() {
        let word = AtomicUsize::new(0x100);
        assert_eq!(set_bits_while_nonzero(&word, 0x2), 0x102);
        assert_eq!(set_bits_while_nonzero(&word, 0x2), 0x102);

        word.store(0x1001, Ordering::Relaxed);
        assert_eq!(set_bits_while_nonzero(&word, 0x2), 0x1001);

        word.store(0, Ordering::Relaxed);
        assert_eq!(set_bits_while_nonzero(&word, 0x2), 0);
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn pin_style_counters() {
        let counter = AtomicUsize::new(0);
        assert_eq!(add_atomic(&counter, 1), 1);
        assert_eq!(add_atomic(&counter, 2), 3);
        assert_eq!(subtract_atomic(&counter, 3), 0);
    }
}
