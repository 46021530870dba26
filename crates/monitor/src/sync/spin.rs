//! Bounded spinning before a thread blocks.
//!
//! Both spins have the same shape: `yields` outer iterations ending in an OS yield, `spins2`
//! attempts per outer iteration, and a tight loop of `spins1` no-ops between attempts. With
//! nested spinning disabled only the first outer iteration runs the full middle loop.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::{
    atomics::{
        compare_and_swap_lockword, drop_smt_priority, load_lockword, nop, read_barrier,
        restore_smt_priority, thread_yield_escalating, yield_cpu,
    },
    fastpath::inline_fast_init_and_enter,
    lockword::{
        flatlock_count, is_inflated, learning_to_flat, owner_bits, OBJECT_HEADER_LOCK_FLC,
        OBJECT_HEADER_LOCK_INFLATED, OBJECT_HEADER_LOCK_LEARNING, OBJECT_HEADER_LOCK_RESERVED,
    },
    object_monitor::ObjectMonitor,
    reservation::increment_cancel_counter,
};
use crate::{
    objectmodel::class::ClassDescriptor,
    runtime::{options::SpinOptions, threads::Thread},
};

#[inline]
fn tight_spin(spins1: usize) {
    yield_cpu();
    drop_smt_priority();
    for _ in 0..spins1 {
        nop();
    }
    restore_smt_priority();
}

/// Spin waiting for the flat lock at `lockword` to be released. Returns `true` if the lock
/// was acquired.
///
/// Gives up as soon as the word is contended, inflated or reserved, or when another thread
/// asks for exclusive access. A learning lock is turned into a flat one on the way, since
/// only its owner could make progress otherwise.
pub fn spin_on_flat_lock(
    thread: &Thread,
    lockword: &AtomicUsize,
    class: &ClassDescriptor,
    options: SpinOptions,
) -> bool {
    let abort_bits = OBJECT_HEADER_LOCK_FLC | OBJECT_HEADER_LOCK_INFLATED | OBJECT_HEADER_LOCK_RESERVED;
    let mut spins2 = options.spins2;
    let mut nested_path = true;

    for yield_sequence in 0..options.yields {
        for _ in 0..spins2 {
            if inline_fast_init_and_enter(lockword, thread.id(), true, 0) {
                return true;
            }

            let lock = load_lockword(lockword);
            if lock & abort_bits != 0 || thread.is_exclusive_access_requested() {
                return false;
            }

            if lock & OBJECT_HEADER_LOCK_LEARNING != 0 {
                if flatlock_count(lock) == 0 {
                    // not held: take it as a flat lock right away
                    if compare_and_swap_lockword(lockword, lock, owner_bits(thread.id()), false)
                        == lock
                    {
                        read_barrier();
                        increment_cancel_counter(class);
                        return true;
                    }
                } else if compare_and_swap_lockword(lockword, lock, learning_to_flat(lock), false)
                    == lock
                {
                    increment_cancel_counter(class);
                }
            }

            if nested_path {
                tight_spin(options.spins1);
            }
        }

        if !options.nested && nested_path {
            spins2 = 1;
            nested_path = false;
        }
        thread_yield_escalating(yield_sequence);
    }

    false
}

/// Spin trying to enter the native monitor of `record`. Returns `true` if the monitor was
/// entered while the lock word still pointed at the record, i.e. the object lock is held.
///
/// At most `max_spin_threads` threads spin on one monitor at a time, later ones try once.
pub fn spin_on_try_enter(
    thread: &Thread,
    record: &ObjectMonitor,
    lockword: &AtomicUsize,
    options: SpinOptions,
    max_spin_threads: usize,
    lock_statistics: bool,
) -> bool {
    let spinning = record.try_start_spinning(max_spin_threads);
    let options = if spinning { options } else { SpinOptions::NONE };

    let mut spins2 = options.spins2;
    let mut nested_path = true;
    let mut yields_done = 0;
    let mut attempts = 0;
    let mut acquired = false;

    'spin: while yields_done < options.yields {
        for _ in 0..spins2 {
            attempts += 1;
            if record.monitor().try_enter(thread.id()) {
                if is_inflated(load_lockword(lockword)) {
                    acquired = true;
                } else {
                    // the word was deflated under us, the blocking path sorts it out
                    let _ = record.monitor().exit(thread.id());
                }
                break 'spin;
            }

            if thread.is_exclusive_access_requested() {
                break 'spin;
            }

            if nested_path {
                tight_spin(options.spins1);
            }
        }

        if !options.nested && nested_path {
            spins2 = 1;
            nested_path = false;
        }
        thread_yield_escalating(yields_done);
        yields_done += 1;
    }

    if lock_statistics {
        let statistics = record.statistics();
        statistics
            .yield_count
            .fetch_add(yields_done as u64, Ordering::Relaxed);
        statistics
            .spin2_count
            .fetch_add(attempts as u64, Ordering::Relaxed);
    }

    if spinning {
        record.stop_spinning(max_spin_threads);
    }

    acquired
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        objectmodel::{header::HeapObjectHeader, ObjectReference},
        runtime::threads::{Threads, THREAD_HALT_EXCLUSIVE},
        sync::lockword::{classify, LockState},
    };

    const QUICK: SpinOptions = SpinOptions {
        spins1: 4,
        spins2: 4,
        yields: 2,
        nested: false,
    };

    #[test]
    fn flat_spin_takes_a_released_lock() {
        let threads = Threads::new();
        let thread = threads.attach_current_thread();
        let class = ClassDescriptor::new("C");

        let word = AtomicUsize::new(0);
        assert!(spin_on_flat_lock(&thread, &word, &class, QUICK));
        assert_eq!(word.load(Ordering::Relaxed), owner_bits(thread.id()));

        let contended = AtomicUsize::new(owner_bits(99) | OBJECT_HEADER_LOCK_FLC);
        assert!(!spin_on_flat_lock(&thread, &contended, &class, QUICK));
        let reserved = AtomicUsize::new(owner_bits(99) | OBJECT_HEADER_LOCK_RESERVED);
        assert!(!spin_on_flat_lock(&thread, &reserved, &class, QUICK));

        threads.detach_thread(&thread);
    }

    #[test]
    fn flat_spin_steals_idle_learning_locks() {
        let threads = Threads::new();
        let thread = threads.attach_current_thread();
        let class = ClassDescriptor::new("C");

        let word = AtomicUsize::new(owner_bits(99) | OBJECT_HEADER_LOCK_LEARNING);
        assert!(spin_on_flat_lock(&thread, &word, &class, QUICK));
        assert_eq!(word.load(Ordering::Relaxed), owner_bits(thread.id()));
        assert_eq!(class.cancel_counter(), 1);

        // held learning lock: demoted, then the spin runs out
        let held = AtomicUsize::new(
            crate::sync::lockword::encode(LockState::Learning {
                owner: 99,
                recursion: 1,
                learn_count: 0,
            }),
        );
        assert!(!spin_on_flat_lock(&thread, &held, &class, QUICK));
        assert_eq!(
            classify(held.load(Ordering::Relaxed)),
            LockState::Flat {
                owner: 99,
                recursion: 0,
                contended: false
            }
        );
        assert_eq!(class.cancel_counter(), 2);

        threads.detach_thread(&thread);
    }

    #[test]
    fn spins_give_up_when_halted() {
        let threads = Threads::new();
        let thread = threads.attach_current_thread();
        let class = ClassDescriptor::new("C");

        thread.set_public_flags(THREAD_HALT_EXCLUSIVE);
        let word = AtomicUsize::new(owner_bits(99));
        let slow = SpinOptions {
            spins1: 1 << 20,
            spins2: 1 << 20,
            yields: 1 << 20,
            nested: true,
        };
        assert!(!spin_on_flat_lock(&thread, &word, &class, slow));
        thread.clear_public_flags(THREAD_HALT_EXCLUSIVE);

        threads.detach_thread(&thread);
    }

    #[test]
    fn try_enter_spin_requires_an_inflated_word() {
        let threads = Threads::new();
        let thread = threads.attach_current_thread();
        let class = Arc::new(ClassDescriptor::new("C"));
        let object = ObjectReference::allocate(HeapObjectHeader::new(class, 0));
        let record = Arc::new(ObjectMonitor::new(object, 0));

        let inflated = AtomicUsize::new(ObjectMonitor::as_lockword(&record));
        assert!(spin_on_try_enter(&thread, &record, &inflated, QUICK, 1, true));
        assert_eq!(record.monitor().owner(), thread.id());
        record.monitor().exit(thread.id()).unwrap();
        assert_eq!(record.statistics().spin2_count(), 1);
        assert_eq!(record.spinning_threads(), 0);

        let flat = AtomicUsize::new(0);
        assert!(!spin_on_try_enter(&thread, &record, &flat, QUICK, 0, false));
        assert_eq!(record.monitor().owner(), 0);

        drop(record);
        unsafe { object.free() };
        threads.detach_thread(&thread);
    }
}
