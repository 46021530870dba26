//! Lock reservation heuristic.
//!
//! Every class counts how often locks on its instances became reserved and how often a
//! reservation (or a learning lock) had to be cancelled because another thread wanted the
//! lock. New instances start out reserved, learning or unlocked depending on the ratio.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::{
    atomics::compare_and_swap_lockword,
    lockword::{is_learning, is_reserved, learning_to_flat, reserved_to_flat},
    lockword::{OBJECT_HEADER_LOCK_LEARNING, OBJECT_HEADER_LOCK_RESERVED},
};
use crate::{objectmodel::class::ClassDescriptor, runtime::options::ReservationOptions};

/// Initial lock word of a new instance of `class`.
pub fn initial_lockword(options: &ReservationOptions, class: &ClassDescriptor) -> usize {
    if options.enabled {
        let reserved = class.reserved_counter() as usize;
        let cancel = class.cancel_counter() as usize;

        if reserved >= options.absolute_threshold
            && reserved > cancel.saturating_mul(options.minimum_reserved_ratio)
        {
            OBJECT_HEADER_LOCK_RESERVED
        } else if cancel < options.cancel_absolute_threshold
            || reserved > cancel.saturating_mul(options.minimum_learning_ratio)
        {
            OBJECT_HEADER_LOCK_LEARNING
        } else {
            0
        }
    } else if class.reservable_lockword_init() {
        OBJECT_HEADER_LOCK_RESERVED
    } else {
        0
    }
}

/// Count a transition to reserved. On overflow both counters are halved, keeping their ratio.
///
/// The counters are read and written separately; concurrent updates may be lost.
pub fn increment_reserved_counter(class: &ClassDescriptor) {
    let reserved = class.reserved_counter.load(Ordering::Relaxed);
    if reserved < u16::MAX {
        class.reserved_counter.store(reserved + 1, Ordering::Relaxed);
    } else {
        let cancel = class.cancel_counter.load(Ordering::Relaxed);
        class
            .reserved_counter
            .store((reserved >> 1) + 1, Ordering::Relaxed);
        class.cancel_counter.store(cancel >> 1, Ordering::Relaxed);
    }
}

/// Count a cancellation, see [`increment_reserved_counter`].
pub fn increment_cancel_counter(class: &ClassDescriptor) {
    let cancel = class.cancel_counter.load(Ordering::Relaxed);
    if cancel < u16::MAX {
        class.cancel_counter.store(cancel + 1, Ordering::Relaxed);
    } else {
        let reserved = class.reserved_counter.load(Ordering::Relaxed);
        class
            .cancel_counter
            .store((cancel >> 1) + 1, Ordering::Relaxed);
        class.reserved_counter.store(reserved >> 1, Ordering::Relaxed);
    }
}

/// Demote a reserved lock word to a flat one with the same owner and entry count.
///
/// Owners of reserved locks update the word with compare-and-swap too, so the demotion needs
/// no cooperation from the owner: whichever CAS loses retries on the new value. Returns
/// `true` if this call performed the cancellation.
pub fn cancel_reservation(lockword: &AtomicUsize, class: &ClassDescriptor) -> bool {
    let mut lock = lockword.load(Ordering::Acquire);
    while is_reserved(lock) {
        let observed = compare_and_swap_lockword(lockword, lock, reserved_to_flat(lock), false);
        if observed == lock {
            increment_cancel_counter(class);
            log::trace!(
                target: "vmkit::monitor::reservation",
                "cancelled reservation {:#x} of a {} instance",
                lock,
                class.name()
            );
            return true;
        }
        lock = observed;
    }
    false
}

/// Demote a learning lock word to a flat one with the same owner and entry count. Returns
/// `true` if this call performed the demotion.
pub fn cancel_learning(lockword: &AtomicUsize, class: &ClassDescriptor) -> bool {
    let mut lock = lockword.load(Ordering::Acquire);
    while is_learning(lock) {
        let observed = compare_and_swap_lockword(lockword, lock, learning_to_flat(lock), false);
        if observed == lock {
            increment_cancel_counter(class);
            return true;
        }
        lock = observed;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::lockword::{classify, owner_bits, LockState, OBJECT_HEADER_LOCK_FIRST_RECURSION_BIT};

    fn enabled() -> ReservationOptions {
        ReservationOptions {
            enabled: true,
            transition_threshold: 1,
            absolute_threshold: 10,
            minimum_reserved_ratio: 4,
            cancel_absolute_threshold: 3,
            minimum_learning_ratio: 2,
        }
    }

    #[test]
    fn initial_lockword_follows_the_counters() {
        let class = ClassDescriptor::new("C");
        let options = enabled();

        // few cancellations so far: learn
        assert_eq!(initial_lockword(&options, &class), OBJECT_HEADER_LOCK_LEARNING);

        for _ in 0..10 {
            increment_reserved_counter(&class);
        }
        assert_eq!(initial_lockword(&options, &class), OBJECT_HEADER_LOCK_RESERVED);

        for _ in 0..3 {
            increment_cancel_counter(&class);
        }
        // 10 > 3 * 2 but not > 3 * 4
        assert_eq!(initial_lockword(&options, &class), OBJECT_HEADER_LOCK_LEARNING);

        for _ in 0..2 {
            increment_cancel_counter(&class);
        }
        assert_eq!(initial_lockword(&options, &class), 0);

        let disabled = ReservationOptions {
            enabled: false,
            ..options
        };
        assert_eq!(initial_lockword(&disabled, &class), 0);
        let reservable = ClassDescriptor::new("D").with_reservable_lockword_init();
        assert_eq!(initial_lockword(&disabled, &reservable), OBJECT_HEADER_LOCK_RESERVED);
    }

    #[test]
    fn counters_halve_on_overflow() {
        let class = ClassDescriptor::new("C");
        class.reserved_counter.store(u16::MAX, Ordering::Relaxed);
        class.cancel_counter.store(100, Ordering::Relaxed);

        increment_reserved_counter(&class);
        assert_eq!(class.reserved_counter(), (u16::MAX >> 1) + 1);
        assert_eq!(class.cancel_counter(), 50);

        class.cancel_counter.store(u16::MAX, Ordering::Relaxed);
        increment_cancel_counter(&class);
        assert_eq!(class.cancel_counter(), (u16::MAX >> 1) + 1);
        assert_eq!(class.reserved_counter(), ((u16::MAX >> 1) + 1) >> 1);
    }

    #[test]
    fn racing_counter_updates_stay_in_bounds() {
        const THREADS: usize = 4;
        const RESERVES: usize = 2_000;
        const CANCELS: usize = 200;

        let class = ClassDescriptor::new("Racy");
        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for i in 0..RESERVES {
                        increment_reserved_counter(&class);
                        if i % (RESERVES / CANCELS) == 0 {
                            increment_cancel_counter(&class);
                        }
                    }
                });
            }
        });

        // lost updates are allowed, invented ones are not
        let reserved = class.reserved_counter() as usize;
        let cancel = class.cancel_counter() as usize;
        assert!(reserved > 0 && reserved <= THREADS * RESERVES, "{}", reserved);
        assert!(cancel > 0 && cancel <= THREADS * CANCELS, "{}", cancel);
    }

    #[test]
    fn mostly_exclusive_classes_converge_to_reserved() {
        let class = ClassDescriptor::new("Owned");
        let options = enabled();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..1_000 {
                    increment_reserved_counter(&class);
                }
            });
            for _ in 0..3 {
                scope.spawn(|| {
                    for _ in 0..5 {
                        increment_cancel_counter(&class);
                        std::thread::yield_now();
                    }
                });
            }
        });

        assert!(class.cancel_counter() <= 15);
        assert_eq!(initial_lockword(&options, &class), OBJECT_HEADER_LOCK_RESERVED);
    }

    #[test]
    fn cancellation_keeps_the_entry_count() {
        let class = ClassDescriptor::new("C");
        let word = AtomicUsize::new(
            owner_bits(5) | OBJECT_HEADER_LOCK_RESERVED | (2 * OBJECT_HEADER_LOCK_FIRST_RECURSION_BIT),
        );

        assert!(cancel_reservation(&word, &class));
        assert_eq!(
            classify(word.load(Ordering::Relaxed)),
            LockState::Flat {
                owner: 5,
                recursion: 1,
                contended: false
            }
        );
        assert!(!cancel_reservation(&word, &class));
        assert_eq!(class.cancel_counter(), 1);

        let idle = AtomicUsize::new(owner_bits(5) | OBJECT_HEADER_LOCK_RESERVED);
        assert!(cancel_reservation(&idle, &class));
        assert_eq!(idle.load(Ordering::Relaxed), 0);

        let learning = AtomicUsize::new(OBJECT_HEADER_LOCK_LEARNING);
        assert!(cancel_learning(&learning, &class));
        assert_eq!(learning.load(Ordering::Relaxed), 0);
        assert_eq!(class.cancel_counter(), 3);
    }
}
