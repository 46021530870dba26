//! The inline enter and exit sequences.
//!
//! Compiled code must reproduce these bit for bit, see
//! [`LockwordLayout`](crate::compiler::LockwordLayout).

use std::sync::atomic::{AtomicUsize, Ordering};

use super::{
    atomics::{compare_and_swap_lockword, load_lockword, read_barrier, write_barrier},
    lockword::{
        is_inflated, is_learning, owner_bits, owner_of, with_incremented_recursion,
        OBJECT_HEADER_LOCK_FIRST_RECURSION_BIT, OBJECT_HEADER_LOCK_LEARNING,
        OBJECT_HEADER_LOCK_LEARNING_FIRST_RECURSION_BIT, OBJECT_HEADER_LOCK_RESERVED,
    },
};

/// Take a lock word that holds one of the unowned initial values (`0`, bare `RESERVED` or
/// bare `LEARNING`) equal to `lock`. Reserved and learning locks are taken with a count
/// of one.
#[inline]
pub fn inline_fast_init_and_enter(
    lockword: &AtomicUsize,
    thread_id: usize,
    read_before_cas: bool,
    lock: usize,
) -> bool {
    let mut mine = owner_bits(thread_id);
    if lock == OBJECT_HEADER_LOCK_RESERVED {
        mine |= lock | OBJECT_HEADER_LOCK_FIRST_RECURSION_BIT;
    } else if lock == OBJECT_HEADER_LOCK_LEARNING {
        mine |= lock | OBJECT_HEADER_LOCK_LEARNING_FIRST_RECURSION_BIT;
    }

    if compare_and_swap_lockword(lockword, lock, mine, read_before_cas) == lock {
        read_barrier();
        true
    } else {
        false
    }
}

/// Whether `lock` is one of the values [`inline_fast_init_and_enter`] accepts.
#[inline(always)]
pub fn is_initial_lockword(lock: usize) -> bool {
    lock == 0 || lock == OBJECT_HEADER_LOCK_RESERVED || lock == OBJECT_HEADER_LOCK_LEARNING
}

/// The most optimistic enter possible. Returns the lock word observed before a successful
/// enter, or `None` if the caller must take the slow path.
///
/// Handles recursive flat and reserved locks owned by `thread_id` whose counter does not
/// overflow, and the unowned initial values. Learning locks owned by the caller need the
/// learn count bookkeeping of the slow path.
pub fn try_fast_enter(lockword: &AtomicUsize, thread_id: usize) -> Option<usize> {
    let lock = load_lockword(lockword);

    if is_initial_lockword(lock) {
        return inline_fast_init_and_enter(lockword, thread_id, false, lock).then_some(lock);
    }

    if is_inflated(lock) || is_learning(lock) || owner_of(lock) != thread_id {
        return None;
    }

    let incremented = with_incremented_recursion(lock)?;
    (compare_and_swap_lockword(lockword, lock, incremented, false) == lock).then_some(lock)
}

/// Release a flat lock entered exactly once by `thread_id` without contention. This is the
/// one lock word transition done with a plain store: only the owner can change such a word.
#[inline]
pub fn try_fast_exit(lockword: &AtomicUsize, thread_id: usize) -> bool {
    if load_lockword(lockword) == owner_bits(thread_id) {
        write_barrier();
        lockword.store(0, Ordering::Relaxed);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::lockword::{classify, flatlock_count, LockState, OBJECT_HEADER_LOCK_FLC};

    #[test]
    fn enter_and_exit_uncontended() {
        let word = AtomicUsize::new(0);
        assert_eq!(try_fast_enter(&word, 3), Some(0));
        assert_eq!(word.load(Ordering::Relaxed), owner_bits(3));
        assert_eq!(try_fast_enter(&word, 4), None);

        assert_eq!(try_fast_enter(&word, 3), Some(owner_bits(3)));
        assert_eq!(flatlock_count(word.load(Ordering::Relaxed)), 2);
        assert!(!try_fast_exit(&word, 3));

        word.store(owner_bits(3), Ordering::Relaxed);
        assert!(try_fast_exit(&word, 3));
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn initial_values_take_a_count_of_one() {
        let word = AtomicUsize::new(OBJECT_HEADER_LOCK_RESERVED);
        assert_eq!(try_fast_enter(&word, 7), Some(OBJECT_HEADER_LOCK_RESERVED));
        assert_eq!(
            classify(word.load(Ordering::Relaxed)),
            LockState::Reserved {
                owner: 7,
                recursion: 1
            }
        );
        assert!(!try_fast_exit(&word, 7));

        let word = AtomicUsize::new(OBJECT_HEADER_LOCK_LEARNING);
        assert!(inline_fast_init_and_enter(&word, 7, true, OBJECT_HEADER_LOCK_LEARNING));
        assert_eq!(flatlock_count(word.load(Ordering::Relaxed)), 1);
        assert_eq!(try_fast_enter(&word, 7), None);
    }

    #[test]
    fn contended_words_fall_through() {
        let word = AtomicUsize::new(owner_bits(3) | OBJECT_HEADER_LOCK_FLC);
        assert!(!try_fast_exit(&word, 3));
        assert!(!inline_fast_init_and_enter(&word, 4, true, 0));
    }
}
