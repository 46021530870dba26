//! What a code generator needs to emit the inline monitor sequences.
//!
//! Compiled code may only inline [`try_fast_enter`](crate::MonitorSystem::try_fast_enter)
//! and [`try_fast_exit`](crate::MonitorSystem::try_fast_exit), and must fall back to the
//! runtime calls for every other word. The sequences, for a thread with id `t`:
//!
//! - enter: if the word is `0`, CAS it to `owned_once(t)`. If it is the bare `RESERVED`
//!   (or `LEARNING`) word, CAS it to `owned_once(t) | word` plus one recursion unit (one
//!   learning recursion unit). If the owner is `t` and the word is neither learning nor inflated,
//!   CAS in one more recursion unit unless that would carry into the owner field. Issue a
//!   read barrier after a successful CAS.
//! - exit: if the word equals `owned_once(t)` exactly, issue a write barrier and store
//!   `0`.

use crate::{
    objectmodel::class::ClassDescriptor,
    runtime::{MonitorSystem, Runtime},
    sync::lockword::{
        LOCK_LEARNING_LC_SHIFT, LOCK_LEARNING_LC_WIDTH, LOCK_LEARNING_RECURSION_SHIFT,
        LOCK_LEARNING_RECURSION_WIDTH, LOCK_OWNER_SHIFT, LOCK_RECURSION_SHIFT,
        LOCK_RECURSION_WIDTH, OBJECT_HEADER_LOCK_FLC, OBJECT_HEADER_LOCK_INFLATED,
        OBJECT_HEADER_LOCK_INFLATED_TAG_MASK, OBJECT_HEADER_LOCK_LEARNING,
        OBJECT_HEADER_LOCK_RESERVED,
    },
};

/// Bit layout of a lock word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockwordLayout {
    pub inflated: usize,
    pub flc: usize,
    pub reserved: usize,
    pub learning: usize,
    pub recursion_shift: usize,
    pub recursion_width: usize,
    pub learning_count_shift: usize,
    pub learning_count_width: usize,
    pub learning_recursion_shift: usize,
    pub learning_recursion_width: usize,
    pub owner_shift: usize,
    /// Low bits of an inflated word that are not part of the monitor address.
    pub inflated_tag_mask: usize,
}

impl LockwordLayout {
    pub const CURRENT: Self = Self {
        inflated: OBJECT_HEADER_LOCK_INFLATED,
        flc: OBJECT_HEADER_LOCK_FLC,
        reserved: OBJECT_HEADER_LOCK_RESERVED,
        learning: OBJECT_HEADER_LOCK_LEARNING,
        recursion_shift: LOCK_RECURSION_SHIFT,
        recursion_width: LOCK_RECURSION_WIDTH,
        learning_count_shift: LOCK_LEARNING_LC_SHIFT,
        learning_count_width: LOCK_LEARNING_LC_WIDTH,
        learning_recursion_shift: LOCK_LEARNING_RECURSION_SHIFT,
        learning_recursion_width: LOCK_LEARNING_RECURSION_WIDTH,
        owner_shift: LOCK_OWNER_SHIFT,
        inflated_tag_mask: OBJECT_HEADER_LOCK_INFLATED_TAG_MASK,
    };

    /// Word of a flat lock entered once by `thread_id`.
    pub const fn owned_once(&self, thread_id: usize) -> usize {
        thread_id << self.owner_shift
    }

    /// Low bits that hold flags and counters.
    pub const fn bits_mask(&self) -> usize {
        (1 << self.owner_shift) - 1
    }

    pub const fn recursion_unit(&self) -> usize {
        1 << self.recursion_shift
    }

    pub const fn learning_recursion_unit(&self) -> usize {
        1 << self.learning_recursion_shift
    }
}

/// Read-only view of a class's locking profile, for speculative inlining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassLockProfile {
    pub reserved_counter: u16,
    pub cancel_counter: u16,
    /// Lock word a new instance would start with.
    pub initial_lockword: usize,
    pub allows_locking: bool,
    pub inline_lockword: bool,
}

impl ClassLockProfile {
    /// Inline sequences can be emitted for instances of this class.
    pub fn inlinable(&self) -> bool {
        self.allows_locking && self.inline_lockword
    }
}

impl<R: Runtime> MonitorSystem<R> {
    pub fn class_lock_profile(&self, class: &ClassDescriptor) -> ClassLockProfile {
        ClassLockProfile {
            reserved_counter: class.reserved_counter(),
            cancel_counter: class.cancel_counter(),
            initial_lockword: self.initial_lockword(class),
            allows_locking: class.allows_locking(),
            inline_lockword: class.has_inline_lockword(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::MockVM,
        runtime::MonitorSystemBuilder,
        sync::lockword::{encode, owner_bits, LockState},
    };

    #[test]
    fn layout_matches_the_encoder() {
        let layout = LockwordLayout::CURRENT;

        assert_eq!(layout.owned_once(5), owner_bits(5));
        assert_eq!(
            layout.owned_once(5) + layout.recursion_unit(),
            encode(LockState::Flat {
                owner: 5,
                recursion: 1,
                contended: false
            })
        );
        assert_eq!(
            layout.owned_once(5) | layout.learning | layout.learning_recursion_unit(),
            encode(LockState::Learning {
                owner: 5,
                recursion: 1,
                learn_count: 0
            })
        );
        assert_eq!(layout.bits_mask() & layout.owned_once(1), 0);
        assert_eq!(layout.inflated_tag_mask & layout.inflated, layout.inflated);
    }

    #[test]
    fn profile_reflects_the_class() {
        let system = MonitorSystemBuilder::<MockVM>::new().build();
        let class = ClassDescriptor::new("Profiled").with_reservable_lockword_init();

        let profile = system.class_lock_profile(&class);
        assert_eq!(profile.reserved_counter, 0);
        assert_eq!(profile.initial_lockword, OBJECT_HEADER_LOCK_RESERVED);
        assert!(profile.inlinable());

        let value_based = ClassDescriptor::new("Value").value_based();
        assert!(!system.class_lock_profile(&value_based).inlinable());
    }
}
