//! Lock word layout and pure transitions.
//!
//! ```text
//!  63                                   8 7    4   3   2   1   0
//! +--------------------------------------+------+---+---+---+---+
//! |             owner thread id          |  RC  | L | R | F | I |
//! +--------------------------------------+------+---+---+---+---+
//! ```
//!
//! - `I` (inflated): the rest of the word is the address of an
//!   [`ObjectMonitor`](super::object_monitor::ObjectMonitor), which is 16-byte aligned.
//! - `F` (FLC): first level contention, some thread is blocked waiting for this lock.
//! - `R` (reserved): the owner field names the thread the lock is reserved for.
//! - `L` (learning): the lock is on probation for reservation. Bits 4..6 are the learn
//!   count and bits 6..8 the recursion count.
//!
//! A flat lock owned once has a recursion count of zero. Reserved and learning locks count
//! from one, a zero count meaning "not currently held".

use easy_bitfield::{BitField, BitFieldTrait};

pub const LOCK_INFLATED_SHIFT: usize = 0;
pub const LOCK_FLC_SHIFT: usize = 1;
pub const LOCK_RESERVED_SHIFT: usize = 2;
pub const LOCK_LEARNING_SHIFT: usize = 3;
pub const LOCK_RECURSION_SHIFT: usize = 4;
pub const LOCK_RECURSION_WIDTH: usize = 4;
pub const LOCK_LEARNING_LC_SHIFT: usize = LOCK_RECURSION_SHIFT;
pub const LOCK_LEARNING_LC_WIDTH: usize = 2;
pub const LOCK_LEARNING_RECURSION_SHIFT: usize = LOCK_LEARNING_LC_SHIFT + LOCK_LEARNING_LC_WIDTH;
pub const LOCK_LEARNING_RECURSION_WIDTH: usize = LOCK_RECURSION_WIDTH - LOCK_LEARNING_LC_WIDTH;
pub const LOCK_OWNER_SHIFT: usize = LOCK_RECURSION_SHIFT + LOCK_RECURSION_WIDTH;
pub const LOCK_OWNER_WIDTH: usize = usize::BITS as usize - LOCK_OWNER_SHIFT;

pub type InflatedBit = BitField<usize, bool, LOCK_INFLATED_SHIFT, 1, false>;
pub type FlcBit = BitField<usize, bool, LOCK_FLC_SHIFT, 1, false>;
pub type ReservedBit = BitField<usize, bool, LOCK_RESERVED_SHIFT, 1, false>;
pub type LearningBit = BitField<usize, bool, LOCK_LEARNING_SHIFT, 1, false>;
pub type RecursionField = BitField<usize, usize, LOCK_RECURSION_SHIFT, LOCK_RECURSION_WIDTH, false>;
pub type LearningCountField =
    BitField<usize, usize, LOCK_LEARNING_LC_SHIFT, LOCK_LEARNING_LC_WIDTH, false>;
pub type LearningRecursionField =
    BitField<usize, usize, LOCK_LEARNING_RECURSION_SHIFT, LOCK_LEARNING_RECURSION_WIDTH, false>;
pub type OwnerField = BitField<usize, usize, LOCK_OWNER_SHIFT, LOCK_OWNER_WIDTH, false>;

const fn mask(shift: usize, width: usize) -> usize {
    ((1usize << width) - 1) << shift
}

pub const OBJECT_HEADER_LOCK_INFLATED: usize = 1 << LOCK_INFLATED_SHIFT;
pub const OBJECT_HEADER_LOCK_FLC: usize = 1 << LOCK_FLC_SHIFT;
pub const OBJECT_HEADER_LOCK_RESERVED: usize = 1 << LOCK_RESERVED_SHIFT;
pub const OBJECT_HEADER_LOCK_LEARNING: usize = 1 << LOCK_LEARNING_SHIFT;
pub const OBJECT_HEADER_LOCK_RECURSION_MASK: usize =
    mask(LOCK_RECURSION_SHIFT, LOCK_RECURSION_WIDTH);
pub const OBJECT_HEADER_LOCK_FIRST_RECURSION_BIT: usize = 1 << LOCK_RECURSION_SHIFT;
pub const OBJECT_HEADER_LOCK_LEARNING_LC_MASK: usize =
    mask(LOCK_LEARNING_LC_SHIFT, LOCK_LEARNING_LC_WIDTH);
pub const OBJECT_HEADER_LOCK_LEARNING_FIRST_LC_BIT: usize = 1 << LOCK_LEARNING_LC_SHIFT;
pub const OBJECT_HEADER_LOCK_LEARNING_RECURSION_MASK: usize =
    mask(LOCK_LEARNING_RECURSION_SHIFT, LOCK_LEARNING_RECURSION_WIDTH);
pub const OBJECT_HEADER_LOCK_LEARNING_FIRST_RECURSION_BIT: usize =
    1 << LOCK_LEARNING_RECURSION_SHIFT;
pub const OBJECT_HEADER_LOCK_BITS_MASK: usize = mask(0, LOCK_OWNER_SHIFT);
pub const OBJECT_HEADER_LOCK_OWNER_MASK: usize = !OBJECT_HEADER_LOCK_BITS_MASK;
/// Low bits of an inflated word that are not part of the monitor address.
pub const OBJECT_HEADER_LOCK_INFLATED_TAG_MASK: usize = 0xF;

pub const LOCK_LEARNING_COUNT_MAX: usize = (1 << LOCK_LEARNING_LC_WIDTH) - 1;

/// The word a thread with id `thread_id` stores to own a flat lock once.
pub const fn owner_bits(thread_id: usize) -> usize {
    thread_id << LOCK_OWNER_SHIFT
}

/// Decoded form of a lock word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    /// `recursion` is the raw counter: a lock entered once has `recursion == 0`.
    Flat {
        owner: usize,
        recursion: usize,
        contended: bool,
    },
    /// `recursion` counts entries; zero means reserved for `owner` but not held.
    Reserved { owner: usize, recursion: usize },
    Learning {
        owner: usize,
        recursion: usize,
        learn_count: usize,
    },
    Inflated { monitor: usize },
}

#[inline(always)]
pub fn is_inflated(word: usize) -> bool {
    InflatedBit::decode(word)
}

#[inline(always)]
pub fn is_reserved(word: usize) -> bool {
    !is_inflated(word) && ReservedBit::decode(word)
}

#[inline(always)]
pub fn is_learning(word: usize) -> bool {
    !is_inflated(word) && LearningBit::decode(word)
}

#[inline(always)]
pub fn is_contended(word: usize) -> bool {
    !is_inflated(word) && FlcBit::decode(word)
}

pub fn classify(word: usize) -> LockState {
    if word == 0 {
        return LockState::Unlocked;
    }

    if is_inflated(word) {
        return LockState::Inflated {
            monitor: inflated_monitor(word),
        };
    }

    let owner = OwnerField::decode(word);

    if is_learning(word) {
        LockState::Learning {
            owner,
            recursion: LearningRecursionField::decode(word),
            learn_count: LearningCountField::decode(word),
        }
    } else if is_reserved(word) {
        LockState::Reserved {
            owner,
            recursion: RecursionField::decode(word),
        }
    } else {
        LockState::Flat {
            owner,
            recursion: RecursionField::decode(word),
            contended: FlcBit::decode(word),
        }
    }
}

pub fn encode(state: LockState) -> usize {
    match state {
        LockState::Unlocked => 0,
        LockState::Flat {
            owner,
            recursion,
            contended,
        } => {
            let word = RecursionField::update(recursion, owner_bits(owner));
            FlcBit::update(contended, word)
        }
        LockState::Reserved { owner, recursion } => {
            RecursionField::update(recursion, owner_bits(owner)) | OBJECT_HEADER_LOCK_RESERVED
        }
        LockState::Learning {
            owner,
            recursion,
            learn_count,
        } => {
            let word = LearningRecursionField::update(recursion, owner_bits(owner));
            LearningCountField::update(learn_count, word) | OBJECT_HEADER_LOCK_LEARNING
        }
        LockState::Inflated { monitor } => as_inflated(monitor),
    }
}

/// Owner thread id, or zero for unowned and inflated words.
#[inline(always)]
pub fn owner_of(word: usize) -> usize {
    if is_inflated(word) {
        0
    } else {
        OwnerField::decode(word)
    }
}

/// The raw recursion counter of a flat, reserved or learning word.
#[inline(always)]
pub fn recursion_of(word: usize) -> usize {
    if is_learning(word) {
        LearningRecursionField::decode(word)
    } else {
        RecursionField::decode(word)
    }
}

#[inline(always)]
pub fn learning_count_of(word: usize) -> usize {
    LearningCountField::decode(word)
}

/// Number of times the owner entered the lock. Zero for unowned and inflated words.
pub fn flatlock_count(word: usize) -> usize {
    if is_inflated(word) || owner_of(word) == 0 {
        return 0;
    }

    if is_learning(word) || is_reserved(word) {
        recursion_of(word)
    } else {
        recursion_of(word) + 1
    }
}

#[inline(always)]
pub fn recursion_increment(word: usize) -> usize {
    if is_learning(word) {
        OBJECT_HEADER_LOCK_LEARNING_FIRST_RECURSION_BIT
    } else {
        OBJECT_HEADER_LOCK_FIRST_RECURSION_BIT
    }
}

/// Incrementing the counter would carry into the owner field.
#[inline(always)]
pub fn would_overflow(word: usize) -> bool {
    let incremented = word.wrapping_add(recursion_increment(word));
    (incremented & OBJECT_HEADER_LOCK_OWNER_MASK) != (word & OBJECT_HEADER_LOCK_OWNER_MASK)
}

pub fn with_incremented_recursion(word: usize) -> Option<usize> {
    if is_inflated(word) || would_overflow(word) {
        None
    } else {
        Some(word + recursion_increment(word))
    }
}

pub fn with_decremented_recursion(word: usize) -> usize {
    debug_assert!(recursion_of(word) > 0, "recursion underflow in {:#x}", word);
    word - recursion_increment(word)
}

/// Bump the learn count of a learning word, saturating at the field width.
pub fn with_incremented_learning_count(word: usize) -> usize {
    debug_assert!(is_learning(word));
    if learning_count_of(word) < LOCK_LEARNING_COUNT_MAX {
        word + OBJECT_HEADER_LOCK_LEARNING_FIRST_LC_BIT
    } else {
        word
    }
}

pub fn as_inflated(monitor: usize) -> usize {
    debug_assert_eq!(
        monitor & OBJECT_HEADER_LOCK_INFLATED_TAG_MASK,
        0,
        "monitor record is not 16-byte aligned"
    );
    monitor | OBJECT_HEADER_LOCK_INFLATED
}

#[inline(always)]
pub fn inflated_monitor(word: usize) -> usize {
    word & !OBJECT_HEADER_LOCK_INFLATED_TAG_MASK
}

/// Flat word holding the same number of entries as `owner` with `count` entries.
fn flat_with_count(owner: usize, count: usize) -> usize {
    if count == 0 {
        0
    } else {
        RecursionField::update(count - 1, owner_bits(owner))
    }
}

/// Cancel a learning word: same owner and entry count, flat protocol.
pub fn learning_to_flat(word: usize) -> usize {
    debug_assert!(is_learning(word));
    flat_with_count(owner_of(word), flatlock_count(word))
}

/// Cancel a reservation: same owner and entry count, flat protocol.
pub fn reserved_to_flat(word: usize) -> usize {
    debug_assert!(is_reserved(word));
    flat_with_count(owner_of(word), flatlock_count(word))
}

/// Promote a learning word to a reservation, keeping owner and entry count.
pub fn learning_to_reserved(word: usize) -> usize {
    debug_assert!(is_learning(word));
    RecursionField::update(flatlock_count(word), owner_bits(owner_of(word)))
        | OBJECT_HEADER_LOCK_RESERVED
}

/// Word restored on deflation for a lock with `count` entries by `owner` (zero, zero for an
/// unowned monitor).
pub fn deflated(owner: usize, count: usize) -> usize {
    flat_with_count(owner, count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_roundtrips_reachable_states() {
        let states = [
            LockState::Unlocked,
            LockState::Flat {
                owner: 1,
                recursion: 0,
                contended: false,
            },
            LockState::Flat {
                owner: 42,
                recursion: 15,
                contended: true,
            },
            LockState::Reserved {
                owner: 0,
                recursion: 0,
            },
            LockState::Reserved {
                owner: 7,
                recursion: 3,
            },
            LockState::Learning {
                owner: 0,
                recursion: 0,
                learn_count: 0,
            },
            LockState::Learning {
                owner: 9,
                recursion: 2,
                learn_count: 3,
            },
            LockState::Inflated { monitor: 0x7f00_1230 },
        ];

        for state in states {
            assert_eq!(classify(encode(state)), state, "{:?}", state);
        }
    }

    #[test]
    fn counts_follow_protocol() {
        let me = 5;
        let flat_once = owner_bits(me);
        assert_eq!(flatlock_count(flat_once), 1);
        assert_eq!(flatlock_count(flat_once + OBJECT_HEADER_LOCK_FIRST_RECURSION_BIT), 2);

        let reserved_unlocked = owner_bits(me) | OBJECT_HEADER_LOCK_RESERVED;
        assert_eq!(flatlock_count(reserved_unlocked), 0);
        assert_eq!(
            flatlock_count(reserved_unlocked + OBJECT_HEADER_LOCK_FIRST_RECURSION_BIT),
            1
        );

        let learning = owner_bits(me)
            | OBJECT_HEADER_LOCK_LEARNING
            | OBJECT_HEADER_LOCK_LEARNING_FIRST_RECURSION_BIT;
        assert_eq!(flatlock_count(learning), 1);
        assert_eq!(flatlock_count(OBJECT_HEADER_LOCK_RESERVED), 0);
        assert_eq!(flatlock_count(as_inflated(0x1000)), 0);
    }

    #[test]
    fn overflow_is_detected_before_wrapping() {
        let mut word = owner_bits(3);
        let mut entries = 1;
        while let Some(next) = with_incremented_recursion(word) {
            word = next;
            entries += 1;
        }

        assert_eq!(entries, 1 << LOCK_RECURSION_WIDTH);
        assert!(would_overflow(word));
        assert_eq!(owner_of(word), 3);

        let mut learning = owner_bits(3) | OBJECT_HEADER_LOCK_LEARNING;
        let mut entries = 0;
        while let Some(next) = with_incremented_recursion(learning) {
            learning = next;
            entries += 1;
        }
        assert_eq!(entries, (1 << LOCK_LEARNING_RECURSION_WIDTH) - 1);
        assert_eq!(owner_of(learning), 3);
        assert!(is_learning(learning));
    }

    #[test]
    fn cancellation_preserves_entries() {
        let reserved = encode(LockState::Reserved {
            owner: 4,
            recursion: 2,
        });
        let flat = reserved_to_flat(reserved);
        assert_eq!(
            classify(flat),
            LockState::Flat {
                owner: 4,
                recursion: 1,
                contended: false
            }
        );
        assert_eq!(reserved_to_flat(owner_bits(4) | OBJECT_HEADER_LOCK_RESERVED), 0);

        let learning = encode(LockState::Learning {
            owner: 4,
            recursion: 1,
            learn_count: 2,
        });
        assert_eq!(learning_to_flat(learning), owner_bits(4));
        assert_eq!(
            classify(learning_to_reserved(learning)),
            LockState::Reserved {
                owner: 4,
                recursion: 1
            }
        );
    }

    #[test]
    fn learning_count_saturates() {
        let mut word = OBJECT_HEADER_LOCK_LEARNING;
        for _ in 0..10 {
            word = with_incremented_learning_count(word);
        }
        assert_eq!(learning_count_of(word), LOCK_LEARNING_COUNT_MAX);
        assert_eq!(recursion_of(word), 0);
    }
}
