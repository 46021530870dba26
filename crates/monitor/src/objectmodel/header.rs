use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use easy_bitfield::{AtomicBitfieldContainer, BitField, BitFieldTrait, FromBitfield, ToBitfield};
use num_traits::{FromPrimitive, ToPrimitive};

use super::class::ClassDescriptor;

pub type HashStateBitfield = BitField<usize, HashState, 0, 2, false>;
pub type AgeBitfield = BitField<usize, u8, { HashStateBitfield::NEXT_BIT }, 4, false>;

/// Identity hash state of an object.
///
/// `Moved` is the transient state of a hashed object that was copied by the current
/// collection: the hash still derives from the old address. An aborted collection can turn
/// it back into `Hashed`, see [`reverse_forwarded_object`](crate::MonitorSystem::reverse_forwarded_object).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum HashState {
    Unhashed = 0,
    Hashed,
    Moved,
    HashedAndMoved,
}

impl<S: FromPrimitive> ToBitfield<S> for HashState {
    fn one() -> Self {
        unreachable!()
    }

    fn zero() -> Self {
        unreachable!()
    }

    fn to_bitfield(self) -> S {
        S::from_u8(self as u8).unwrap()
    }
}

impl<S: ToPrimitive> FromBitfield<S> for HashState {
    fn from_bitfield(value: S) -> Self {
        let value = value.to_u8().unwrap();

        match value {
            0 => Self::Unhashed,
            1 => Self::Hashed,
            2 => Self::Moved,
            3 => Self::HashedAndMoved,
            _ => {
                #[cfg(debug_assertions)]
                {
                    unreachable!("invalid hash state")
                }

                #[cfg(not(debug_assertions))]
                unsafe {
                    std::hint::unreachable_unchecked();
                }
            }
        }
    }

    fn from_i64(_value: i64) -> Self {
        unreachable!()
    }
}

/// Object header: class pointer, a word of GC flags and the inline lock word.
///
/// The lock word is only meaningful when the class reports an inline lock word; other
/// objects keep theirs in their monitor record.
pub struct HeapObjectHeader {
    class: Arc<ClassDescriptor>,
    storage: AtomicBitfieldContainer<usize>,
    lockword: AtomicUsize,
}

impl HeapObjectHeader {
    pub fn new(class: Arc<ClassDescriptor>, lockword: usize) -> Self {
        let this = Self {
            class,
            storage: AtomicBitfieldContainer::new(0),
            lockword: AtomicUsize::new(lockword),
        };

        this.set_hash_state(HashState::Unhashed);

        this
    }

    pub fn class(&self) -> &Arc<ClassDescriptor> {
        &self.class
    }

    pub fn hash_state(&self) -> HashState {
        self.storage.read::<HashStateBitfield>()
    }

    pub fn set_hash_state(&self, state: HashState) {
        self.storage.update_synchronized::<HashStateBitfield>(state);
    }

    pub fn age(&self) -> u8 {
        self.storage.read::<AgeBitfield>()
    }

    pub fn set_age(&self, age: u8) {
        self.storage.update_synchronized::<AgeBitfield>(age);
    }

    /// Mark the object as hashed at its current address, if it was not hashed yet.
    pub fn mark_hashed(&self) {
        if self.hash_state() == HashState::Unhashed {
            self.set_hash_state(HashState::Hashed);
        }
    }

    /// The inline lock word, or `None` when the class stores lock words out of line.
    pub fn inline_lockword(&self) -> Option<&AtomicUsize> {
        if self.class.has_inline_lockword() {
            Some(&self.lockword)
        } else {
            None
        }
    }

    /// Raw access to the lock word slot regardless of the class layout. Used by the
    /// collector when copying headers.
    pub(crate) fn lockword_slot(&self) -> &AtomicUsize {
        &self.lockword
    }

    pub(crate) fn load_lockword(&self) -> usize {
        self.lockword.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_state_and_age_share_the_flags_word() {
        let class = Arc::new(ClassDescriptor::new("Point"));
        let header = HeapObjectHeader::new(class, 0);

        assert_eq!(header.hash_state(), HashState::Unhashed);
        header.set_age(7);
        header.mark_hashed();
        assert_eq!(header.hash_state(), HashState::Hashed);
        assert_eq!(header.age(), 7);

        header.set_hash_state(HashState::Moved);
        header.mark_hashed();
        assert_eq!(header.hash_state(), HashState::Moved);
        assert_eq!(header.age(), 7);
    }

    #[test]
    fn out_of_line_classes_hide_the_lockword() {
        let inline = HeapObjectHeader::new(Arc::new(ClassDescriptor::new("A")), 0);
        let out_of_line = HeapObjectHeader::new(
            Arc::new(ClassDescriptor::new("B").with_inline_lockword(false)),
            0,
        );

        assert!(inline.inline_lockword().is_some());
        assert!(out_of_line.inline_lockword().is_none());
    }
}
