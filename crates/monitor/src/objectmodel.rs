//! # Object model
//!
//! The monitor subsystem only needs a small part of an object: its class, a word of
//! hash/GC flags and the lock word. Objects are referenced through [`ObjectReference`],
//! which is the only place where a raw header pointer is dereferenced.

use std::{fmt, ptr::NonNull, sync::Arc};

pub mod class;
pub mod header;

use class::ClassDescriptor;
use header::HeapObjectHeader;

/// A reference to a heap object.
///
/// Whoever hands out an `ObjectReference` (the heap, the collector) guarantees that the
/// header stays valid while the reference is reachable by the mutator. The monitor table
/// only keeps weak back-references and re-validates them through the collector hooks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectReference(NonNull<HeapObjectHeader>);

unsafe impl Send for ObjectReference {}
unsafe impl Sync for ObjectReference {}

impl ObjectReference {
    /// # Safety
    ///
    /// `ptr` must point to an initialized header that outlives every use of the reference.
    pub unsafe fn from_raw(ptr: NonNull<HeapObjectHeader>) -> Self {
        Self(ptr)
    }

    /// # Safety
    ///
    /// Same as [`from_raw`](Self::from_raw); `address` must have been produced by
    /// [`to_address`](Self::to_address).
    pub unsafe fn from_address(address: usize) -> Option<Self> {
        NonNull::new(address as *mut HeapObjectHeader).map(Self)
    }

    pub fn to_address(self) -> usize {
        self.0.as_ptr() as usize
    }

    pub fn header<'a>(self) -> &'a HeapObjectHeader {
        // SAFETY: see the type level documentation.
        unsafe { self.0.as_ref() }
    }

    pub fn class<'a>(self) -> &'a Arc<ClassDescriptor> {
        self.header().class()
    }

    /// Allocate a boxed header and return a reference to it. The object stays alive until
    /// [`free`](Self::free) is called.
    pub fn allocate(header: HeapObjectHeader) -> Self {
        Self(NonNull::from(Box::leak(Box::new(header))))
    }

    /// # Safety
    ///
    /// The object must have been created with [`allocate`](Self::allocate) and no other
    /// reference to it may be used afterwards.
    pub unsafe fn free(self) {
        drop(Box::from_raw(self.0.as_ptr()));
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectReference({:#x})", self.to_address())
    }
}

impl fmt::Pointer for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.to_address())
    }
}
