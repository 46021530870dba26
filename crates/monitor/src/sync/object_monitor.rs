use std::sync::{
    atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use super::{
    atomics::{add_atomic, subtract_atomic},
    lockword, Monitor,
};
use crate::objectmodel::ObjectReference;

/// The lock word of the object points at this record.
pub const MONITOR_INFLATED: u32 = 1 << 0;
/// The next contended exit of this monitor must not be reported again.
pub const SUPPRESS_CONTENDED_EXIT: u32 = 1 << 1;

/// Shared handle to a monitor record.
///
/// The monitor table keeps one strong reference. Every thread that decodes an inflated lock
/// word takes its own, so a record can only be reclaimed when the table's reference is the
/// last one.
pub type MonitorRef = Arc<ObjectMonitor>;

/// Heavyweight state of an inflated (or about to be inflated) object lock.
///
/// The alignment leaves the low four bits of the record address free for the lock word
/// tag bits.
#[repr(C, align(16))]
pub struct ObjectMonitor {
    monitor: Monitor,
    /// Address of the object, rewritten by the collector when the object moves.
    object: AtomicUsize,
    /// Lock word of objects without an inline one.
    alternate_lockword: AtomicUsize,
    pin_count: AtomicUsize,
    flags: AtomicU32,
    spinning_threads: AtomicUsize,
    statistics: LockStatistics,
}

#[derive(Default, Debug)]
pub struct LockStatistics {
    pub yield_count: AtomicU64,
    pub spin2_count: AtomicU64,
    pub enter_count: AtomicU64,
    pub contended_count: AtomicU64,
}

impl LockStatistics {
    pub fn yield_count(&self) -> u64 {
        self.yield_count.load(Ordering::Relaxed)
    }

    pub fn spin2_count(&self) -> u64 {
        self.spin2_count.load(Ordering::Relaxed)
    }

    pub fn enter_count(&self) -> u64 {
        self.enter_count.load(Ordering::Relaxed)
    }

    pub fn contended_count(&self) -> u64 {
        self.contended_count.load(Ordering::Relaxed)
    }
}

impl ObjectMonitor {
    pub fn new(object: ObjectReference, alternate_lockword: usize) -> Self {
        Self {
            monitor: Monitor::new(),
            object: AtomicUsize::new(object.to_address()),
            alternate_lockword: AtomicUsize::new(alternate_lockword),
            pin_count: AtomicUsize::new(0),
            flags: AtomicU32::new(0),
            spinning_threads: AtomicUsize::new(0),
            statistics: LockStatistics::default(),
        }
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// The object this record belongs to. Always read it through here: the object may have
    /// moved since the record was looked up.
    pub fn object(&self) -> ObjectReference {
        let address = self.object.load(Ordering::Acquire);
        // SAFETY: records are created for live objects and the collector keeps the
        // back-reference current.
        unsafe { ObjectReference::from_address(address) }
            .unwrap_or_else(|| unreachable!("monitor record without an object"))
    }

    pub(crate) fn set_object(&self, object: ObjectReference) {
        self.object.store(object.to_address(), Ordering::Release);
    }

    pub fn alternate_lockword(&self) -> &AtomicUsize {
        &self.alternate_lockword
    }

    pub fn pin(&self) -> usize {
        add_atomic(&self.pin_count, 1)
    }

    pub fn unpin(&self) -> usize {
        subtract_atomic(&self.pin_count, 1)
    }

    pub fn pin_count(&self) -> usize {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn set_flags(&self, flags: u32) {
        self.flags.fetch_or(flags, Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: u32) {
        self.flags.fetch_and(!flags, Ordering::AcqRel);
    }

    pub fn is_inflated(&self) -> bool {
        self.flags() & MONITOR_INFLATED != 0
    }

    pub fn statistics(&self) -> &LockStatistics {
        &self.statistics
    }

    /// Join the spinners of this monitor unless `max` of them are spinning already. Zero
    /// means unbounded.
    pub(crate) fn try_start_spinning(&self, max: usize) -> bool {
        if max == 0 {
            return true;
        }

        if self.spinning_threads.load(Ordering::Relaxed) < max {
            add_atomic(&self.spinning_threads, 1);
            true
        } else {
            false
        }
    }

    pub(crate) fn stop_spinning(&self, max: usize) {
        if max != 0 {
            subtract_atomic(&self.spinning_threads, 1);
        }
    }

    pub fn spinning_threads(&self) -> usize {
        self.spinning_threads.load(Ordering::Relaxed)
    }

    /// Inflated lock word referencing `this`.
    pub fn as_lockword(this: &MonitorRef) -> usize {
        lockword::as_inflated(Arc::as_ptr(this) as usize)
    }

    /// Take a new reference to the record an inflated lock word points at.
    ///
    /// # Safety
    ///
    /// `word` must have been loaded from a lock word while the calling thread holds execution
    /// permission. Records are only reclaimed under exclusive access, after the lock word
    /// stopped referencing them.
    pub unsafe fn from_lockword(word: usize) -> MonitorRef {
        debug_assert!(lockword::is_inflated(word));
        let ptr = lockword::inflated_monitor(word) as *const ObjectMonitor;
        Arc::increment_strong_count(ptr);
        Arc::from_raw(ptr)
    }

    /// Nobody but the table references the record and the native monitor is free.
    pub fn is_deflatable(this: &MonitorRef) -> bool {
        Arc::strong_count(this) == 1 && this.pin_count() == 0 && this.monitor.is_idle()
    }
}

impl std::fmt::Debug for ObjectMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectMonitor")
            .field("object", &format_args!("{:#x}", self.object.load(Ordering::Relaxed)))
            .field("monitor", &self.monitor)
            .field("pin_count", &self.pin_count())
            .field("flags", &self.flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectmodel::{class::ClassDescriptor, header::HeapObjectHeader};

    #[test]
    fn lockword_references_keep_the_record_alive() {
        let class = Arc::new(ClassDescriptor::new("Lock"));
        let object = ObjectReference::allocate(HeapObjectHeader::new(class, 0));

        let record: MonitorRef = Arc::new(ObjectMonitor::new(object, 0));
        assert!(ObjectMonitor::is_deflatable(&record));

        let word = ObjectMonitor::as_lockword(&record);
        assert!(lockword::is_inflated(word));

        let decoded = unsafe { ObjectMonitor::from_lockword(word) };
        assert!(Arc::ptr_eq(&decoded, &record));
        assert!(!ObjectMonitor::is_deflatable(&record));
        drop(decoded);

        record.pin();
        assert!(!ObjectMonitor::is_deflatable(&record));
        record.unpin();
        assert!(ObjectMonitor::is_deflatable(&record));
        assert_eq!(record.object(), object);

        drop(record);
        unsafe { object.free() };
    }

    #[test]
    fn spin_budget() {
        let class = Arc::new(ClassDescriptor::new("Lock"));
        let object = ObjectReference::allocate(HeapObjectHeader::new(class, 0));
        let record = ObjectMonitor::new(object, 0);

        assert!(record.try_start_spinning(1));
        assert!(!record.try_start_spinning(1));
        record.stop_spinning(1);
        assert_eq!(record.spinning_threads(), 0);
        assert!(record.try_start_spinning(0));
        assert_eq!(record.spinning_threads(), 0);

        unsafe { object.free() };
    }
}
