//! Object to monitor record mapping.

use std::sync::Arc;

use parking_lot::Mutex;

use super::object_monitor::{MonitorRef, ObjectMonitor};
use crate::{objectmodel::ObjectReference, MonitorError};

const INITIAL_BUCKETS: usize = 64;
/// Grow when the average chain is longer than this.
const MAX_LOAD: usize = 2;

struct TableInner {
    buckets: Vec<Vec<MonitorRef>>,
    len: usize,
    version: u64,
}

impl TableInner {
    fn bucket_of(&self, object: ObjectReference) -> usize {
        bucket_index(object.to_address(), self.buckets.len())
    }

    fn find(&self, object: ObjectReference) -> Option<&MonitorRef> {
        self.buckets[self.bucket_of(object)]
            .iter()
            .find(|record| record.object() == object)
    }

    /// Rehash into twice as many buckets. The new bucket array is fully built before it
    /// replaces the old one, so an allocation failure leaves the table untouched.
    fn grow(&mut self) -> Result<(), MonitorError> {
        let new_size = self.buckets.len() * 2;
        let mut buckets: Vec<Vec<MonitorRef>> = Vec::new();
        buckets
            .try_reserve_exact(new_size)
            .map_err(|_| MonitorError::OutOfMemory)?;
        buckets.resize_with(new_size, Vec::new);

        for record in self.buckets.iter().flatten() {
            let bucket = &mut buckets[bucket_index(record.object().to_address(), new_size)];
            bucket.try_reserve(1).map_err(|_| MonitorError::OutOfMemory)?;
            bucket.push(record.clone());
        }

        self.buckets = buckets;
        self.version += 1;
        log::debug!(
            target: "vmkit::monitor::inflate",
            "monitor table grown to {} buckets ({} records)",
            new_size,
            self.len
        );
        Ok(())
    }
}

fn bucket_index(address: usize, buckets: usize) -> usize {
    debug_assert!(buckets.is_power_of_two());
    let hash = (address >> 3).wrapping_mul(0x9E37_79B9_7F4A_7C15u64 as usize);
    (hash >> 7) & (buckets - 1)
}

/// Process wide table of monitor records keyed by object identity, guarded by its own lock.
pub struct MonitorTable {
    inner: Mutex<TableInner>,
    max_monitors: usize,
}

impl MonitorTable {
    /// `max_monitors` caps the number of live records, zero means unbounded.
    pub fn new(max_monitors: usize) -> Self {
        let mut buckets = Vec::with_capacity(INITIAL_BUCKETS);
        buckets.resize_with(INITIAL_BUCKETS, Vec::new);
        Self {
            inner: Mutex::new(TableInner {
                buckets,
                len: 0,
                version: 0,
            }),
            max_monitors,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bumped every time the bucket array is replaced.
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Look up the record of `object` without creating one.
    pub fn peek(&self, object: ObjectReference) -> Option<MonitorRef> {
        self.inner.lock().find(object).cloned()
    }

    /// Look up or create the record of `object`. A new record's alternate lock word is
    /// initialised with `alternate_lockword()`.
    pub fn at(
        &self,
        object: ObjectReference,
        alternate_lockword: impl FnOnce() -> usize,
    ) -> Result<MonitorRef, MonitorError> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.find(object) {
            return Ok(record.clone());
        }

        if self.max_monitors != 0 && inner.len >= self.max_monitors {
            log::warn!(
                target: "vmkit::monitor::inflate",
                "monitor table full ({} records), cannot create a record for {:?}",
                inner.len,
                object
            );
            return Err(MonitorError::OutOfMemory);
        }

        if inner.len >= inner.buckets.len() * MAX_LOAD {
            if let Err(err) = inner.grow() {
                log::warn!(target: "vmkit::monitor::inflate", "monitor table growth failed");
                return Err(err);
            }
        }

        let record = Arc::new(ObjectMonitor::new(object, alternate_lockword()));
        let bucket = inner.bucket_of(object);
        inner.buckets[bucket]
            .try_reserve(1)
            .map_err(|_| MonitorError::OutOfMemory)?;
        inner.buckets[bucket].push(record.clone());
        inner.len += 1;

        log::trace!(
            target: "vmkit::monitor::inflate",
            "created monitor record {:p} for {:?}",
            Arc::as_ptr(&record),
            object
        );
        Ok(record)
    }

    /// Move the record of `old` to `new` and update its back-reference.
    pub(crate) fn rekey(&self, old: ObjectReference, new: ObjectReference) -> Option<MonitorRef> {
        let mut inner = self.inner.lock();
        let old_bucket = inner.bucket_of(old);
        let ix = inner.buckets[old_bucket]
            .iter()
            .position(|record| record.object() == old)?;
        let record = inner.buckets[old_bucket].swap_remove(ix);
        record.set_object(new);

        let new_bucket = inner.bucket_of(new);
        inner.buckets[new_bucket].push(record.clone());
        Some(record)
    }

    /// Keep only the records for which `keep` returns `true`. Returns how many were removed.
    pub(crate) fn retain(&self, mut keep: impl FnMut(&MonitorRef) -> bool) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        for bucket in inner.buckets.iter_mut() {
            let before = bucket.len();
            bucket.retain(|record| keep(record));
            removed += before - bucket.len();
        }
        inner.len -= removed;
        removed
    }

    /// Every record currently in the table.
    pub fn snapshot(&self) -> Vec<MonitorRef> {
        self.inner.lock().buckets.iter().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectmodel::{class::ClassDescriptor, header::HeapObjectHeader};

    fn objects(n: usize) -> Vec<ObjectReference> {
        let class = Arc::new(ClassDescriptor::new("Lock"));
        (0..n)
            .map(|_| ObjectReference::allocate(HeapObjectHeader::new(class.clone(), 0)))
            .collect()
    }

    #[test]
    fn lookup_is_stable_across_growth() {
        let objs = objects(500);
        let table = MonitorTable::new(0);

        let records = objs
            .iter()
            .map(|&object| table.at(object, || 0).unwrap())
            .collect::<Vec<_>>();

        assert_eq!(table.len(), 500);
        assert!(table.version() > 0);

        for (object, record) in objs.iter().zip(records.iter()) {
            let found = table.peek(*object).unwrap();
            assert!(Arc::ptr_eq(&found, record));
            assert!(Arc::ptr_eq(&table.at(*object, || 0).unwrap(), record));
        }

        drop(records);
        assert_eq!(table.retain(|_| false), 500);
        assert!(table.is_empty());

        for object in objs {
            unsafe { object.free() };
        }
    }

    #[test]
    fn cap_reports_out_of_memory() {
        let objs = objects(3);
        let table = MonitorTable::new(2);

        assert!(table.at(objs[0], || 0).is_ok());
        assert!(table.at(objs[1], || 0).is_ok());
        assert_eq!(table.at(objs[2], || 0).unwrap_err(), MonitorError::OutOfMemory);
        assert!(table.at(objs[0], || 0).is_ok());

        let record = table.rekey(objs[1], objs[2]).unwrap();
        assert_eq!(record.object(), objs[2]);
        assert!(table.peek(objs[1]).is_none());
        assert!(table.peek(objs[2]).is_some());
        assert_eq!(table.snapshot().len(), 2);

        drop(record);
        table.retain(|_| false);
        for object in objs {
            unsafe { object.free() };
        }
    }
}
