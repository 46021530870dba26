use crate::{
    objectmodel::ObjectReference,
    runtime::{threads::Thread, MonitorSystem, Runtime},
    MonitorError,
};

/// How many times the frame `frame` entered the monitor of `object`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorEnterRecord {
    pub object: ObjectReference,
    pub frame: usize,
    pub count: usize,
}

/// Per-thread list of monitor enters, newest last.
///
/// Used to release the right number of entries when a frame unwinds, and to tell stack
/// walkers which monitors a frame holds.
#[derive(Debug, Default)]
pub struct MonitorEnterRecords {
    records: Vec<MonitorEnterRecord>,
}

impl MonitorEnterRecords {
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MonitorEnterRecord> {
        self.records.iter().rev()
    }

    pub fn record_enter(&mut self, object: ObjectReference, frame: usize) -> Result<(), MonitorError> {
        if let Some(top) = self.records.last_mut() {
            if top.object == object && top.frame == frame {
                top.count += 1;
                return Ok(());
            }
        }

        self.records
            .try_reserve(1)
            .map_err(|_| MonitorError::OutOfMemory)?;
        self.records.push(MonitorEnterRecord {
            object,
            frame,
            count: 1,
        });
        Ok(())
    }

    /// Consume one entry of `object` made by `frame`. Returns `false` if the frame never
    /// entered that monitor.
    pub fn record_exit(&mut self, object: ObjectReference, frame: usize) -> bool {
        let Some(ix) = self
            .records
            .iter()
            .rposition(|record| record.object == object && record.frame == frame)
        else {
            return false;
        };

        self.records[ix].count -= 1;
        if self.records[ix].count == 0 {
            self.records.remove(ix);
        }
        true
    }

    /// Remove and return every record of `frame`, newest first.
    pub fn pop_frame(&mut self, frame: usize) -> Vec<MonitorEnterRecord> {
        let mut popped = Vec::new();
        let mut inserted = 0;

        for i in 0..self.records.len() {
            if self.records[i].frame != frame {
                if inserted != i {
                    self.records[inserted] = self.records[i];
                }
                inserted += 1;
            } else {
                popped.push(self.records[i]);
            }
        }

        self.records.truncate(inserted);
        popped.reverse();
        popped
    }

    /// Remove and return every record, newest first.
    pub fn drain(&mut self) -> Vec<MonitorEnterRecord> {
        let mut records = std::mem::take(&mut self.records);
        records.reverse();
        records
    }

    /// Total number of recorded entries of `object`.
    pub fn count(&self, object: ObjectReference) -> usize {
        self.records
            .iter()
            .filter(|record| record.object == object)
            .map(|record| record.count)
            .sum()
    }

    pub fn contains(&self, object: ObjectReference) -> bool {
        self.records.iter().any(|record| record.object == object)
    }

    pub(crate) fn relocate(&mut self, old: ObjectReference, new: ObjectReference) {
        for record in self.records.iter_mut() {
            if record.object == old {
                record.object = new;
            }
        }
    }
}

impl<R: Runtime> MonitorSystem<R> {
    /// Enter the monitor of `object` on behalf of compiled frame `frame`, recording the
    /// entry so that unwinding the frame releases it.
    pub fn enter_in_frame(
        &self,
        thread: &Thread,
        object: ObjectReference,
        frame: usize,
    ) -> Result<ObjectReference, MonitorError> {
        let object = self.enter(thread, object)?;
        let recorded = thread.enter_records.lock().record_enter(object, frame);
        if let Err(err) = recorded {
            self.exit_balanced(thread, object);
            R::out_of_memory(thread, err);
            return Err(err);
        }
        Ok(object)
    }

    /// Exit a monitor entered with [`enter_in_frame`](Self::enter_in_frame).
    pub fn exit_in_frame(
        &self,
        thread: &Thread,
        object: ObjectReference,
        frame: usize,
    ) -> Result<(), MonitorError> {
        self.exit(thread, object)?;
        if !thread.enter_records.lock().record_exit(object, frame) {
            self.fatal_ownership_violation(thread, object, "exit without a monitor enter record");
        }
        Ok(())
    }

    /// Release every monitor still held by `frame`, as when the frame unwinds with an
    /// exception. Returns the number of entries released.
    pub fn release_frame_monitors(&self, thread: &Thread, frame: usize) -> usize {
        let records = thread.enter_records.lock().pop_frame(frame);
        self.release_records(thread, &records)
    }

    /// Enter the monitor of `object` from native code. Such entries are released when the
    /// thread detaches.
    pub fn jni_enter(
        &self,
        thread: &Thread,
        object: ObjectReference,
    ) -> Result<ObjectReference, MonitorError> {
        let object = self.enter(thread, object)?;
        let recorded = thread.jni_enter_records.lock().record_enter(object, 0);
        if let Err(err) = recorded {
            self.exit_balanced(thread, object);
            R::out_of_memory(thread, err);
            return Err(err);
        }
        Ok(object)
    }

    pub fn jni_exit(&self, thread: &Thread, object: ObjectReference) -> Result<(), MonitorError> {
        if thread.jni_enter_records.lock().count(object) == 0 {
            return Err(MonitorError::NotOwner);
        }
        self.exit(thread, object)?;
        thread.jni_enter_records.lock().record_exit(object, 0);
        Ok(())
    }

    /// Exit every monitor `thread` entered through the native interface and never left.
    pub fn release_jni_monitors(&self, thread: &Thread) -> usize {
        let records = thread.jni_enter_records.lock().drain();
        let released = self.release_records(thread, &records);
        if released != 0 {
            log::debug!(
                target: "vmkit::monitor::exit",
                "released {} native monitor entries of thread {}",
                released,
                thread.id()
            );
        }
        released
    }

    fn release_records(&self, thread: &Thread, records: &[MonitorEnterRecord]) -> usize {
        let mut released = 0;
        for record in records {
            for _ in 0..record.count {
                self.exit_balanced(thread, record.object);
                released += 1;
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::objectmodel::{class::ClassDescriptor, header::HeapObjectHeader};

    fn objects(n: usize) -> Vec<ObjectReference> {
        let class = Arc::new(ClassDescriptor::new("Lock"));
        (0..n)
            .map(|_| ObjectReference::allocate(HeapObjectHeader::new(class.clone(), 0)))
            .collect()
    }

    fn free(objects: Vec<ObjectReference>) {
        for object in objects {
            unsafe { object.free() };
        }
    }

    #[test]
    fn nested_enters_share_a_record() {
        let objs = objects(2);
        let mut records = MonitorEnterRecords::new();

        records.record_enter(objs[0], 1).unwrap();
        records.record_enter(objs[0], 1).unwrap();
        records.record_enter(objs[1], 1).unwrap();
        records.record_enter(objs[0], 2).unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records.count(objs[0]), 3);

        assert!(records.record_exit(objs[0], 2));
        assert!(records.record_exit(objs[0], 1));
        assert_eq!(records.count(objs[0]), 1);
        assert!(!records.record_exit(objs[1], 7));

        free(objs);
    }

    #[test]
    fn popping_a_frame_keeps_the_others() {
        let objs = objects(3);
        let mut records = MonitorEnterRecords::new();

        records.record_enter(objs[0], 1).unwrap();
        records.record_enter(objs[1], 2).unwrap();
        records.record_enter(objs[1], 2).unwrap();
        records.record_enter(objs[2], 2).unwrap();

        let popped = records.pop_frame(2);
        assert_eq!(
            popped,
            vec![
                MonitorEnterRecord {
                    object: objs[2],
                    frame: 2,
                    count: 1
                },
                MonitorEnterRecord {
                    object: objs[1],
                    frame: 2,
                    count: 2
                },
            ]
        );
        assert_eq!(records.len(), 1);
        assert!(records.contains(objs[0]));

        records.relocate(objs[0], objs[2]);
        assert!(records.contains(objs[2]));
        assert_eq!(records.drain().len(), 1);
        assert!(records.is_empty());

        free(objs);
    }
}
