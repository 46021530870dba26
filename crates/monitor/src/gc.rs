//! Collector hooks.
//!
//! Every hook takes an [`ExclusiveAccess`] guard: mutators are either parked or stopped at a
//! yieldpoint, so lock words only change through these hooks. Threads blocked on a monitor
//! are parked with the record pinned and re-read the object from the record when they
//! resume.

use std::sync::{atomic::Ordering, Arc};

use crate::{
    objectmodel::{header::HashState, ObjectReference},
    runtime::{threads::ExclusiveAccess, MonitorSystem, Runtime},
    sync::{
        lockword::{deflated, flatlock_count, inflated_monitor, is_inflated},
        object_monitor::{ObjectMonitor, MONITOR_INFLATED},
    },
};

impl<R: Runtime> MonitorSystem<R> {
    /// The collector copied `old` to `new`. Carries the lock word and the monitor record
    /// over and rewrites every reference the monitor subsystem holds to `old`.
    ///
    /// A hashed object becomes `Moved` so that its hash keeps deriving from `old`.
    pub fn relocate_lock_metadata(
        &self,
        _access: &ExclusiveAccess<'_>,
        old: ObjectReference,
        new: ObjectReference,
    ) {
        let (from, to) = (old.header(), new.header());
        to.lockword_slot().store(from.load_lockword(), Ordering::Release);
        to.set_hash_state(match from.hash_state() {
            HashState::Hashed => HashState::Moved,
            state => state,
        });

        self.move_references(old, new);
        log::trace!(target: "vmkit::monitor::gc", "relocated lock of {:?} to {:?}", old, new);
    }

    /// Undo a copy made by an aborted collection: `copy` goes back to `original`. The lock
    /// word is kept and `Moved` returns to `Hashed`.
    pub fn reverse_forwarded_object(
        &self,
        _access: &ExclusiveAccess<'_>,
        original: ObjectReference,
        copy: ObjectReference,
    ) {
        let (from, to) = (copy.header(), original.header());
        to.lockword_slot().store(from.load_lockword(), Ordering::Release);
        to.set_hash_state(match from.hash_state() {
            HashState::Moved => HashState::Hashed,
            state => state,
        });

        self.move_references(copy, original);
        log::trace!(
            target: "vmkit::monitor::gc",
            "reversed forwarding of {:?} back to {:?}",
            copy,
            original
        );
    }

    fn move_references(&self, old: ObjectReference, new: ObjectReference) {
        self.table.rekey(old, new);

        for thread in self.threads.all() {
            if thread.blocking_enter_object() == Some(old) {
                thread.set_blocking_enter_object(Some(new));
            }
            thread.enter_records.lock().relocate(old, new);
            thread.jni_enter_records.lock().relocate(old, new);
        }
    }

    /// Remove records nobody uses, restoring the lock word of inflated objects. Returns how
    /// many records were removed.
    ///
    /// A record stays while any thread holds, waits on or is blocked entering its monitor,
    /// while it is pinned or referenced outside the table, and while its out-of-line lock
    /// word is held.
    pub fn deflate_idle_monitors(&self, _access: &ExclusiveAccess<'_>) -> usize {
        let removed = self.table.retain(|record| {
            if !ObjectMonitor::is_deflatable(record) {
                return true;
            }

            let object = record.object();
            match object.header().inline_lockword() {
                Some(word) => {
                    let lock = word.load(Ordering::Acquire);
                    if is_inflated(lock) {
                        if inflated_monitor(lock) != Arc::as_ptr(record) as usize {
                            return true;
                        }
                        word.store(deflated(0, 0), Ordering::Release);
                        record.clear_flags(MONITOR_INFLATED);
                    }
                    false
                }
                None => {
                    let lock = record.alternate_lockword().load(Ordering::Acquire);
                    !is_inflated(lock) && flatlock_count(lock) != 0
                }
            }
        });

        self.statistics
            .deflations
            .fetch_add(removed as u64, Ordering::Relaxed);
        if removed != 0 {
            log::debug!(
                target: "vmkit::monitor::gc",
                "deflated {} idle monitors, {} left",
                removed,
                self.table.len()
            );
        }
        removed
    }

    /// Drop the records of objects the collector found dead. Pinned records stay: a
    /// thread is still blocked on them.
    pub fn clear_dead_monitors(
        &self,
        _access: &ExclusiveAccess<'_>,
        mut is_live: impl FnMut(ObjectReference) -> bool,
    ) -> usize {
        let removed = self
            .table
            .retain(|record| record.pin_count() != 0 || is_live(record.object()));

        if removed != 0 {
            log::debug!(
                target: "vmkit::monitor::gc",
                "cleared {} monitors of dead objects",
                removed
            );
        }
        removed
    }
}
