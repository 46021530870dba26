//! Monitor exit and notification.

use super::{
    atomics::{compare_and_swap_lockword, load_lockword},
    fastpath,
    lockword::{
        classify, flatlock_count, is_contended, is_inflated, is_learning, is_reserved, owner_of,
        recursion_of, with_decremented_recursion,
    },
    object_monitor::ObjectMonitor,
};
use crate::{
    objectmodel::ObjectReference,
    runtime::{threads::Thread, LockAddress, MonitorError, MonitorSystem, Runtime},
};

impl<R: Runtime> MonitorSystem<R> {
    /// The inline exit sequence, see [`fastpath::try_fast_exit`].
    pub fn try_fast_exit(&self, thread: &Thread, object: ObjectReference) -> bool {
        let Some(lockword) = object.header().inline_lockword() else {
            return false;
        };

        if fastpath::try_fast_exit(lockword, thread.id()) {
            thread.decrement_owned_monitor_count();
            true
        } else {
            false
        }
    }

    /// Lock word of `object` if it can be owned at all. Out-of-line lock words only exist
    /// once the object was locked.
    fn existing_lock_address(&self, object: ObjectReference) -> Option<LockAddress<'_>> {
        match object.header().inline_lockword() {
            Some(word) => Some(LockAddress::Inline(word)),
            None => self.table.peek(object).map(LockAddress::Alternate),
        }
    }

    /// Exit the monitor of `object` once.
    pub fn exit(&self, thread: &Thread, object: ObjectReference) -> Result<(), MonitorError> {
        if self.try_fast_exit(thread, object) {
            return Ok(());
        }

        let lockword = self
            .existing_lock_address(object)
            .ok_or(MonitorError::NotOwner)?;
        let id = thread.id();

        loop {
            let lock = load_lockword(&lockword);

            if is_inflated(lock) {
                // SAFETY: loaded from the lock word with execution permission held.
                let record = unsafe { ObjectMonitor::from_lockword(lock) };
                record.monitor().exit(id)?;
                break;
            }

            if owner_of(lock) != id || flatlock_count(lock) == 0 {
                return Err(MonitorError::NotOwner);
            }

            if is_reserved(lock) || is_learning(lock) || recursion_of(lock) > 0 {
                // reserved and learning locks stay reserved for us when the count drops to 0
                let new = with_decremented_recursion(lock);
                if compare_and_swap_lockword(&lockword, lock, new, false) != lock {
                    continue;
                }
                break;
            }

            if is_contended(lock) {
                // someone is blocked on us, hand the lock over through the monitor record
                match self.inflate(thread, object, lock) {
                    Ok(record) => {
                        record.monitor().exit(id)?;
                        break;
                    }
                    Err(_) => {
                        log::warn!(
                            target: "vmkit::monitor::exit",
                            "could not inflate contended {:?}, blocked threads will poll",
                            object
                        );
                    }
                }
            }

            if compare_and_swap_lockword(&lockword, lock, 0, false) == lock {
                break;
            }
        }

        thread.decrement_owned_monitor_count();
        Ok(())
    }

    /// Exit a monitor the caller must hold. Used where an unbalanced exit can only be a bug
    /// in the code driving the monitors, such as compiled code and frame unwinding.
    pub fn exit_balanced(&self, thread: &Thread, object: ObjectReference) {
        if let Err(err) = self.exit(thread, object) {
            self.fatal_ownership_violation(thread, object, &err.to_string());
        }
    }

    /// Wake one thread waiting on the monitor of `object`. The caller must own it.
    pub fn notify(&self, thread: &Thread, object: ObjectReference) -> Result<(), MonitorError> {
        self.notify_impl(thread, object, false)
    }

    /// Wake every thread waiting on the monitor of `object`. The caller must own it.
    pub fn notify_all(&self, thread: &Thread, object: ObjectReference) -> Result<(), MonitorError> {
        self.notify_impl(thread, object, true)
    }

    fn notify_impl(
        &self,
        thread: &Thread,
        object: ObjectReference,
        all: bool,
    ) -> Result<(), MonitorError> {
        let lockword = self
            .existing_lock_address(object)
            .ok_or(MonitorError::NotOwner)?;
        let lock = load_lockword(&lockword);

        if is_inflated(lock) {
            // SAFETY: loaded from the lock word with execution permission held.
            let record = unsafe { ObjectMonitor::from_lockword(lock) };
            return if all {
                record.monitor().notify_all(thread.id())
            } else {
                record.monitor().notify(thread.id())
            };
        }

        // waiting always inflates, so nobody can wait on a lock that is not inflated
        if owner_of(lock) == thread.id() && flatlock_count(lock) != 0 {
            Ok(())
        } else {
            Err(MonitorError::NotOwner)
        }
    }

    /// Abort after a monitor ownership invariant was violated, dumping what is known about
    /// the lock first.
    pub fn fatal_ownership_violation(
        &self,
        thread: &Thread,
        object: ObjectReference,
        what: &str,
    ) -> ! {
        let lock = self.peek_lockword(object);
        let record = self.table.peek(object);

        log::error!(
            target: "vmkit::monitor::exit",
            "monitor ownership violation: {}\n  thread: {:?}\n  object: {:?} ({})\n  lock word: {:#x?} {:?}\n  owner: {:?}\n  record: {:?}",
            what,
            thread,
            object,
            object.class().name(),
            lock,
            lock.map(classify),
            lock.map(owner_of),
            record
        );
        panic!("monitor ownership violation: {}", what);
    }
}
