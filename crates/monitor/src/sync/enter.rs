//! Monitor enter: fast path, non-blocking slow path, blocking path and inflation.

use std::time::{Duration, Instant};

use super::{
    atomics::{compare_and_swap_lockword, load_lockword, set_bits_while_nonzero},
    fastpath::{self, inline_fast_init_and_enter, is_initial_lockword},
    lockword::{
        flatlock_count, is_inflated, is_learning, is_reserved, learning_count_of,
        learning_to_flat, learning_to_reserved, owner_of, recursion_increment,
        with_incremented_learning_count, would_overflow, OBJECT_HEADER_LOCK_FLC,
        OBJECT_HEADER_LOCK_RESERVED,
    },
    object_monitor::{MonitorRef, ObjectMonitor, MONITOR_INFLATED, SUPPRESS_CONTENDED_EXIT},
    reservation::{self, increment_cancel_counter, increment_reserved_counter},
    spin::{spin_on_flat_lock, spin_on_try_enter},
};
use crate::{
    objectmodel::ObjectReference,
    runtime::{
        threads::{Thread, THREAD_BLOCKED},
        EnterStatus, MonitorError, MonitorEvent, MonitorStatistics, MonitorSystem, Runtime,
    },
};

impl<R: Runtime> MonitorSystem<R> {
    /// Enter the monitor of `object`, blocking until it is available.
    ///
    /// Returns the object, which may have been moved by the collector while the thread was
    /// blocked.
    pub fn enter(
        &self,
        thread: &Thread,
        object: ObjectReference,
    ) -> Result<ObjectReference, MonitorError> {
        if self.try_fast_enter(thread, object) {
            return Ok(object);
        }

        match self.enter_nonblocking(thread, object)? {
            EnterStatus::Entered => Ok(object),
            EnterStatus::WouldBlock => self.enter_blocking(thread),
        }
    }

    /// The inline enter sequence: a single compare-and-swap on the inline lock word.
    pub fn try_fast_enter(&self, thread: &Thread, object: ObjectReference) -> bool {
        let class = object.class();
        if !class.allows_locking() {
            return false;
        }

        let Some(lockword) = object.header().inline_lockword() else {
            return false;
        };

        match fastpath::try_fast_enter(lockword, thread.id()) {
            Some(previous) => {
                if previous == OBJECT_HEADER_LOCK_RESERVED {
                    increment_reserved_counter(class);
                }
                thread.increment_owned_monitor_count();
                MonitorStatistics::bump(&self.statistics.fast_enters);
                true
            }
            None => false,
        }
    }

    /// Enter the monitor of `object` without blocking.
    ///
    /// Handles recursion, the reservation and learning states, spinning on flat locks and
    /// on inflated monitors. When blocking is needed the object is recorded as the thread's
    /// blocking enter object and [`EnterStatus::WouldBlock`] is returned.
    pub fn enter_nonblocking(
        &self,
        thread: &Thread,
        object: ObjectReference,
    ) -> Result<EnterStatus, MonitorError> {
        let class = object.class();
        if !class.allows_locking() {
            log::trace!(
                target: "vmkit::monitor::enter",
                "refusing to lock an instance of value-based class {}",
                class.name()
            );
            return Err(MonitorError::IllegalMonitorState);
        }

        let lockword = self
            .lock_address(object)
            .map_err(|_| self.out_of_memory(thread, object))?;
        let id = thread.id();

        let record: MonitorRef = loop {
            let lock = load_lockword(&lockword);

            if !is_inflated(lock) && owner_of(lock) == id && !would_overflow(lock) {
                // recursive flat enter, or an enter of our own reserved or learning lock
                let incremented = lock + recursion_increment(lock);
                let mut reserved_transition = false;

                let new = if !is_learning(lock) {
                    incremented
                } else if learning_count_of(lock)
                    >= self.options.reservation().transition_threshold
                {
                    reserved_transition = true;
                    learning_to_reserved(incremented)
                } else {
                    with_incremented_learning_count(incremented)
                };

                if compare_and_swap_lockword(&lockword, lock, new, false) != lock {
                    // someone cancelled the reservation or set FLC
                    continue;
                }

                if reserved_transition {
                    increment_reserved_counter(class);
                    log::trace!(
                        target: "vmkit::monitor::reservation",
                        "learning lock of {:?} became reserved for thread {}",
                        object,
                        id
                    );
                }
                thread.increment_owned_monitor_count();
                return Ok(EnterStatus::Entered);
            }

            if is_initial_lockword(lock) {
                if inline_fast_init_and_enter(&lockword, id, false, lock) {
                    if lock == OBJECT_HEADER_LOCK_RESERVED {
                        increment_reserved_counter(class);
                    }
                    thread.increment_owned_monitor_count();
                    return Ok(EnterStatus::Entered);
                }
                continue;
            }

            if is_inflated(lock) {
                // SAFETY: loaded from the lock word with execution permission held.
                break unsafe { ObjectMonitor::from_lockword(lock) };
            }

            if owner_of(lock) == id {
                if is_learning(lock) {
                    // recursion would overflow the small learning counter, go flat instead
                    if compare_and_swap_lockword(&lockword, lock, learning_to_flat(lock), false)
                        == lock
                    {
                        increment_cancel_counter(class);
                    }
                    continue;
                }

                // recursion count is full
                break self.inflate(thread, object, lock)?;
            }

            let spin = class
                .custom_spin()
                .map_or_else(|| self.options.flat_spin(), |custom| custom.flat);
            if spin_on_flat_lock(thread, &lockword, class, spin) {
                thread.increment_owned_monitor_count();
                return Ok(EnterStatus::Entered);
            }

            // Create the record now so that the blocking path cannot fail to allocate.
            if self
                .table
                .at(object, || self.initial_lockword(class))
                .is_err()
            {
                return Err(self.out_of_memory(thread, object));
            }

            log::trace!(
                target: "vmkit::monitor::enter",
                "thread {} failed to spin on flat lock {:#x} of {:?}",
                id,
                load_lockword(&lockword),
                object
            );
            thread.set_blocking_enter_object(Some(object));
            return Ok(EnterStatus::WouldBlock);
        };

        let spin = class
            .custom_spin()
            .map_or_else(|| self.options.try_enter_spin(), |custom| custom.try_enter);
        if spin_on_try_enter(
            thread,
            &record,
            &lockword,
            spin,
            self.options.max_spin_threads(),
            self.options.lock_statistics(),
        ) {
            if self.options.lock_statistics() {
                record
                    .statistics()
                    .enter_count
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            thread.increment_owned_monitor_count();
            return Ok(EnterStatus::Entered);
        }

        thread.set_blocking_enter_object(Some(object));
        Ok(EnterStatus::WouldBlock)
    }

    /// Finish an enter that [`enter_nonblocking`](Self::enter_nonblocking) reported as
    /// [`EnterStatus::WouldBlock`]. Execution permission is released while the thread is
    /// blocked. Returns the (possibly moved) object.
    pub fn enter_blocking(&self, thread: &Thread) -> Result<ObjectReference, MonitorError> {
        let Some(mut object) = thread.blocking_enter_object() else {
            log::error!(
                target: "vmkit::monitor::enter",
                "thread {} entered the blocking path without a pending object",
                thread.id()
            );
            panic!("enter_blocking called without a blocking enter object");
        };
        let class = object.class().clone();
        let id = thread.id();
        let started = Instant::now();

        loop {
            let lockword = self
                .lock_address(object)
                .map_err(|_| self.out_of_memory(thread, object))?;
            if !is_reserved(load_lockword(&lockword)) {
                break;
            }

            log::trace!(
                target: "vmkit::monitor::enter",
                "thread {} cancels the reservation of {:?} before blocking",
                id,
                object
            );
            if reservation::cancel_reservation(&lockword, &class) {
                MonitorStatistics::bump(&self.statistics.reservation_cancels);
            }
            drop(lockword);

            object = thread.blocking_enter_object().unwrap_or(object);
            let lockword = self
                .lock_address(object)
                .map_err(|_| self.out_of_memory(thread, object))?;
            if inline_fast_init_and_enter(&lockword, id, false, 0) {
                thread.increment_owned_monitor_count();
                thread.set_blocking_enter_object(None);
                return Ok(object);
            }
        }

        let record = self
            .table
            .at(object, || self.initial_lockword(&class))
            .map_err(|_| self.out_of_memory(thread, object))?;
        record.pin();

        thread.set_public_flags(THREAD_BLOCKED);
        R::monitor_event(
            thread,
            &MonitorEvent::ContendedEnter {
                object,
                monitor: &record,
            },
        );
        thread.increment_blocked_count();
        MonitorStatistics::bump(&self.statistics.blocking_enters);
        if self.options.lock_statistics() {
            record
                .statistics()
                .contended_count
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        let monitor = record.monitor();
        let backoff_cap = Duration::from_millis(self.options.blocking_backoff_cap_ms());
        let mut wait_time = Duration::from_millis(1).min(backoff_cap);

        'restart: loop {
            thread.enter_parked();
            monitor.enter(id);

            loop {
                if record.is_inflated() {
                    // the native monitor is the object lock now, and we hold it
                    thread.leave_parked();
                    break 'restart;
                }

                if !thread.attempt_leave_parked_no_block() {
                    let _ = monitor.exit(id);
                    thread.leave_parked();
                    continue 'restart;
                }

                // the object may have moved while we were parked
                let current = record.object();
                let lockword = self.lockword_with_record(current, &record);

                reservation::cancel_learning(lockword, &class);

                if is_reserved(load_lockword(lockword)) {
                    let _ = monitor.exit(id);
                    if reservation::cancel_reservation(lockword, &class) {
                        MonitorStatistics::bump(&self.statistics.reservation_cancels);
                    }
                    continue 'restart;
                }

                set_bits_while_nonzero(lockword, OBJECT_HEADER_LOCK_FLC);

                if inline_fast_init_and_enter(lockword, id, true, 0) {
                    let _ = monitor.exit(id);
                    // others are probably queued behind us, make our exit wake them
                    set_bits_while_nonzero(lockword, OBJECT_HEADER_LOCK_FLC);
                    break 'restart;
                }

                thread.enter_parked();
                monitor.wait_contended(id, wait_time);
                wait_time = (wait_time * 4).min(backoff_cap);
            }
        }

        thread.clear_public_flags(THREAD_BLOCKED);
        record.clear_flags(SUPPRESS_CONTENDED_EXIT);
        record.unpin();
        thread.increment_owned_monitor_count();

        let object = record.object();
        R::monitor_event(
            thread,
            &MonitorEvent::ContendedEntered {
                object,
                monitor: &record,
                blocked_for: started.elapsed(),
            },
        );
        thread.set_blocking_enter_object(None);

        log::trace!(
            target: "vmkit::monitor::enter",
            "thread {} acquired {:?} after blocking for {:?}",
            id,
            object,
            started.elapsed()
        );
        Ok(object)
    }

    /// Inflate the flat or reserved lock of `object`, which the calling thread owns (`lock`
    /// is the word it observed). On return the thread owns the record's native monitor with
    /// the same entry count as the flat lock had.
    pub fn inflate(
        &self,
        thread: &Thread,
        object: ObjectReference,
        lock: usize,
    ) -> Result<MonitorRef, MonitorError> {
        debug_assert_eq!(owner_of(lock), thread.id(), "inflating a lock we do not own");
        let class = object.class();
        let record = self
            .table
            .at(object, || self.initial_lockword(class))
            .map_err(|_| self.out_of_memory(thread, object))?;

        record.monitor().enter_with_handshake(thread);

        let object = record.object();
        let lockword = self.lockword_with_record(object, &record);
        let inflated = ObjectMonitor::as_lockword(&record);

        let mut current = load_lockword(lockword);
        loop {
            if is_inflated(current) || owner_of(current) != thread.id() {
                let _ = record.monitor().exit(thread.id());
                self.fatal_ownership_violation(thread, object, "lock changed owner during inflation");
            }

            let observed = compare_and_swap_lockword(lockword, current, inflated, false);
            if observed == current {
                break;
            }
            current = observed;
        }

        record
            .monitor()
            .set_rec_count(thread.id(), flatlock_count(current));
        record.set_flags(MONITOR_INFLATED);
        record.monitor().notify_contenders();
        MonitorStatistics::bump(&self.statistics.inflations);

        log::trace!(
            target: "vmkit::monitor::inflate",
            "inflated {:?} ({:#x} -> {:#x}) for thread {}",
            object,
            current,
            inflated,
            thread.id()
        );
        Ok(record)
    }
}
