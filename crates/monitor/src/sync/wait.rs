use std::time::Duration;

use super::{
    atomics::load_lockword,
    lockword::{flatlock_count, is_inflated, is_learning, is_reserved, owner_of},
    object_monitor::ObjectMonitor,
    reservation, WaitResult,
};
use crate::{
    objectmodel::ObjectReference,
    runtime::{
        threads::Thread, LockAddress, MonitorError, MonitorEvent, MonitorStatistics,
        MonitorSystem, Runtime,
    },
};

impl<R: Runtime> MonitorSystem<R> {
    /// Release the monitor of `object`, which the caller must own, and wait until another
    /// thread notifies it or `timeout_ms` milliseconds elapse (zero waits forever). The
    /// monitor is reacquired with the same entry count before returning.
    ///
    /// Waiting inflates the lock.
    pub fn wait(
        &self,
        thread: &Thread,
        object: ObjectReference,
        timeout_ms: u64,
    ) -> Result<WaitResult, MonitorError> {
        let timeout = (timeout_ms != 0).then(|| Duration::from_millis(timeout_ms));
        let id = thread.id();
        let class = object.class();

        let lockword = match object.header().inline_lockword() {
            Some(word) => LockAddress::Inline(word),
            None => LockAddress::Alternate(
                self.table.peek(object).ok_or(MonitorError::NotOwner)?,
            ),
        };

        let record = loop {
            let lock = load_lockword(&lockword);

            if is_inflated(lock) {
                // SAFETY: loaded from the lock word with execution permission held.
                break unsafe { ObjectMonitor::from_lockword(lock) };
            }

            if owner_of(lock) != id || flatlock_count(lock) == 0 {
                return Err(MonitorError::NotOwner);
            }

            if is_learning(lock) {
                reservation::cancel_learning(&lockword, class);
                continue;
            }

            if is_reserved(lock) {
                if reservation::cancel_reservation(&lockword, class) {
                    MonitorStatistics::bump(&self.statistics.reservation_cancels);
                }
                continue;
            }

            break self.inflate(thread, object, lock)?;
        };
        drop(lockword);

        if record.monitor().owner() != id {
            return Err(MonitorError::NotOwner);
        }

        record.pin();
        R::monitor_event(
            thread,
            &MonitorEvent::Wait {
                object: record.object(),
                monitor: &record,
                timeout,
            },
        );
        log::trace!(
            target: "vmkit::monitor::wait",
            "thread {} waits on {:?} (timeout {:?})",
            id,
            object,
            timeout
        );

        let result = record.monitor().wait_with_handshake(thread, timeout);
        record.unpin();

        if let Ok(result) = result {
            R::monitor_event(
                thread,
                &MonitorEvent::Waited {
                    object: record.object(),
                    monitor: &record,
                    timed_out: result == WaitResult::TimedOut,
                },
            );
        }
        result
    }
}
