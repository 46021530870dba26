//! Object monitors.
//!
//! Every object can be used as a monitor. Uncontended locking is done with compare-and-swap
//! on the object's lock word (see [`lockword`]); contended and waited-on locks are inflated
//! to an [`ObjectMonitor`](object_monitor::ObjectMonitor) which wraps the native
//! [`Monitor`] defined here.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{runtime::threads::Thread, MonitorError};

pub mod atomics;
pub mod enter;
pub mod enter_records;
pub mod exit;
pub mod fastpath;
pub mod lockword;
pub mod object_monitor;
pub mod reservation;
pub mod spin;
pub mod table;
pub mod wait;


/// A recursive mutex with a wait set, identified by thread ids.
///
/// The blocking operations do not know about execution permission; the `*_with_handshake`
/// variants release it around every potentially unbounded wait so that a thread blocked on a
/// monitor never holds up a request for exclusive access.
pub struct Monitor {
    state: Mutex<MonitorState>,
    entry: Condvar,
    waiting: Condvar,
    contenders: Condvar,
}

#[derive(Default)]
struct MonitorState {
    holder: usize,
    rec_count: usize,
    /// Threads inside `wait_timed`.
    waiters: usize,
    /// Ticket handed to the next waiter.
    next_ticket: u64,
    /// Tickets of waiters not notified yet, oldest first.
    wait_set: VecDeque<u64>,
    /// Tickets notified but not yet woken.
    signaled: Vec<u64>,
    /// Threads blocked acquiring the monitor.
    entering: usize,
    /// Threads polling the flat lock in `wait_contended`.
    contenders: usize,
}

impl MonitorState {
    fn take_signal(&mut self, ticket: u64) -> bool {
        match self.signaled.iter().position(|t| *t == ticket) {
            Some(ix) => {
                self.signaled.swap_remove(ix);
                true
            }
            None => false,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RecCount(usize);

impl RecCount {
    pub fn value(&self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WaitResult {
    Signaled,
    TimedOut,
}

impl Monitor {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(MonitorState {
                holder: 0,
                rec_count: 0,
                waiters: 0,
                next_ticket: 0,
                wait_set: VecDeque::new(),
                signaled: Vec::new(),
                entering: 0,
                contenders: 0,
            }),
            entry: Condvar::new(),
            waiting: Condvar::new(),
            contenders: Condvar::new(),
        }
    }

    /// Acquire the monitor for thread `id`, blocking without releasing execution permission.
    pub fn enter(&self, id: usize) {
        let mut state = self.state.lock();
        if state.holder == id {
            state.rec_count += 1;
            return;
        }

        state.entering += 1;
        while state.holder != 0 {
            self.entry.wait(&mut state);
        }
        state.entering -= 1;
        state.holder = id;
        state.rec_count = 1;
    }

    pub fn try_enter(&self, id: usize) -> bool {
        let Some(mut state) = self.state.try_lock() else {
            return false;
        };

        if state.holder == id {
            state.rec_count += 1;
            true
        } else if state.holder == 0 {
            state.holder = id;
            state.rec_count = 1;
            true
        } else {
            false
        }
    }

    pub fn exit(&self, id: usize) -> Result<(), MonitorError> {
        let mut state = self.state.lock();
        if state.holder != id || state.rec_count == 0 {
            return Err(MonitorError::NotOwner);
        }

        state.rec_count -= 1;
        if state.rec_count == 0 {
            state.holder = 0;
            self.entry.notify_one();
        }
        Ok(())
    }

    /// Thread id of the holder, zero when free.
    pub fn owner(&self) -> usize {
        self.state.lock().holder
    }

    pub fn rec_count(&self) -> usize {
        self.state.lock().rec_count
    }

    /// Overwrite the recursion count of a monitor held by `id`.
    pub fn set_rec_count(&self, id: usize, rec_count: usize) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.holder, id);
        debug_assert!(rec_count > 0);
        state.rec_count = rec_count;
    }

    /// No holder, no waiters and nobody trying to get in.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.holder == 0 && state.waiters == 0 && state.entering == 0 && state.contenders == 0
    }

    pub fn has_waiters(&self) -> bool {
        self.state.lock().waiters != 0
    }

    /// Release the monitor regardless of the recursion count.
    pub fn unlock_completely(&self, id: usize) -> RecCount {
        let mut state = self.state.lock();
        debug_assert_eq!(state.holder, id, "monitor released by a non-owner");
        let rec_count = std::mem::take(&mut state.rec_count);
        state.holder = 0;
        self.entry.notify_one();
        RecCount(rec_count)
    }

    /// Relock with a recursion count saved by [`unlock_completely`](Self::unlock_completely),
    /// leaving execution permission while blocked.
    pub fn relock_with_handshake(&self, thread: &Thread, rec_count: RecCount) {
        loop {
            thread.enter_parked();
            self.enter(thread.id());

            if thread.attempt_leave_parked_no_block() {
                break;
            }

            self.unlock_completely(thread.id());
            thread.leave_parked();
        }

        let mut state = self.state.lock();
        state.rec_count = rec_count.0;
    }

    /// Enter the monitor, leaving execution permission while blocked.
    pub fn enter_with_handshake(&self, thread: &Thread) {
        if self.try_enter(thread.id()) {
            return;
        }

        loop {
            thread.enter_parked();
            self.enter(thread.id());

            if thread.attempt_leave_parked_no_block() {
                return;
            }

            self.unlock_completely(thread.id());
            thread.leave_parked();
        }
    }

    /// Release the monitor and wait for a notification or until `timeout` elapses. The
    /// monitor is reacquired with its recursion count before returning.
    pub fn wait_timed(
        &self,
        id: usize,
        timeout: Option<Duration>,
    ) -> Result<WaitResult, MonitorError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();
        if state.holder != id {
            return Err(MonitorError::NotOwner);
        }

        let rec_count = std::mem::take(&mut state.rec_count);
        state.holder = 0;
        state.waiters += 1;
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.wait_set.push_back(ticket);
        self.entry.notify_one();

        let result = loop {
            if state.take_signal(ticket) {
                break WaitResult::Signaled;
            }

            match deadline {
                None => self.waiting.wait(&mut state),
                Some(deadline) => {
                    if self.waiting.wait_until(&mut state, deadline).timed_out() {
                        if state.take_signal(ticket) {
                            break WaitResult::Signaled;
                        }
                        state.wait_set.retain(|t| *t != ticket);
                        break WaitResult::TimedOut;
                    }
                }
            }
        };
        state.waiters -= 1;

        state.entering += 1;
        while state.holder != 0 {
            self.entry.wait(&mut state);
        }
        state.entering -= 1;
        state.holder = id;
        state.rec_count = rec_count;

        Ok(result)
    }

    /// [`wait_timed`](Self::wait_timed) without execution permission.
    pub fn wait_with_handshake(
        &self,
        thread: &Thread,
        timeout: Option<Duration>,
    ) -> Result<WaitResult, MonitorError> {
        if self.owner() != thread.id() {
            return Err(MonitorError::NotOwner);
        }

        thread.enter_parked();
        let result = self.wait_timed(thread.id(), timeout);
        let rec_count = self.unlock_completely(thread.id());
        thread.leave_parked();

        self.relock_with_handshake(thread, rec_count);
        result
    }

    /// Wake the longest waiting thread. The caller must hold the monitor. Threads that
    /// start waiting afterwards are not woken by this call.
    pub fn notify(&self, id: usize) -> Result<(), MonitorError> {
        let mut state = self.state.lock();
        if state.holder != id {
            return Err(MonitorError::NotOwner);
        }

        if let Some(ticket) = state.wait_set.pop_front() {
            state.signaled.push(ticket);
            // the condvar cannot pick a thread, the others go back to sleep
            self.waiting.notify_all();
        }
        Ok(())
    }

    pub fn notify_all(&self, id: usize) -> Result<(), MonitorError> {
        let mut state = self.state.lock();
        if state.holder != id {
            return Err(MonitorError::NotOwner);
        }

        let MonitorState {
            wait_set, signaled, ..
        } = &mut *state;
        signaled.extend(wait_set.drain(..));
        self.waiting.notify_all();
        Ok(())
    }

    /// Release the monitor held by `id` and sleep until [`notify_contenders`] is called or
    /// `timeout` elapses, then reacquire it. Used by threads waiting for a flat lock to be
    /// released or inflated.
    ///
    /// [`notify_contenders`]: Self::notify_contenders
    pub fn wait_contended(&self, id: usize, timeout: Duration) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.holder, id);

        let rec_count = std::mem::take(&mut state.rec_count);
        state.holder = 0;
        state.contenders += 1;
        self.entry.notify_one();

        let _ = self.contenders.wait_for(&mut state, timeout);
        state.contenders -= 1;

        state.entering += 1;
        while state.holder != 0 {
            self.entry.wait(&mut state);
        }
        state.entering -= 1;
        state.holder = id;
        state.rec_count = rec_count;
    }

    pub fn notify_contenders(&self) {
        let state = self.state.lock();
        if state.contenders != 0 {
            self.contenders.notify_all();
        }
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Monitor")
            .field("holder", &state.holder)
            .field("rec_count", &state.rec_count)
            .field("waiters", &state.waiters)
            .field("entering", &state.entering)
            .finish()
    }
}
