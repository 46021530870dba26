//! Mutator threads and the exclusive-access (safepoint) protocol.
//!
//! A thread running managed code holds *execution permission*. Code that may block for an
//! unbounded time first releases it with [`Thread::enter_parked`] and reacquires it with
//! [`Thread::leave_parked`] or [`Thread::attempt_leave_parked_no_block`]. A thread asking
//! for exclusive access raises `HALT_EXCLUSIVE` on every other thread and waits until each
//! of them is either parked or blocked at a yieldpoint.

use std::{
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc, Weak,
    },
    thread::ThreadId,
};

use parking_lot::{Condvar, Mutex};

use crate::{
    objectmodel::ObjectReference,
    sync::enter_records::{MonitorEnterRecord, MonitorEnterRecords},
};

/// Another thread asked for exclusive access; spin loops must give up and the thread must
/// block at its next yieldpoint.
pub const THREAD_HALT_EXCLUSIVE: u32 = 1 << 0;
/// The thread is blocked entering a contended monitor.
pub const THREAD_BLOCKED: u32 = 1 << 1;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    New = 0,
    /// Thread holds execution permission.
    Running = 1,
    /// Thread released execution permission and may stay away for an unbounded time.
    Parked = 2,
    /// Thread is running but exclusive access was requested; it must block at the next
    /// yieldpoint or when parking.
    RunningToBlock = 3,
    /// Thread is parked and may not resume running until exclusive access ends.
    BlockedInParked = 4,
    Terminated = 5,
}

impl From<u8> for ThreadState {
    fn from(value: u8) -> ThreadState {
        match value {
            0 => ThreadState::New,
            1 => ThreadState::Running,
            2 => ThreadState::Parked,
            3 => ThreadState::RunningToBlock,
            4 => ThreadState::BlockedInParked,
            5 => ThreadState::Terminated,
            _ => unreachable!(),
        }
    }
}

impl ThreadState {
    pub fn is_running(&self) -> bool {
        matches!(self, ThreadState::Running | ThreadState::RunningToBlock)
    }

    pub fn is_parked(&self) -> bool {
        matches!(self, ThreadState::Parked | ThreadState::BlockedInParked)
    }

    /// The thread cannot touch the heap until exclusive access ends.
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            ThreadState::New | ThreadState::BlockedInParked | ThreadState::Terminated
        )
    }
}

struct SafepointData {
    armed: bool,
    requester: usize,
}

struct Safepoint {
    data: Mutex<SafepointData>,
    cv_stopped: Condvar,
    cv_resume: Condvar,
}

pub struct Thread {
    id: usize,
    os_thread: ThreadId,
    state: AtomicU8,
    public_flags: AtomicU32,
    blocking_enter_object: AtomicUsize,
    owned_monitor_count: AtomicUsize,
    blocked_count: AtomicU64,
    yieldpoints_taken: AtomicU64,
    pub(crate) enter_records: Mutex<MonitorEnterRecords>,
    pub(crate) jni_enter_records: Mutex<MonitorEnterRecords>,
    safepoint: Arc<Safepoint>,
}

impl Thread {
    /// Non-zero identifier, stored in the owner field of lock words.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.os_thread
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from(self.state.load(Ordering::Acquire))
    }

    fn set_exec_status(&self, state: ThreadState) {
        self.state.store(state as _, Ordering::Release);
    }

    fn attempt_fast_exec_status_transition(
        &self,
        old_state: ThreadState,
        new_state: ThreadState,
    ) -> bool {
        self.state
            .compare_exchange_weak(
                old_state as _,
                new_state as _,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Called by the requester of exclusive access with the safepoint lock held.
    fn set_blocked_exec_status(&self) -> ThreadState {
        loop {
            let old_state = self.state();

            let new_state = match old_state {
                ThreadState::Running => ThreadState::RunningToBlock,
                ThreadState::Parked => ThreadState::BlockedInParked,
                other => other,
            };

            if old_state == new_state || self.attempt_fast_exec_status_transition(old_state, new_state)
            {
                break new_state;
            }
        }
    }

    pub fn public_flags(&self) -> u32 {
        self.public_flags.load(Ordering::Acquire)
    }

    pub(crate) fn set_public_flags(&self, flags: u32) {
        self.public_flags.fetch_or(flags, Ordering::AcqRel);
    }

    pub(crate) fn clear_public_flags(&self, flags: u32) {
        self.public_flags.fetch_and(!flags, Ordering::AcqRel);
    }

    /// Non-blocking poll used by spin loops.
    #[inline]
    pub fn is_exclusive_access_requested(&self) -> bool {
        self.public_flags() & THREAD_HALT_EXCLUSIVE != 0
    }

    /// Release execution permission.
    pub fn enter_parked(&self) {
        debug_assert!(self.is_current(), "only a thread can park itself");
        loop {
            let old_state = self.state();
            if old_state != ThreadState::Running {
                self.enter_parked_blocked();
                return;
            }

            if self.attempt_fast_exec_status_transition(old_state, ThreadState::Parked) {
                return;
            }
        }
    }

    /// Slow path of [`enter_parked`](Self::enter_parked): exclusive access was requested
    /// while we were running, tell the requester that we are out of its way.
    fn enter_parked_blocked(&self) {
        let data = self.safepoint.data.lock();
        if data.armed && self.is_exclusive_access_requested() {
            self.set_exec_status(ThreadState::BlockedInParked);
            self.safepoint.cv_stopped.notify_all();
        } else {
            self.set_exec_status(ThreadState::Parked);
        }
        drop(data);
    }

    /// Try to reacquire execution permission without blocking. Fails while exclusive access
    /// is in progress.
    pub fn attempt_leave_parked_no_block(&self) -> bool {
        debug_assert!(self.is_current());
        loop {
            let old_state = self.state();
            if old_state != ThreadState::Parked {
                return false;
            }

            if self.attempt_fast_exec_status_transition(old_state, ThreadState::Running) {
                return true;
            }
        }
    }

    /// Reacquire execution permission, blocking while another thread has exclusive access.
    pub fn leave_parked(&self) {
        debug_assert!(self.is_current());
        if self.attempt_leave_parked_no_block() {
            return;
        }
        self.check_block();
    }

    /// Block while exclusive access is requested, then return to `Running`.
    fn check_block(&self) {
        let mut data = self.safepoint.data.lock();
        while data.armed && self.is_exclusive_access_requested() {
            self.set_exec_status(ThreadState::BlockedInParked);
            self.safepoint.cv_stopped.notify_all();
            self.safepoint.cv_resume.wait(&mut data);
        }
        self.set_exec_status(ThreadState::Running);
        drop(data);
    }

    /// Poll point for threads running managed code.
    pub fn yieldpoint(&self) {
        self.yieldpoints_taken.fetch_add(1, Ordering::Relaxed);
        if self.is_exclusive_access_requested() {
            log::trace!(target: "vmkit::threads", "thread {} blocks at yieldpoint", self.id);
            self.check_block();
        }
    }

    pub fn yieldpoints_taken(&self) -> u64 {
        self.yieldpoints_taken.load(Ordering::Relaxed)
    }

    /// Run `f` without execution permission.
    pub fn parked_scope<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.enter_parked();
        let result = f();
        self.leave_parked();
        result
    }

    /// Object this thread is blocked on or about to block on.
    pub fn blocking_enter_object(&self) -> Option<ObjectReference> {
        let address = self.blocking_enter_object.load(Ordering::Acquire);
        // SAFETY: only addresses of live objects are recorded, and the collector rewrites
        // them on relocation.
        unsafe { ObjectReference::from_address(address) }
    }

    pub(crate) fn set_blocking_enter_object(&self, object: Option<ObjectReference>) {
        self.blocking_enter_object.store(
            object.map_or(0, ObjectReference::to_address),
            Ordering::Release,
        );
    }

    /// Monitors entered by compiled frames, newest first. Stack walkers use this to report
    /// which monitors a frame holds.
    pub fn monitor_enter_records(&self) -> Vec<MonitorEnterRecord> {
        self.enter_records.lock().iter().copied().collect()
    }

    /// Monitors entered through the native interface, newest first.
    pub fn jni_monitor_enter_records(&self) -> Vec<MonitorEnterRecord> {
        self.jni_enter_records.lock().iter().copied().collect()
    }

    pub fn owned_monitor_count(&self) -> usize {
        self.owned_monitor_count.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_owned_monitor_count(&self) {
        self.owned_monitor_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decrement_owned_monitor_count(&self) {
        self.owned_monitor_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// How many times this thread had to block entering a monitor.
    pub fn blocked_count(&self) -> u64 {
        self.blocked_count.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_blocked_count(&self) {
        self.blocked_count.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("flags", &self.public_flags())
            .field("owned_monitors", &self.owned_monitor_count())
            .finish()
    }
}

/// Registry of attached threads.
pub struct Threads {
    threads: Mutex<Vec<Weak<Thread>>>,
    next_thread_id: AtomicUsize,
    safepoint: Arc<Safepoint>,
}

impl Threads {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            next_thread_id: AtomicUsize::new(1),
            safepoint: Arc::new(Safepoint {
                data: Mutex::new(SafepointData {
                    armed: false,
                    requester: 0,
                }),
                cv_stopped: Condvar::new(),
                cv_resume: Condvar::new(),
            }),
        }
    }

    /// Register the calling OS thread. The returned thread is `Running`.
    pub fn attach_current_thread(&self) -> Arc<Thread> {
        let thread = Arc::new(Thread {
            id: self.next_thread_id.fetch_add(1, Ordering::Relaxed),
            os_thread: std::thread::current().id(),
            state: AtomicU8::new(ThreadState::New as _),
            public_flags: AtomicU32::new(0),
            blocking_enter_object: AtomicUsize::new(0),
            owned_monitor_count: AtomicUsize::new(0),
            blocked_count: AtomicU64::new(0),
            yieldpoints_taken: AtomicU64::new(0),
            enter_records: Mutex::new(MonitorEnterRecords::new()),
            jni_enter_records: Mutex::new(MonitorEnterRecords::new()),
            safepoint: self.safepoint.clone(),
        });

        let mut data = self.safepoint.data.lock();
        while data.armed {
            self.safepoint.cv_resume.wait(&mut data);
        }
        self.threads.lock().push(Arc::downgrade(&thread));
        thread.set_exec_status(ThreadState::Running);
        drop(data);

        log::trace!(target: "vmkit::threads", "attached thread {}", thread.id);
        thread
    }

    pub fn detach_thread(&self, thread: &Thread) {
        let data = self.safepoint.data.lock();
        thread.set_exec_status(ThreadState::Terminated);
        self.threads
            .lock()
            .retain(|t| t.upgrade().map_or(false, |t| t.id != thread.id));
        self.safepoint.cv_stopped.notify_all();
        drop(data);
        log::trace!(target: "vmkit::threads", "detached thread {}", thread.id);
    }

    /// Snapshot of every attached thread.
    pub fn all(&self) -> Vec<Arc<Thread>> {
        self.threads
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every other thread. Threads block at their next yieldpoint or stay out of
    /// managed code if they are parked. Exclusive access ends when the guard is dropped.
    pub fn request_exclusive_access<'a>(&'a self, requester: &Thread) -> ExclusiveAccess<'a> {
        let mut data = self.safepoint.data.lock();
        while data.armed {
            self.safepoint.cv_resume.wait(&mut data);
        }
        data.armed = true;
        data.requester = requester.id;

        let others = self
            .all()
            .into_iter()
            .filter(|thread| thread.id != requester.id)
            .collect::<Vec<_>>();

        for thread in others.iter() {
            thread.set_public_flags(THREAD_HALT_EXCLUSIVE);
            thread.set_blocked_exec_status();
        }

        while !others.iter().all(|thread| thread.state().is_stopped()) {
            self.safepoint.cv_stopped.wait(&mut data);
        }

        log::debug!(
            target: "vmkit::threads",
            "thread {} acquired exclusive access, {} threads stopped",
            requester.id,
            others.len()
        );

        drop(data);
        ExclusiveAccess {
            threads: self,
            stopped: others,
        }
    }

    fn release_exclusive_access(&self, stopped: &[Arc<Thread>]) {
        let mut data = self.safepoint.data.lock();
        for thread in stopped {
            thread.clear_public_flags(THREAD_HALT_EXCLUSIVE);
            let _ = thread.attempt_fast_exec_status_transition(
                ThreadState::BlockedInParked,
                ThreadState::Parked,
            );
            let _ = thread.attempt_fast_exec_status_transition(
                ThreadState::RunningToBlock,
                ThreadState::Running,
            );
        }
        data.armed = false;
        data.requester = 0;
        self.safepoint.cv_resume.notify_all();
        drop(data);
    }
}

impl Default for Threads {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that every other thread is stopped. Operations that move objects or reclaim
/// monitor records take a reference to it.
pub struct ExclusiveAccess<'a> {
    threads: &'a Threads,
    stopped: Vec<Arc<Thread>>,
}

impl ExclusiveAccess<'_> {
    pub fn stopped_threads(&self) -> &[Arc<Thread>] {
        &self.stopped
    }
}

impl Drop for ExclusiveAccess<'_> {
    fn drop(&mut self) {
        self.threads.release_exclusive_access(&self.stopped);
    }
}
