use std::{
    fmt,
    marker::PhantomData,
    ops::Deref,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use options::MonitorOptions;
use threads::{ExclusiveAccess, Thread, Threads};

use crate::{
    objectmodel::{class::ClassDescriptor, header::HeapObjectHeader, ObjectReference},
    sync::{
        lockword,
        object_monitor::{MonitorRef, ObjectMonitor},
        reservation,
        table::MonitorTable,
    },
};

pub mod options;
pub mod threads;

/// Binds the monitor subsystem to the runtime embedding it.
pub trait Runtime: 'static + Send + Sync + Sized {
    /// Observe contended enters and waits. Called with execution permission held.
    fn monitor_event(_thread: &Thread, _event: &MonitorEvent<'_>) {}

    /// A monitor operation of `thread` failed to allocate. The operation returns
    /// [`MonitorError::OutOfMemory`] right after this call.
    fn out_of_memory(thread: &Thread, error: MonitorError);
}

pub enum MonitorEvent<'a> {
    /// `thread` is about to block entering the monitor of `object`.
    ContendedEnter {
        object: ObjectReference,
        monitor: &'a ObjectMonitor,
    },
    /// `thread` acquired a monitor it had to block on.
    ContendedEntered {
        object: ObjectReference,
        monitor: &'a ObjectMonitor,
        blocked_for: Duration,
    },
    Wait {
        object: ObjectReference,
        monitor: &'a ObjectMonitor,
        timeout: Option<Duration>,
    },
    Waited {
        object: ObjectReference,
        monitor: &'a ObjectMonitor,
        timed_out: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorError {
    /// A monitor record or a monitor enter record could not be allocated.
    OutOfMemory,
    /// The calling thread does not own the monitor.
    NotOwner,
    /// Instances of the class may not be used as monitors.
    IllegalMonitorState,
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::OutOfMemory => write!(f, "out of memory while inflating a monitor"),
            MonitorError::NotOwner => write!(f, "current thread is not the owner of the monitor"),
            MonitorError::IllegalMonitorState => {
                write!(f, "instances of this class cannot be used as monitors")
            }
        }
    }
}

impl std::error::Error for MonitorError {}

/// Outcome of [`MonitorSystem::enter_nonblocking`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterStatus {
    Entered,
    /// The object is recorded as the thread's blocking enter object; finish with
    /// [`MonitorSystem::enter_blocking`].
    WouldBlock,
}

/// VM wide counters.
#[derive(Default, Debug)]
pub struct MonitorStatistics {
    pub(crate) fast_enters: AtomicU64,
    pub(crate) inflations: AtomicU64,
    pub(crate) deflations: AtomicU64,
    pub(crate) blocking_enters: AtomicU64,
    pub(crate) reservation_cancels: AtomicU64,
}

impl MonitorStatistics {
    pub fn fast_enters(&self) -> u64 {
        self.fast_enters.load(Ordering::Relaxed)
    }

    pub fn inflations(&self) -> u64 {
        self.inflations.load(Ordering::Relaxed)
    }

    pub fn deflations(&self) -> u64 {
        self.deflations.load(Ordering::Relaxed)
    }

    pub fn blocking_enters(&self) -> u64 {
        self.blocking_enters.load(Ordering::Relaxed)
    }

    pub fn reservation_cancels(&self) -> u64 {
        self.reservation_cancels.load(Ordering::Relaxed)
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Where the lock word of an object lives.
pub enum LockAddress<'a> {
    /// In the object header.
    Inline(&'a AtomicUsize),
    /// In the object's monitor record, for classes without an inline lock word.
    Alternate(MonitorRef),
}

impl Deref for LockAddress<'_> {
    type Target = AtomicUsize;

    fn deref(&self) -> &AtomicUsize {
        match self {
            LockAddress::Inline(word) => word,
            LockAddress::Alternate(record) => record.alternate_lockword(),
        }
    }
}

/// The monitor subsystem of one runtime instance: options, the monitor table and the
/// attached threads.
pub struct MonitorSystem<R: Runtime> {
    pub(crate) options: MonitorOptions,
    pub(crate) table: MonitorTable,
    pub(crate) threads: Threads,
    pub(crate) statistics: MonitorStatistics,
    marker: PhantomData<R>,
}

pub struct MonitorSystemBuilder<R: Runtime> {
    options: MonitorOptions,
    marker: PhantomData<R>,
}

impl<R: Runtime> MonitorSystemBuilder<R> {
    pub fn new() -> Self {
        Self {
            options: MonitorOptions::default(),
            marker: PhantomData,
        }
    }

    /// Use the values of the parsed [`MonitorFlags`](options::MonitorFlags).
    pub fn from_flags(mut self) -> Result<Self, String> {
        self.options = MonitorOptions::from_flags()?;
        Ok(self)
    }

    pub fn options(mut self, options: MonitorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> MonitorSystem<R> {
        let max_monitors = self.options.max_monitors();
        MonitorSystem {
            options: self.options,
            table: MonitorTable::new(max_monitors),
            threads: Threads::new(),
            statistics: MonitorStatistics::default(),
            marker: PhantomData,
        }
    }
}

impl<R: Runtime> Default for MonitorSystemBuilder<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Runtime> MonitorSystem<R> {
    /// Tuning values. `max_monitors` is read once when the system is built.
    pub fn options(&self) -> &MonitorOptions {
        &self.options
    }

    pub fn table(&self) -> &MonitorTable {
        &self.table
    }

    pub fn threads(&self) -> &Threads {
        &self.threads
    }

    pub fn statistics(&self) -> &MonitorStatistics {
        &self.statistics
    }

    pub fn attach_current_thread(&self) -> Arc<Thread> {
        self.threads.attach_current_thread()
    }

    /// Detach `thread`, releasing monitors still recorded for it by native code.
    pub fn detach_thread(&self, thread: &Thread) {
        self.release_jni_monitors(thread);
        self.threads.detach_thread(thread);
    }

    pub fn request_exclusive_access<'a>(&'a self, requester: &Thread) -> ExclusiveAccess<'a> {
        self.threads.request_exclusive_access(requester)
    }

    /// Lock word a new instance of `class` starts with.
    pub fn initial_lockword(&self, class: &ClassDescriptor) -> usize {
        reservation::initial_lockword(&self.options.reservation(), class)
    }

    /// Header for a new instance of `class`, with its initial lock word in place.
    pub fn new_header(&self, class: Arc<ClassDescriptor>) -> HeapObjectHeader {
        let lockword = if class.has_inline_lockword() {
            self.initial_lockword(&class)
        } else {
            0
        };
        HeapObjectHeader::new(class, lockword)
    }

    /// Locate the lock word of `object`. Objects without an inline lock word get a monitor
    /// record on first use, which may fail.
    pub fn lock_address(&self, object: ObjectReference) -> Result<LockAddress<'_>, MonitorError> {
        if let Some(word) = object.header().inline_lockword() {
            return Ok(LockAddress::Inline(word));
        }

        let class = object.class();
        self.table
            .at(object, || self.initial_lockword(class))
            .map(LockAddress::Alternate)
    }

    /// Lock word of `object` as seen by the record `record` that belongs to it. Never
    /// allocates.
    pub(crate) fn lockword_with_record<'a>(
        &self,
        object: ObjectReference,
        record: &'a ObjectMonitor,
    ) -> &'a AtomicUsize {
        match object.header().inline_lockword() {
            Some(word) => word,
            None => record.alternate_lockword(),
        }
    }

    /// Current lock word of `object`, without creating anything.
    pub fn peek_lockword(&self, object: ObjectReference) -> Option<usize> {
        match object.header().inline_lockword() {
            Some(word) => Some(word.load(Ordering::Acquire)),
            None => self
                .table
                .peek(object)
                .map(|record| record.alternate_lockword().load(Ordering::Acquire)),
        }
    }

    /// Decoded lock state of `object`, see [`peek_lockword`](Self::peek_lockword).
    pub fn lock_state(&self, object: ObjectReference) -> Option<lockword::LockState> {
        self.peek_lockword(object).map(lockword::classify)
    }

    /// The record of `object`, if it has one.
    pub fn monitor_of(&self, object: ObjectReference) -> Option<MonitorRef> {
        self.table.peek(object)
    }

    pub(crate) fn out_of_memory(&self, thread: &Thread, object: ObjectReference) -> MonitorError {
        log::warn!(
            target: "vmkit::monitor::inflate",
            "thread {} ran out of memory locking {:?}",
            thread.id(),
            object
        );
        R::out_of_memory(thread, MonitorError::OutOfMemory);
        MonitorError::OutOfMemory
    }
}
