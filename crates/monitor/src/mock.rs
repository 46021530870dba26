//! Simple MockVM used in tests

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Once,
};

use parking_lot::Mutex;

use crate::{
    objectmodel::{class::ClassDescriptor, ObjectReference},
    runtime::threads::Thread,
    MonitorError, MonitorEvent, MonitorSystem, MonitorSystemBuilder, Runtime,
};

/// Counts of the events seen by every [`MockVM`] system. Tests run in parallel, so only
/// lower bounds are meaningful.
pub static CONTENDED_ENTERS: AtomicUsize = AtomicUsize::new(0);
pub static WAITS: AtomicUsize = AtomicUsize::new(0);
pub static OUT_OF_MEMORY: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
pub struct MockVM;

impl Runtime for MockVM {
    fn monitor_event(_thread: &Thread, event: &MonitorEvent<'_>) {
        match event {
            MonitorEvent::ContendedEnter { .. } => {
                CONTENDED_ENTERS.fetch_add(1, Ordering::Relaxed);
            }
            MonitorEvent::Wait { .. } => {
                WAITS.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn out_of_memory(thread: &Thread, error: MonitorError) {
        log::debug!(target: "vmkit::mock", "thread {}: {}", thread.id(), error);
        OUT_OF_MEMORY.fetch_add(1, Ordering::Relaxed);
    }
}

/// Install `env_logger` once, honoring `RUST_LOG`.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn system() -> MonitorSystem<MockVM> {
    init_logging();
    MonitorSystemBuilder::new().build()
}

/// Objects allocated for one test, freed when the heap is dropped.
pub struct TestHeap {
    objects: Mutex<Vec<ObjectReference>>,
}

impl TestHeap {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(Vec::new()),
        }
    }

    /// A new instance of `class` with the lock word `system` assigns to it.
    pub fn allocate<R: Runtime>(
        &self,
        system: &MonitorSystem<R>,
        class: &Arc<ClassDescriptor>,
    ) -> ObjectReference {
        let object = ObjectReference::allocate(system.new_header(class.clone()));
        self.objects.lock().push(object);
        object
    }

    /// Free `object` before the heap is dropped, as the collector would after finding it
    /// dead.
    pub fn free(&self, object: ObjectReference) {
        let mut objects = self.objects.lock();
        if let Some(ix) = objects.iter().position(|o| *o == object) {
            objects.swap_remove(ix);
            // SAFETY: allocated by this heap and removed from it.
            unsafe { object.free() };
        }
    }
}

impl Default for TestHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestHeap {
    fn drop(&mut self) {
        for object in self.objects.get_mut().drain(..) {
            // SAFETY: allocated by this heap and never freed elsewhere.
            unsafe { object.free() };
        }
    }
}
