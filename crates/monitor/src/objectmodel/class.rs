use std::{
    fmt,
    sync::atomic::{AtomicU16, Ordering},
};

use crate::runtime::options::CustomSpinOptions;

/// Per-class metadata the monitor subsystem needs.
///
/// The reservation counters are deliberately updated with separate load and store
/// operations: concurrent updates may lose increments, which only adds noise to the
/// heuristic.
pub struct ClassDescriptor {
    name: Box<str>,
    has_inline_lockword: bool,
    allows_locking: bool,
    reservable_lockword_init: bool,
    custom_spin: Option<CustomSpinOptions>,
    pub(crate) reserved_counter: AtomicU16,
    pub(crate) cancel_counter: AtomicU16,
}

impl ClassDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            has_inline_lockword: true,
            allows_locking: true,
            reservable_lockword_init: false,
            custom_spin: None,
            reserved_counter: AtomicU16::new(0),
            cancel_counter: AtomicU16::new(0),
        }
    }

    /// Instances without an inline lock word keep it in their monitor record.
    pub fn with_inline_lockword(mut self, inline: bool) -> Self {
        self.has_inline_lockword = inline;
        self
    }

    /// Instances of value-based classes cannot be used as monitors.
    pub fn value_based(mut self) -> Self {
        self.allows_locking = false;
        self
    }

    /// Start instances reserved even when lock reservation is globally disabled.
    pub fn with_reservable_lockword_init(mut self) -> Self {
        self.reservable_lockword_init = true;
        self
    }

    /// Spin with `options` instead of the global values when locking instances.
    pub fn with_custom_spin(mut self, options: CustomSpinOptions) -> Self {
        self.custom_spin = Some(options);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_inline_lockword(&self) -> bool {
        self.has_inline_lockword
    }

    pub fn allows_locking(&self) -> bool {
        self.allows_locking
    }

    pub fn reservable_lockword_init(&self) -> bool {
        self.reservable_lockword_init
    }

    pub fn custom_spin(&self) -> Option<&CustomSpinOptions> {
        self.custom_spin.as_ref()
    }

    pub fn reserved_counter(&self) -> u16 {
        self.reserved_counter.load(Ordering::Relaxed)
    }

    pub fn cancel_counter(&self) -> u16 {
        self.cancel_counter.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("name", &self.name)
            .field("inline_lockword", &self.has_inline_lockword)
            .field("reserved", &self.reserved_counter())
            .field("cancel", &self.cancel_counter())
            .finish()
    }
}
