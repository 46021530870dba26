use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::define_flag;

pub struct MonitorFlags;

define_flag!(MonitorFlags => usize, thr_max_spins1_before_blocking, 256,
    "Inner busy-wait iterations of the flat lock spin (default: 256)");
define_flag!(MonitorFlags => usize, thr_max_spins2_before_blocking, 32,
    "Middle CAS-retry iterations of the flat lock spin (default: 32)");
define_flag!(MonitorFlags => usize, thr_max_yields_before_blocking, 45,
    "Outer OS-yield iterations of the flat lock spin (default: 45)");
define_flag!(MonitorFlags => bool, thr_nested_spinning, true,
    "Run the full middle loop on every outer iteration (default: true)");
define_flag!(MonitorFlags => usize, thr_max_try_enter_spins1_before_blocking, 256,
    "Inner busy-wait iterations of the inflated try-enter spin (default: 256)");
define_flag!(MonitorFlags => usize, thr_max_try_enter_spins2_before_blocking, 32,
    "Middle try-enter iterations of the inflated try-enter spin (default: 32)");
define_flag!(MonitorFlags => usize, thr_max_try_enter_yields_before_blocking, 45,
    "Outer OS-yield iterations of the inflated try-enter spin (default: 45)");
define_flag!(MonitorFlags => bool, thr_try_enter_nested_spinning, true,
    "Nested spinning for the inflated try-enter spin (default: true)");
define_flag!(MonitorFlags => usize, max_spin_threads, 0,
    "Maximum number of threads spinning on native monitors at once, 0 for no limit (default: 0)");
define_flag!(MonitorFlags => bool, global_lock_reservation, false,
    "Allocate objects with reserved or learning lock words (default: false)");
define_flag!(MonitorFlags => usize, reserved_transition_threshold, 1,
    "Learn count at which a learning lock becomes reserved (default: 1)");
define_flag!(MonitorFlags => usize, reserved_absolute_threshold, 10,
    "Reservations needed before new instances start reserved (default: 10)");
define_flag!(MonitorFlags => usize, minimum_reserved_ratio, 1024,
    "Reservations per cancellation needed before new instances start reserved (default: 1024)");
define_flag!(MonitorFlags => usize, cancel_absolute_threshold, 10,
    "Cancellations after which new instances stop starting in learning (default: 10)");
define_flag!(MonitorFlags => usize, minimum_learning_ratio, 256,
    "Reservations per cancellation needed to keep learning (default: 256)");
define_flag!(MonitorFlags => usize, max_monitors, 0,
    "Maximum number of monitor records, 0 for no limit (default: 0)");
define_flag!(MonitorFlags => bool, lock_statistics, false,
    "Collect per-monitor spin statistics (default: false)");
define_flag!(MonitorFlags => usize, blocking_backoff_cap_ms, 64,
    "Longest wait between lock word checks of a blocked thread, in ms (default: 64)");

/// Parameters of one bounded spin. Read once per spin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinOptions {
    pub spins1: usize,
    pub spins2: usize,
    pub yields: usize,
    pub nested: bool,
}

impl SpinOptions {
    /// A spin that gives up right away.
    pub const NONE: Self = Self {
        spins1: 1,
        spins2: 1,
        yields: 1,
        nested: false,
    };
}

/// Per-class replacement for both global spin configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomSpinOptions {
    /// Used by the spin on a flat lock.
    pub flat: SpinOptions,
    /// Used by the spin on an inflated monitor.
    pub try_enter: SpinOptions,
}

/// Thresholds of the reservation heuristic, read once per decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationOptions {
    pub enabled: bool,
    pub transition_threshold: usize,
    pub absolute_threshold: usize,
    pub minimum_reserved_ratio: usize,
    pub cancel_absolute_threshold: usize,
    pub minimum_learning_ratio: usize,
}

struct AtomicSpinOptions {
    spins1: AtomicUsize,
    spins2: AtomicUsize,
    yields: AtomicUsize,
    nested: AtomicBool,
}

impl AtomicSpinOptions {
    fn new(options: SpinOptions) -> Self {
        Self {
            spins1: AtomicUsize::new(options.spins1),
            spins2: AtomicUsize::new(options.spins2),
            yields: AtomicUsize::new(options.yields),
            nested: AtomicBool::new(options.nested),
        }
    }

    fn load(&self) -> SpinOptions {
        SpinOptions {
            spins1: self.spins1.load(Ordering::Relaxed),
            spins2: self.spins2.load(Ordering::Relaxed),
            yields: self.yields.load(Ordering::Relaxed),
            nested: self.nested.load(Ordering::Relaxed),
        }
    }

    fn store(&self, options: SpinOptions) {
        self.spins1.store(options.spins1, Ordering::Relaxed);
        self.spins2.store(options.spins2, Ordering::Relaxed);
        self.yields.store(options.yields, Ordering::Relaxed);
        self.nested.store(options.nested, Ordering::Relaxed);
    }
}

/// Live tuning values of the monitor subsystem. Every value may be changed while threads
/// are locking; users take a snapshot per operation.
pub struct MonitorOptions {
    flat_spin: AtomicSpinOptions,
    try_enter_spin: AtomicSpinOptions,
    max_spin_threads: AtomicUsize,
    global_lock_reservation: AtomicBool,
    reserved_transition_threshold: AtomicUsize,
    reserved_absolute_threshold: AtomicUsize,
    minimum_reserved_ratio: AtomicUsize,
    cancel_absolute_threshold: AtomicUsize,
    minimum_learning_ratio: AtomicUsize,
    max_monitors: AtomicUsize,
    lock_statistics: AtomicBool,
    blocking_backoff_cap_ms: AtomicUsize,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            flat_spin: AtomicSpinOptions::new(SpinOptions {
                spins1: 256,
                spins2: 32,
                yields: 45,
                nested: true,
            }),
            try_enter_spin: AtomicSpinOptions::new(SpinOptions {
                spins1: 256,
                spins2: 32,
                yields: 45,
                nested: true,
            }),
            max_spin_threads: AtomicUsize::new(0),
            global_lock_reservation: AtomicBool::new(false),
            reserved_transition_threshold: AtomicUsize::new(1),
            reserved_absolute_threshold: AtomicUsize::new(10),
            minimum_reserved_ratio: AtomicUsize::new(1024),
            cancel_absolute_threshold: AtomicUsize::new(10),
            minimum_learning_ratio: AtomicUsize::new(256),
            max_monitors: AtomicUsize::new(0),
            lock_statistics: AtomicBool::new(false),
            blocking_backoff_cap_ms: AtomicUsize::new(64),
        }
    }
}

impl MonitorOptions {
    /// Build options from the values of [`MonitorFlags`], as parsed by
    /// [`flags::parse`](crate::utils::flags::parse).
    pub fn from_flags() -> Result<Self, String> {
        let flat_spin = SpinOptions {
            spins1: monitorflags_thr_max_spins1_before_blocking(),
            spins2: monitorflags_thr_max_spins2_before_blocking(),
            yields: monitorflags_thr_max_yields_before_blocking(),
            nested: monitorflags_thr_nested_spinning(),
        };
        let try_enter_spin = SpinOptions {
            spins1: monitorflags_thr_max_try_enter_spins1_before_blocking(),
            spins2: monitorflags_thr_max_try_enter_spins2_before_blocking(),
            yields: monitorflags_thr_max_try_enter_yields_before_blocking(),
            nested: monitorflags_thr_try_enter_nested_spinning(),
        };

        for (what, spin) in [("flat lock", flat_spin), ("try-enter", try_enter_spin)] {
            if spin.spins1 == 0 || spin.spins2 == 0 || spin.yields == 0 {
                return Err(format!(
                    "{} spin counts must be at least 1: {:?}",
                    what, spin
                ));
            }
        }

        if monitorflags_reserved_transition_threshold() == 0 {
            return Err("reserved transition threshold cannot be zero".to_owned());
        }

        let backoff_cap = monitorflags_blocking_backoff_cap_ms();
        if backoff_cap == 0 {
            return Err("blocking backoff cap cannot be zero".to_owned());
        }

        let options = Self::default();
        options.flat_spin.store(flat_spin);
        options.try_enter_spin.store(try_enter_spin);
        options.set_max_spin_threads(monitorflags_max_spin_threads());
        options.set_reservation(ReservationOptions {
            enabled: monitorflags_global_lock_reservation(),
            transition_threshold: monitorflags_reserved_transition_threshold(),
            absolute_threshold: monitorflags_reserved_absolute_threshold(),
            minimum_reserved_ratio: monitorflags_minimum_reserved_ratio(),
            cancel_absolute_threshold: monitorflags_cancel_absolute_threshold(),
            minimum_learning_ratio: monitorflags_minimum_learning_ratio(),
        });
        options.set_max_monitors(monitorflags_max_monitors());
        options.set_lock_statistics(monitorflags_lock_statistics());
        options
            .blocking_backoff_cap_ms
            .store(backoff_cap, Ordering::Relaxed);

        Ok(options)
    }

    pub fn flat_spin(&self) -> SpinOptions {
        self.flat_spin.load()
    }

    pub fn set_flat_spin(&self, options: SpinOptions) {
        self.flat_spin.store(options);
    }

    pub fn try_enter_spin(&self) -> SpinOptions {
        self.try_enter_spin.load()
    }

    pub fn set_try_enter_spin(&self, options: SpinOptions) {
        self.try_enter_spin.store(options);
    }

    pub fn max_spin_threads(&self) -> usize {
        self.max_spin_threads.load(Ordering::Relaxed)
    }

    pub fn set_max_spin_threads(&self, max: usize) {
        self.max_spin_threads.store(max, Ordering::Relaxed);
    }

    pub fn reservation(&self) -> ReservationOptions {
        ReservationOptions {
            enabled: self.global_lock_reservation.load(Ordering::Relaxed),
            transition_threshold: self.reserved_transition_threshold.load(Ordering::Relaxed),
            absolute_threshold: self.reserved_absolute_threshold.load(Ordering::Relaxed),
            minimum_reserved_ratio: self.minimum_reserved_ratio.load(Ordering::Relaxed),
            cancel_absolute_threshold: self.cancel_absolute_threshold.load(Ordering::Relaxed),
            minimum_learning_ratio: self.minimum_learning_ratio.load(Ordering::Relaxed),
        }
    }

    pub fn set_reservation(&self, options: ReservationOptions) {
        self.global_lock_reservation
            .store(options.enabled, Ordering::Relaxed);
        self.reserved_transition_threshold
            .store(options.transition_threshold.max(1), Ordering::Relaxed);
        self.reserved_absolute_threshold
            .store(options.absolute_threshold, Ordering::Relaxed);
        self.minimum_reserved_ratio
            .store(options.minimum_reserved_ratio, Ordering::Relaxed);
        self.cancel_absolute_threshold
            .store(options.cancel_absolute_threshold, Ordering::Relaxed);
        self.minimum_learning_ratio
            .store(options.minimum_learning_ratio, Ordering::Relaxed);
    }

    pub fn set_global_lock_reservation(&self, enabled: bool) {
        self.global_lock_reservation
            .store(enabled, Ordering::Relaxed);
    }

    pub fn max_monitors(&self) -> usize {
        self.max_monitors.load(Ordering::Relaxed)
    }

    pub fn set_max_monitors(&self, max: usize) {
        self.max_monitors.store(max, Ordering::Relaxed);
    }

    pub fn lock_statistics(&self) -> bool {
        self.lock_statistics.load(Ordering::Relaxed)
    }

    pub fn set_lock_statistics(&self, enabled: bool) {
        self.lock_statistics.store(enabled, Ordering::Relaxed);
    }

    pub fn blocking_backoff_cap_ms(&self) -> u64 {
        self.blocking_backoff_cap_ms.load(Ordering::Relaxed) as u64
    }

    pub fn set_blocking_backoff_cap_ms(&self, cap: u64) {
        self.blocking_backoff_cap_ms
            .store(cap.max(1) as usize, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_default_to_builtin_values() {
        let options = MonitorOptions::from_flags().expect("default flags are valid");
        let defaults = MonitorOptions::default();

        assert_eq!(options.flat_spin(), defaults.flat_spin());
        assert_eq!(options.try_enter_spin(), defaults.try_enter_spin());
        assert_eq!(options.reservation(), defaults.reservation());
        assert!(!options.reservation().enabled);
        assert_eq!(options.blocking_backoff_cap_ms(), 64);
    }

    #[test]
    fn snapshots_see_retuned_values() {
        let options = MonitorOptions::default();
        let before = options.flat_spin();
        options.set_flat_spin(SpinOptions::NONE);

        assert_eq!(before.spins1, 256);
        assert_eq!(options.flat_spin(), SpinOptions::NONE);

        let mut reservation = options.reservation();
        reservation.transition_threshold = 0;
        options.set_reservation(reservation);
        assert_eq!(options.reservation().transition_threshold, 1);
    }
}
