//! Object monitors for a managed runtime: lock words with flat, reserved and learning
//! states, inflation to native monitors, and the hooks a moving collector needs.
//!
//! [`MonitorSystem`] is the entry point. Every operation takes the calling [`Thread`],
//! which must hold execution permission.
//!
//! [`Thread`]: runtime::threads::Thread

pub mod compiler;
pub mod gc;
pub mod mock;
pub mod objectmodel;
pub mod runtime;
pub mod sync;
pub mod utils;

pub use runtime::{
    EnterStatus, LockAddress, MonitorError, MonitorEvent, MonitorStatistics, MonitorSystem,
    MonitorSystemBuilder, Runtime,
};
pub use sync::WaitResult;
