#![cfg_attr(target_os = "none", no_std)]

//! Destructive erase/program/verify endurance testing for NOR flash.
//!
//! [`EnduranceTest`] cycles a chip until it meets one of the end-of-life criteria,
//! persisting its state to the chip's first block after every erase so that the run
//! survives power loss. The chip is reached only through [`FlashDevice`], time through
//! [`Clock`], and the status panel through [`Display`].

extern crate alloc;

pub mod api;
pub use api::*;

pub mod checkpoint;
pub mod cycle;
pub mod degradation;
pub mod display;
pub mod eol;
pub mod faults;
pub mod pattern;
pub mod runner;
pub mod storage;

#[cfg(any(test, feature = "hosted"))]
pub mod hosted;

pub use checkpoint::Checkpoint;
pub use cycle::CycleReport;
pub use display::{Display, LogDisplay, NullDisplay};
pub use eol::EolReason;
pub use faults::{FaultInjector, NoFaults, SeededFaults};
pub use runner::EnduranceTest;
pub use storage::{Clock, DeviceInfo, FlashDevice, FlashError};
