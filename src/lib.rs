// Part of ethercat-motion. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! CiA 402 motion manager for the IgH EtherCAT master.
//!
//! An application constructs a [`NetworkConfig`], starts a [`Manager`] and
//! talks to drives through non-blocking [`DriveHandle`]s; the manager owns an
//! isolated worker process whose cyclic engine realises every intent on the
//! wire with correct ordering, timing, retries and vendor workarounds.
//!
//! ```no_run
//! use ethercat_motion::{DriveConfig, Manager, NetworkConfig, ProbeEdge};
//!
//! fn main() -> ethercat_motion::Result<()> {
//!     // Turns the re-executed child into the cyclic worker.
//!     ethercat_motion::worker_check();
//!
//!     let mut drive = DriveConfig::new(0, 0x0000_0A1B, 0x0000_5081);
//!     drive.esi = Some(ethercat_motion::EsiRef::File("servo.xml".into()));
//!     let cfg = NetworkConfig::new(0, vec![drive]);
//!
//!     let mut manager = Manager::start(cfg)?;
//!     let axis = manager.drive(0)?;
//!     axis.set_velocity_mode()?;
//!     axis.set_velocity(2_000.0)?;
//!     axis.arm_probe(ProbeEdge::Positive)?;
//!     // ... poll axis.position_actual() / axis.statusword() ...
//!     manager.stop()?;
//!     Ok(())
//! }
//! ```
//!
//! Deployment prerequisites (not configured here): the worker should run
//! with SCHED_FIFO priority on an isolated CPU, with the NIC IRQ priority
//! strictly above it.  Exactly one process may hold a master at a time.

pub mod cia402;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod esi;
pub mod handle;
pub mod intent;
pub mod master;
pub mod status;
pub mod supervisor;
pub mod transport;

pub use crate::command::{Command, ProbeEdge};
pub use crate::config::{
    DcConfig, DriveConfig, EsiRef, HomingConfig, JerkLimitSettings, NetworkConfig, PdoSelection,
    Polarity, UnitConversion,
};
pub use crate::engine::CyclicEngine;
pub use crate::error::{Error, Result};
pub use crate::handle::DriveHandle;
pub use crate::master::MasterAccess;
pub use crate::status::{DriveStatus, FailureKind, NetworkStatus, PdoHealth};
pub use crate::supervisor::{worker_check, Manager};
