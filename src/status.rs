// Part of ethercat-motion. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Status snapshots published by the cyclic worker.
//!
//! A snapshot reflects the end of some cycle; the publisher never emits a
//! partially updated record.  Transport is latest-wins: readers only care
//! about the most recent snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::master::{DomainState, WcState};

/// Health of one canonical object in the process-data mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PdoHealth {
    /// Present in the offset map; maintained via PDO.
    Mapped,
    /// Absent; the engine falls back to SDO for this object.
    Missing,
    /// Mapped but the last domain access failed.
    Error,
}

/// Runtime per-drive failures; recorded in status, never fatal to the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// 0x6061 never confirmed the commanded mode within the attempt budget.
    ModeVerifyTimeout,
    /// PP target made no progress through the full rescue budget.
    PpStall,
    /// 0x60B8 readback kept disagreeing after the retry budget.
    ProbeArmMismatch,
    HomingFailed,
    HomingTimeout,
    /// A staged parameter write (e.g. PREOP-only object) was refused.
    ParameterStaging,
}

/// Progress of the homing sequence as visible to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HomingProgress {
    Idle,
    InProgress,
    Complete,
    Failed,
}

/// Snapshot of one drive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriveStatus {
    /// Slave reached EtherCAT OP state.
    pub in_op: bool,
    pub al_state: u8,
    /// CiA 402 power stage reports Operation Enabled.
    pub enabled: bool,
    pub statusword: Option<u16>,
    pub mode_display: Option<i8>,
    pub mode_verified: bool,
    /// Actual position, user units.
    pub position_actual: Option<f64>,
    pub position_actual_pulses: Option<i32>,
    /// Actual velocity, user units/s.
    pub velocity_actual: Option<f64>,
    pub velocity_actual_pulses: Option<i32>,
    pub probe_active: bool,
    pub probe_status: Option<u16>,
    /// Latched capture on the positive edge (0x60BA), pulses.
    pub probe_pos_positive: Option<i32>,
    /// Latched capture on the negative edge (0x60BB/0x60BC), pulses.
    pub probe_pos_negative: Option<i32>,
    pub digital_inputs: Option<u32>,
    /// Drive error code (0x603F) when the drive reports a fault.
    pub fault_code: Option<u16>,
    pub fault: bool,
    pub homing: HomingProgress,
    pub last_failure: Option<FailureKind>,
    /// Capability flags derived from the ESI decode.
    pub features: DriveFeatures,
    /// Canonical object -> PDO health.
    pub pdo_health: BTreeMap<u16, PdoHealth>,
    pub op_dropouts: u32,
}

impl Default for HomingProgress {
    fn default() -> Self {
        HomingProgress::Idle
    }
}

/// Capability flags for one drive, from the ESI decode plus overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveFeatures {
    pub controlword_in_pdo: bool,
    pub statusword_in_pdo: bool,
    pub mode_command_in_pdo: bool,
    pub mode_display_in_pdo: bool,
    pub touch_probe: bool,
}

/// Timing diagnostics for the cyclic loop.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CycleStats {
    pub last_cycle_us: i64,
    pub last_jitter_us: i64,
    pub max_abs_jitter_us: i64,
    pub deadline_misses: u64,
}

/// Immutable network-wide snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStatus {
    /// Monotonic time of the snapshot, nanoseconds since worker start.
    pub timestamp_ns: u64,
    pub cycle_time_ms: f64,
    pub sdo_only: bool,
    pub cycle_count: u64,
    pub domain: DomainState,
    pub stats: CycleStats,
    pub all_op: bool,
    pub drives: BTreeMap<u16, DriveStatus>,
}

impl NetworkStatus {
    pub fn drive(&self, pos: u16) -> Option<&DriveStatus> {
        self.drives.get(&pos)
    }

    pub fn domain_complete(&self) -> bool {
        self.domain.wc_state == WcState::Complete
    }
}
