// Part of ethercat-motion. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Network and per-drive configuration.
//!
//! All records are plain data, constructed by the application and immutable
//! after [`Manager::start`](crate::Manager::start).  The supervisor ships the
//! whole `NetworkConfig` to the worker process as the first command frame.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cia402::OperationMode;
use crate::esi::EsiDevice;
use crate::master::PdoConfig;

/// Process-wide network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub master_index: u32,
    /// Cycle period in milliseconds; typically 1-10.
    pub cycle_time_ms: f64,
    /// SDO-only mode: no domain, no cyclic PDO exchange.
    pub sdo_only: bool,
    /// Run the worker against the in-memory simulated master.
    pub simulate: bool,
    /// Time budget for all slaves to reach OP after activation.
    pub op_timeout_s: f64,
    /// Pacing between CiA 402 enable transitions.
    pub enable_transition_ms: u64,
    /// Clear drive faults without an explicit `ClearFault` command.
    pub auto_clear_fault: bool,
    /// Statusword mask for PP "set-point acknowledged" (vendor-variable).
    pub pp_ack_mask: u16,
    pub pp_ack_timeout_ms: u64,
    /// No observed motion for this long marks a PP move as stalled.
    pub pp_stall_window_ms: u64,
    /// Minimum position advance (pulses) that counts as motion.
    pub pp_stall_min_delta: i32,
    /// Minimum spacing between two bit-4 rescues for the same target.
    pub bit4_cycle_interval_ms: u64,
    /// Rescue budget per target before `PpStall` is reported.
    pub pp_max_rescues: u32,
    pub mode_verify_attempts: u32,
    pub mode_verify_interval_ms: u64,
    /// Length of the probe disable-first transition window.
    pub probe_transition_ms: u64,
    /// Re-runs of the disable-first sequence on readback mismatch.
    pub probe_arm_retries: u32,
    pub device_path: PathBuf,
    /// On a busy master at startup, try to dislodge the holder once.
    pub preflight_release: bool,
    pub preflight_delay_ms: u64,
    /// Bounded join at `stop` before the worker is force-terminated.
    pub stop_join_ms: u64,
    pub status_period_ms: u64,
    /// Commands drained from the queue per cycle.
    pub command_drain_budget: usize,
    /// Explicit DC reference slave; defaults to the first DC-enabled drive.
    pub dc_reference_slave: Option<u16>,
    /// Ordered drive list; bus position order.
    pub drives: Vec<DriveConfig>,
}

impl NetworkConfig {
    pub fn new(master_index: u32, drives: Vec<DriveConfig>) -> Self {
        Self {
            master_index,
            cycle_time_ms: 5.0,
            sdo_only: false,
            simulate: false,
            op_timeout_s: 10.0,
            enable_transition_ms: 100,
            auto_clear_fault: false,
            pp_ack_mask: 0x1000,
            pp_ack_timeout_ms: 500,
            pp_stall_window_ms: 500,
            pp_stall_min_delta: 1,
            bit4_cycle_interval_ms: 300,
            pp_max_rescues: 16,
            mode_verify_attempts: 5,
            mode_verify_interval_ms: 200,
            probe_transition_ms: 50,
            probe_arm_retries: 1,
            device_path: PathBuf::from("/dev/EtherCAT0"),
            preflight_release: false,
            preflight_delay_ms: 1000,
            stop_join_ms: 2000,
            status_period_ms: 50,
            command_drain_budget: 16,
            dc_reference_slave: None,
            drives,
        }
    }

    pub fn cycle_time_ns(&self) -> u64 {
        (self.cycle_time_ms * 1_000_000.0) as u64
    }

    pub fn drive(&self, pos: u16) -> Option<&DriveConfig> {
        self.drives.iter().find(|d| d.position == pos)
    }

    /// Sanity checks done before anything touches the bus.
    pub fn validate(&self) -> crate::Result<()> {
        if self.cycle_time_ms <= 0.0 {
            return Err(crate::Error::InvalidConfig("cycle_time_ms must be > 0".into()));
        }
        for d in &self.drives {
            if d.esi.is_none() && d.pdo.is_none() && !self.sdo_only {
                return Err(crate::Error::InvalidConfig(format!(
                    "drive {}: needs an ESI reference or explicit PDO mapping",
                    d.position
                )));
            }
            if self.drives.iter().filter(|o| o.position == d.position).count() > 1 {
                return Err(crate::Error::InvalidConfig(format!(
                    "duplicate drive position {}",
                    d.position
                )));
            }
        }
        Ok(())
    }
}

/// Where the drive's PDO layout and feature flags come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EsiRef {
    /// Path to the vendor's ESI XML; decoded at worker startup.
    File(PathBuf),
    /// Pre-decoded device description.
    Device(EsiDevice),
}

/// Explicit PDO mapping override; replaces the ESI-derived mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PdoSelection {
    pub rx: Vec<PdoConfig>,
    pub tx: Vec<PdoConfig>,
}

/// Distributed-clock settings for one slave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcConfig {
    /// AssignActivate word; 0x0300 = SYNC0, 0x0700 = SYNC0+SYNC1.
    pub assign_activate: u16,
    /// SYNC0 cycle; defaults to the network cycle when `None`.
    pub sync0_cycle_ns: Option<u32>,
    pub sync0_shift_ns: i32,
    pub sync1_cycle_ns: u32,
    pub sync1_shift_ns: i32,
}

impl Default for DcConfig {
    fn default() -> Self {
        Self {
            assign_activate: 0x0300,
            sync0_cycle_ns: None,
            sync0_shift_ns: 0,
            sync1_cycle_ns: 0,
            sync1_shift_ns: 0,
        }
    }
}

/// Homing parameters staged over SDO before the HM mode switch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HomingConfig {
    pub method: Option<i8>,
    /// Speed during search for switch, user units/s.
    pub search_velocity: Option<f64>,
    /// Speed during search for zero, user units/s.
    pub zero_velocity: Option<f64>,
    pub acceleration: Option<f64>,
    /// Home offset (0x607C), user units.
    pub offset: Option<f64>,
    pub timeout_s: f64,
}

impl HomingConfig {
    pub fn with_method(method: i8) -> Self {
        Self {
            method: Some(method),
            timeout_s: 30.0,
            ..Self::default()
        }
    }
}

/// Conversion between drive pulses and user units.
///
/// Position/velocity values on the command and status surfaces are user
/// units; everything on the wire is pulses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UnitConversion {
    pub pulses_per_unit: f64,
    pub scale_factor: f64,
}

impl Default for UnitConversion {
    fn default() -> Self {
        Self {
            pulses_per_unit: 1.0,
            scale_factor: 1.0,
        }
    }
}

impl UnitConversion {
    pub fn to_pulses(&self, user: f64) -> i32 {
        let p = user * self.pulses_per_unit * self.scale_factor;
        p.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32
    }

    pub fn to_pulses_unsigned(&self, user: f64) -> u32 {
        let p = (user * self.pulses_per_unit * self.scale_factor).abs();
        p.round().min(u32::MAX as f64) as u32
    }

    pub fn from_pulses(&self, pulses: i32) -> f64 {
        pulses as f64 / (self.pulses_per_unit * self.scale_factor)
    }
}

/// Settings for an external jerk-limited trajectory generator.
///
/// The engine does not generate trajectories; a streaming planner feeds CSP
/// targets through the ordinary command queue.  These limits are carried so
/// such a collaborator can read them from the same configuration record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JerkLimitSettings {
    pub enabled: bool,
    pub max_velocity: f64,
    pub max_acceleration: f64,
    pub max_jerk: f64,
}

/// Rotation polarity; written to vendor polarity objects where supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Polarity {
    Forward,
    Reversed,
}

/// Per-slave configuration, immutable after start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Absolute ring position.
    pub position: u16,
    pub alias: u16,
    pub vendor_id: u32,
    pub product_code: u32,
    pub esi: Option<EsiRef>,
    /// Explicit rx/tx PDO override; wins over the ESI mapping.
    pub pdo: Option<PdoSelection>,
    pub dc: Option<DcConfig>,
    pub units: UnitConversion,
    /// Default mode applied at startup, before any command.
    pub initial_mode: Option<OperationMode>,
    pub profile_velocity: Option<f64>,
    pub profile_acceleration: Option<f64>,
    pub polarity: Option<Polarity>,
    /// Informational; the object for this is vendor-specific, so drives
    /// that need it staged take it through `startup_sdos`.
    pub inertia_ratio: Option<f64>,
    /// (min, max) software limits in user units.
    pub software_limits: Option<(f64, f64)>,
    /// Velocity command cap, user units/s.
    pub max_velocity: Option<f64>,
    pub homing: Option<HomingConfig>,
    pub jerk_limits: Option<JerkLimitSettings>,
    /// Negative-edge probe position object; ESI-driven when `None`.
    pub probe_neg_index: Option<u16>,
    /// SDOs written by the master during the transition to OP.
    pub startup_sdos: Vec<(u16, u8, Vec<u8>)>,
}

impl DriveConfig {
    pub fn new(position: u16, vendor_id: u32, product_code: u32) -> Self {
        Self {
            position,
            alias: 0,
            vendor_id,
            product_code,
            esi: None,
            pdo: None,
            dc: None,
            units: UnitConversion::default(),
            initial_mode: None,
            profile_velocity: None,
            profile_acceleration: None,
            polarity: None,
            inertia_ratio: None,
            software_limits: None,
            max_velocity: None,
            homing: None,
            jerk_limits: None,
            probe_neg_index: None,
            startup_sdos: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_conversion_roundtrip() {
        let u = UnitConversion {
            pulses_per_unit: 1000.0,
            scale_factor: 1.0,
        };
        assert_eq!(u.to_pulses(2.5), 2500);
        assert_eq!(u.to_pulses(-0.25), -250);
        assert!((u.from_pulses(2500) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn config_defaults_match_canonical_values() {
        let cfg = NetworkConfig::new(0, vec![]);
        assert_eq!(cfg.pp_ack_mask, 0x1000);
        assert_eq!(cfg.enable_transition_ms, 100);
        assert_eq!(cfg.bit4_cycle_interval_ms, 300);
        assert_eq!(cfg.pp_max_rescues, 16);
        assert_eq!(cfg.cycle_time_ns(), 5_000_000);
        assert_eq!(cfg.device_path, PathBuf::from("/dev/EtherCAT0"));
    }

    #[test]
    fn validate_rejects_unmapped_drive() {
        let mut cfg = NetworkConfig::new(0, vec![DriveConfig::new(0, 0x1, 0x2)]);
        assert!(cfg.validate().is_err());
        cfg.sdo_only = true;
        assert!(cfg.validate().is_ok());
    }
}
