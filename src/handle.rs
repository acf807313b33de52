// Part of ethercat-motion. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Non-blocking drive facade.
//!
//! Every mutating call enqueues a [`Command`] and returns immediately; a
//! full command queue surfaces as [`Error::QueueFull`].  Getters read the
//! supervisor's status cache, which the reader thread refreshes at the
//! worker's publish cadence; no call ever waits for the wire.

use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;

use crate::command::{Command, ProbeEdge};
use crate::config::UnitConversion;
use crate::status::{DriveStatus, FailureKind, HomingProgress, NetworkStatus};
use crate::{Error, Result};

#[derive(Clone)]
pub struct DriveHandle {
    pos: u16,
    units: UnitConversion,
    commands: Sender<Command>,
    latest: Arc<Mutex<Option<NetworkStatus>>>,
}

impl DriveHandle {
    pub(crate) fn new(
        pos: u16,
        units: UnitConversion,
        commands: Sender<Command>,
        latest: Arc<Mutex<Option<NetworkStatus>>>,
    ) -> Self {
        Self {
            pos,
            units,
            commands,
            latest,
        }
    }

    pub fn position(&self) -> u16 {
        self.pos
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.commands.try_send(cmd).map_err(|_| Error::QueueFull)
    }

    // Mode control.

    pub fn set_velocity_mode(&self) -> Result<()> {
        self.send(Command::SetVelocityMode { drive: self.pos })
    }

    pub fn set_position_mode(&self) -> Result<()> {
        self.send(Command::SetPositionMode { drive: self.pos })
    }

    pub fn set_csp_mode(&self) -> Result<()> {
        self.send(Command::SetCspMode { drive: self.pos })
    }

    pub fn set_homing_mode(&self) -> Result<()> {
        self.send(Command::SetHomingMode { drive: self.pos })
    }

    // Motion.

    /// Target velocity in user units/s (clamped by the configured cap).
    pub fn set_velocity(&self, velocity: f64) -> Result<()> {
        self.send(Command::SetVelocity {
            drive: self.pos,
            velocity,
        })
    }

    /// Absolute PP move target in user units.
    pub fn set_position_absolute(&self, position: f64) -> Result<()> {
        self.send(Command::SetPosition {
            drive: self.pos,
            position,
        })
    }

    /// Streaming CSP target in user units.
    pub fn set_position_csp(&self, position: f64) -> Result<()> {
        self.send(Command::SetPositionCsp {
            drive: self.pos,
            position,
        })
    }

    pub fn stop_motion(&self) -> Result<()> {
        self.send(Command::StopMotion { drive: self.pos })
    }

    // Probe, fault, homing, power.

    pub fn arm_probe(&self, edge: ProbeEdge) -> Result<()> {
        self.send(Command::ArmProbe {
            drive: self.pos,
            edge,
        })
    }

    pub fn disable_probe(&self) -> Result<()> {
        self.send(Command::DisableProbe { drive: self.pos })
    }

    pub fn clear_fault(&self) -> Result<()> {
        self.send(Command::ClearFault { drive: self.pos })
    }

    pub fn start_homing(&self) -> Result<()> {
        self.send(Command::StartHoming { drive: self.pos })
    }

    pub fn enable(&self) -> Result<()> {
        self.send(Command::EnableDrive { drive: self.pos })
    }

    pub fn disable(&self) -> Result<()> {
        self.send(Command::DisableDrive { drive: self.pos })
    }

    // Status getters, backed by the cached snapshot.

    fn with_status<T>(&self, f: impl FnOnce(&DriveStatus) -> T) -> Option<T> {
        let guard = self.latest.lock().unwrap();
        guard.as_ref().and_then(|s| s.drive(self.pos)).map(f)
    }

    pub fn status(&self) -> Option<DriveStatus> {
        self.with_status(|d| d.clone())
    }

    pub fn statusword(&self) -> Option<u16> {
        self.with_status(|d| d.statusword).flatten()
    }

    pub fn mode_display(&self) -> Option<i8> {
        self.with_status(|d| d.mode_display).flatten()
    }

    pub fn mode_verified(&self) -> bool {
        self.with_status(|d| d.mode_verified).unwrap_or(false)
    }

    /// Actual position in user units.
    pub fn position_actual(&self) -> Option<f64> {
        self.with_status(|d| d.position_actual).flatten()
    }

    /// Actual velocity in user units/s.
    pub fn velocity_actual(&self) -> Option<f64> {
        self.with_status(|d| d.velocity_actual).flatten()
    }

    pub fn is_enabled(&self) -> bool {
        self.with_status(|d| d.enabled).unwrap_or(false)
    }

    pub fn in_op(&self) -> bool {
        self.with_status(|d| d.in_op).unwrap_or(false)
    }

    pub fn fault_code(&self) -> Option<u16> {
        self.with_status(|d| d.fault_code).flatten()
    }

    pub fn probe_active(&self) -> bool {
        self.with_status(|d| d.probe_active).unwrap_or(false)
    }

    /// Latched probe captures in user units (positive edge, negative edge).
    pub fn probe_positions(&self) -> (Option<f64>, Option<f64>) {
        self.with_status(|d| {
            (
                d.probe_pos_positive.map(|p| self.units.from_pulses(p)),
                d.probe_pos_negative.map(|p| self.units.from_pulses(p)),
            )
        })
        .unwrap_or((None, None))
    }

    pub fn digital_inputs(&self) -> Option<u32> {
        self.with_status(|d| d.digital_inputs).flatten()
    }

    pub fn homing_progress(&self) -> HomingProgress {
        self.with_status(|d| d.homing).unwrap_or(HomingProgress::Idle)
    }

    pub fn last_failure(&self) -> Option<FailureKind> {
        self.with_status(|d| d.last_failure).flatten()
    }
}
