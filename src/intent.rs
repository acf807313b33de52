// Part of ethercat-motion. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Per-drive intent records.
//!
//! A [`DriveIntent`] is owned exclusively by the cyclic engine.  Every
//! retrying behaviour (mode verification, probe disable-first transition,
//! PP stall rescue, the CiA 402 enable walk) is a small state machine
//! advanced once per cycle, carrying its own deadline and attempt counter,
//! so the loop never blocks.

use std::time::Instant;

use crate::cia402::OperationMode;
use crate::status::FailureKind;

/// Mode intent: keep writing 0x6060 until 0x6061 confirms it.
#[derive(Debug)]
pub struct ModeIntent {
    pub mode: OperationMode,
    pub verified: bool,
    pub failed: bool,
    pub attempts: u32,
    pub next_attempt: Instant,
    /// Last value and time sent over SDO, for the fallback throttle.
    pub last_sdo: Option<(i8, Instant)>,
}

impl ModeIntent {
    pub fn new(mode: OperationMode, now: Instant, interval_ms: u64) -> Self {
        Self {
            mode,
            verified: false,
            failed: false,
            attempts: 0,
            next_attempt: now + std::time::Duration::from_millis(interval_ms),
            last_sdo: None,
        }
    }

    /// Still actively writing 0x6060.
    pub fn maintaining(&self) -> bool {
        !self.verified && !self.failed
    }
}

/// One-cycle bit-4 rescue: clear for a cycle, then re-assert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescuePhase {
    /// Bit 4 held low this cycle.
    Clearing,
}

/// Profile-position target with latch strobe, ack watchdog and stall rescue.
#[derive(Debug)]
pub struct PositionIntent {
    /// Target in pulses.
    pub target: i32,
    /// Last target actually written to 0x607A (change detection).
    pub applied: Option<i32>,
    /// Assert controlword bit 4 in the next composed word, for one cycle.
    pub pulse_due: bool,
    pub rescue: Option<RescuePhase>,
    pub ack_pending: bool,
    pub ack_deadline: Instant,
    pub ack_timed_out: bool,
    /// Time and position of the last observed motion.
    pub motion_at: Instant,
    pub motion_pos: Option<i32>,
    pub last_rescue: Option<Instant>,
    pub rescues: u32,
    pub failed: bool,
}

impl PositionIntent {
    pub fn new(target: i32, now: Instant) -> Self {
        Self {
            target,
            applied: None,
            pulse_due: false,
            rescue: None,
            ack_pending: false,
            ack_deadline: now,
            ack_timed_out: false,
            motion_at: now,
            motion_pos: None,
            last_rescue: None,
            rescues: 0,
            failed: false,
        }
    }

    /// New target from the application: rearm everything.
    pub fn retarget(&mut self, target: i32, now: Instant) {
        if target != self.target || self.applied.is_none() {
            self.target = target;
            self.applied = None;
            self.pulse_due = false;
            self.rescue = None;
            self.ack_pending = false;
            self.ack_timed_out = false;
            self.motion_at = now;
            self.motion_pos = None;
            self.last_rescue = None;
            self.rescues = 0;
            self.failed = false;
        }
    }
}

/// Touch-probe arm sequence.  A change of function value always goes through
/// a disable-first transition: 0x0000, a quiet window, then the new value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeArm {
    Idle,
    /// 0x0000 written; no probe writes until `resume_at`.
    DisableWait {
        value: u16,
        resume_at: Instant,
        retries: u32,
    },
    /// Value written; awaiting a matching readback until `deadline`.
    Verify {
        value: u16,
        deadline: Instant,
        retries: u32,
    },
    /// Latched and held; nothing is rewritten.
    Armed { value: u16 },
    Failed,
}

/// Homing sequence: stage parameters over SDO, switch to HM, strobe bit 4,
/// then watch the statusword homing bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingState {
    Idle,
    /// Staging parameter `step` (0 = method .. 4 = offset) via SDO.
    Staging { step: u8 },
    /// Parameters staged; waiting for the HM mode intent to verify.
    AwaitMode,
    /// Start strobe issued; homing runs until `deadline`.
    InProgress { deadline: Instant },
    Complete,
    Failed,
}

/// CiA 402 power walk bookkeeping.
#[derive(Debug)]
pub struct PowerTracker {
    /// Controlword the walk wants on the wire this cycle.
    pub commanded: Option<u16>,
    pub last_transition: Option<Instant>,
    pub fault_reset_attempts: u32,
    pub enabled: bool,
}

impl PowerTracker {
    pub fn new() -> Self {
        Self {
            commanded: None,
            last_transition: None,
            fault_reset_attempts: 0,
            enabled: false,
        }
    }

    pub fn paced(&self, now: Instant, period_ms: u64) -> bool {
        match self.last_transition {
            Some(t) => now.duration_since(t).as_millis() as u64 >= period_ms,
            None => true,
        }
    }

    pub fn reset(&mut self) {
        self.commanded = None;
        self.last_transition = None;
        self.fault_reset_attempts = 0;
        self.enabled = false;
    }
}

/// Everything the engine maintains for one drive.
#[derive(Debug)]
pub struct DriveIntent {
    pub mode: Option<ModeIntent>,
    /// Velocity intent in pulses (already clamped).
    pub velocity: Option<i32>,
    /// PP target bookkeeping.
    pub position: Option<PositionIntent>,
    /// CSP streaming target in pulses.
    pub csp_target: Option<i32>,
    /// Last value and time 0x60FF went out over SDO (fallback throttle).
    pub velocity_sdo: Option<(i32, Instant)>,
    /// One-shot SDO fallback marker for 0x607A.
    pub position_sdo_done: bool,
    /// Requested probe function value; consumed by the arm sequence.
    pub probe_request: Option<u16>,
    pub probe: ProbeArm,
    pub homing: HomingState,
    pub homing_strobe: bool,
    pub fault_reset: bool,
    pub manual_disable: bool,
    pub power: PowerTracker,
    pub last_controlword: u16,
    pub last_failure: Option<FailureKind>,
    pub op_dropouts: u32,
}

impl DriveIntent {
    pub fn new() -> Self {
        Self {
            mode: None,
            velocity: None,
            position: None,
            csp_target: None,
            velocity_sdo: None,
            position_sdo_done: false,
            probe_request: None,
            probe: ProbeArm::Idle,
            homing: HomingState::Idle,
            homing_strobe: false,
            fault_reset: false,
            manual_disable: false,
            power: PowerTracker::new(),
            last_controlword: 0,
            last_failure: None,
            op_dropouts: 0,
        }
    }

    pub fn commanded_mode(&self) -> Option<OperationMode> {
        self.mode.as_ref().map(|m| m.mode)
    }

    /// Drop in-flight strobes; used on disable and on OP drop-out.
    pub fn clear_pulses(&mut self) {
        if let Some(p) = self.position.as_mut() {
            p.pulse_due = false;
            p.rescue = None;
        }
        self.homing_strobe = false;
    }

    pub fn record_failure(&mut self, kind: FailureKind) {
        self.last_failure = Some(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn retarget_resets_watchdogs_only_on_change() {
        let t0 = Instant::now();
        let mut p = PositionIntent::new(1000, t0);
        p.applied = Some(1000);
        p.rescues = 3;
        p.retarget(1000, t0 + Duration::from_millis(10));
        assert_eq!(p.rescues, 3, "same target must not rearm");
        p.retarget(2000, t0 + Duration::from_millis(20));
        assert_eq!(p.rescues, 0);
        assert_eq!(p.applied, None);
        assert!(!p.failed);
    }

    #[test]
    fn power_pacing() {
        let t0 = Instant::now();
        let mut pw = PowerTracker::new();
        assert!(pw.paced(t0, 100));
        pw.last_transition = Some(t0);
        assert!(!pw.paced(t0 + Duration::from_millis(50), 100));
        assert!(pw.paced(t0 + Duration::from_millis(100), 100));
    }
}
