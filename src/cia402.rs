// Part of ethercat-motion. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! CiA 402 object dictionary indices, controlword/statusword vocabulary and
//! the power-state machine decode.

use serde::{Deserialize, Serialize};

// Object indices (CoE).
pub const CONTROLWORD: u16 = 0x6040;
pub const STATUSWORD: u16 = 0x6041;
pub const MODES_OF_OPERATION: u16 = 0x6060;
pub const MODES_OF_OPERATION_DISPLAY: u16 = 0x6061;
pub const POSITION_ACTUAL: u16 = 0x6064;
pub const VELOCITY_ACTUAL: u16 = 0x606C;
pub const TARGET_POSITION: u16 = 0x607A;
pub const SOFTWARE_POSITION_LIMIT: u16 = 0x607D;
pub const POLARITY: u16 = 0x607E;
pub const PROFILE_VELOCITY: u16 = 0x6081;
pub const PROFILE_ACCELERATION: u16 = 0x6083;
pub const HOME_OFFSET: u16 = 0x607C;
pub const HOMING_METHOD: u16 = 0x6098;
pub const HOMING_SPEEDS: u16 = 0x6099;
pub const HOMING_ACCELERATION: u16 = 0x609A;
pub const PROBE_FUNCTION: u16 = 0x60B8;
pub const PROBE_STATUS: u16 = 0x60B9;
pub const PROBE_POS_POSITIVE: u16 = 0x60BA;
/// Second captured position; some devices map it at 0x60BB instead.
pub const PROBE_POS_NEGATIVE: u16 = 0x60BC;
pub const PROBE_POS_NEGATIVE_ALT: u16 = 0x60BB;
pub const DIGITAL_INPUTS: u16 = 0x60FD;
pub const TARGET_VELOCITY: u16 = 0x60FF;
pub const ERROR_CODE: u16 = 0x603F;

// Controlword bits.
pub const CW_FAULT_RESET: u16 = 0x0080;
pub const CW_SHUTDOWN: u16 = 0x0006;
pub const CW_SWITCH_ON: u16 = 0x0007;
pub const CW_ENABLE_OPERATION: u16 = 0x000F;
pub const CW_DISABLE_VOLTAGE: u16 = 0x0000;
/// PP "new set-point" (doubles as the homing start strobe in HM).
pub const CW_BIT_NEW_SET_POINT: u16 = 1 << 4;
/// PP "change set immediately".
pub const CW_BIT_CHANGE_IMMEDIATELY: u16 = 1 << 5;
/// PP 0 = absolute, 1 = relative.
pub const CW_BIT_ABS_REL: u16 = 1 << 6;
pub const CW_BIT_HALT: u16 = 1 << 8;

// Statusword bits.
pub const SW_BIT_FAULT: u16 = 1 << 3;
pub const SW_BIT_WARNING: u16 = 1 << 7;
pub const SW_BIT_TARGET_REACHED: u16 = 1 << 10;
pub const SW_BIT_INTERNAL_LIMIT: u16 = 1 << 11;
/// "Set-point acknowledged" in PP; "homing attained" in HM.
pub const SW_BIT_SETPOINT_ACK: u16 = 1 << 12;
/// "Homing error" in HM.
pub const SW_BIT_HOMING_ERROR: u16 = 1 << 13;

// Canonical touch-probe function values (single-shot).
pub const PROBE_DISABLED: u16 = 0x0000;
pub const PROBE_POSITIVE_EDGE: u16 = 0x0011;
pub const PROBE_NEGATIVE_EDGE: u16 = 0x0021;
pub const PROBE_BOTH_EDGES: u16 = 0x0031;
/// Probe status bit 0: probe 1 enabled; bit 1: positive edge latched.
pub const PROBE_STATUS_ACTIVE: u16 = 0x0001;

/// Modes of operation (0x6060 / 0x6061), signed 8-bit on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i8)]
pub enum OperationMode {
    ProfilePosition = 1,
    ProfileVelocity = 3,
    Homing = 6,
    CyclicSyncPosition = 8,
}

impl OperationMode {
    pub fn raw(self) -> i8 {
        self as i8
    }

    pub fn from_raw(v: i8) -> Option<Self> {
        match v {
            1 => Some(OperationMode::ProfilePosition),
            3 => Some(OperationMode::ProfileVelocity),
            6 => Some(OperationMode::Homing),
            8 => Some(OperationMode::CyclicSyncPosition),
            _ => None,
        }
    }
}

/// CiA 402 power states decoded from the statusword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    NotReadyToSwitchOn,
    SwitchOnDisabled,
    ReadyToSwitchOn,
    SwitchedOn,
    OperationEnabled,
    QuickStopActive,
    FaultReactionActive,
    Fault,
}

/// Decode the power state from statusword bits 0-3, 5 and 6.
pub fn power_state(sw: u16) -> PowerState {
    match sw & 0x004F {
        0x0000 => return PowerState::NotReadyToSwitchOn,
        0x0040 => return PowerState::SwitchOnDisabled,
        0x000F => return PowerState::FaultReactionActive,
        0x0008 => return PowerState::Fault,
        _ => {}
    }
    match sw & 0x006F {
        0x0021 => PowerState::ReadyToSwitchOn,
        0x0023 => PowerState::SwitchedOn,
        0x0027 => PowerState::OperationEnabled,
        0x0007 => PowerState::QuickStopActive,
        _ => PowerState::NotReadyToSwitchOn,
    }
}

/// The controlword that advances the enable sequence by exactly one edge
/// from the given power state.  `None` when no transition applies (fault
/// handling is separate).
pub fn enable_step(state: PowerState) -> Option<u16> {
    match state {
        PowerState::SwitchOnDisabled | PowerState::QuickStopActive => Some(CW_SHUTDOWN),
        PowerState::ReadyToSwitchOn => Some(CW_SWITCH_ON),
        PowerState::SwitchedOn => Some(CW_ENABLE_OPERATION),
        PowerState::OperationEnabled => Some(CW_ENABLE_OPERATION),
        _ => None,
    }
}

#[test]
fn test_power_state_decode() {
    assert_eq!(power_state(0x0000), PowerState::NotReadyToSwitchOn);
    assert_eq!(power_state(0x0250), PowerState::SwitchOnDisabled);
    assert_eq!(power_state(0x0231), PowerState::ReadyToSwitchOn);
    assert_eq!(power_state(0x0233), PowerState::SwitchedOn);
    assert_eq!(power_state(0x0237), PowerState::OperationEnabled);
    assert_eq!(power_state(0x0217), PowerState::QuickStopActive);
    assert_eq!(power_state(0x0218), PowerState::Fault);
    assert_eq!(power_state(0x021F), PowerState::FaultReactionActive);
    // Ack/limit bits must not disturb the decode.
    assert_eq!(power_state(0x1637), PowerState::OperationEnabled);
}

#[test]
fn test_enable_step_sequence() {
    assert_eq!(enable_step(PowerState::SwitchOnDisabled), Some(0x0006));
    assert_eq!(enable_step(PowerState::ReadyToSwitchOn), Some(0x0007));
    assert_eq!(enable_step(PowerState::SwitchedOn), Some(0x000F));
    assert_eq!(enable_step(PowerState::OperationEnabled), Some(0x000F));
    assert_eq!(enable_step(PowerState::Fault), None);
}
