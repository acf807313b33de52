// Part of ethercat-motion. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Commands flowing from the application to the cyclic worker.
//!
//! Every record is an intent: the engine keeps realising it on the wire
//! until it is verified or replaced.  Position and velocity values are user
//! units; the engine converts to pulses with the drive's [`UnitConversion`]
//! (crate::config::UnitConversion).

use serde::{Deserialize, Serialize};

use crate::cia402;

/// Touch-probe trigger edge (single-shot capture).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeEdge {
    Positive,
    Negative,
    Both,
}

impl ProbeEdge {
    /// The 0x60B8 function value for this edge.
    pub fn function_value(self) -> u16 {
        match self {
            ProbeEdge::Positive => cia402::PROBE_POSITIVE_EDGE,
            ProbeEdge::Negative => cia402::PROBE_NEGATIVE_EDGE,
            ProbeEdge::Both => cia402::PROBE_BOTH_EDGES,
        }
    }
}

/// Command records; `drive` is the bus position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    SetVelocityMode { drive: u16 },
    SetPositionMode { drive: u16 },
    SetCspMode { drive: u16 },
    SetHomingMode { drive: u16 },
    /// Target velocity in user units/s; clamped by the drive's cap.
    SetVelocity { drive: u16, velocity: f64 },
    /// Absolute PP target in user units; latched with a bit-4 strobe.
    SetPosition { drive: u16, position: f64 },
    /// Streaming CSP target in user units; written every cycle.
    SetPositionCsp { drive: u16, position: f64 },
    ArmProbe { drive: u16, edge: ProbeEdge },
    DisableProbe { drive: u16 },
    ClearFault { drive: u16 },
    StartHoming { drive: u16 },
    EnableDrive { drive: u16 },
    /// Latches the drive disabled until `EnableDrive`.
    DisableDrive { drive: u16 },
    /// Zero the velocity intent and drop any pending PP strobe.
    StopMotion { drive: u16 },
}

impl Command {
    pub fn drive(&self) -> u16 {
        match *self {
            Command::SetVelocityMode { drive }
            | Command::SetPositionMode { drive }
            | Command::SetCspMode { drive }
            | Command::SetHomingMode { drive }
            | Command::SetVelocity { drive, .. }
            | Command::SetPosition { drive, .. }
            | Command::SetPositionCsp { drive, .. }
            | Command::ArmProbe { drive, .. }
            | Command::DisableProbe { drive }
            | Command::ClearFault { drive }
            | Command::StartHoming { drive }
            | Command::EnableDrive { drive }
            | Command::DisableDrive { drive }
            | Command::StopMotion { drive } => drive,
        }
    }
}

#[test]
fn probe_edges_use_canonical_single_shot_values() {
    assert_eq!(ProbeEdge::Positive.function_value(), 0x0011);
    assert_eq!(ProbeEdge::Negative.function_value(), 0x0021);
    assert_eq!(ProbeEdge::Both.function_value(), 0x0031);
}
