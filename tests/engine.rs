// Part of ethercat-motion. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! End-to-end engine scenarios on the simulated master, stepped
//! cycle-by-cycle with a hand-controlled clock.

use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

use ethercat_motion::cia402;
use ethercat_motion::engine::CyclicEngine;
use ethercat_motion::master::sim::SimMaster;
use ethercat_motion::master::{PdoConfig, PdoEntryDef};
use ethercat_motion::transport::{ChannelCommands, ChannelStatus};
use ethercat_motion::{
    Command, DriveConfig, Error, FailureKind, NetworkConfig, NetworkStatus, PdoSelection,
    ProbeEdge,
};

const CYCLE: Duration = Duration::from_millis(5);

/// Statusword with the CiA 402 "operation enabled" pattern.
const SW_OP_ENABLED: u16 = 0x0237;

fn full_mapping() -> PdoSelection {
    PdoSelection {
        rx: vec![PdoConfig::new(
            0x1600,
            vec![
                PdoEntryDef::new(0x6040, 0, 16),
                PdoEntryDef::new(0x6060, 0, 8),
                PdoEntryDef::new(0x607A, 0, 32),
                PdoEntryDef::new(0x60FF, 0, 32),
                PdoEntryDef::new(0x60B8, 0, 16),
            ],
        )],
        tx: vec![PdoConfig::new(
            0x1A00,
            vec![
                PdoEntryDef::new(0x6041, 0, 16),
                PdoEntryDef::new(0x6061, 0, 8),
                PdoEntryDef::new(0x6064, 0, 32),
                PdoEntryDef::new(0x606C, 0, 32),
                PdoEntryDef::new(0x60B9, 0, 16),
                PdoEntryDef::new(0x60BA, 0, 32),
                PdoEntryDef::new(0x60BC, 0, 32),
            ],
        )],
    }
}

/// Mapping without the mode objects; mode maintenance must go over SDO.
fn mapping_without_mode_objects() -> PdoSelection {
    PdoSelection {
        rx: vec![PdoConfig::new(
            0x1600,
            vec![
                PdoEntryDef::new(0x6040, 0, 16),
                PdoEntryDef::new(0x607A, 0, 32),
                PdoEntryDef::new(0x60FF, 0, 32),
            ],
        )],
        tx: vec![PdoConfig::new(
            0x1A00,
            vec![
                PdoEntryDef::new(0x6041, 0, 16),
                PdoEntryDef::new(0x6064, 0, 32),
            ],
        )],
    }
}

struct Rig {
    engine: CyclicEngine<SimMaster>,
    commands: Sender<Command>,
    status_rx: Receiver<NetworkStatus>,
    last_status: Option<NetworkStatus>,
    now: Instant,
}

impl Rig {
    fn with_config(mut cfg: NetworkConfig) -> Self {
        let mut sim = SimMaster::new();
        for d in &cfg.drives {
            sim.set_operational(d.position, true);
        }
        cfg.cycle_time_ms = 5.0;
        let (tx, rx) = bounded(1024);
        let (status_tx, status_rx) = bounded(64);
        let engine = CyclicEngine::setup(
            cfg,
            sim,
            Box::new(ChannelCommands(rx)),
            Box::new(ChannelStatus(status_tx)),
        )
        .expect("engine setup");
        Rig {
            engine,
            commands: tx,
            status_rx,
            last_status: None,
            now: Instant::now(),
        }
    }

    fn new(sel: PdoSelection) -> Self {
        let mut drive = DriveConfig::new(0, 0x0A1B, 0x5081);
        drive.pdo = Some(sel);
        Self::with_config(NetworkConfig::new(0, vec![drive]))
    }

    fn step(&mut self) {
        self.engine.cycle(self.now).expect("cycle");
        self.now += CYCLE;
        while let Ok(s) = self.status_rx.try_recv() {
            self.last_status = Some(s);
        }
    }

    fn steps(&mut self, n: usize) {
        for _ in 0..n {
            self.step();
        }
    }

    fn sim(&mut self) -> &mut SimMaster {
        self.engine.master_mut()
    }

    fn sim_ref(&self) -> &SimMaster {
        self.engine.master()
    }

    fn send(&self, cmd: Command) {
        self.commands.send(cmd).unwrap();
    }

    fn set_statusword(&mut self, v: u16) {
        self.sim().set_input(0, cia402::STATUSWORD, 0, &v.to_le_bytes());
    }

    fn set_mode_display(&mut self, v: i8) {
        self.sim()
            .set_input(0, cia402::MODES_OF_OPERATION_DISPLAY, 0, &[v as u8]);
    }

    fn set_position_actual(&mut self, v: i32) {
        self.sim()
            .set_input(0, cia402::POSITION_ACTUAL, 0, &v.to_le_bytes());
    }

    /// Drive enabled with the given mode commanded and verified.
    fn bring_up(&mut self, mode_cmd: Command, mode_value: i8) {
        self.set_statusword(SW_OP_ENABLED);
        self.step();
        self.send(mode_cmd);
        self.step();
        self.set_mode_display(mode_value);
        self.step();
    }

    fn controlword_writes(&self) -> Vec<(u64, u16)> {
        self.sim_ref()
            .writes_to(0, cia402::CONTROLWORD, 0)
            .iter()
            .map(|w| (w.cycle, u16::from_le_bytes([w.data[0], w.data[1]])))
            .collect()
    }
}

// Scenario 1: mode switch verified through 0x6061.
#[test]
fn mode_switch_verifies_and_stops_writing() {
    let mut rig = Rig::new(full_mapping());
    rig.set_statusword(SW_OP_ENABLED);
    rig.step();

    rig.send(Command::SetVelocityMode { drive: 0 });
    rig.step();
    rig.step();
    rig.set_mode_display(3);
    rig.step();
    rig.steps(10);

    let writes = rig.sim_ref().writes_to(0, cia402::MODES_OF_OPERATION, 0);
    assert_eq!(writes.len(), 3, "0x6060 written on exactly three cycles");
    assert!(writes.iter().all(|w| w.data == vec![3]));

    // A fresh mode command resets the verified flag and resumes writing.
    rig.send(Command::SetVelocityMode { drive: 0 });
    rig.step();
    let writes = rig.sim_ref().writes_to(0, cia402::MODES_OF_OPERATION, 0);
    assert_eq!(writes.len(), 4);
}

// Scenario 2: PP move without stall; single target write, single strobe.
#[test]
fn pp_move_without_stall() {
    let mut rig = Rig::new(full_mapping());
    rig.bring_up(Command::SetPositionMode { drive: 0 }, 1);

    rig.set_position_actual(0);
    rig.send(Command::SetPosition {
        drive: 0,
        position: 2000.0,
    });
    rig.step();
    // Set-point acknowledged by the drive.
    rig.set_statusword(SW_OP_ENABLED | 0x1000);
    for p in [0, 500, 1000, 1500, 1950, 2000, 2000] {
        rig.set_position_actual(p);
        rig.step();
    }
    rig.steps(12); // let a status snapshot land

    let target_writes = rig.sim_ref().writes_to(0, cia402::TARGET_POSITION, 0);
    assert_eq!(target_writes.len(), 1, "0x607A written exactly once");
    assert_eq!(target_writes[0].data, 2000i32.to_le_bytes().to_vec());

    let strobes: Vec<_> = rig
        .controlword_writes()
        .into_iter()
        .filter(|(_, cw)| cw & cia402::CW_BIT_NEW_SET_POINT != 0)
        .collect();
    assert_eq!(strobes.len(), 1, "bit 4 asserted for exactly one cycle");
    assert_eq!(strobes[0].0, target_writes[0].cycle, "strobe rides the target frame");

    let st = rig.last_status.as_ref().expect("status published");
    let drive = st.drive(0).unwrap();
    assert_eq!(drive.position_actual_pulses, Some(2000));
    assert_eq!(drive.last_failure, None);
}

// Scenario 3: PP stall; throttled bit-4 rescues, then a recorded failure.
#[test]
fn pp_stall_rescues_then_fails() {
    let mut rig = Rig::new(full_mapping());
    rig.bring_up(Command::SetPositionMode { drive: 0 }, 1);

    rig.set_position_actual(500);
    rig.send(Command::SetPosition {
        drive: 0,
        position: 2000.0,
    });
    // 6.5 s of cycles with the position pinned at 500.
    rig.steps(1300);

    let strobes: Vec<u64> = rig
        .controlword_writes()
        .into_iter()
        .filter(|(_, cw)| cw & cia402::CW_BIT_NEW_SET_POINT != 0)
        .map(|(c, _)| c)
        .collect();
    // Initial strobe plus the full rescue budget.
    assert_eq!(strobes.len(), 17, "one strobe + 16 rescues");

    // First rescue fires once the 500 ms stall window elapses.
    let first_gap = strobes[1] - strobes[0];
    assert!(
        (100..=103).contains(&first_gap),
        "first rescue at ~500 ms, got {} cycles",
        first_gap
    );
    // Consecutive rescues are spaced by at least 300 ms.
    for pair in strobes[1..].windows(2) {
        assert!(
            pair[1] - pair[0] >= 60,
            "rescues {} and {} closer than 300 ms",
            pair[0],
            pair[1]
        );
    }

    let st = rig.last_status.as_ref().expect("status published");
    assert_eq!(st.drive(0).unwrap().last_failure, Some(FailureKind::PpStall));
}

// Scenario 4: probe arm goes through disable-first with a quiet window.
#[test]
fn probe_arm_disable_first_sequence() {
    let mut rig = Rig::new(full_mapping());
    rig.set_statusword(SW_OP_ENABLED);
    rig.step();

    // Arm negative edge (0x0021) and let the readback confirm it.
    rig.sim()
        .set_sdo_object(0, cia402::PROBE_FUNCTION, 0, &0x0021u16.to_le_bytes());
    rig.send(Command::ArmProbe {
        drive: 0,
        edge: ProbeEdge::Negative,
    });
    rig.steps(14);

    // Now switch to positive edge (0x0011).
    rig.sim()
        .set_sdo_object(0, cia402::PROBE_FUNCTION, 0, &0x0011u16.to_le_bytes());
    rig.send(Command::ArmProbe {
        drive: 0,
        edge: ProbeEdge::Positive,
    });
    rig.steps(14);

    let writes = rig.sim_ref().writes_to(0, cia402::PROBE_FUNCTION, 0);
    let values: Vec<u16> = writes
        .iter()
        .map(|w| u16::from_le_bytes([w.data[0], w.data[1]]))
        .collect();
    assert_eq!(values, vec![0x0000, 0x0021, 0x0000, 0x0011]);

    // The transition window keeps the bus quiet for >= 10 cycles at 5 ms.
    assert!(writes[3].cycle - writes[2].cycle >= 10);
    // Once latched, nothing is rewritten.
    let before = writes.len();
    rig.steps(20);
    assert_eq!(
        rig.sim_ref().writes_to(0, cia402::PROBE_FUNCTION, 0).len(),
        before
    );
}

#[test]
fn probe_arm_readback_mismatch_retries_once_then_fails() {
    let mut rig = Rig::new(full_mapping());
    rig.set_statusword(SW_OP_ENABLED);
    rig.step();

    // Device keeps reporting a stale function value.
    rig.sim()
        .set_sdo_object(0, cia402::PROBE_FUNCTION, 0, &0x0021u16.to_le_bytes());
    rig.send(Command::ArmProbe {
        drive: 0,
        edge: ProbeEdge::Positive,
    });
    rig.steps(60);

    let writes = rig.sim_ref().writes_to(0, cia402::PROBE_FUNCTION, 0);
    let values: Vec<u16> = writes
        .iter()
        .map(|w| u16::from_le_bytes([w.data[0], w.data[1]]))
        .collect();
    // Disable-first sequence, one full retry, then failure.
    assert_eq!(values, vec![0x0000, 0x0011, 0x0000, 0x0011]);

    let st = rig.last_status.as_ref().expect("status published");
    assert_eq!(
        st.drive(0).unwrap().last_failure,
        Some(FailureKind::ProbeArmMismatch)
    );
}

// Scenario 5: mode maintenance falls back to throttled SDO.
#[test]
fn mode_sdo_fallback_is_throttled() {
    let mut rig = Rig::new(mapping_without_mode_objects());
    rig.set_statusword(SW_OP_ENABLED);
    rig.step();

    rig.send(Command::SetPositionMode { drive: 0 });
    // ~1.2 s while the drive never confirms.
    rig.steps(240);

    let downloads = rig.sim_ref().sdo_downloads(0, cia402::MODES_OF_OPERATION);
    assert!(
        (1..=2).contains(&downloads.len()),
        "at most one SDO download per second, got {}",
        downloads.len()
    );
    assert_eq!(downloads[0].2, vec![1]);
    // 0x6060 never goes through the (absent) PDO mapping.
    assert!(rig
        .sim_ref()
        .writes_to(0, cia402::MODES_OF_OPERATION, 0)
        .is_empty());

    let st = rig.last_status.as_ref().expect("status published");
    let drive = st.drive(0).unwrap();
    assert!(!drive.mode_verified);
    assert_eq!(drive.last_failure, Some(FailureKind::ModeVerifyTimeout));
}

#[test]
fn mode_sdo_fallback_verifies_via_upload() {
    let mut rig = Rig::new(mapping_without_mode_objects());
    rig.set_statusword(SW_OP_ENABLED);
    rig.step();

    // The display object answers over the mailbox.
    rig.sim()
        .set_sdo_object(0, cia402::MODES_OF_OPERATION_DISPLAY, 0, &[1]);
    rig.send(Command::SetPositionMode { drive: 0 });
    rig.steps(60); // past the first verification attempt at 200 ms

    let st = rig.last_status.as_ref().expect("status published");
    let drive = st.drive(0).unwrap();
    assert!(drive.mode_verified);
    assert_eq!(drive.last_failure, None);
    assert_eq!(
        rig.sim_ref()
            .sdo_downloads(0, cia402::MODES_OF_OPERATION)
            .len(),
        1
    );
}

// Scenario 6: startup refuses a drive without the mandatory controlword.
#[test]
fn startup_refuses_missing_controlword() {
    let mut sel = full_mapping();
    sel.rx[0].entries.retain(|e| e.index != cia402::CONTROLWORD);
    let mut drive = DriveConfig::new(0, 0x0A1B, 0x5081);
    drive.pdo = Some(sel);
    let cfg = NetworkConfig::new(0, vec![drive]);

    let mut sim = SimMaster::new();
    sim.set_operational(0, true);
    // Failing activation would be reported *if* activation were reached;
    // the mapping check must fire first.
    sim.fail_activate = true;
    let (_tx, rx) = bounded(16);
    let (status_tx, _status_rx) = bounded(16);
    let err = CyclicEngine::setup(
        cfg,
        sim,
        Box::new(ChannelCommands(rx)),
        Box::new(ChannelStatus(status_tx)),
    )
    .unwrap_err();
    match err {
        Error::RequiredPdoMissing { pos, index } => {
            assert_eq!(pos, 0);
            assert_eq!(index, cia402::CONTROLWORD);
        }
        other => panic!("expected RequiredPdoMissing, got {:?}", other),
    }
}

#[test]
fn velocity_is_clamped_and_streamed() {
    let mut drive = DriveConfig::new(0, 0x0A1B, 0x5081);
    drive.pdo = Some(full_mapping());
    drive.max_velocity = Some(1000.0);
    let mut rig = Rig::with_config(NetworkConfig::new(0, vec![drive]));
    rig.bring_up(Command::SetVelocityMode { drive: 0 }, 3);

    rig.send(Command::SetVelocity {
        drive: 0,
        velocity: 5000.0,
    });
    rig.steps(3);
    let writes = rig.sim_ref().writes_to(0, cia402::TARGET_VELOCITY, 0);
    assert!(!writes.is_empty());
    assert_eq!(
        writes.last().unwrap().data,
        1000i32.to_le_bytes().to_vec(),
        "clamped to the configured cap"
    );

    rig.send(Command::SetVelocity {
        drive: 0,
        velocity: -200.0,
    });
    rig.steps(2);
    let writes = rig.sim_ref().writes_to(0, cia402::TARGET_VELOCITY, 0);
    assert_eq!(writes.last().unwrap().data, (-200i32).to_le_bytes().to_vec());
}

#[test]
fn csp_targets_stream_every_cycle_without_strobe() {
    let mut rig = Rig::new(full_mapping());
    rig.bring_up(Command::SetCspMode { drive: 0 }, 8);

    rig.send(Command::SetPositionCsp {
        drive: 0,
        position: 777.0,
    });
    rig.steps(5);

    let writes = rig.sim_ref().writes_to(0, cia402::TARGET_POSITION, 0);
    assert!(writes.len() >= 4, "CSP target streamed every cycle");
    assert!(writes.iter().all(|w| w.data == 777i32.to_le_bytes().to_vec()));
    assert!(rig
        .controlword_writes()
        .iter()
        .all(|(_, cw)| cw & cia402::CW_BIT_NEW_SET_POINT == 0));
}

#[test]
fn application_time_is_monotonic() {
    let mut rig = Rig::new(full_mapping());
    rig.set_statusword(SW_OP_ENABLED);
    rig.steps(50);
    let times = rig.sim_ref().app_times();
    assert!(times.len() >= 50);
    assert!(times.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn status_published_at_snapshot_cadence() {
    let mut rig = Rig::new(full_mapping());
    rig.set_statusword(SW_OP_ENABLED);
    let mut published = 0;
    for _ in 0..100 {
        rig.engine.cycle(rig.now).unwrap();
        rig.now += CYCLE;
        while rig.status_rx.try_recv().is_ok() {
            published += 1;
        }
    }
    // 500 ms of cycles at a 50 ms publish period.
    assert!(
        (9..=11).contains(&published),
        "expected ~10 snapshots, got {}",
        published
    );
}

#[test]
fn cia402_enable_walk_is_paced() {
    let mut rig = Rig::new(full_mapping());
    // FAULT with a pending clear request.
    rig.set_statusword(0x0218);
    rig.step();
    rig.send(Command::ClearFault { drive: 0 });
    rig.step();
    let writes = rig.controlword_writes();
    assert_eq!(writes.last().unwrap().1, cia402::CW_FAULT_RESET);

    // Walk: SWITCH_ON_DISABLED -> READY -> SWITCHED_ON -> ENABLED, one
    // edge per enable-transition period.
    let mut transitions = Vec::new();
    for (sw, _expected) in [
        (0x0250u16, cia402::CW_SHUTDOWN),
        (0x0231, cia402::CW_SWITCH_ON),
        (0x0233, cia402::CW_ENABLE_OPERATION),
        (0x0237, cia402::CW_ENABLE_OPERATION),
    ] {
        rig.set_statusword(sw);
        rig.steps(25); // > 100 ms pacing window
        transitions.push(rig.controlword_writes().last().unwrap().1);
    }
    assert_eq!(
        transitions,
        vec![0x0006, 0x0007, 0x000F, 0x000F],
        "one edge per paced step"
    );

    let st = rig.last_status.as_ref().expect("status published");
    assert!(st.drive(0).unwrap().enabled);
}

#[test]
fn disable_drive_latches_voltage_off() {
    let mut rig = Rig::new(full_mapping());
    rig.bring_up(Command::SetVelocityMode { drive: 0 }, 3);

    rig.send(Command::DisableDrive { drive: 0 });
    rig.steps(3);
    assert_eq!(rig.controlword_writes().last().unwrap().1, 0x0000);

    // Velocity intents are suppressed while latched off.
    rig.send(Command::SetVelocity {
        drive: 0,
        velocity: 100.0,
    });
    let before = rig.sim_ref().writes_to(0, cia402::TARGET_VELOCITY, 0).len();
    rig.steps(5);
    assert_eq!(
        rig.sim_ref().writes_to(0, cia402::TARGET_VELOCITY, 0).len(),
        before
    );

    rig.send(Command::EnableDrive { drive: 0 });
    rig.steps(5);
    let last = rig.controlword_writes().last().unwrap().1;
    assert_ne!(last, 0x0000, "walk resumes after re-enable");
}

#[test]
fn homing_stages_parameters_and_completes() {
    let mut drive = DriveConfig::new(0, 0x0A1B, 0x5081);
    drive.pdo = Some(full_mapping());
    drive.homing = Some(ethercat_motion::HomingConfig {
        method: Some(33),
        search_velocity: Some(500.0),
        zero_velocity: Some(50.0),
        acceleration: None,
        offset: Some(-10.0),
        timeout_s: 30.0,
    });
    let mut rig = Rig::with_config(NetworkConfig::new(0, vec![drive]));
    rig.set_statusword(SW_OP_ENABLED);
    rig.step();

    rig.send(Command::StartHoming { drive: 0 });
    // One staged SDO per cycle: method, search vel, zero vel, offset.
    rig.steps(5);
    assert_eq!(
        rig.sim_ref().sdo_downloads(0, cia402::HOMING_METHOD)[0].2,
        vec![33]
    );
    assert_eq!(rig.sim_ref().sdo_downloads(0, cia402::HOMING_SPEEDS).len(), 2);
    assert_eq!(
        rig.sim_ref().sdo_downloads(0, cia402::HOME_OFFSET)[0].2,
        (-10i32).to_le_bytes().to_vec()
    );

    // HM mode goes out over PDO; confirm it.
    rig.set_mode_display(6);
    rig.steps(2);
    let strobes: Vec<_> = rig
        .controlword_writes()
        .into_iter()
        .filter(|(_, cw)| cw & cia402::CW_BIT_NEW_SET_POINT != 0)
        .collect();
    assert_eq!(strobes.len(), 1, "homing start strobe");

    // Homing attained + target reached.
    rig.set_statusword(SW_OP_ENABLED | 0x1400);
    rig.steps(12);
    let st = rig.last_status.as_ref().expect("status published");
    assert_eq!(
        st.drive(0).unwrap().homing,
        ethercat_motion::status::HomingProgress::Complete
    );
}

#[test]
fn teardown_disables_drives_and_releases_master() {
    let mut rig = Rig::new(full_mapping());
    rig.set_statusword(SW_OP_ENABLED);
    rig.steps(3);

    rig.engine.teardown();
    assert!(rig.sim_ref().released());
    // Drives were commanded safe on the way down.
    let last_cw = rig.controlword_writes().last().unwrap().1;
    assert_eq!(last_cw, 0x0000);
    let sends = rig.sim_ref().cycles_sent();

    // No further PDO sends once teardown returns.
    assert_eq!(rig.sim_ref().cycles_sent(), sends);
}

#[test]
fn profile_defaults_are_staged_as_startup_sdos() {
    let mut drive = DriveConfig::new(0, 0x0A1B, 0x5081);
    drive.pdo = Some(full_mapping());
    drive.profile_velocity = Some(3000.0);
    drive.profile_acceleration = Some(10000.0);
    drive.software_limits = Some((-50000.0, 50000.0));
    let rig = Rig::with_config(NetworkConfig::new(0, vec![drive]));

    let staged = &rig.sim_ref().slave(0).unwrap().config_sdos;
    assert!(staged.contains(&(0x6081, 0, 3000u32.to_le_bytes().to_vec())));
    assert!(staged.contains(&(0x6083, 0, 10000u32.to_le_bytes().to_vec())));
    assert!(staged.contains(&(0x607D, 1, (-50000i32).to_le_bytes().to_vec())));
    assert!(staged.contains(&(0x607D, 2, 50000i32.to_le_bytes().to_vec())));
}

#[test]
fn pdo_health_reports_missing_objects() {
    let mut rig = Rig::new(mapping_without_mode_objects());
    rig.set_statusword(SW_OP_ENABLED);
    rig.steps(2);
    let st = rig.last_status.as_ref().expect("status published");
    let health = &st.drive(0).unwrap().pdo_health;
    use ethercat_motion::PdoHealth;
    assert_eq!(health[&cia402::CONTROLWORD], PdoHealth::Mapped);
    assert_eq!(health[&cia402::STATUSWORD], PdoHealth::Mapped);
    assert_eq!(health[&cia402::MODES_OF_OPERATION], PdoHealth::Missing);
    assert_eq!(health[&cia402::PROBE_FUNCTION], PdoHealth::Missing);
}
