// Part of ethercat-motion. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! The cyclic engine.
//!
//! One cooperative thread owns the master, the process-data domain and every
//! [`DriveIntent`].  Each cycle it drains commands, exchanges process data,
//! advances the per-drive state machines by one step and, every
//! `status_period_ms`, publishes a snapshot.  The loop never blocks on user
//! input; it only sleeps to pace the cycle.
//!
//! Elevated scheduling (SCHED_FIFO, CPU isolation, NIC IRQ priority above
//! the loop) is a deployment prerequisite and deliberately not configured
//! here.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian as LE};
use log::{debug, info, warn};

use crate::cia402::{self, power_state, OperationMode, PowerState};
use crate::command::Command;
use crate::config::{DriveConfig, EsiRef, NetworkConfig, Polarity};
use crate::esi::{self, EsiDevice};
use crate::intent::{DriveIntent, HomingState, ModeIntent, PositionIntent, ProbeArm, RescuePhase};
use crate::master::{
    DomainIdx, DomainState, MasterAccess, PdoConfig, SlaveId, SmDirection, SyncConfig,
};
use crate::status::{
    CycleStats, DriveFeatures, DriveStatus, FailureKind, HomingProgress, NetworkStatus, PdoHealth,
};
use crate::transport::{CommandSource, StatusSink};
use crate::{Error, Result};

/// SDO fallback refresh for an unchanged value.
const SDO_REFRESH: Duration = Duration::from_secs(1);
/// Budget for fault-reset edges before giving up until the next request.
const FAULT_RESET_ATTEMPTS: u32 = 10;

pub struct CyclicEngine<M: MasterAccess> {
    cfg: NetworkConfig,
    master: M,
    domain: Option<DomainIdx>,
    /// Per-slave (index, subindex) -> byte offset; immutable after setup.
    offsets: BTreeMap<u16, HashMap<(u16, u8), usize>>,
    features: BTreeMap<u16, DriveFeatures>,
    /// Resolved negative-edge capture object per drive.
    probe_neg: BTreeMap<u16, u16>,
    intents: BTreeMap<u16, DriveIntent>,
    in_op: BTreeMap<u16, bool>,
    /// One SDO transfer per slave per cycle.
    sdo_used: BTreeMap<u16, bool>,
    commands: Box<dyn CommandSource>,
    status: Box<dyn StatusSink>,
    start: Instant,
    wall_base_ns: u64,
    last_app_time_ns: u64,
    cycle_count: u64,
    last_status: Option<Instant>,
    last_domain: DomainState,
    stats: CycleStats,
}

impl<M: MasterAccess> std::fmt::Debug for CyclicEngine<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CyclicEngine").finish_non_exhaustive()
    }
}

impl<M: MasterAccess> CyclicEngine<M> {
    /// Run the full startup sequence: request the master (with the optional
    /// preflight), build and register the PDO layout for every drive,
    /// enforce the mandatory 0x6040/0x6041 mapping, configure DC and
    /// activate.  Does not wait for OP; [`run`](Self::run) does.
    pub fn setup(
        cfg: NetworkConfig,
        mut master: M,
        commands: Box<dyn CommandSource>,
        status: Box<dyn StatusSink>,
    ) -> Result<Self> {
        cfg.validate()?;

        if let Err(e) = master.request(cfg.sdo_only) {
            if matches!(e, Error::MasterBusy(_)) && cfg.preflight_release {
                warn!(
                    "master busy; trying to release {} and retrying once",
                    cfg.device_path.display()
                );
                crate::supervisor::release_device_holders(&cfg.device_path);
                thread::sleep(Duration::from_millis(cfg.preflight_delay_ms));
                master.request(cfg.sdo_only)?;
            } else {
                return Err(e);
            }
        }

        let domain = if cfg.sdo_only {
            None
        } else {
            Some(master.create_domain()?)
        };

        let mut offsets: BTreeMap<u16, HashMap<(u16, u8), usize>> = BTreeMap::new();
        let mut features = BTreeMap::new();
        let mut probe_neg = BTreeMap::new();

        for d in &cfg.drives {
            master.config_slave(d.alias, d.position, SlaveId::new(d.vendor_id, d.product_code))?;

            let (rx, tx, feat, esi_neg) = resolve_mapping(d, cfg.sdo_only)?;
            features.insert(d.position, feat);
            probe_neg.insert(
                d.position,
                d.probe_neg_index
                    .or(esi_neg)
                    .unwrap_or(cia402::PROBE_POS_NEGATIVE),
            );

            if let Some(dom) = domain {
                let mut syncs = Vec::new();
                if !rx.is_empty() {
                    syncs.push(SyncConfig {
                        index: 2,
                        direction: SmDirection::Output,
                        pdos: rx.clone(),
                    });
                }
                if !tx.is_empty() {
                    syncs.push(SyncConfig {
                        index: 3,
                        direction: SmDirection::Input,
                        pdos: tx.clone(),
                    });
                }
                master.config_pdos(d.position, &syncs)?;

                // Registration list: every real entry, first occurrence wins.
                // Index 0 entries are mapping padding and cannot be registered.
                let mut regs: Vec<(u16, u8)> = Vec::new();
                for p in rx.iter().chain(tx.iter()) {
                    for e in &p.entries {
                        if e.index != 0 && !regs.contains(&(e.index, e.subindex)) {
                            regs.push((e.index, e.subindex));
                        }
                    }
                }
                let offs = master.register_pdo_entries(dom, d.position, &regs)?;
                let map: HashMap<(u16, u8), usize> =
                    regs.into_iter().zip(offs.into_iter()).collect();
                offsets.insert(d.position, map);
            } else {
                offsets.insert(d.position, HashMap::new());
            }

            for (index, subindex, data) in &d.startup_sdos {
                master.config_sdo(d.position, *index, *subindex, data)?;
            }

            // Profile defaults reach the drive during the transition to OP.
            if let Some(v) = d.profile_velocity {
                let pulses = d.units.to_pulses_unsigned(v);
                master.config_sdo(d.position, cia402::PROFILE_VELOCITY, 0, &pulses.to_le_bytes())?;
            }
            if let Some(a) = d.profile_acceleration {
                let pulses = d.units.to_pulses_unsigned(a);
                master.config_sdo(
                    d.position,
                    cia402::PROFILE_ACCELERATION,
                    0,
                    &pulses.to_le_bytes(),
                )?;
            }
            if let Some(p) = d.polarity {
                // Bits 7/6: position/velocity polarity.
                let value: u8 = match p {
                    Polarity::Forward => 0x00,
                    Polarity::Reversed => 0xC0,
                };
                master.config_sdo(d.position, cia402::POLARITY, 0, &[value])?;
            }
            if let Some((lo, hi)) = d.software_limits {
                let lo = d.units.to_pulses(lo);
                let hi = d.units.to_pulses(hi);
                master.config_sdo(
                    d.position,
                    cia402::SOFTWARE_POSITION_LIMIT,
                    1,
                    &lo.to_le_bytes(),
                )?;
                master.config_sdo(
                    d.position,
                    cia402::SOFTWARE_POSITION_LIMIT,
                    2,
                    &hi.to_le_bytes(),
                )?;
            }

            // A configured initial mode that is not PDO-mapped still reaches
            // the drive during the transition to OP.
            if let Some(mode) = d.initial_mode {
                let mapped = offsets
                    .get(&d.position)
                    .map(|m| m.contains_key(&(cia402::MODES_OF_OPERATION, 0)))
                    .unwrap_or(false);
                if !mapped {
                    master.config_sdo(
                        d.position,
                        cia402::MODES_OF_OPERATION,
                        0,
                        &[mode.raw() as u8],
                    )?;
                }
            }

            if let Some(dc) = &d.dc {
                let sync0 = dc.sync0_cycle_ns.unwrap_or(cfg.cycle_time_ns() as u32);
                master.config_dc(
                    d.position,
                    dc.assign_activate,
                    sync0,
                    dc.sync0_shift_ns,
                    dc.sync1_cycle_ns,
                    dc.sync1_shift_ns,
                )?;
                info!("slave {}: DC configured (0x{:04X})", d.position, dc.assign_activate);
            }
        }

        // Mandatory PDO objects, checked before activation so a broken
        // mapping never brings the bus up.
        if !cfg.sdo_only {
            for d in &cfg.drives {
                let map = &offsets[&d.position];
                for index in [cia402::CONTROLWORD, cia402::STATUSWORD] {
                    if !map.contains_key(&(index, 0)) {
                        return Err(Error::RequiredPdoMissing {
                            pos: d.position,
                            index,
                        });
                    }
                }
            }

            let reference = cfg
                .dc_reference_slave
                .or_else(|| cfg.drives.iter().find(|d| d.dc.is_some()).map(|d| d.position));
            if let Some(pos) = reference {
                master.select_reference_clock(pos)?;
                info!("slave {} selected as DC reference clock", pos);
            }
        }

        let wall_base_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        master.set_application_time(wall_base_ns)?;

        if !cfg.sdo_only {
            master.activate()?;
            info!("master activated ({} drives)", cfg.drives.len());
        }

        let mut intents = BTreeMap::new();
        let mut in_op = BTreeMap::new();
        let mut sdo_used = BTreeMap::new();
        let now = Instant::now();
        for d in &cfg.drives {
            let mut intent = DriveIntent::new();
            if let Some(mode) = d.initial_mode {
                intent.mode = Some(ModeIntent::new(mode, now, cfg.mode_verify_interval_ms));
            }
            intents.insert(d.position, intent);
            in_op.insert(d.position, false);
            sdo_used.insert(d.position, false);
        }

        Ok(Self {
            cfg,
            master,
            domain,
            offsets,
            features,
            probe_neg,
            intents,
            in_op,
            sdo_used,
            commands,
            status,
            start: now,
            wall_base_ns,
            last_app_time_ns: wall_base_ns,
            cycle_count: 0,
            last_status: None,
            last_domain: DomainState::default(),
            stats: CycleStats::default(),
        })
    }

    pub fn master(&self) -> &M {
        &self.master
    }

    pub fn master_mut(&mut self) -> &mut M {
        &mut self.master
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    /// The cyclic loop.  Waits for OP first (unless SDO-only), then paces
    /// cycles with an absolute deadline, re-anchoring after an overrun.
    pub fn run(&mut self, stop: Arc<AtomicBool>) -> Result<()> {
        if self.domain.is_some() {
            self.wait_for_op(&stop)?;
        }
        let period = Duration::from_nanos(self.cfg.cycle_time_ns());
        let mut next = Instant::now() + period;
        let mut prev_start: Option<Instant> = None;

        while !stop.load(Ordering::SeqCst) && !self.commands.closed() {
            let cycle_start = Instant::now();
            if let Some(prev) = prev_start {
                let actual = cycle_start.duration_since(prev).as_micros() as i64;
                self.stats.last_cycle_us = actual;
                self.stats.last_jitter_us = actual - period.as_micros() as i64;
                self.stats.max_abs_jitter_us = self
                    .stats
                    .max_abs_jitter_us
                    .max(self.stats.last_jitter_us.abs());
            }
            prev_start = Some(cycle_start);
            if cycle_start > next {
                self.stats.deadline_misses += 1;
            }

            if let Err(e) = self.cycle(cycle_start) {
                warn!("error in cycle {}: {}", self.cycle_count, e);
            }

            next += period;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            } else {
                // Overrun: re-anchor rather than trying to catch up.
                next = now + period;
            }
        }
        self.teardown();
        Ok(())
    }

    /// Bus cycles (no intent application) until every slave reports OP,
    /// checking at 1 Hz within the configured timeout.
    fn wait_for_op(&mut self, stop: &AtomicBool) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs_f64(self.cfg.op_timeout_s);
        let period = Duration::from_nanos(self.cfg.cycle_time_ns());
        let mut last_report = Instant::now();
        loop {
            if stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            let domain = self.domain.expect("wait_for_op requires a domain");
            self.master.receive()?;
            self.master.process(domain)?;
            self.refresh_op_states();
            self.master.queue(domain)?;
            self.master.send()?;

            if !self.in_op.is_empty() && self.in_op.values().all(|&v| v) {
                info!("all slaves operational");
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                let slaves: Vec<u16> = self
                    .in_op
                    .iter()
                    .filter(|(_, &op)| !op)
                    .map(|(&p, _)| p)
                    .collect();
                return Err(Error::SlaveNotOp {
                    timeout_s: self.cfg.op_timeout_s,
                    slaves,
                });
            }
            if now.duration_since(last_report) >= Duration::from_secs(1) {
                let pending: Vec<u16> = self
                    .in_op
                    .iter()
                    .filter(|(_, &op)| !op)
                    .map(|(&p, _)| p)
                    .collect();
                info!("waiting for OP: {:?}", pending);
                last_report = now;
            }
            thread::sleep(period);
        }
    }

    /// One full cycle.  `now` is injected so tests can step time by hand.
    pub fn cycle(&mut self, now: Instant) -> Result<()> {
        self.cycle_count += 1;
        for used in self.sdo_used.values_mut() {
            *used = false;
        }

        for _ in 0..self.cfg.command_drain_budget {
            match self.commands.try_next() {
                Some(cmd) => self.apply_command(cmd, now),
                None => break,
            }
        }

        let positions: Vec<u16> = self.intents.keys().copied().collect();
        if let Some(domain) = self.domain {
            let app_ns = self.application_time(now);
            self.master.set_application_time(app_ns)?;
            self.master.receive()?;
            self.master.process(domain)?;
            self.last_domain = self.master.domain_state(domain)?;
            self.refresh_op_states();

            for pos in &positions {
                self.apply_drive(*pos, now);
            }

            self.master.sync_reference_clock()?;
            self.master.sync_slave_clocks()?;
            self.master.queue(domain)?;
            self.master.send()?;
        } else {
            for pos in &positions {
                self.apply_drive(*pos, now);
            }
        }

        let due = match self.last_status {
            None => true,
            Some(at) => {
                now.duration_since(at) >= Duration::from_millis(self.cfg.status_period_ms)
            }
        };
        if due {
            let snapshot = self.snapshot(now);
            self.status.publish(&snapshot);
            self.last_status = Some(now);
        }
        Ok(())
    }

    /// Application time handed to the library; strictly non-decreasing.
    fn application_time(&mut self, now: Instant) -> u64 {
        let t = self.wall_base_ns + now.duration_since(self.start).as_nanos() as u64;
        self.last_app_time_ns = self.last_app_time_ns.max(t);
        self.last_app_time_ns
    }

    fn refresh_op_states(&mut self) {
        for (&pos, intent) in self.intents.iter_mut() {
            let st = match self.master.slave_config_state(pos) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let was = self.in_op.get(&pos).copied().unwrap_or(false);
            if st.operational && !was {
                info!("slave {} entered OP (al_state=0x{:02X})", pos, st.al_state);
                self.in_op.insert(pos, true);
            } else if !st.operational && was {
                warn!("slave {} left OP (al_state=0x{:02X})", pos, st.al_state);
                self.in_op.insert(pos, false);
                intent.power.reset();
                intent.clear_pulses();
                intent.op_dropouts += 1;
            }
        }
    }

    fn obj_offset(&self, pos: u16, index: u16) -> Option<usize> {
        self.offsets
            .get(&pos)
            .and_then(|m| m.get(&(index, 0)).copied())
    }

    /// Claim this cycle's SDO slot for a slave.
    fn take_sdo(&mut self, pos: u16) -> bool {
        match self.sdo_used.get_mut(&pos) {
            Some(used) if !*used => {
                *used = true;
                true
            }
            _ => false,
        }
    }

    fn apply_command(&mut self, cmd: Command, now: Instant) {
        let pos = cmd.drive();
        if self.cfg.drive(pos).is_none() {
            warn!("command for unknown drive {}: {:?}", pos, cmd);
            return;
        }
        match cmd {
            Command::SetVelocityMode { .. } => {
                self.set_mode(pos, OperationMode::ProfileVelocity, now)
            }
            Command::SetPositionMode { .. } => {
                self.set_mode(pos, OperationMode::ProfilePosition, now)
            }
            Command::SetCspMode { .. } => {
                self.set_mode(pos, OperationMode::CyclicSyncPosition, now)
            }
            Command::SetHomingMode { .. } => self.set_mode(pos, OperationMode::Homing, now),
            Command::SetVelocity { velocity, .. } => {
                let dcfg = self.cfg.drive(pos).unwrap();
                let cap = dcfg.max_velocity.map(|c| dcfg.units.to_pulses(c).abs());
                let mut pulses = dcfg.units.to_pulses(velocity);
                if let Some(cap) = cap {
                    pulses = pulses.clamp(-cap, cap);
                }
                if let Some(intent) = self.intents.get_mut(&pos) {
                    intent.velocity = Some(pulses);
                }
            }
            Command::SetPosition { position, .. } => {
                let pulses = self.position_pulses(pos, position);
                if let Some(intent) = self.intents.get_mut(&pos) {
                    match intent.position.as_mut() {
                        Some(p) => p.retarget(pulses, now),
                        None => intent.position = Some(PositionIntent::new(pulses, now)),
                    }
                }
            }
            Command::SetPositionCsp { position, .. } => {
                let pulses = self.position_pulses(pos, position);
                if let Some(intent) = self.intents.get_mut(&pos) {
                    intent.csp_target = Some(pulses);
                }
            }
            Command::ArmProbe { edge, .. } => {
                if let Some(intent) = self.intents.get_mut(&pos) {
                    intent.probe_request = Some(edge.function_value());
                }
            }
            Command::DisableProbe { .. } => {
                if let Some(intent) = self.intents.get_mut(&pos) {
                    intent.probe_request = Some(cia402::PROBE_DISABLED);
                }
            }
            Command::ClearFault { .. } => {
                if let Some(intent) = self.intents.get_mut(&pos) {
                    intent.fault_reset = true;
                    intent.power.fault_reset_attempts = 0;
                }
            }
            Command::StartHoming { .. } => {
                if let Some(intent) = self.intents.get_mut(&pos) {
                    intent.homing = HomingState::Staging { step: 0 };
                    intent.homing_strobe = false;
                }
            }
            Command::EnableDrive { .. } => {
                if let Some(intent) = self.intents.get_mut(&pos) {
                    intent.manual_disable = false;
                }
            }
            Command::DisableDrive { .. } => {
                if let Some(intent) = self.intents.get_mut(&pos) {
                    intent.manual_disable = true;
                    intent.power.reset();
                    intent.clear_pulses();
                }
            }
            Command::StopMotion { .. } => {
                if let Some(intent) = self.intents.get_mut(&pos) {
                    intent.velocity = Some(0);
                    intent.clear_pulses();
                }
            }
        }
    }

    fn position_pulses(&self, pos: u16, user: f64) -> i32 {
        let dcfg = self.cfg.drive(pos).unwrap();
        let clamped = match dcfg.software_limits {
            Some((lo, hi)) => user.clamp(lo, hi),
            None => user,
        };
        dcfg.units.to_pulses(clamped)
    }

    fn set_mode(&mut self, pos: u16, mode: OperationMode, now: Instant) {
        let interval = self.cfg.mode_verify_interval_ms;
        if let Some(intent) = self.intents.get_mut(&pos) {
            intent.mode = Some(ModeIntent::new(mode, now, interval));
            if mode != OperationMode::Homing {
                intent.homing = HomingState::Idle;
                intent.homing_strobe = false;
            }
        }
    }

    /// Intent application for one drive, one cycle (spec order: fault and
    /// power walk, mode, velocity, position, probe; homing runs first since
    /// it may install the mode intent).
    fn apply_drive(&mut self, pos: u16, now: Instant) {
        if self.domain.is_some() && !self.in_op.get(&pos).copied().unwrap_or(false) {
            return;
        }
        let sw = self.read_statusword(pos);

        self.update_homing(pos, sw, now);
        self.update_power(pos, sw, now);
        self.update_mode(pos, now);
        self.update_velocity(pos, now);
        self.update_position(pos, sw, now);
        self.write_controlword(pos);
        self.update_probe(pos, now);
    }

    fn read_statusword(&self, pos: u16) -> Option<u16> {
        let domain = self.domain?;
        let off = self.obj_offset(pos, cia402::STATUSWORD)?;
        read_u16_at(&self.master, domain, off)
    }

    fn update_power(&mut self, pos: u16, sw: Option<u16>, now: Instant) {
        let period = self.cfg.enable_transition_ms;
        let auto_clear = self.cfg.auto_clear_fault;
        let Some(intent) = self.intents.get_mut(&pos) else { return };
        let Some(sw) = sw else {
            intent.power.commanded = None;
            return;
        };
        if intent.manual_disable {
            intent.power.commanded = Some(cia402::CW_DISABLE_VOLTAGE);
            intent.power.enabled = false;
            return;
        }
        let state = power_state(sw);
        match state {
            PowerState::Fault => {
                intent.power.enabled = false;
                let want_reset = intent.fault_reset || auto_clear;
                if want_reset
                    && intent.power.fault_reset_attempts < FAULT_RESET_ATTEMPTS
                    && intent.power.paced(now, period)
                {
                    if intent.power.fault_reset_attempts == 0 {
                        info!("slave {}: FAULT (0x{:04X}), issuing fault reset", pos, sw);
                    }
                    intent.power.commanded = Some(cia402::CW_FAULT_RESET);
                    intent.power.fault_reset_attempts += 1;
                    intent.power.last_transition = Some(now);
                }
            }
            PowerState::OperationEnabled => {
                intent.power.commanded = Some(cia402::CW_ENABLE_OPERATION);
                if !intent.power.enabled {
                    intent.power.enabled = true;
                    info!("slave {}: operation enabled (0x{:04X})", pos, sw);
                }
                intent.fault_reset = false;
                intent.power.fault_reset_attempts = 0;
            }
            other => {
                intent.power.enabled = false;
                intent.fault_reset = false;
                if let Some(step) = cia402::enable_step(other) {
                    if intent.power.paced(now, period) {
                        if intent.power.commanded != Some(step) {
                            debug!("slave {}: {:?} -> controlword 0x{:04X}", pos, other, step);
                        }
                        intent.power.commanded = Some(step);
                        intent.power.last_transition = Some(now);
                    }
                }
            }
        }
    }

    fn update_mode(&mut self, pos: u16, now: Instant) {
        let domain = self.domain;
        let mode_off = self.obj_offset(pos, cia402::MODES_OF_OPERATION);
        let disp_off = self.obj_offset(pos, cia402::MODES_OF_OPERATION_DISPLAY);
        let interval = Duration::from_millis(self.cfg.mode_verify_interval_ms);
        let attempt_budget = self.cfg.mode_verify_attempts;

        // Snapshot what the maintenance pass needs, then act.
        let (raw, attempt_due) = {
            let Some(intent) = self.intents.get_mut(&pos) else { return };
            let Some(m) = intent.mode.as_ref() else { return };
            if !m.maintaining() {
                return;
            }
            (m.mode.raw(), now >= m.next_attempt)
        };

        // Command the mode: PDO when mapped, throttled SDO otherwise.
        match (domain, mode_off) {
            (Some(d), Some(off)) => {
                let _ = self.master.write_domain(d, off, &[raw as u8]);
            }
            _ => {
                let due = {
                    let m = self.intents[&pos].mode.as_ref().unwrap();
                    match m.last_sdo {
                        Some((v, at)) => v != raw || now.duration_since(at) >= SDO_REFRESH,
                        None => true,
                    }
                };
                if due && self.take_sdo(pos) {
                    match self
                        .master
                        .sdo_download(pos, cia402::MODES_OF_OPERATION, 0, &[raw as u8])
                    {
                        Ok(()) => {
                            let intent = self.intents.get_mut(&pos).unwrap();
                            if let Some(m) = intent.mode.as_mut() {
                                m.last_sdo = Some((raw, now));
                            }
                        }
                        Err(e) => warn!("slave {}: mode SDO write failed: {}", pos, e),
                    }
                }
            }
        }

        // Verify against the display object.
        let display: Option<i8> = match (domain, disp_off) {
            (Some(d), Some(off)) => read_i8_at(&self.master, d, off),
            _ => {
                if attempt_due && self.take_sdo(pos) {
                    let mut buf = [0u8; 1];
                    match self
                        .master
                        .sdo_upload(pos, cia402::MODES_OF_OPERATION_DISPLAY, 0, &mut buf)
                    {
                        Ok(n) if n >= 1 => Some(buf[0] as i8),
                        _ => None,
                    }
                } else {
                    None
                }
            }
        };

        let Some(intent) = self.intents.get_mut(&pos) else { return };
        let Some(m) = intent.mode.as_mut() else { return };
        if display == Some(raw) {
            m.verified = true;
            info!("slave {}: mode {:?} verified", pos, m.mode);
            return;
        }
        if attempt_due {
            m.attempts += 1;
            m.next_attempt = now + interval;
            if m.attempts >= attempt_budget {
                m.failed = true;
                warn!(
                    "slave {}: mode {:?} not confirmed after {} attempts",
                    pos, m.mode, m.attempts
                );
                intent.last_failure = Some(FailureKind::ModeVerifyTimeout);
            }
        }
    }

    fn update_velocity(&mut self, pos: u16, now: Instant) {
        let domain = self.domain;
        let off = self.obj_offset(pos, cia402::TARGET_VELOCITY);
        let v = {
            let Some(intent) = self.intents.get_mut(&pos) else { return };
            let mode_settled = intent
                .mode
                .as_ref()
                .map(|m| m.verified || m.failed)
                .unwrap_or(false);
            if !mode_settled || !intent.power.enabled || intent.manual_disable {
                return;
            }
            let Some(v) = intent.velocity else { return };
            v
        };
        match (domain, off) {
            (Some(d), Some(off)) => {
                let mut buf = [0u8; 4];
                LE::write_i32(&mut buf, v);
                let _ = self.master.write_domain(d, off, &buf);
            }
            _ => {
                let due = match self.intents[&pos].velocity_sdo {
                    Some((prev, at)) => prev != v || now.duration_since(at) >= SDO_REFRESH,
                    None => true,
                };
                if due && self.take_sdo(pos) {
                    match self
                        .master
                        .sdo_download(pos, cia402::TARGET_VELOCITY, 0, &v.to_le_bytes())
                    {
                        Ok(()) => {
                            self.intents.get_mut(&pos).unwrap().velocity_sdo = Some((v, now));
                        }
                        Err(e) => warn!("slave {}: velocity SDO write failed: {}", pos, e),
                    }
                }
            }
        }
    }

    fn update_position(&mut self, pos: u16, sw: Option<u16>, now: Instant) {
        let domain = self.domain;
        let target_off = self.obj_offset(pos, cia402::TARGET_POSITION);
        let actual_off = self.obj_offset(pos, cia402::POSITION_ACTUAL);
        let ack_mask = self.cfg.pp_ack_mask;
        let ack_timeout = Duration::from_millis(self.cfg.pp_ack_timeout_ms);
        let stall_window = Duration::from_millis(self.cfg.pp_stall_window_ms);
        let rescue_interval = Duration::from_millis(self.cfg.bit4_cycle_interval_ms);
        let min_delta = self.cfg.pp_stall_min_delta.max(1);
        let max_rescues = self.cfg.pp_max_rescues;

        let actual = match (domain, actual_off) {
            (Some(d), Some(off)) => read_i32_at(&self.master, d, off),
            _ => None,
        };

        // Decide writes with the intent borrowed, perform them after.
        let mut write_target: Option<i32> = None;
        let mut sdo_target: Option<i32> = None;
        {
            let Some(intent) = self.intents.get_mut(&pos) else { return };
            let mode = intent.commanded_mode();
            let mode_settled = intent
                .mode
                .as_ref()
                .map(|m| m.verified || m.failed)
                .unwrap_or(false);
            let enabled = intent.power.enabled && !intent.manual_disable;
            if !mode_settled || !enabled {
                return;
            }

            match mode {
                Some(OperationMode::CyclicSyncPosition) => {
                    // Stream the buffered target every cycle; no strobe.
                    if let Some(t) = intent.csp_target {
                        write_target = Some(t);
                    }
                }
                Some(OperationMode::ProfilePosition) => {
                    let Some(p) = intent.position.as_mut() else { return };
                    if p.failed {
                        return;
                    }

                    if p.applied != Some(p.target) {
                        if target_off.is_some() {
                            write_target = Some(p.target);
                        } else if !intent.position_sdo_done {
                            sdo_target = Some(p.target);
                            intent.position_sdo_done = true;
                        }
                        p.applied = Some(p.target);
                        p.pulse_due = true;
                        p.ack_pending = true;
                        p.ack_timed_out = false;
                        p.ack_deadline = now + ack_timeout;
                        p.motion_at = now;
                        p.motion_pos = None;
                    }

                    if p.ack_pending {
                        if let Some(sw) = sw {
                            if sw & ack_mask != 0 {
                                p.ack_pending = false;
                            }
                        }
                        if p.ack_pending && now >= p.ack_deadline {
                            p.ack_pending = false;
                            p.ack_timed_out = true;
                            warn!("slave {}: set-point not acknowledged in time", pos);
                        }
                    }

                    if let Some(a) = actual {
                        match p.motion_pos {
                            None => {
                                p.motion_pos = Some(a);
                                p.motion_at = now;
                            }
                            Some(prev) if (a.wrapping_sub(prev)).abs() >= min_delta => {
                                p.motion_pos = Some(a);
                                p.motion_at = now;
                            }
                            _ => {}
                        }
                        let reached = (a.wrapping_sub(p.target)).abs() < min_delta;
                        if !reached
                            && p.rescue.is_none()
                            && now.duration_since(p.motion_at) >= stall_window
                        {
                            let throttled = p
                                .last_rescue
                                .map(|t| now.duration_since(t) < rescue_interval)
                                .unwrap_or(false);
                            if !throttled {
                                if p.rescues >= max_rescues {
                                    p.failed = true;
                                    warn!(
                                        "slave {}: PP stall persists after {} rescues",
                                        pos, p.rescues
                                    );
                                    intent.last_failure = Some(FailureKind::PpStall);
                                } else {
                                    p.rescue = Some(RescuePhase::Clearing);
                                    p.rescues += 1;
                                    p.last_rescue = Some(now);
                                    debug!(
                                        "slave {}: PP stall, bit-4 rescue {}/{}",
                                        pos, p.rescues, max_rescues
                                    );
                                }
                            }
                        }
                    }
                }
                _ => return,
            }
        }

        if let (Some(t), Some(d), Some(off)) = (write_target, domain, target_off) {
            let mut buf = [0u8; 4];
            LE::write_i32(&mut buf, t);
            let _ = self.master.write_domain(d, off, &buf);
        }
        if let Some(t) = sdo_target {
            if self.take_sdo(pos) {
                warn!(
                    "slave {}: 0x{:04X} not in PDO; writing target via SDO once",
                    pos,
                    cia402::TARGET_POSITION
                );
                if let Err(e) =
                    self.master
                        .sdo_download(pos, cia402::TARGET_POSITION, 0, &t.to_le_bytes())
                {
                    warn!("slave {}: position SDO write failed: {}", pos, e);
                }
            }
        }
    }

    fn write_controlword(&mut self, pos: u16) {
        let domain = self.domain;
        let cw_off = self.obj_offset(pos, cia402::CONTROLWORD);
        let (Some(d), Some(off)) = (domain, cw_off) else { return };
        let Some(intent) = self.intents.get_mut(&pos) else { return };
        let Some(base) = intent.power.commanded else { return };

        let mut cw = base;
        let enabled = intent.power.enabled && !intent.manual_disable;
        if enabled {
            cw &= !cia402::CW_BIT_HALT;
            match intent.commanded_mode() {
                Some(OperationMode::ProfilePosition) => {
                    cw |= cia402::CW_BIT_CHANGE_IMMEDIATELY;
                    cw &= !cia402::CW_BIT_ABS_REL;
                    if let Some(p) = intent.position.as_mut() {
                        if p.rescue == Some(RescuePhase::Clearing) {
                            // Quiet cycle; the strobe returns next cycle.
                            cw &= !cia402::CW_BIT_NEW_SET_POINT;
                            p.rescue = None;
                            p.pulse_due = true;
                        } else if p.pulse_due {
                            cw |= cia402::CW_BIT_NEW_SET_POINT;
                            p.pulse_due = false;
                        }
                    }
                }
                Some(OperationMode::Homing) => {
                    if intent.homing_strobe {
                        cw |= cia402::CW_BIT_NEW_SET_POINT;
                        intent.homing_strobe = false;
                    }
                }
                _ => {}
            }
        }

        let mut buf = [0u8; 2];
        LE::write_u16(&mut buf, cw);
        let _ = self.master.write_domain(d, off, &buf);
        intent.last_controlword = cw;
    }

    fn probe_write(&mut self, pos: u16, value: u16) {
        let domain = self.domain;
        let off = self.obj_offset(pos, cia402::PROBE_FUNCTION);
        match (domain, off) {
            (Some(d), Some(off)) => {
                let mut buf = [0u8; 2];
                LE::write_u16(&mut buf, value);
                let _ = self.master.write_domain(d, off, &buf);
            }
            _ => {
                if self.take_sdo(pos) {
                    if let Err(e) = self.master.sdo_download(
                        pos,
                        cia402::PROBE_FUNCTION,
                        0,
                        &value.to_le_bytes(),
                    ) {
                        warn!("slave {}: probe SDO write failed: {}", pos, e);
                    }
                }
            }
        }
    }

    fn probe_readback(&mut self, pos: u16) -> Option<u16> {
        if !self.take_sdo(pos) {
            return None;
        }
        let mut buf = [0u8; 2];
        match self
            .master
            .sdo_upload(pos, cia402::PROBE_FUNCTION, 0, &mut buf)
        {
            Ok(n) if n >= 2 => Some(LE::read_u16(&buf)),
            _ => None,
        }
    }

    fn update_probe(&mut self, pos: u16, now: Instant) {
        let window = Duration::from_millis(self.cfg.probe_transition_ms);
        let retry_budget = self.cfg.probe_arm_retries;

        // New request: start (or restart) the disable-first transition.
        let request = match self.intents.get_mut(&pos) {
            Some(intent) => intent.probe_request.take(),
            None => return,
        };
        if let Some(req) = request {
            let current = self.intents[&pos].probe;
            let already = matches!(current, ProbeArm::Armed { value } if value == req);
            if !already {
                self.probe_write(pos, cia402::PROBE_DISABLED);
                let next = if req == cia402::PROBE_DISABLED {
                    ProbeArm::Idle
                } else {
                    ProbeArm::DisableWait {
                        value: req,
                        resume_at: now + window,
                        retries: 0,
                    }
                };
                self.intents.get_mut(&pos).unwrap().probe = next;
            }
        }

        let state = self.intents[&pos].probe;
        match state {
            ProbeArm::DisableWait {
                value,
                resume_at,
                retries,
            } if now >= resume_at => {
                self.probe_write(pos, value);
                self.intents.get_mut(&pos).unwrap().probe = ProbeArm::Verify {
                    value,
                    deadline: now + window,
                    retries,
                };
            }
            ProbeArm::Verify {
                value,
                deadline,
                retries,
            } => {
                let readback = self.probe_readback(pos);
                if readback == Some(value) {
                    info!("slave {}: probe armed (0x{:04X})", pos, value);
                    self.intents.get_mut(&pos).unwrap().probe = ProbeArm::Armed { value };
                } else if now >= deadline {
                    if retries < retry_budget {
                        self.probe_write(pos, cia402::PROBE_DISABLED);
                        self.intents.get_mut(&pos).unwrap().probe = ProbeArm::DisableWait {
                            value,
                            resume_at: now + window,
                            retries: retries + 1,
                        };
                    } else {
                        warn!(
                            "slave {}: probe readback mismatch after {} retries",
                            pos, retries
                        );
                        let intent = self.intents.get_mut(&pos).unwrap();
                        intent.probe = ProbeArm::Failed;
                        intent.last_failure = Some(FailureKind::ProbeArmMismatch);
                    }
                }
            }
            _ => {}
        }
    }

    fn update_homing(&mut self, pos: u16, sw: Option<u16>, now: Instant) {
        let state = match self.intents.get(&pos) {
            Some(intent) => intent.homing,
            None => return,
        };
        match state {
            HomingState::Staging { step } => {
                let dcfg = self.cfg.drive(pos).unwrap();
                let units = dcfg.units;
                let hcfg = dcfg.homing.clone().unwrap_or_default();
                let mut s = step;
                while s <= 4 {
                    let write: Option<(u16, u8, Vec<u8>)> = match s {
                        0 => hcfg
                            .method
                            .map(|m| (cia402::HOMING_METHOD, 0, vec![m as u8])),
                        1 => hcfg.search_velocity.map(|v| {
                            (
                                cia402::HOMING_SPEEDS,
                                1,
                                units.to_pulses_unsigned(v).to_le_bytes().to_vec(),
                            )
                        }),
                        2 => hcfg.zero_velocity.map(|v| {
                            (
                                cia402::HOMING_SPEEDS,
                                2,
                                units.to_pulses_unsigned(v).to_le_bytes().to_vec(),
                            )
                        }),
                        3 => hcfg.acceleration.map(|v| {
                            (
                                cia402::HOMING_ACCELERATION,
                                0,
                                units.to_pulses_unsigned(v).to_le_bytes().to_vec(),
                            )
                        }),
                        4 => hcfg.offset.map(|v| {
                            (
                                cia402::HOME_OFFSET,
                                0,
                                units.to_pulses(v).to_le_bytes().to_vec(),
                            )
                        }),
                        _ => None,
                    };
                    match write {
                        Some((index, subindex, data)) => {
                            if !self.take_sdo(pos) {
                                // No mailbox slot left this cycle; resume here.
                                self.intents.get_mut(&pos).unwrap().homing =
                                    HomingState::Staging { step: s };
                                return;
                            }
                            if let Err(e) = self.master.sdo_download(pos, index, subindex, &data) {
                                warn!(
                                    "slave {}: homing parameter 0x{:04X}:{} refused: {}",
                                    pos, index, subindex, e
                                );
                                self.intents.get_mut(&pos).unwrap().last_failure =
                                    Some(FailureKind::ParameterStaging);
                            }
                            s += 1;
                        }
                        None => s += 1,
                    }
                }
                self.set_mode(pos, OperationMode::Homing, now);
                self.intents.get_mut(&pos).unwrap().homing = HomingState::AwaitMode;
            }
            HomingState::AwaitMode => {
                let timeout = self
                    .cfg
                    .drive(pos)
                    .and_then(|d| d.homing.as_ref())
                    .map(|h| h.timeout_s)
                    .filter(|&t| t > 0.0)
                    .unwrap_or(30.0);
                let intent = self.intents.get_mut(&pos).unwrap();
                match intent.mode.as_ref() {
                    Some(m) if m.mode == OperationMode::Homing && m.verified => {
                        intent.homing_strobe = true;
                        intent.homing = HomingState::InProgress {
                            deadline: now + Duration::from_secs_f64(timeout),
                        };
                        info!("slave {}: homing started", pos);
                    }
                    Some(m) if m.mode == OperationMode::Homing && m.failed => {
                        intent.homing = HomingState::Failed;
                        intent.last_failure = Some(FailureKind::HomingFailed);
                    }
                    _ => {}
                }
            }
            HomingState::InProgress { deadline } => {
                let intent = self.intents.get_mut(&pos).unwrap();
                if let Some(sw) = sw {
                    if sw & cia402::SW_BIT_HOMING_ERROR != 0 {
                        warn!("slave {}: homing failed (0x{:04X})", pos, sw);
                        intent.homing = HomingState::Failed;
                        intent.last_failure = Some(FailureKind::HomingFailed);
                        return;
                    }
                    let done = cia402::SW_BIT_SETPOINT_ACK | cia402::SW_BIT_TARGET_REACHED;
                    if sw & done == done {
                        info!("slave {}: homing complete", pos);
                        intent.homing = HomingState::Complete;
                        return;
                    }
                }
                if now >= deadline {
                    warn!("slave {}: homing timed out", pos);
                    intent.homing = HomingState::Failed;
                    intent.last_failure = Some(FailureKind::HomingTimeout);
                }
            }
            _ => {}
        }
    }

    /// Build the status snapshot for this cycle.
    fn snapshot(&self, now: Instant) -> NetworkStatus {
        let mut drives = BTreeMap::new();
        for (&pos, intent) in &self.intents {
            let units = self.cfg.drive(pos).map(|d| d.units).unwrap_or_default();
            let neg_index = self
                .probe_neg
                .get(&pos)
                .copied()
                .unwrap_or(cia402::PROBE_POS_NEGATIVE);
            let mut ds = DriveStatus::default();
            ds.in_op = self.in_op.get(&pos).copied().unwrap_or(false);
            if let Ok(st) = self.master.slave_config_state(pos) {
                ds.al_state = st.al_state;
            }

            if let Some(d) = self.domain {
                if let Some(off) = self.obj_offset(pos, cia402::STATUSWORD) {
                    ds.statusword = read_u16_at(&self.master, d, off);
                }
                if let Some(sw) = ds.statusword {
                    ds.fault = power_state(sw) == PowerState::Fault;
                    ds.enabled =
                        power_state(sw) == PowerState::OperationEnabled && !intent.manual_disable;
                }
                if let Some(off) = self.obj_offset(pos, cia402::MODES_OF_OPERATION_DISPLAY) {
                    ds.mode_display = read_i8_at(&self.master, d, off);
                }
                if let Some(off) = self.obj_offset(pos, cia402::POSITION_ACTUAL) {
                    ds.position_actual_pulses = read_i32_at(&self.master, d, off);
                    ds.position_actual = ds.position_actual_pulses.map(|p| units.from_pulses(p));
                }
                if let Some(off) = self.obj_offset(pos, cia402::VELOCITY_ACTUAL) {
                    ds.velocity_actual_pulses = read_i32_at(&self.master, d, off);
                    ds.velocity_actual = ds.velocity_actual_pulses.map(|p| units.from_pulses(p));
                }
                if let Some(off) = self.obj_offset(pos, cia402::PROBE_STATUS) {
                    ds.probe_status = read_u16_at(&self.master, d, off);
                    ds.probe_active = ds
                        .probe_status
                        .map(|s| s & cia402::PROBE_STATUS_ACTIVE != 0)
                        .unwrap_or(false);
                }
                if let Some(off) = self.obj_offset(pos, cia402::PROBE_POS_POSITIVE) {
                    ds.probe_pos_positive = read_i32_at(&self.master, d, off);
                }
                if let Some(off) = self.obj_offset(pos, neg_index) {
                    ds.probe_pos_negative = read_i32_at(&self.master, d, off);
                }
                if let Some(off) = self.obj_offset(pos, cia402::DIGITAL_INPUTS) {
                    ds.digital_inputs = read_u32_at(&self.master, d, off);
                }
                if ds.fault {
                    if let Some(off) = self.obj_offset(pos, cia402::ERROR_CODE) {
                        ds.fault_code = read_u16_at(&self.master, d, off);
                    }
                }
            }

            ds.mode_verified = intent.mode.as_ref().map(|m| m.verified).unwrap_or(false);
            ds.homing = match intent.homing {
                HomingState::Idle => HomingProgress::Idle,
                HomingState::Complete => HomingProgress::Complete,
                HomingState::Failed => HomingProgress::Failed,
                _ => HomingProgress::InProgress,
            };
            ds.last_failure = intent.last_failure;
            ds.features = self.features.get(&pos).copied().unwrap_or_default();
            ds.op_dropouts = intent.op_dropouts;

            for index in [
                cia402::CONTROLWORD,
                cia402::STATUSWORD,
                cia402::MODES_OF_OPERATION,
                cia402::MODES_OF_OPERATION_DISPLAY,
                cia402::POSITION_ACTUAL,
                cia402::VELOCITY_ACTUAL,
                cia402::TARGET_POSITION,
                cia402::TARGET_VELOCITY,
                cia402::PROBE_FUNCTION,
                cia402::PROBE_STATUS,
                cia402::PROBE_POS_POSITIVE,
                neg_index,
                cia402::DIGITAL_INPUTS,
                cia402::ERROR_CODE,
            ] {
                let health = match (self.domain, self.obj_offset(pos, index)) {
                    (Some(d), Some(off)) => {
                        let mut probe = [0u8; 1];
                        if self.master.read_domain(d, off, &mut probe).is_ok() {
                            PdoHealth::Mapped
                        } else {
                            PdoHealth::Error
                        }
                    }
                    _ => PdoHealth::Missing,
                };
                ds.pdo_health.insert(index, health);
            }

            drives.insert(pos, ds);
        }

        NetworkStatus {
            timestamp_ns: now.duration_since(self.start).as_nanos() as u64,
            cycle_time_ms: self.cfg.cycle_time_ms,
            sdo_only: self.cfg.sdo_only,
            cycle_count: self.cycle_count,
            domain: self.last_domain,
            stats: self.stats,
            all_op: !self.in_op.is_empty() && self.in_op.values().all(|&v| v),
            drives,
        }
    }

    /// Orderly teardown: command drives safe, then deactivate and release.
    /// After this returns no further PDO sends occur.
    pub fn teardown(&mut self) {
        if let Some(domain) = self.domain {
            let cycle = Duration::from_nanos(self.cfg.cycle_time_ns());
            let cycles = ((Duration::from_millis(500).as_nanos() / cycle.as_nanos().max(1))
                as usize)
                .max(50);
            info!("graceful shutdown: disabling drives over {} cycles", cycles);

            let positions: Vec<u16> = self.intents.keys().copied().collect();
            for &pos in &positions {
                if let Some(off) = self.obj_offset(pos, cia402::TARGET_VELOCITY) {
                    let _ = self.master.write_domain(domain, off, &0i32.to_le_bytes());
                }
                // Hold position: rewrite the current actual as the target.
                if let (Some(t_off), Some(a_off)) = (
                    self.obj_offset(pos, cia402::TARGET_POSITION),
                    self.obj_offset(pos, cia402::POSITION_ACTUAL),
                ) {
                    if let Some(actual) = read_i32_at(&self.master, domain, a_off) {
                        let _ = self
                            .master
                            .write_domain(domain, t_off, &actual.to_le_bytes());
                    }
                }
            }
            for _ in 0..cycles {
                if self.master.receive().is_err() {
                    break;
                }
                if self.master.process(domain).is_err() {
                    break;
                }
                for &pos in &positions {
                    if let Some(off) = self.obj_offset(pos, cia402::CONTROLWORD) {
                        let _ = self.master.write_domain(
                            domain,
                            off,
                            &cia402::CW_DISABLE_VOLTAGE.to_le_bytes(),
                        );
                    }
                }
                if self.master.queue(domain).is_err() || self.master.send().is_err() {
                    break;
                }
                thread::sleep(cycle);
            }
            info!("graceful shutdown complete");
        }
        self.master.deactivate();
        self.master.release();
    }
}

/// Resolve a drive's PDO maps and capability flags from the explicit
/// override or the ESI reference.
fn resolve_mapping(
    d: &DriveConfig,
    sdo_only: bool,
) -> Result<(Vec<PdoConfig>, Vec<PdoConfig>, DriveFeatures, Option<u16>)> {
    if let Some(sel) = &d.pdo {
        let dev = EsiDevice {
            name: String::new(),
            product_code: d.product_code,
            revision: None,
            rx_pdos: sel.rx.clone(),
            tx_pdos: sel.tx.clone(),
        };
        let features = dev.features();
        let neg = dev.probe_neg_index();
        return Ok((dev.rx_pdos, dev.tx_pdos, features, neg));
    }
    if let Some(esi) = &d.esi {
        let dev = match esi {
            EsiRef::File(path) => esi::decode_esi_file(path, Some(d.product_code))?,
            EsiRef::Device(dev) => dev.clone(),
        };
        let features = dev.features();
        let neg = dev.probe_neg_index();
        return Ok((dev.rx_pdos, dev.tx_pdos, features, neg));
    }
    if sdo_only {
        return Ok((Vec::new(), Vec::new(), DriveFeatures::default(), None));
    }
    Err(Error::InvalidConfig(format!(
        "drive {}: needs an ESI reference or explicit PDO mapping",
        d.position
    )))
}

fn read_u16_at<M: MasterAccess>(m: &M, d: DomainIdx, off: usize) -> Option<u16> {
    let mut buf = [0u8; 2];
    m.read_domain(d, off, &mut buf).ok()?;
    Some(LE::read_u16(&buf))
}

fn read_u32_at<M: MasterAccess>(m: &M, d: DomainIdx, off: usize) -> Option<u32> {
    let mut buf = [0u8; 4];
    m.read_domain(d, off, &mut buf).ok()?;
    Some(LE::read_u32(&buf))
}

fn read_i32_at<M: MasterAccess>(m: &M, d: DomainIdx, off: usize) -> Option<i32> {
    let mut buf = [0u8; 4];
    m.read_domain(d, off, &mut buf).ok()?;
    Some(LE::read_i32(&buf))
}

fn read_i8_at<M: MasterAccess>(m: &M, d: DomainIdx, off: usize) -> Option<i8> {
    let mut buf = [0u8; 1];
    m.read_domain(d, off, &mut buf).ok()?;
    Some(buf[0] as i8)
}
