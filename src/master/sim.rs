// Part of ethercat-motion. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! In-memory master used by the test suite and for development without
//! hardware.  Keeps a byte-exact process-data image, assigns offsets the way
//! the kernel master would, and journals every domain write with the cycle
//! it happened in so tests can assert exact wire sequences.

use std::collections::{BTreeMap, HashMap};

use crate::master::{
    AlState, DomainIdx, DomainState, MasterAccess, MasterInfo, SlaveConfigState, SlaveId,
    SlaveInfo, SyncConfig,
};
use crate::{Error, Result};

/// One journaled domain write.  `cycle` is the number of completed `send`
/// calls at the time of the write, so two writes in the same cycle share it.
#[derive(Debug, Clone)]
pub struct DomainWrite {
    pub cycle: u64,
    pub offset: usize,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct SimSlave {
    pub id: SlaveId,
    pub alias: u16,
    pub online: bool,
    pub operational: bool,
    pub al_state: u8,
    /// Object store backing SDO upload/download.
    pub sdo_store: HashMap<(u16, u8), Vec<u8>>,
    pub sdo_downloads: Vec<(u16, u8, Vec<u8>)>,
    /// SDOs queued for the startup transition.
    pub config_sdos: Vec<(u16, u8, Vec<u8>)>,
    pub syncs: Vec<SyncConfig>,
    pub dc: Option<(u16, u32, i32, u32, i32)>,
}

#[derive(Default)]
pub struct SimMaster {
    requested: bool,
    activated: bool,
    domain_count: usize,
    domain: Vec<u8>,
    next_offset: usize,
    offsets: HashMap<(u16, u16, u8), usize>,
    slaves: BTreeMap<u16, SimSlave>,
    writes: Vec<DomainWrite>,
    cycles_sent: u64,
    app_times: Vec<u64>,
    reference_clock: Option<u16>,
    domain_state: DomainState,
    released: bool,
    /// Test knob: make `activate` fail.
    pub fail_activate: bool,
    /// Test knob: make `request` report a busy master.
    pub fail_request: bool,
}

impl SimMaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slave(&self, pos: u16) -> Option<&SimSlave> {
        self.slaves.get(&pos)
    }

    pub fn slave_mut(&mut self, pos: u16) -> &mut SimSlave {
        self.slaves.entry(pos).or_default()
    }

    /// Bring a slave (pre-created or not) into or out of OP.
    pub fn set_operational(&mut self, pos: u16, op: bool) {
        let s = self.slave_mut(pos);
        s.online = true;
        s.operational = op;
        s.al_state = if op { AlState::Op.raw() } else { AlState::Safeop.raw() };
    }

    pub fn offset_of(&self, pos: u16, index: u16, subindex: u8) -> Option<usize> {
        self.offsets.get(&(pos, index, subindex)).copied()
    }

    /// Write slave-side input data (e.g. a statusword) into the image.
    pub fn set_input(&mut self, pos: u16, index: u16, subindex: u8, data: &[u8]) {
        let off = self
            .offset_of(pos, index, subindex)
            .unwrap_or_else(|| panic!("object 0x{:04X}:{} not registered", index, subindex));
        self.domain[off..off + data.len()].copy_from_slice(data);
    }

    pub fn domain_bytes(&self, pos: u16, index: u16, subindex: u8, len: usize) -> Vec<u8> {
        let off = self
            .offset_of(pos, index, subindex)
            .unwrap_or_else(|| panic!("object 0x{:04X}:{} not registered", index, subindex));
        self.domain[off..off + len].to_vec()
    }

    /// Journal of writes that landed on one object's offset.
    pub fn writes_to(&self, pos: u16, index: u16, subindex: u8) -> Vec<DomainWrite> {
        match self.offset_of(pos, index, subindex) {
            Some(off) => self
                .writes
                .iter()
                .filter(|w| w.offset == off)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn set_sdo_object(&mut self, pos: u16, index: u16, subindex: u8, data: &[u8]) {
        self.slave_mut(pos)
            .sdo_store
            .insert((index, subindex), data.to_vec());
    }

    pub fn sdo_downloads(&self, pos: u16, index: u16) -> Vec<(u16, u8, Vec<u8>)> {
        self.slaves
            .get(&pos)
            .map(|s| {
                s.sdo_downloads
                    .iter()
                    .filter(|(i, _, _)| *i == index)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn cycles_sent(&self) -> u64 {
        self.cycles_sent
    }

    pub fn app_times(&self) -> &[u64] {
        &self.app_times
    }

    pub fn set_domain_state(&mut self, state: DomainState) {
        self.domain_state = state;
    }

    pub fn released(&self) -> bool {
        self.released
    }

    fn entry_size(&self, pos: u16, index: u16, subindex: u8) -> usize {
        let bits = self
            .slaves
            .get(&pos)
            .and_then(|s| {
                s.syncs.iter().flat_map(|sc| &sc.pdos).find_map(|p| {
                    p.entries
                        .iter()
                        .find(|e| e.index == index && e.subindex == subindex)
                        .map(|e| e.bit_len as usize)
                })
            })
            .unwrap_or(8);
        (bits + 7) / 8
    }
}

impl MasterAccess for SimMaster {
    fn request(&mut self, _sdo_only: bool) -> Result<()> {
        if self.fail_request {
            return Err(Error::MasterBusy(0));
        }
        self.requested = true;
        Ok(())
    }

    fn release(&mut self) {
        self.released = true;
        self.requested = false;
    }

    fn create_domain(&mut self) -> Result<DomainIdx> {
        let idx = self.domain_count;
        self.domain_count += 1;
        Ok(idx)
    }

    fn config_slave(&mut self, alias: u16, pos: u16, id: SlaveId) -> Result<()> {
        let s = self.slave_mut(pos);
        s.id = id;
        s.alias = alias;
        s.online = true;
        Ok(())
    }

    fn config_pdos(&mut self, pos: u16, syncs: &[SyncConfig]) -> Result<()> {
        self.slave_mut(pos).syncs = syncs.to_vec();
        Ok(())
    }

    fn register_pdo_entries(
        &mut self,
        _domain: DomainIdx,
        pos: u16,
        entries: &[(u16, u8)],
    ) -> Result<Vec<usize>> {
        let mut out = Vec::with_capacity(entries.len());
        for &(index, subindex) in entries {
            let size = self.entry_size(pos, index, subindex);
            let off = self.next_offset;
            self.next_offset += size;
            self.offsets.insert((pos, index, subindex), off);
            out.push(off);
        }
        if self.domain.len() < self.next_offset {
            self.domain.resize(self.next_offset, 0);
        }
        Ok(out)
    }

    fn config_dc(
        &mut self,
        pos: u16,
        assign_activate: u16,
        sync0_cycle_ns: u32,
        sync0_shift_ns: i32,
        sync1_cycle_ns: u32,
        sync1_shift_ns: i32,
    ) -> Result<()> {
        self.slave_mut(pos).dc = Some((
            assign_activate,
            sync0_cycle_ns,
            sync0_shift_ns,
            sync1_cycle_ns,
            sync1_shift_ns,
        ));
        Ok(())
    }

    fn select_reference_clock(&mut self, pos: u16) -> Result<()> {
        self.reference_clock = Some(pos);
        Ok(())
    }

    fn config_sdo(&mut self, pos: u16, index: u16, subindex: u8, data: &[u8]) -> Result<()> {
        self.slave_mut(pos)
            .config_sdos
            .push((index, subindex, data.to_vec()));
        Ok(())
    }

    fn activate(&mut self) -> Result<()> {
        if !self.requested {
            return Err(Error::NullHandle("master not requested"));
        }
        if self.fail_activate {
            return Err(Error::ActivateFailed(-1));
        }
        self.activated = true;
        Ok(())
    }

    fn deactivate(&mut self) {
        self.activated = false;
    }

    fn receive(&mut self) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, _domain: DomainIdx) -> Result<()> {
        Ok(())
    }

    fn queue(&mut self, _domain: DomainIdx) -> Result<()> {
        Ok(())
    }

    fn send(&mut self) -> Result<()> {
        self.cycles_sent += 1;
        Ok(())
    }

    fn set_application_time(&mut self, time_ns: u64) -> Result<()> {
        self.app_times.push(time_ns);
        Ok(())
    }

    fn sync_reference_clock(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync_slave_clocks(&mut self) -> Result<()> {
        Ok(())
    }

    fn domain_state(&mut self, _domain: DomainIdx) -> Result<DomainState> {
        Ok(self.domain_state)
    }

    fn read_domain(&self, _domain: DomainIdx, offset: usize, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len();
        if end > self.domain.len() {
            return Err(Error::DomainError(format!(
                "read past domain end ({} > {})",
                end,
                self.domain.len()
            )));
        }
        buf.copy_from_slice(&self.domain[offset..end]);
        Ok(())
    }

    fn write_domain(&mut self, _domain: DomainIdx, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset + data.len();
        if end > self.domain.len() {
            return Err(Error::DomainError(format!(
                "write past domain end ({} > {})",
                end,
                self.domain.len()
            )));
        }
        self.domain[offset..end].copy_from_slice(data);
        self.writes.push(DomainWrite {
            cycle: self.cycles_sent,
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn slave_config_state(&self, pos: u16) -> Result<SlaveConfigState> {
        let s = self
            .slaves
            .get(&pos)
            .ok_or(Error::NullHandle("slave not configured"))?;
        Ok(SlaveConfigState {
            online: s.online,
            operational: s.operational,
            al_state: s.al_state,
        })
    }

    fn slave_info(&self, pos: u16) -> Result<SlaveInfo> {
        let s = self
            .slaves
            .get(&pos)
            .ok_or(Error::NullHandle("slave not configured"))?;
        Ok(SlaveInfo {
            name: format!("sim-slave-{}", pos),
            ring_pos: pos,
            id: s.id,
            revision_number: 0,
            serial_number: 0,
            alias: s.alias,
            current_on_ebus: 0,
            al_state: AlState::from_raw(s.al_state),
            error_flag: false,
        })
    }

    fn master_info(&self) -> Result<MasterInfo> {
        Ok(MasterInfo {
            slave_count: self.slaves.len() as u32,
            link_up: true,
            scan_busy: false,
            app_time: self.app_times.last().copied().unwrap_or(0),
        })
    }

    fn sdo_download(&mut self, pos: u16, index: u16, subindex: u8, data: &[u8]) -> Result<()> {
        let s = self.slave_mut(pos);
        s.sdo_downloads.push((index, subindex, data.to_vec()));
        s.sdo_store.insert((index, subindex), data.to_vec());
        Ok(())
    }

    fn sdo_upload(&mut self, pos: u16, index: u16, subindex: u8, buf: &mut [u8]) -> Result<usize> {
        let s = self
            .slaves
            .get(&pos)
            .ok_or(Error::NullHandle("slave not configured"))?;
        match s.sdo_store.get(&(index, subindex)) {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            // CoE 0x06020000: object does not exist.
            None => Err(Error::SdoAbort {
                pos,
                index,
                subindex,
                code: 0x0602_0000,
            }),
        }
    }
}
