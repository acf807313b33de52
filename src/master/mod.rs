// Part of ethercat-motion. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Master adapter surface.
//!
//! [`MasterAccess`] is the seam between the cyclic engine and the EtherCAT
//! kernel library.  The real backend ([`igh::Master`], feature `igh`) wraps
//! the IgH userspace API with its memory-layout contracts; [`sim::SimMaster`]
//! is an in-memory implementation for tests and hardware-less development.

use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::Result;

#[cfg(feature = "igh")]
pub mod igh;
pub mod sim;

pub type DomainIdx = usize;

/// An EtherCAT slave identification, consisting of vendor ID and product code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, new, Serialize, Deserialize)]
pub struct SlaveId {
    pub vendor_id: u32,
    pub product_code: u32,
}

/// One PDO entry: object index, subindex and bit length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new, Serialize, Deserialize)]
pub struct PdoEntryDef {
    pub index: u16,
    pub subindex: u8,
    pub bit_len: u8,
}

/// One PDO with its mapped entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdoConfig {
    pub index: u16,
    pub entries: Vec<PdoEntryDef>,
}

impl PdoConfig {
    pub fn new(index: u16, entries: Vec<PdoEntryDef>) -> Self {
        Self { index, entries }
    }
}

/// Sync-manager transfer direction, seen from the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmDirection {
    /// Master to slave (RxPDO), conventionally SM2.
    Output,
    /// Slave to master (TxPDO), conventionally SM3.
    Input,
}

/// Sync-manager assignment handed to the adapter during setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub index: u8,
    pub direction: SmDirection,
    pub pdos: Vec<PdoConfig>,
}

/// EtherCAT application-layer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlState {
    Init,
    Preop,
    Safeop,
    Op,
}

impl AlState {
    pub fn from_raw(raw: u8) -> Self {
        match raw & 0x0F {
            2 => AlState::Preop,
            4 => AlState::Safeop,
            8 => AlState::Op,
            _ => AlState::Init,
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            AlState::Init => 1,
            AlState::Preop => 2,
            AlState::Safeop => 4,
            AlState::Op => 8,
        }
    }
}

/// Per-cycle slave-config state (cheap to poll from the cyclic path).
#[derive(Debug, Clone, Copy, Default)]
pub struct SlaveConfigState {
    pub online: bool,
    pub operational: bool,
    pub al_state: u8,
}

/// Domain exchange state: working counter plus its interpretation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainState {
    pub working_counter: u32,
    pub wc_state: WcState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcState {
    #[default]
    Zero,
    Incomplete,
    Complete,
}

impl WcState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => WcState::Incomplete,
            2 => WcState::Complete,
            _ => WcState::Zero,
        }
    }
}

/// Bus-level information about one slave.
#[derive(Debug, Clone)]
pub struct SlaveInfo {
    pub name: String,
    pub ring_pos: u16,
    pub id: SlaveId,
    pub revision_number: u32,
    pub serial_number: u32,
    pub alias: u16,
    /// Signed: a slave can feed current back into the E-bus.
    pub current_on_ebus: i16,
    pub al_state: AlState,
    pub error_flag: bool,
}

/// Bus-level information about the master.
#[derive(Debug, Clone)]
pub struct MasterInfo {
    pub slave_count: u32,
    pub link_up: bool,
    pub scan_busy: bool,
    pub app_time: u64,
}

/// Operations the cyclic engine needs from an EtherCAT master.
///
/// Calls fail with typed [`Error`](crate::Error) values; the adapter never
/// swallows a library error.  Implementations own all library handles and any
/// descriptor storage the library requires to outlive its calls.
pub trait MasterAccess {
    /// Request (or, in SDO-only mode, open) the master.
    fn request(&mut self, sdo_only: bool) -> Result<()>;
    fn release(&mut self);

    fn create_domain(&mut self) -> Result<DomainIdx>;
    fn config_slave(&mut self, alias: u16, pos: u16, id: SlaveId) -> Result<()>;
    fn config_pdos(&mut self, pos: u16, syncs: &[SyncConfig]) -> Result<()>;
    /// Register the entries with the domain; returns byte offsets in
    /// registration order.
    fn register_pdo_entries(
        &mut self,
        domain: DomainIdx,
        pos: u16,
        entries: &[(u16, u8)],
    ) -> Result<Vec<usize>>;
    fn config_dc(
        &mut self,
        pos: u16,
        assign_activate: u16,
        sync0_cycle_ns: u32,
        sync0_shift_ns: i32,
        sync1_cycle_ns: u32,
        sync1_shift_ns: i32,
    ) -> Result<()>;
    fn select_reference_clock(&mut self, pos: u16) -> Result<()>;
    /// Queue an SDO write performed by the master during startup.
    fn config_sdo(&mut self, pos: u16, index: u16, subindex: u8, data: &[u8]) -> Result<()>;

    fn activate(&mut self) -> Result<()>;
    fn deactivate(&mut self);

    fn receive(&mut self) -> Result<()>;
    fn process(&mut self, domain: DomainIdx) -> Result<()>;
    fn queue(&mut self, domain: DomainIdx) -> Result<()>;
    fn send(&mut self) -> Result<()>;

    fn set_application_time(&mut self, time_ns: u64) -> Result<()>;
    fn sync_reference_clock(&mut self) -> Result<()>;
    fn sync_slave_clocks(&mut self) -> Result<()>;

    fn domain_state(&mut self, domain: DomainIdx) -> Result<DomainState>;
    fn read_domain(&self, domain: DomainIdx, offset: usize, buf: &mut [u8]) -> Result<()>;
    fn write_domain(&mut self, domain: DomainIdx, offset: usize, data: &[u8]) -> Result<()>;

    fn slave_config_state(&self, pos: u16) -> Result<SlaveConfigState>;
    fn slave_info(&self, pos: u16) -> Result<SlaveInfo>;
    fn master_info(&self) -> Result<MasterInfo>;

    /// Synchronous mailbox download; blocks for the SDO round trip.
    fn sdo_download(&mut self, pos: u16, index: u16, subindex: u8, data: &[u8]) -> Result<()>;
    /// Synchronous mailbox upload into `buf`; returns the byte count.
    fn sdo_upload(&mut self, pos: u16, index: u16, subindex: u8, buf: &mut [u8]) -> Result<usize>;
}
