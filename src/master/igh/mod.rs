// Part of ethercat-motion. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Master adapter over the IgH userspace library.
//!
//! The library is sensitive to descriptor lifetimes: sync/PDO/entry arrays
//! and the offset/bit-position output cells handed to it must outlive the
//! calls.  The adapter therefore retains all of them — descriptor arrays on
//! the owning slave configuration, registration storage on the master — for
//! its whole lifetime.  Sync arrays are terminated with the 0xFF sentinel
//! and registration arrays with a zeroed entry, as the ABI requires.

pub mod ffi;

use std::collections::HashMap;
use std::ffi::CStr;

use libc::c_uint;
use log::debug;

use crate::master::{
    AlState, DomainIdx, DomainState, MasterAccess, MasterInfo, SlaveConfigState, SlaveId,
    SlaveInfo, SmDirection, SyncConfig, WcState,
};
use crate::{Error, Result};

/// Per-slave configuration handle plus the descriptor storage the library
/// keeps pointing into.
struct SlaveHandle {
    sc: *mut ffi::ec_slave_config_t,
    alias: u16,
    id: SlaveId,
    entry_storage: Vec<Box<[ffi::ec_pdo_entry_info_t]>>,
    pdo_storage: Vec<Box<[ffi::ec_pdo_info_t]>>,
    sync_storage: Option<Box<[ffi::ec_sync_info_t]>>,
}

/// Registration keep-alive: the reg array and the cells it points at.
struct RegStorage {
    _regs: Box<[ffi::ec_pdo_entry_reg_t]>,
    _offsets: Box<[c_uint]>,
    _bit_positions: Box<[c_uint]>,
}

pub struct Master {
    index: u32,
    master: *mut ffi::ec_master_t,
    activated: bool,
    domains: Vec<*mut ffi::ec_domain_t>,
    slaves: HashMap<u16, SlaveHandle>,
    reg_storage: Vec<RegStorage>,
}

// The worker's single thread owns the handle; raw pointers block the
// auto-derive only.
unsafe impl Send for Master {}

impl Master {
    pub fn open(index: u32) -> Result<Self> {
        Ok(Self {
            index,
            master: std::ptr::null_mut(),
            activated: false,
            domains: Vec::new(),
            slaves: HashMap::new(),
            reg_storage: Vec::new(),
        })
    }

    fn handle(&self) -> Result<*mut ffi::ec_master_t> {
        if self.master.is_null() {
            Err(Error::NullHandle("master not requested"))
        } else {
            Ok(self.master)
        }
    }

    fn slave(&self, pos: u16) -> Result<&SlaveHandle> {
        self.slaves
            .get(&pos)
            .ok_or(Error::NullHandle("slave not configured"))
    }

    fn domain_ptr(&self, domain: DomainIdx) -> Result<*mut ffi::ec_domain_t> {
        self.domains
            .get(domain)
            .copied()
            .ok_or_else(|| Error::DomainError(format!("unknown domain {}", domain)))
    }

    fn domain_span(&self, domain: DomainIdx, offset: usize, len: usize) -> Result<*mut u8> {
        let d = self.domain_ptr(domain)?;
        let size = unsafe { ffi::ecrt_domain_size(d) };
        if offset + len > size {
            return Err(Error::DomainError(format!(
                "access {}..{} outside domain of {} bytes",
                offset,
                offset + len,
                size
            )));
        }
        let data = unsafe { ffi::ecrt_domain_data(d) };
        if data.is_null() {
            return Err(Error::NullHandle("domain data"));
        }
        Ok(unsafe { data.add(offset) })
    }
}

impl MasterAccess for Master {
    fn request(&mut self, sdo_only: bool) -> Result<()> {
        if !self.master.is_null() {
            return Ok(());
        }
        let handle = unsafe {
            if sdo_only {
                ffi::ecrt_open_master(self.index)
            } else {
                ffi::ecrt_request_master(self.index)
            }
        };
        if handle.is_null() {
            return Err(Error::MasterBusy(self.index));
        }
        debug!("master {} requested (sdo_only={})", self.index, sdo_only);
        self.master = handle;
        Ok(())
    }

    fn release(&mut self) {
        if !self.master.is_null() {
            if self.activated {
                self.deactivate();
            }
            unsafe { ffi::ecrt_release_master(self.master) };
            self.master = std::ptr::null_mut();
        }
    }

    fn create_domain(&mut self) -> Result<DomainIdx> {
        let d = unsafe { ffi::ecrt_master_create_domain(self.handle()?) };
        if d.is_null() {
            return Err(Error::DomainError("create_domain failed".into()));
        }
        self.domains.push(d);
        Ok(self.domains.len() - 1)
    }

    fn config_slave(&mut self, alias: u16, pos: u16, id: SlaveId) -> Result<()> {
        let sc = unsafe {
            ffi::ecrt_master_slave_config(self.handle()?, alias, pos, id.vendor_id, id.product_code)
        };
        if sc.is_null() {
            return Err(Error::NullHandle("slave config"));
        }
        self.slaves.insert(
            pos,
            SlaveHandle {
                sc,
                alias,
                id,
                entry_storage: Vec::new(),
                pdo_storage: Vec::new(),
                sync_storage: None,
            },
        );
        Ok(())
    }

    fn config_pdos(&mut self, pos: u16, syncs: &[SyncConfig]) -> Result<()> {
        let handle = self
            .slaves
            .get_mut(&pos)
            .ok_or(Error::NullHandle("slave not configured"))?;

        let mut sync_array = Vec::with_capacity(syncs.len() + 1);
        for sync in syncs {
            let mut pdo_array = Vec::with_capacity(sync.pdos.len());
            for pdo in &sync.pdos {
                let entries: Box<[ffi::ec_pdo_entry_info_t]> = pdo
                    .entries
                    .iter()
                    .map(|e| ffi::ec_pdo_entry_info_t {
                        index: e.index,
                        subindex: e.subindex,
                        bit_length: e.bit_len,
                    })
                    .collect();
                pdo_array.push(ffi::ec_pdo_info_t {
                    index: pdo.index,
                    n_entries: entries.len() as c_uint,
                    entries: entries.as_ptr(),
                });
                handle.entry_storage.push(entries);
            }
            let pdo_array: Box<[ffi::ec_pdo_info_t]> = pdo_array.into_boxed_slice();
            sync_array.push(ffi::ec_sync_info_t {
                index: sync.index,
                dir: match sync.direction {
                    SmDirection::Output => ffi::EC_DIR_OUTPUT,
                    SmDirection::Input => ffi::EC_DIR_INPUT,
                },
                n_pdos: pdo_array.len() as c_uint,
                pdos: pdo_array.as_ptr(),
                watchdog_mode: ffi::EC_WD_DEFAULT,
            });
            handle.pdo_storage.push(pdo_array);
        }
        // Sentinel termination; the library scans until index 0xFF.
        sync_array.push(ffi::ec_sync_info_t {
            index: ffi::EC_END,
            dir: 0,
            n_pdos: 0,
            pdos: std::ptr::null(),
            watchdog_mode: 0,
        });
        let sync_array: Box<[ffi::ec_sync_info_t]> = sync_array.into_boxed_slice();

        let rc = unsafe {
            ffi::ecrt_slave_config_pdos(handle.sc, syncs.len() as c_uint, sync_array.as_ptr())
        };
        handle.sync_storage = Some(sync_array);
        if rc != 0 {
            return Err(Error::InvalidConfig(format!(
                "slave {}: PDO configuration failed (rc={})",
                pos, rc
            )));
        }
        Ok(())
    }

    fn register_pdo_entries(
        &mut self,
        domain: DomainIdx,
        pos: u16,
        entries: &[(u16, u8)],
    ) -> Result<Vec<usize>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let d = self.domain_ptr(domain)?;
        let (alias, id) = {
            let handle = self.slave(pos)?;
            (handle.alias, handle.id)
        };

        let mut offsets: Box<[c_uint]> = vec![0; entries.len()].into_boxed_slice();
        let mut bit_positions: Box<[c_uint]> = vec![0; entries.len()].into_boxed_slice();
        let mut regs = Vec::with_capacity(entries.len() + 1);
        for (i, &(index, subindex)) in entries.iter().enumerate() {
            regs.push(ffi::ec_pdo_entry_reg_t {
                alias,
                position: pos,
                vendor_id: id.vendor_id,
                product_code: id.product_code,
                index,
                subindex,
                offset: &mut offsets[i],
                bit_position: &mut bit_positions[i],
            });
        }
        // Zero-terminated: an entry with index 0 ends the list.
        regs.push(ffi::ec_pdo_entry_reg_t {
            alias: 0,
            position: 0,
            vendor_id: 0,
            product_code: 0,
            index: 0,
            subindex: 0,
            offset: std::ptr::null_mut(),
            bit_position: std::ptr::null_mut(),
        });
        let regs: Box<[ffi::ec_pdo_entry_reg_t]> = regs.into_boxed_slice();

        let rc = unsafe { ffi::ecrt_domain_reg_pdo_entry_list(d, regs.as_ptr()) };
        if rc != 0 {
            return Err(Error::DomainError(format!(
                "slave {}: PDO entry registration failed (rc={})",
                pos, rc
            )));
        }

        let result = offsets.iter().map(|&o| o as usize).collect();
        self.reg_storage.push(RegStorage {
            _regs: regs,
            _offsets: offsets,
            _bit_positions: bit_positions,
        });
        Ok(result)
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
        let sc = self.slave(pos)?.sc;
        let rc = unsafe {
            ffi::ecrt_slave_config_dc(
                sc,
                assign_activate,
                sync0_cycle_ns,
                sync0_shift_ns,
                sync1_cycle_ns,
                sync1_shift_ns,
            )
        };
        if rc != 0 {
            return Err(Error::InvalidConfig(format!(
                "slave {}: DC configuration failed (rc={})",
                pos, rc
            )));
        }
        Ok(())
    }

    fn select_reference_clock(&mut self, pos: u16) -> Result<()> {
        let sc = self.slave(pos)?.sc;
        let rc = unsafe { ffi::ecrt_master_select_reference_clock(self.handle()?, sc) };
        if rc != 0 {
            return Err(Error::InvalidConfig(format!(
                "slave {}: reference clock selection failed (rc={})",
                pos, rc
            )));
        }
        Ok(())
    }

    fn config_sdo(&mut self, pos: u16, index: u16, subindex: u8, data: &[u8]) -> Result<()> {
        let sc = self.slave(pos)?.sc;
        let rc =
            unsafe { ffi::ecrt_slave_config_sdo(sc, index, subindex, data.as_ptr(), data.len()) };
        if rc != 0 {
            return Err(Error::InvalidConfig(format!(
                "slave {}: startup SDO 0x{:04X}:{} failed (rc={})",
                pos, index, subindex, rc
            )));
        }
        Ok(())
    }

    fn activate(&mut self) -> Result<()> {
        if self.activated {
            return Ok(());
        }
        let rc = unsafe { ffi::ecrt_master_activate(self.handle()?) };
        if rc != 0 {
            return Err(Error::ActivateFailed(rc));
        }
        self.activated = true;
        Ok(())
    }

    fn deactivate(&mut self) {
        if self.activated && !self.master.is_null() {
            unsafe { ffi::ecrt_master_deactivate(self.master) };
            self.activated = false;
        }
    }

    fn receive(&mut self) -> Result<()> {
        unsafe { ffi::ecrt_master_receive(self.handle()?) };
        Ok(())
    }

    fn process(&mut self, domain: DomainIdx) -> Result<()> {
        unsafe { ffi::ecrt_domain_process(self.domain_ptr(domain)?) };
        Ok(())
    }

    fn queue(&mut self, domain: DomainIdx) -> Result<()> {
        unsafe { ffi::ecrt_domain_queue(self.domain_ptr(domain)?) };
        Ok(())
    }

    fn send(&mut self) -> Result<()> {
        unsafe { ffi::ecrt_master_send(self.handle()?) };
        Ok(())
    }

    fn set_application_time(&mut self, time_ns: u64) -> Result<()> {
        unsafe { ffi::ecrt_master_application_time(self.handle()?, time_ns) };
        Ok(())
    }

    fn sync_reference_clock(&mut self) -> Result<()> {
        unsafe { ffi::ecrt_master_sync_reference_clock(self.handle()?) };
        Ok(())
    }

    fn sync_slave_clocks(&mut self) -> Result<()> {
        unsafe { ffi::ecrt_master_sync_slave_clocks(self.handle()?) };
        Ok(())
    }

    fn domain_state(&mut self, domain: DomainIdx) -> Result<DomainState> {
        let mut state = ffi::ec_domain_state_t::default();
        unsafe { ffi::ecrt_domain_state(self.domain_ptr(domain)?, &mut state) };
        Ok(DomainState {
            working_counter: state.working_counter,
            wc_state: WcState::from_raw(state.wc_state),
        })
    }

    fn read_domain(&self, domain: DomainIdx, offset: usize, buf: &mut [u8]) -> Result<()> {
        let src = self.domain_span(domain, offset, buf.len())?;
        unsafe { std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    fn write_domain(&mut self, domain: DomainIdx, offset: usize, data: &[u8]) -> Result<()> {
        let dst = self.domain_span(domain, offset, data.len())?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    fn slave_config_state(&self, pos: u16) -> Result<SlaveConfigState> {
        let sc = self.slave(pos)?.sc;
        let mut state = ffi::ec_slave_config_state_t::default();
        unsafe { ffi::ecrt_slave_config_state(sc, &mut state) };
        Ok(SlaveConfigState {
            online: state.online(),
            operational: state.operational(),
            al_state: state.al_state(),
        })
    }

    fn slave_info(&self, pos: u16) -> Result<SlaveInfo> {
        let mut info = ffi::ec_slave_info_t::default();
        let rc = unsafe { ffi::ecrt_master_get_slave(self.handle()?, pos, &mut info) };
        if rc != 0 {
            return Err(Error::NullHandle("slave info"));
        }
        let name = unsafe { CStr::from_ptr(info.name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        Ok(SlaveInfo {
            name,
            ring_pos: info.position,
            id: SlaveId::new(info.vendor_id, info.product_code),
            revision_number: info.revision_number,
            serial_number: info.serial_number,
            alias: info.alias,
            current_on_ebus: info.current_on_ebus,
            al_state: AlState::from_raw(info.al_state),
            error_flag: info.error_flag != 0,
        })
    }

    fn master_info(&self) -> Result<MasterInfo> {
        let mut info = ffi::ec_master_info_t::default();
        let rc = unsafe { ffi::ecrt_master(self.handle()?, &mut info) };
        if rc != 0 {
            return Err(Error::NullHandle("master info"));
        }
        Ok(MasterInfo {
            slave_count: info.slave_count,
            link_up: info.link_up != 0,
            scan_busy: info.scan_busy != 0,
            app_time: info.app_time,
        })
    }

    fn sdo_download(&mut self, pos: u16, index: u16, subindex: u8, data: &[u8]) -> Result<()> {
        let mut abort_code: u32 = 0;
        let rc = unsafe {
            ffi::ecrt_master_sdo_download(
                self.handle()?,
                pos,
                index,
                subindex,
                data.as_ptr(),
                data.len(),
                &mut abort_code,
            )
        };
        if rc != 0 {
            return Err(Error::SdoAbort {
                pos,
                index,
                subindex,
                code: abort_code,
            });
        }
        Ok(())
    }

    fn sdo_upload(&mut self, pos: u16, index: u16, subindex: u8, buf: &mut [u8]) -> Result<usize> {
        let mut abort_code: u32 = 0;
        let mut result_size: usize = 0;
        let rc = unsafe {
            ffi::ecrt_master_sdo_upload(
                self.handle()?,
                pos,
                index,
                subindex,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result_size,
                &mut abort_code,
            )
        };
        if rc != 0 {
            return Err(Error::SdoAbort {
                pos,
                index,
                subindex,
                code: abort_code,
            });
        }
        Ok(result_size)
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.release();
    }
}
