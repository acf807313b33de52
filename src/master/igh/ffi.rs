// Part of ethercat-motion. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Raw binding to the IgH userspace library (`libethercat`).
//!
//! The layouts here are the ABI contract with `ecrt.h` and must not be
//! "improved": PDO/sync descriptor counts are platform-width unsigned ints
//! (not 8-bit), `current_on_ebus` is signed 16-bit, and the registration
//! struct carries raw output-cell pointers the library writes through.

#![allow(non_camel_case_types)]

use libc::{c_char, c_int, c_uint};

pub enum ec_master_t {}
pub enum ec_slave_config_t {}
pub enum ec_domain_t {}

/// `EC_DIR_OUTPUT` / `EC_DIR_INPUT` from `ec_direction_t`.
pub const EC_DIR_OUTPUT: c_int = 1;
pub const EC_DIR_INPUT: c_int = 2;
pub const EC_WD_DEFAULT: c_int = 0;
/// Sync-array sentinel index.
pub const EC_END: u8 = 0xFF;

#[repr(C)]
pub struct ec_pdo_entry_info_t {
    pub index: u16,
    pub subindex: u8,
    pub bit_length: u8,
}

#[repr(C)]
pub struct ec_pdo_info_t {
    pub index: u16,
    /// Platform-width by contract; a u8 here corrupts the descriptor.
    pub n_entries: c_uint,
    pub entries: *const ec_pdo_entry_info_t,
}

#[repr(C)]
pub struct ec_sync_info_t {
    pub index: u8,
    pub dir: c_int,
    pub n_pdos: c_uint,
    pub pdos: *const ec_pdo_info_t,
    pub watchdog_mode: c_int,
}

#[repr(C)]
pub struct ec_pdo_entry_reg_t {
    pub alias: u16,
    pub position: u16,
    pub vendor_id: u32,
    pub product_code: u32,
    pub index: u16,
    pub subindex: u8,
    /// Output cells; must stay valid while the library holds the pointer.
    pub offset: *mut c_uint,
    pub bit_position: *mut c_uint,
}

#[repr(C)]
#[derive(Default)]
pub struct ec_domain_state_t {
    pub working_counter: c_uint,
    pub wc_state: c_uint,
}

#[repr(C)]
#[derive(Default)]
pub struct ec_master_info_t {
    pub slave_count: c_uint,
    pub link_up: c_int,
    pub scan_busy: c_int,
    pub app_time: u64,
}

#[repr(C)]
pub struct ec_slave_info_t {
    pub position: u16,
    pub vendor_id: u32,
    pub product_code: u32,
    pub revision_number: u32,
    pub serial_number: u32,
    pub alias: u16,
    /// Signed: slaves can feed current back into the E-bus.
    pub current_on_ebus: i16,
    pub al_state: u8,
    pub error_flag: u8,
    pub sync_count: u8,
    pub sdo_count: u16,
    pub name: [c_char; 200],
}

impl Default for ec_slave_info_t {
    fn default() -> Self {
        // Safe: all-zero is a valid value for every field.
        unsafe { std::mem::zeroed() }
    }
}

/// C bitfield `online:1, operational:1, al_state:4` packed in one word.
#[repr(C)]
#[derive(Default, Clone, Copy)]
pub struct ec_slave_config_state_t {
    bits: u32,
}

impl ec_slave_config_state_t {
    pub fn online(self) -> bool {
        self.bits & 0x1 != 0
    }

    pub fn operational(self) -> bool {
        self.bits & 0x2 != 0
    }

    pub fn al_state(self) -> u8 {
        ((self.bits >> 2) & 0x0F) as u8
    }
}

#[link(name = "ethercat")]
extern "C" {
    pub fn ecrt_open_master(master_index: c_uint) -> *mut ec_master_t;
    pub fn ecrt_request_master(master_index: c_uint) -> *mut ec_master_t;
    pub fn ecrt_release_master(master: *mut ec_master_t);

    pub fn ecrt_master_create_domain(master: *mut ec_master_t) -> *mut ec_domain_t;
    pub fn ecrt_master_slave_config(
        master: *mut ec_master_t,
        alias: u16,
        position: u16,
        vendor_id: u32,
        product_code: u32,
    ) -> *mut ec_slave_config_t;
    pub fn ecrt_master_select_reference_clock(
        master: *mut ec_master_t,
        sc: *mut ec_slave_config_t,
    ) -> c_int;
    pub fn ecrt_master_activate(master: *mut ec_master_t) -> c_int;
    pub fn ecrt_master_deactivate(master: *mut ec_master_t);
    pub fn ecrt_master_application_time(master: *mut ec_master_t, app_time: u64);
    pub fn ecrt_master_sync_reference_clock(master: *mut ec_master_t);
    pub fn ecrt_master_sync_slave_clocks(master: *mut ec_master_t);
    pub fn ecrt_master_receive(master: *mut ec_master_t);
    pub fn ecrt_master_send(master: *mut ec_master_t);
    pub fn ecrt_master(master: *mut ec_master_t, info: *mut ec_master_info_t) -> c_int;
    pub fn ecrt_master_get_slave(
        master: *mut ec_master_t,
        position: u16,
        info: *mut ec_slave_info_t,
    ) -> c_int;
    pub fn ecrt_master_sdo_download(
        master: *mut ec_master_t,
        position: u16,
        index: u16,
        subindex: u8,
        data: *const u8,
        size: usize,
        abort_code: *mut u32,
    ) -> c_int;
    pub fn ecrt_master_sdo_upload(
        master: *mut ec_master_t,
        position: u16,
        index: u16,
        subindex: u8,
        target: *mut u8,
        target_size: usize,
        result_size: *mut usize,
        abort_code: *mut u32,
    ) -> c_int;

    pub fn ecrt_slave_config_pdos(
        sc: *mut ec_slave_config_t,
        n_syncs: c_uint,
        syncs: *const ec_sync_info_t,
    ) -> c_int;
    pub fn ecrt_slave_config_dc(
        sc: *mut ec_slave_config_t,
        assign_activate: u16,
        sync0_cycle_time: u32,
        sync0_shift_time: i32,
        sync1_cycle_time: u32,
        sync1_shift_time: i32,
    ) -> c_int;
    pub fn ecrt_slave_config_sdo(
        sc: *mut ec_slave_config_t,
        index: u16,
        subindex: u8,
        data: *const u8,
        size: usize,
    ) -> c_int;
    pub fn ecrt_slave_config_state(
        sc: *const ec_slave_config_t,
        state: *mut ec_slave_config_state_t,
    );

    pub fn ecrt_domain_reg_pdo_entry_list(
        domain: *mut ec_domain_t,
        pdo_entry_regs: *const ec_pdo_entry_reg_t,
    ) -> c_int;
    pub fn ecrt_domain_size(domain: *const ec_domain_t) -> usize;
    pub fn ecrt_domain_data(domain: *mut ec_domain_t) -> *mut u8;
    pub fn ecrt_domain_process(domain: *mut ec_domain_t);
    pub fn ecrt_domain_queue(domain: *mut ec_domain_t);
    pub fn ecrt_domain_state(domain: *const ec_domain_t, state: *mut ec_domain_state_t);
}
