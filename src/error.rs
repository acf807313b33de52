// Part of ethercat-motion. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Crate-wide error type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The EtherCAT userspace library (or the `igh` feature) is not available.
    #[error("EtherCAT library unavailable: {0}")]
    LibraryUnavailable(String),

    /// Another process holds the master; see the preflight options.
    #[error("master {0} is busy (held by another process)")]
    MasterBusy(u32),

    #[error("master activation failed (rc={0})")]
    ActivateFailed(i32),

    /// CoE SDO transfer aborted by the slave; carries the abort code.
    #[error("SDO abort on slave {pos}, 0x{index:04X}:{subindex} (code 0x{code:08X})")]
    SdoAbort {
        pos: u16,
        index: u16,
        subindex: u8,
        code: u32,
    },

    #[error("domain error: {0}")]
    DomainError(String),

    #[error("null handle from EtherCAT library: {0}")]
    NullHandle(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A CiA 402 drive is missing a mandatory PDO object (0x6040/0x6041).
    #[error("slave {pos}: required object 0x{index:04X} not mapped in PDO")]
    RequiredPdoMissing { pos: u16, index: u16 },

    #[error("slaves not operational after {timeout_s}s: {slaves:?}")]
    SlaveNotOp { timeout_s: f64, slaves: Vec<u16> },

    #[error("ESI decode error: {0}")]
    Esi(String),

    /// Command queue overflow; the producer should back off.
    #[error("command queue full")]
    QueueFull,

    /// The worker process exited or the transport to it broke down.
    #[error("worker transport closed: {0}")]
    WorkerGone(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("frame codec error: {0}")]
    Codec(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}
