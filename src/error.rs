use thiserror::Error;

use crate::command::Command;

/// Everything that can go wrong while talking to a Rio 500.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Rio 500 not found (VID=0x0841, PID=0x0001)")]
    DeviceNotFound,

    #[error("USB transport error during {op} (req=0x{req:02x} val=0x{val:04x} idx=0x{idx:04x})")]
    Transport {
        op: &'static str,
        req: u8,
        val: u16,
        idx: u16,
        #[source]
        source: rusb::Error,
    },

    #[error("device rejected command {command:?}")]
    ProtocolRejected { command: Command },

    #[error("{what} {requested} is out of range (bound {bound})")]
    OutOfRange {
        what: &'static str,
        requested: u32,
        bound: u32,
    },

    #[error("not enough free memory: need {need} bytes, have {have}")]
    OutOfMemory { need: u32, have: u32 },

    #[error("corrupt directory data: {detail}")]
    Corrupt { detail: String },

    /// Never returned from a public operation; a firmware write running in
    /// recovery mode logs this as a warning and keeps going. Kept as a
    /// variant so callers that do want to inspect what was tolerated can
    /// format it.
    #[error("continued past error in recovery mode: {cause}")]
    RecoveryContinued { cause: String },
}

pub type Result<T> = std::result::Result<T, Error>;
