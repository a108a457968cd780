//! Engine for talking to a Diamond Rio 500 over USB: directory management,
//! song upload/download and firmware replacement, built on the vendor
//! control/bulk protocol described in `rio500.go` upstream.

pub mod address;
pub mod command;
pub mod directory;
pub mod error;
pub mod firmware;
pub mod record;
pub mod session;
pub mod transport;

#[cfg(test)]
mod mock;

pub use directory::{FolderInfo, SongInfo};
pub use error::Error;
pub use session::{Session, Storage};
pub use transport::{Transport, UsbTransport};
