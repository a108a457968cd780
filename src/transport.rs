//! The four primitives the rest of the engine is built on: two vendor
//! control transfer directions and the one bulk pipe in each direction.
//!
//! Every transfer is followed by a fixed settle delay; the peripheral drops
//! overlapping traffic otherwise (observed empirically, not documented by
//! the vendor).

use std::time::Duration;

use log::trace;
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, Direction, TransferType, UsbContext};

use crate::error::Error;

pub const VENDOR_ID: u16 = 0x0841;
pub const PRODUCT_ID: u16 = 0x0001;

const ENDPOINT_IN: u8 = 0x81;
const ENDPOINT_OUT: u8 = 0x02;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
const BULK_TIMEOUT: Duration = Duration::from_secs(30);

/// The peripheral silently drops a transfer that starts before the previous
/// one has settled. 400 microseconds is the value the original driver used
/// and which this protocol was reverse engineered against; keep it exact.
const SETTLE_DELAY: Duration = Duration::from_micros(400);

const BM_REQUEST_TYPE_VENDOR_IN: u8 = 0xC0;
const BM_REQUEST_TYPE_VENDOR_OUT: u8 = 0x40;

/// The four operations every other layer of the engine is built from.
///
/// A trait (rather than a concrete `UsbTransport`) so the directory manager,
/// firmware writer and session controller can be exercised in tests against
/// an in-memory emulator instead of real hardware.
pub trait Transport {
    fn control_in(&mut self, req: u8, val: u16, idx: u16, buf: &mut [u8]) -> Result<(), Error>;
    fn control_out(&mut self, req: u8, val: u16, idx: u16, buf: &[u8]) -> Result<(), Error>;
    fn bulk_read(&mut self, buf: &mut [u8]) -> Result<(), Error>;
    fn bulk_write(&mut self, buf: &[u8]) -> Result<(), Error>;
}

/// Transport backed by a real USB device handle via `rusb`.
pub struct UsbTransport {
    handle: DeviceHandle<Context>,
}

fn open_usb_device<T: UsbContext>(
    context: &T,
    vid: u16,
    pid: u16,
) -> Option<(Device<T>, DeviceDescriptor, DeviceHandle<T>)> {
    let devices = context.devices().ok()?;

    for device in devices.iter() {
        let device_desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };

        if device_desc.vendor_id() == vid && device_desc.product_id() == pid {
            if let Ok(handle) = device.open() {
                return Some((device, device_desc, handle));
            }
        }
    }

    None
}

impl UsbTransport {
    /// Finds the Rio 500, claims its single interface and detaches any
    /// kernel driver that is holding it.
    pub fn open() -> Result<Self, Error> {
        let context = Context::new().map_err(|source| Error::Transport {
            op: "create USB context",
            req: 0,
            val: 0,
            idx: 0,
            source,
        })?;

        let (device, _device_desc, mut handle) =
            open_usb_device(&context, VENDOR_ID, PRODUCT_ID).ok_or(Error::DeviceNotFound)?;

        handle
            .set_auto_detach_kernel_driver(true)
            .or_else(|source| match source {
                rusb::Error::NotSupported => Ok(()),
                source => Err(Error::Transport {
                    op: "detach kernel driver",
                    req: 0,
                    val: 0,
                    idx: 0,
                    source,
                }),
            })?;

        handle
            .set_active_configuration(1)
            .map_err(|source| Error::Transport {
                op: "set active configuration",
                req: 0,
                val: 0,
                idx: 0,
                source,
            })?;

        handle.claim_interface(0).map_err(|source| Error::Transport {
            op: "claim interface",
            req: 0,
            val: 0,
            idx: 0,
            source,
        })?;

        let config_desc = device.config_descriptor(0).map_err(|source| Error::Transport {
            op: "read config descriptor",
            req: 0,
            val: 0,
            idx: 0,
            source,
        })?;

        let mut found_in = false;
        let mut found_out = false;

        for interface in config_desc.interfaces() {
            for interface_desc in interface.descriptors() {
                for endpoint_desc in interface_desc.endpoint_descriptors() {
                    if endpoint_desc.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    match endpoint_desc.direction() {
                        Direction::In if endpoint_desc.address() == ENDPOINT_IN => found_in = true,
                        Direction::Out if endpoint_desc.address() == ENDPOINT_OUT => {
                            found_out = true
                        }
                        _ => {}
                    }
                }
            }
        }

        if !found_in || !found_out {
            return Err(Error::Corrupt {
                detail: "device is missing the expected bulk endpoints (0x81/0x02)".into(),
            });
        }

        Ok(Self { handle })
    }

    fn settle(&self) {
        std::thread::sleep(SETTLE_DELAY);
    }
}

impl Transport for UsbTransport {
    fn control_in(&mut self, req: u8, val: u16, idx: u16, buf: &mut [u8]) -> Result<(), Error> {
        trace!("control_in req=0x{req:02x} val=0x{val:04x} idx=0x{idx:04x} len={}", buf.len());

        let n = self
            .handle
            .read_control(BM_REQUEST_TYPE_VENDOR_IN, req, val, idx, buf, CONTROL_TIMEOUT)
            .map_err(|source| Error::Transport {
                op: "control_in",
                req,
                val,
                idx,
                source,
            })?;

        self.settle();

        if n != buf.len() {
            return Err(Error::Corrupt {
                detail: format!("control_in short read: got {n}, expected {}", buf.len()),
            });
        }

        Ok(())
    }

    fn control_out(&mut self, req: u8, val: u16, idx: u16, buf: &[u8]) -> Result<(), Error> {
        trace!("control_out req=0x{req:02x} val=0x{val:04x} idx=0x{idx:04x} len={}", buf.len());

        let n = self
            .handle
            .write_control(BM_REQUEST_TYPE_VENDOR_OUT, req, val, idx, buf, CONTROL_TIMEOUT)
            .map_err(|source| Error::Transport {
                op: "control_out",
                req,
                val,
                idx,
                source,
            })?;

        self.settle();

        if n != buf.len() {
            return Err(Error::Corrupt {
                detail: format!("control_out short write: sent {n}, expected {}", buf.len()),
            });
        }

        Ok(())
    }

    fn bulk_read(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let mut total = 0;
        while total < buf.len() {
            let n = self
                .handle
                .read_bulk(ENDPOINT_IN, &mut buf[total..], BULK_TIMEOUT)
                .map_err(|source| Error::Transport {
                    op: "bulk_read",
                    req: 0,
                    val: 0,
                    idx: 0,
                    source,
                })?;
            if n == 0 {
                return Err(Error::Corrupt {
                    detail: "bulk_read stalled with zero-length packet before buffer was full"
                        .into(),
                });
            }
            total += n;
        }
        self.settle();
        Ok(())
    }

    fn bulk_write(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut total = 0;
        while total < buf.len() {
            let n = self
                .handle
                .write_bulk(ENDPOINT_OUT, &buf[total..], BULK_TIMEOUT)
                .map_err(|source| Error::Transport {
                    op: "bulk_write",
                    req: 0,
                    val: 0,
                    idx: 0,
                    source,
                })?;
            if n == 0 {
                return Err(Error::Corrupt {
                    detail: "bulk_write stalled with zero-length write before buffer was drained"
                        .into(),
                });
            }
            total += n;
        }
        self.settle();
        Ok(())
    }
}
