// Copyright (C) 2023, Alex Badics
// This file is part of usb-echo-probe
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Bulk echo probe: writes a fixed payload to the OUT endpoint of interface
//! 0, reads back at most one packet from the IN endpoint, and dumps both as
//! hex.
//!
//! Write failures abort the probe. Read failures reported by the host
//! controller are printed and the probe still completes.

use std::{io::Write, time::Duration};

use log::{debug, warn};

use crate::{
    descriptor::{EndpointDescriptor, InterfaceTree},
    Direction, Error, Result, TransferError, UsbDevice,
};

pub const VENDOR_ID: u16 = 0x2e8a;
pub const PRODUCT_ID: u16 = 0x000a;
/// Interface number and alternate setting.
pub const INTERFACE: (u8, u8) = (0, 0);
pub const OUT_ADDRESS: u8 = 0x01 | Direction::Out as u8;
pub const IN_ADDRESS: u8 = 0x81 | Direction::In as u8;
pub const TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);
pub const HEX_DUMP_WIDTH: usize = 32;
pub const PAYLOAD_LEN: usize = 4;

/// The operations the probe needs from a device.
pub trait BulkDevice {
    fn select_interface(&self, number: u8, alternate_setting: u8) -> Result<InterfaceTree>;
    fn claim_interface(&self, number: u8) -> Result<()>;
    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> Result<usize>;
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize>;
}

impl BulkDevice for UsbDevice {
    fn select_interface(&self, number: u8, alternate_setting: u8) -> Result<InterfaceTree> {
        Ok(self.interface(number, alternate_setting)?.clone())
    }

    fn claim_interface(&self, number: u8) -> Result<()> {
        UsbDevice::claim_interface(self, number)
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> Result<usize> {
        UsbDevice::write_bulk(self, endpoint, buf, timeout)
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        UsbDevice::read_bulk(self, endpoint, buf, timeout)
    }
}

/// Positions of the echo endpoints in an interface's endpoint list.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct EndpointIndices {
    pub out: Option<usize>,
    pub r#in: Option<usize>,
}

impl EndpointIndices {
    /// Falls back to the first endpoint for every direction that had no
    /// match. The fallback can pick an endpoint of the wrong direction.
    pub fn or_first(self) -> (usize, usize) {
        if self.out.is_none() {
            warn!("No endpoint at {OUT_ADDRESS:#04x}, using endpoint index 0 for OUT");
        }
        if self.r#in.is_none() {
            warn!("No endpoint at {IN_ADDRESS:#04x}, using endpoint index 0 for IN");
        }
        (self.out.unwrap_or(0), self.r#in.unwrap_or(0))
    }
}

/// Scans the endpoints in the order the device lists them. When several
/// endpoints share an address, the last one wins.
pub fn resolve_endpoints(endpoints: &[EndpointDescriptor]) -> EndpointIndices {
    let mut indices = EndpointIndices::default();
    for (i, endpoint) in endpoints.iter().enumerate() {
        if endpoint.address() == OUT_ADDRESS {
            indices.out = Some(i);
        } else if endpoint.address() == IN_ADDRESS {
            indices.r#in = Some(i);
        }
    }
    debug!("Resolved endpoints: {indices:?}");
    indices
}

pub fn payload() -> [u8; PAYLOAD_LEN] {
    let mut data = [0u8; PAYLOAD_LEN];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i * 20) as u8;
    }
    data
}

pub fn hex_dump(data: &[u8]) -> Vec<String> {
    data.chunks(HEX_DUMP_WIDTH)
        .map(|line| {
            line.iter()
                .map(|byte| format!("{byte:02X}"))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

fn write_hex_dump(out: &mut impl Write, data: &[u8]) -> Result<()> {
    for line in hex_dump(data) {
        writeln!(out, "{line}")?;
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ReadOutcome {
    Received(Vec<u8>),
    Failed(TransferError),
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Outcome {
    NoDevice,
    Completed(ReadOutcome),
}

/// Runs the probe once against the device returned by `open`, reporting to
/// `out`. `Error::NotFound` from `open` is not an error.
pub fn run<D, W>(out: &mut W, open: impl FnOnce() -> Result<D>) -> Result<Outcome>
where
    D: BulkDevice,
    W: Write,
{
    let device = match open() {
        Ok(device) => device,
        Err(Error::NotFound) => {
            writeln!(out, "No USB device found!")?;
            return Ok(Outcome::NoDevice);
        }
        Err(e) => return Err(e),
    };

    let (number, alternate_setting) = INTERFACE;
    let interface = device.select_interface(number, alternate_setting)?;
    device.claim_interface(number)?;

    let (out_index, in_index) = resolve_endpoints(&interface.endpoints).or_first();
    let ep_out = interface
        .endpoints
        .get(out_index)
        .ok_or(Error::InvalidEndpoint)?;
    let ep_in = interface
        .endpoints
        .get(in_index)
        .ok_or(Error::InvalidEndpoint)?;

    writeln!(out, "{ep_in}")?;
    writeln!(out, "{ep_out}")?;
    writeln!(out)?;

    let data = payload();
    let written = device.write_bulk(ep_out.address(), &data, TRANSFER_TIMEOUT)?;
    if written != data.len() {
        debug!("Short write: {written} of {} bytes", data.len());
    }

    writeln!(out, "Sent data ({}-byte):", data.len())?;
    write_hex_dump(out, &data)?;
    writeln!(out)?;

    let mut received = vec![0u8; ep_in.max_packet_size()];
    let read = match device.read_bulk(ep_in.address(), &mut received, TRANSFER_TIMEOUT) {
        Ok(len) => {
            received.truncate(len);
            writeln!(out, "Received data ({}-byte):", received.len())?;
            write_hex_dump(out, &received)?;
            ReadOutcome::Received(received)
        }
        Err(Error::Transfer(e)) => {
            writeln!(out, "Error while reading from IN endpoint: {e}")?;
            ReadOutcome::Failed(e)
        }
        Err(e) => return Err(e),
    };
    Ok(Outcome::Completed(read))
}
