// Copyright (C) 2023, Alex Badics
// This file is part of usb-echo-probe
// Licensed under the MIT license. See LICENSE file in the project root for details.

pub mod descriptor;
mod ioctl;
pub mod probe;

use std::{
    cell::OnceCell,
    ffi::c_void,
    fs::{File, OpenOptions},
    io::{Read, Seek},
    os::fd::AsRawFd,
    path::Path,
    time::Duration,
};

use log::{debug, info};

use crate::{
    descriptor::{ConfigurationTree, DeviceTree, InterfaceTree},
    ioctl::{
        usbdevfs_bulk, usbdevfs_claim_interface, usbdevfs_control, usbdevfs_ioctl, BulkTransfer,
        ControlTransfer, SubIoctl, IOCTL_USBFS_DISCONNECT,
    },
};

const REQUEST_GET_CONFIGURATION: u8 = 0x08;
const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug)]
pub struct UsbDevice {
    file: File,
    descriptor_cache: OnceCell<DeviceTree>,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    DescriptorError(#[from] descriptor::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("Invalid endpoint")]
    InvalidEndpoint,
    #[error("Interface {number} (alternate setting {alternate_setting}) not found")]
    InvalidInterface { number: u8, alternate_setting: u8 },
    #[error("Device is not configured")]
    NotConfigured,
    #[error("Not found")]
    NotFound,
}

/// Failures reported by the host controller for a single transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("timed out")]
    Timeout,
    #[error("endpoint stalled")]
    Stall,
    #[error("device disconnected")]
    Disconnected,
    #[error("data overflow")]
    Overflow,
    #[error(transparent)]
    Io(nix::errno::Errno),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Direction {
    Out = 0x0,
    In = 0x80,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RequestType {
    Standard = 0,
    Class = 1 << 5,
    Vendor = 2 << 5,
    Reserved = 3 << 5,
}

/// Recipients of control transfers.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

impl UsbDevice {
    pub fn new(file: File) -> Self {
        Self {
            file,
            descriptor_cache: OnceCell::new(),
        }
    }

    pub fn claim_interface(&self, interface: u8) -> Result<()> {
        let mut command = SubIoctl {
            ifno: interface as i32,
            ioctl_code: IOCTL_USBFS_DISCONNECT,
            data: std::ptr::null_mut(),
        };
        // Fails when no driver is attached, which is fine
        if let Err(e) = unsafe { usbdevfs_ioctl(self.fd(), &mut command as *mut _) } {
            debug!("Kernel driver not detached from interface {interface}: {e}");
        }
        let mut interface_number = interface as u32;

        unsafe { usbdevfs_claim_interface(self.fd(), &mut interface_number as *mut _)? };
        debug!("Claimed interface {interface}");
        Ok(())
    }

    pub fn descriptors(&self) -> Result<&DeviceTree> {
        if let Some(d) = self.descriptor_cache.get() {
            return Ok(d);
        }
        let mut file = &self.file;
        let mut descriptor_data = Vec::new();
        file.rewind()?;
        file.read_to_end(&mut descriptor_data)?;
        let tree = DeviceTree::from_byte_array(&descriptor_data)?;
        Ok(self.descriptor_cache.get_or_init(|| tree))
    }

    /// Asks the device for its current configuration value and returns the
    /// matching configuration descriptor tree.
    pub fn active_configuration(&self) -> Result<&ConfigurationTree> {
        let mut value = [0u8; 1];
        let len = self.read_control(
            request_type(Direction::In, RequestType::Standard, Recipient::Device),
            REQUEST_GET_CONFIGURATION,
            0,
            0,
            &mut value,
            CONTROL_TIMEOUT,
        )?;
        if len != 1 || value[0] == 0 {
            return Err(Error::NotConfigured);
        }
        debug!("Active configuration: {}", value[0]);
        self.descriptors()?
            .configuration(value[0])
            .ok_or(Error::NotConfigured)
    }

    pub fn interface(&self, number: u8, alternate_setting: u8) -> Result<&InterfaceTree> {
        self.active_configuration()?
            .interface(number, alternate_setting)
            .ok_or(Error::InvalidInterface {
                number,
                alternate_setting,
            })
    }

    pub fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if endpoint & Direction::In as u8 == 0 {
            return Err(Error::InvalidEndpoint);
        }
        let mut bulk_desc = BulkTransfer {
            ep: endpoint as u32,
            len: buf.len() as u32,
            timeout: timeout.as_millis() as u32,
            data: buf.as_mut_ptr() as *mut c_void,
        };
        let transferred = unsafe { usbdevfs_bulk(self.fd(), &mut bulk_desc as *mut _) }
            .map_err(TransferError::from)?;
        debug!("Bulk IN {endpoint:#04x}: {transferred} bytes");
        Ok(transferred as usize)
    }

    pub fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> Result<usize> {
        if endpoint & Direction::In as u8 != 0 {
            return Err(Error::InvalidEndpoint);
        }
        let mut bulk_desc = BulkTransfer {
            ep: endpoint as u32,
            len: buf.len() as u32,
            timeout: timeout.as_millis() as u32,
            data: buf.as_ptr() as *mut c_void,
        };
        let transferred = unsafe { usbdevfs_bulk(self.fd(), &mut bulk_desc as *mut _) }
            .map_err(TransferError::from)?;
        debug!("Bulk OUT {endpoint:#04x}: {transferred} bytes");
        Ok(transferred as usize)
    }

    pub fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        if request_type & Direction::In as u8 == 0 {
            return Err(Error::InvalidEndpoint);
        }
        let mut desc = ControlTransfer {
            request_type,
            request,
            value,
            index,
            length: buf.len() as u16,
            timeout: timeout.as_millis() as u32,
            data: buf.as_mut_ptr() as *mut c_void,
        };
        let transferred = unsafe { usbdevfs_control(self.fd(), &mut desc as *mut _) }
            .map_err(TransferError::from)?;
        Ok(transferred as usize)
    }

    fn fd(&self) -> i32 {
        self.file.as_raw_fd()
    }
}

pub fn request_type(direction: Direction, request_type: RequestType, recipient: Recipient) -> u8 {
    direction as u8 | request_type as u8 | recipient as u8
}

impl From<nix::errno::Errno> for TransferError {
    fn from(value: nix::errno::Errno) -> Self {
        use nix::errno::Errno;
        match value {
            Errno::ETIMEDOUT => Self::Timeout,
            Errno::EPIPE => Self::Stall,
            Errno::ENODEV | Errno::ESHUTDOWN => Self::Disconnected,
            Errno::EOVERFLOW => Self::Overflow,
            v => Self::Io(v),
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(value: nix::errno::Errno) -> Self {
        match value {
            nix::errno::Errno::ENODEV => Self::Transfer(TransferError::Disconnected),
            nix::errno::Errno::ENOENT => Self::InvalidEndpoint,
            v => Self::IoError(v.into()),
        }
    }
}

fn read_sysfs_number(device_path: &Path, attribute: &str, radix: u32) -> Option<u32> {
    let contents = std::fs::read_to_string(device_path.join(attribute)).ok()?;
    u32::from_str_radix(contents.trim(), radix).ok()
}

/// Opens the first device in `/sys/bus/usb/devices` with the given vendor and
/// product id. No interface is claimed.
pub fn open_device_vid_pid(vid: u16, pid: u16) -> Result<UsbDevice> {
    for device_path in std::fs::read_dir("/sys/bus/usb/devices/")? {
        let device_path = device_path?.path();
        // Interface nodes have none of these, skip them
        if let (Some(dev_vid), Some(dev_pid), Some(devnum), Some(busnum)) = (
            read_sysfs_number(&device_path, "idVendor", 16),
            read_sysfs_number(&device_path, "idProduct", 16),
            read_sysfs_number(&device_path, "devnum", 10),
            read_sysfs_number(&device_path, "busnum", 10),
        ) {
            if dev_vid == vid as u32 && dev_pid == pid as u32 {
                let node = format!("/dev/bus/usb/{busnum:03}/{devnum:03}");
                info!("Found {vid:04x}:{pid:04x} at {node}");
                let usb_file = OpenOptions::new().read(true).write(true).open(node)?;
                return Ok(UsbDevice::new(usb_file));
            }
        }
    }
    Err(Error::NotFound)
}

#[cfg(test)]
mod tests {
    use nix::errno::Errno;

    use super::*;

    #[test]
    fn errno_maps_to_transfer_errors() {
        assert_eq!(TransferError::from(Errno::ETIMEDOUT), TransferError::Timeout);
        assert_eq!(TransferError::from(Errno::EPIPE), TransferError::Stall);
        assert_eq!(TransferError::from(Errno::ENODEV), TransferError::Disconnected);
        assert_eq!(TransferError::from(Errno::ESHUTDOWN), TransferError::Disconnected);
        assert_eq!(TransferError::from(Errno::EOVERFLOW), TransferError::Overflow);
        assert_eq!(TransferError::from(Errno::EPROTO), TransferError::Io(Errno::EPROTO));
    }

    #[test]
    fn transfer_errors_display() {
        assert_eq!(TransferError::Timeout.to_string(), "timed out");
        assert_eq!(
            Error::from(TransferError::Stall).to_string(),
            "endpoint stalled"
        );
        assert_eq!(
            Error::InvalidInterface {
                number: 0,
                alternate_setting: 0
            }
            .to_string(),
            "Interface 0 (alternate setting 0) not found"
        );
    }

    #[test]
    fn claim_errors_map_to_device_errors() {
        assert!(matches!(
            Error::from(Errno::ENODEV),
            Error::Transfer(TransferError::Disconnected)
        ));
        assert!(matches!(Error::from(Errno::ENOENT), Error::InvalidEndpoint));
        assert!(matches!(Error::from(Errno::EBUSY), Error::IoError(_)));
    }

    #[test]
    fn standard_device_in_request_type() {
        assert_eq!(
            request_type(Direction::In, RequestType::Standard, Recipient::Device),
            0x80
        );
        assert_eq!(
            request_type(Direction::Out, RequestType::Vendor, Recipient::Interface),
            0x41
        );
    }

    #[test]
    fn sysfs_numbers() {
        let dir = std::env::temp_dir().join(format!("usb-echo-probe-sysfs-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("idVendor"), "2e8a\n").unwrap();
        std::fs::write(dir.join("devnum"), "12\n").unwrap();
        std::fs::write(dir.join("busnum"), "garbage\n").unwrap();
        assert_eq!(read_sysfs_number(&dir, "idVendor", 16), Some(0x2e8a));
        assert_eq!(read_sysfs_number(&dir, "devnum", 10), Some(12));
        assert_eq!(read_sysfs_number(&dir, "busnum", 10), None);
        assert_eq!(read_sysfs_number(&dir, "idProduct", 16), None);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
