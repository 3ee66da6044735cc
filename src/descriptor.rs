// Copyright (C) 2023, Alex Badics
// This file is part of usb-echo-probe
// Licensed under the MIT license. See LICENSE file in the project root for details.

use std::fmt;

use crate::Direction;

macro_rules! check_size {
    ($t:ty, $s: literal) => {
        const _: () = assert!(std::mem::size_of::<$t>() == $s);
    };
}

#[allow(non_snake_case)]
#[repr(C)]
#[repr(packed)]
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bcdUSB: u16,
    pub bDeviceClass: u8,
    pub bDeviceSubClass: u8,
    pub bDeviceProtocol: u8,
    pub bMaxPacketSize0: u8,
    pub idVendor: u16,
    pub idProduct: u16,
    pub bcdDevice: u16,
    pub iManufacturer: u8,
    pub iProduct: u8,
    pub iSerialNumber: u8,
    pub bNumConfigurations: u8,
}

check_size!(DeviceDescriptor, 18);

#[allow(non_snake_case)]
#[repr(C)]
#[repr(packed)]
#[derive(Debug, Clone)]
pub struct ConfigurationDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub wTotalLength: u16,
    pub bNumInterfaces: u8,
    pub bConfigurationValue: u8,
    pub iConfiguration: u8,
    pub bmAttributes: u8,
    pub MaxPower: u8,
}

check_size!(ConfigurationDescriptor, 9);

#[allow(non_snake_case)]
#[repr(C)]
#[repr(packed)]
#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bInterfaceNumber: u8,
    pub bAlternateSetting: u8,
    pub bNumEndpoints: u8,
    pub bInterfaceClass: u8,
    pub bInterfaceSubClass: u8,
    pub bInterfaceProtocol: u8,
    pub iInterface: u8,
}
check_size!(InterfaceDescriptor, 9);

#[allow(non_snake_case)]
#[repr(C)]
#[repr(packed)]
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bEndpointAddress: u8,
    pub bmAttributes: u8,
    pub wMaxPacketSize: u16,
    pub bInterval: u8,
    // Only used for audio endpoints:
    // pub bRefresh: u8,
    // pub bSynchAddress: u8,
}
check_size!(EndpointDescriptor, 7);

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointDescriptor {
    pub fn address(&self) -> u8 {
        self.bEndpointAddress
    }

    pub fn direction(&self) -> Direction {
        if self.bEndpointAddress & Direction::In as u8 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn transfer_type(&self) -> TransferType {
        match self.bmAttributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }

    /// Only the low 11 bits are the packet size, the rest encodes
    /// additional transactions per microframe.
    pub fn max_packet_size(&self) -> usize {
        let raw = self.wMaxPacketSize;
        (u16::from_le(raw) & 0x07ff) as usize
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Copies, no references into packed fields
        let (length, descriptor_type, attributes, interval) = (
            self.bLength,
            self.bDescriptorType,
            self.bmAttributes,
            self.bInterval,
        );
        let address = self.address();
        let max_packet_size = self.max_packet_size();
        let transfer_type = self.transfer_type();
        let direction = match self.direction() {
            Direction::In => "IN",
            Direction::Out => "OUT",
        };

        writeln!(f, "ENDPOINT {address:#04x}: {transfer_type:?} {direction}")?;
        writeln!(f, "  bLength          : {length:>#6x} ({length} bytes)")?;
        writeln!(f, "  bDescriptorType  : {descriptor_type:>#6x} Endpoint")?;
        writeln!(f, "  bEndpointAddress : {address:>#6x} {direction}")?;
        writeln!(f, "  bmAttributes     : {attributes:>#6x} {transfer_type:?}")?;
        writeln!(
            f,
            "  wMaxPacketSize   : {max_packet_size:>#6x} ({max_packet_size} bytes)"
        )?;
        write!(f, "  bInterval        : {interval:>#6x}")
    }
}

#[derive(Debug, Clone)]
pub struct DeviceTree {
    pub desc: DeviceDescriptor,
    pub configurations: Vec<ConfigurationTree>,
}

#[derive(Debug, Clone)]
pub struct ConfigurationTree {
    pub desc: ConfigurationDescriptor,
    pub interfaces: Vec<InterfaceTree>,
}

/// One alternate setting of an interface, with its endpoints in the
/// order the device reports them.
#[derive(Debug, Clone)]
pub struct InterfaceTree {
    pub desc: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl DeviceTree {
    pub fn from_byte_array(data: &[u8]) -> Result<Self> {
        let descriptors = byte_array_to_descriptors(data)?;
        if descriptors.is_empty() {
            return Err(Error::InvalidSize);
        }
        if descriptors
            .iter()
            .filter(|d| matches!(d, AnyDescriptor::DeviceDescriptor(..)))
            .count()
            > 1
        {
            return Err(Error::TooManyDevices);
        }
        let desc = if let AnyDescriptor::DeviceDescriptor(d) = &descriptors[0] {
            d.clone()
        } else {
            return Err(Error::DeviceWasNotFirst);
        };

        Ok(Self {
            desc,
            configurations: split_by_parent_desc::<ConfigurationDescriptor>(&descriptors)
                .iter()
                .map(|(d, ds)| ConfigurationTree::from_descriptors((*d).clone(), ds))
                .collect::<Result<Vec<_>>>()?,
        })
    }

    pub fn configuration(&self, value: u8) -> Option<&ConfigurationTree> {
        self.configurations
            .iter()
            .find(|c| c.desc.bConfigurationValue == value)
    }
}

impl ConfigurationTree {
    fn from_descriptors(
        desc: ConfigurationDescriptor,
        descriptors: &[AnyDescriptor],
    ) -> Result<Self> {
        Ok(Self {
            desc,
            interfaces: split_by_parent_desc::<InterfaceDescriptor>(descriptors)
                .iter()
                .map(|(d, ds)| InterfaceTree::from_descriptors((*d).clone(), ds))
                .collect::<Result<Vec<_>>>()?,
        })
    }

    pub fn interface(&self, number: u8, alternate_setting: u8) -> Option<&InterfaceTree> {
        self.interfaces.iter().find(|i| {
            i.desc.bInterfaceNumber == number && i.desc.bAlternateSetting == alternate_setting
        })
    }
}

impl InterfaceTree {
    fn from_descriptors(desc: InterfaceDescriptor, descriptors: &[AnyDescriptor]) -> Result<Self> {
        Ok(Self {
            desc,
            endpoints: descriptors
                .iter()
                .filter_map(|d| {
                    let d: Option<&EndpointDescriptor> = d.try_into().ok();
                    Some(d?.clone())
                })
                .collect(),
        })
    }
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Invalid size field")]
    InvalidSize,
    #[error("Invalid type")]
    InvalidType,
    #[error("The first descriptor was not of type Device")]
    DeviceWasNotFirst,
    #[error("Too many device descriptors found")]
    TooManyDevices,
}

macro_rules! any_descriptor {
    ($($name: tt),*) => {
        enum AnyDescriptor {
            $(
                $name($name),
            )*
            Other(u8),
        }
        $(
            impl<'a> TryFrom<&'a AnyDescriptor> for &'a $name {
                type Error = Error;

                fn try_from(value: &'a AnyDescriptor) -> std::result::Result<Self, Self::Error> {
                    if let AnyDescriptor::$name(v) = value {
                        Ok(v)
                    } else {
                        Err(Error::InvalidType)
                    }
                }
            }
        )*
    };
}

any_descriptor!(
    DeviceDescriptor,
    ConfigurationDescriptor,
    InterfaceDescriptor,
    EndpointDescriptor
);

fn split_by_parent_desc<'a, T>(descriptors: &'a [AnyDescriptor]) -> Vec<(&'a T, &'a [AnyDescriptor])>
where
    &'a T: std::convert::TryFrom<&'a AnyDescriptor>,
{
    let split_points: Vec<(usize, &T)> = descriptors
        .iter()
        .enumerate()
        .filter_map(|(i, d)| Some((i, d.try_into().ok()?)))
        .collect();
    split_points
        .iter()
        .enumerate()
        .map(|(spi, (sp, d))| {
            let end = split_points
                .get(spi + 1)
                .map_or(descriptors.len(), |(next, _)| *next);
            (*d, &descriptors[*sp..end])
        })
        .collect()
}

fn parse_descriptor<T>(data: &[u8]) -> Result<T> {
    if data.len() < std::mem::size_of::<T>() {
        return Err(Error::InvalidSize);
    }
    // All descriptor structs are packed plain-old-data
    Ok(unsafe { std::ptr::read_unaligned(data.as_ptr() as *const T) })
}

fn byte_array_to_descriptors(mut data: &[u8]) -> Result<Vec<AnyDescriptor>> {
    let mut result = Vec::new();
    while data.len() >= 2 {
        let l = data[0] as usize;
        if l < 2 || l > data.len() {
            return Err(Error::InvalidSize);
        }
        let descriptor_data = &data[..l];
        result.push(match descriptor_data[1] {
            1 => AnyDescriptor::DeviceDescriptor(parse_descriptor(descriptor_data)?),
            2 => AnyDescriptor::ConfigurationDescriptor(parse_descriptor(descriptor_data)?),
            4 => AnyDescriptor::InterfaceDescriptor(parse_descriptor(descriptor_data)?),
            5 => AnyDescriptor::EndpointDescriptor(parse_descriptor(descriptor_data)?),
            o => AnyDescriptor::Other(o),
        });
        data = &data[l..]
    }
    Ok(result)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const DEVICE: [u8; 18] = [
        18, 1, 0x00, 0x02, 0xff, 0, 0, 64, 0x8a, 0x2e, 0x0a, 0x00, 0x00, 0x01, 1, 2, 3, 1,
    ];

    /// Device with one configuration (value 1), interface 0 in two alternate
    /// settings. Setting 0 has bulk OUT 0x01 and bulk IN 0x81, setting 1 has
    /// a single interrupt IN endpoint.
    pub(crate) fn echo_device_blob() -> Vec<u8> {
        let mut blob = DEVICE.to_vec();
        blob.extend_from_slice(&[9, 2, 48, 0, 1, 1, 0, 0x80, 50]);
        blob.extend_from_slice(&[9, 4, 0, 0, 2, 0xff, 0, 0, 0]);
        blob.extend_from_slice(&[7, 5, 0x01, 0x02, 64, 0, 0]);
        blob.extend_from_slice(&[7, 5, 0x81, 0x02, 64, 0, 0]);
        blob.extend_from_slice(&[9, 4, 0, 1, 1, 0xff, 0, 0, 0]);
        blob.extend_from_slice(&[7, 5, 0x82, 0x03, 8, 0, 10]);
        blob
    }

    #[test]
    fn parses_echo_device_tree() {
        let tree = DeviceTree::from_byte_array(&echo_device_blob()).unwrap();
        let vid = tree.desc.idVendor;
        let pid = tree.desc.idProduct;
        assert_eq!((vid, pid), (0x2e8a, 0x000a));
        assert_eq!(tree.configurations.len(), 1);

        let config = tree.configuration(1).unwrap();
        assert_eq!(config.interfaces.len(), 2);

        let interface = config.interface(0, 0).unwrap();
        let addresses: Vec<u8> = interface.endpoints.iter().map(|e| e.address()).collect();
        assert_eq!(addresses, [0x01, 0x81]);
        assert_eq!(interface.endpoints[0].direction(), Direction::Out);
        assert_eq!(interface.endpoints[1].direction(), Direction::In);
        assert_eq!(interface.endpoints[1].transfer_type(), TransferType::Bulk);
        assert_eq!(interface.endpoints[1].max_packet_size(), 64);

        let alternate = config.interface(0, 1).unwrap();
        assert_eq!(alternate.endpoints.len(), 1);
        assert_eq!(alternate.endpoints[0].transfer_type(), TransferType::Interrupt);
    }

    #[test]
    fn missing_configuration_and_interface() {
        let tree = DeviceTree::from_byte_array(&echo_device_blob()).unwrap();
        assert!(tree.configuration(2).is_none());
        assert!(tree.configuration(1).unwrap().interface(1, 0).is_none());
    }

    #[test]
    fn unknown_descriptors_are_skipped() {
        let mut blob = DEVICE.to_vec();
        blob.extend_from_slice(&[9, 2, 34, 0, 1, 1, 0, 0x80, 50]);
        blob.extend_from_slice(&[9, 4, 0, 0, 1, 3, 0, 0, 0]);
        // HID class descriptor between interface and endpoint
        blob.extend_from_slice(&[9, 0x21, 0x11, 0x01, 0, 1, 0x22, 0x3f, 0]);
        blob.extend_from_slice(&[7, 5, 0x81, 0x03, 8, 0, 10]);
        let tree = DeviceTree::from_byte_array(&blob).unwrap();
        let interface = tree.configuration(1).unwrap().interface(0, 0).unwrap();
        assert_eq!(interface.endpoints.len(), 1);
    }

    #[test]
    fn rejects_malformed_blobs() {
        assert!(matches!(
            DeviceTree::from_byte_array(&[]),
            Err(Error::InvalidSize)
        ));
        assert!(matches!(
            DeviceTree::from_byte_array(&[9, 2, 34, 0, 1, 1, 0, 0x80, 50]),
            Err(Error::DeviceWasNotFirst)
        ));
        assert!(matches!(
            DeviceTree::from_byte_array(&[18, 1, 0, 2]),
            Err(Error::InvalidSize)
        ));
        let mut two_devices = DEVICE.to_vec();
        two_devices.extend_from_slice(&DEVICE);
        assert!(matches!(
            DeviceTree::from_byte_array(&two_devices),
            Err(Error::TooManyDevices)
        ));
    }

    #[test]
    fn max_packet_size_ignores_high_bandwidth_bits() {
        let mut blob = DEVICE.to_vec();
        blob.extend_from_slice(&[9, 2, 25, 0, 1, 1, 0, 0x80, 50]);
        blob.extend_from_slice(&[9, 4, 0, 0, 1, 0xff, 0, 0, 0]);
        blob.extend_from_slice(&[7, 5, 0x81, 0x01, 0x00, 0x14, 1]);
        let tree = DeviceTree::from_byte_array(&blob).unwrap();
        let endpoint = &tree.configurations[0].interfaces[0].endpoints[0];
        assert_eq!(endpoint.max_packet_size(), 1024);
        assert_eq!(endpoint.transfer_type(), TransferType::Isochronous);
    }

    #[test]
    fn endpoint_display() {
        let tree = DeviceTree::from_byte_array(&echo_device_blob()).unwrap();
        let text = tree.configurations[0].interfaces[0].endpoints[1].to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ENDPOINT 0x81: Bulk IN");
        assert_eq!(lines[3], "  bEndpointAddress :   0x81 IN");
        assert_eq!(lines[5], "  wMaxPacketSize   :   0x40 (64 bytes)");
        assert_eq!(lines.len(), 7);
    }
}
