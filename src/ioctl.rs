// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-layout ioctl records for the tenstorrent kernel driver (ttkmd).
//!
//! Every request is a packed input/output pair handed to the driver through a
//! read-write ioctl. The request codes combine the vendor magic byte (0xFA)
//! with a per-command number and carry no direction or size bits.

const TENSTORRENT_IOCTL_MAGIC: usize = 0xFA;

use nix::request_code_none;

#[derive(Debug)]
#[repr(C)]
pub struct GetDeviceInfoIn {
    pub output_size_bytes: u32,
}

impl Default for GetDeviceInfoIn {
    fn default() -> Self {
        Self {
            output_size_bytes: std::mem::size_of::<GetDeviceInfoOut>() as u32,
        }
    }
}

#[derive(Default, Debug)]
#[repr(C)]
pub struct GetDeviceInfoOut {
    pub output_size_bytes: u32,
    pub vendor_id: u16,
    pub device_id: u16,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub bus_dev_fn: u16,            // [0:2] function, [3:7] device, [8:15] bus
    pub max_dma_buf_size_log2: u16, // Since 1.0
    pub pci_domain: u16,            // Since 1.23
}

#[derive(Default, Debug)]
#[repr(C)]
pub struct GetDeviceInfo {
    pub input: GetDeviceInfoIn,
    pub output: GetDeviceInfoOut,
}

nix::ioctl_readwrite_bad!(
    get_device_info,
    request_code_none!(TENSTORRENT_IOCTL_MAGIC, 0),
    GetDeviceInfo
);

pub const MAPPING_RESOURCE0_UC: u32 = 1;
pub const MAPPING_RESOURCE2_UC: u32 = 5;

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct Mapping {
    pub mapping_id: u32,
    _reserved: u32,
    pub mapping_base: u64,
    pub mapping_size: u64,
}

#[derive(Debug, Default)]
#[repr(C)]
pub struct QueryMappingsIn {
    pub output_mapping_count: u32,
    _reserved: u32,
}

#[derive(Debug)]
#[repr(C)]
pub struct QueryMappingsOut<const N: usize> {
    pub mappings: [Mapping; N],
}

impl<const N: usize> Default for QueryMappingsOut<N> {
    fn default() -> Self {
        Self {
            mappings: [Mapping::default(); N],
        }
    }
}

#[derive(Debug)]
#[repr(C)]
pub struct QueryMappings<const N: usize> {
    pub input: QueryMappingsIn,
    pub output: QueryMappingsOut<N>,
}

impl<const N: usize> Default for QueryMappings<N> {
    fn default() -> Self {
        Self {
            input: QueryMappingsIn {
                output_mapping_count: N as u32,
                ..Default::default()
            },
            output: QueryMappingsOut::<N>::default(),
        }
    }
}

/// # Safety
///
/// You must make sure that data is a valid pointer and that the file descriptor is valid
pub unsafe fn query_mappings<const N: usize>(
    fd: nix::libc::c_int,
    data: *mut QueryMappings<N>,
) -> nix::Result<nix::libc::c_int> {
    nix::convert_ioctl_res!(nix::libc::ioctl(
        fd,
        request_code_none!(TENSTORRENT_IOCTL_MAGIC, 2) as nix::sys::ioctl::ioctl_num_type,
        data
    ))
}

pub const RESET_DEVICE_RESTORE_STATE: u32 = 0;
pub const RESET_DEVICE_RESET_PCIE_LINK: u32 = 1;

#[repr(C)]
pub struct ResetDeviceIn {
    pub output_size_bytes: u32,
    pub flags: u32,
}

impl Default for ResetDeviceIn {
    fn default() -> Self {
        Self {
            output_size_bytes: std::mem::size_of::<ResetDeviceOut>() as u32,
            flags: 0,
        }
    }
}

/// `result == 0` indicates the driver accepted and completed the request.
#[derive(Default)]
#[repr(C)]
pub struct ResetDeviceOut {
    pub output_size_bytes: u32,
    pub result: u32,
}

#[derive(Default)]
#[repr(C)]
pub struct ResetDevice {
    pub input: ResetDeviceIn,
    pub output: ResetDeviceOut,
}

nix::ioctl_readwrite_bad!(
    reset_device,
    request_code_none!(TENSTORRENT_IOCTL_MAGIC, 6),
    ResetDevice
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_device_layout() {
        assert_eq!(std::mem::size_of::<ResetDeviceIn>(), 8);
        assert_eq!(std::mem::size_of::<ResetDeviceOut>(), 8);
        assert_eq!(std::mem::size_of::<ResetDevice>(), 16);
    }

    #[test]
    fn reset_device_request_code() {
        // Magic byte in the high byte, command number in the low byte.
        assert_eq!(request_code_none!(TENSTORRENT_IOCTL_MAGIC, 6) as u32, 0xFA06);
    }

    #[test]
    fn reset_device_in_defaults() {
        let input = ResetDeviceIn::default();
        assert_eq!(
            input.output_size_bytes,
            std::mem::size_of::<ResetDeviceOut>() as u32
        );
        assert_eq!(input.flags, RESET_DEVICE_RESTORE_STATE);
    }

    #[test]
    fn query_mappings_layout() {
        assert_eq!(std::mem::size_of::<Mapping>(), 24);
        assert_eq!(std::mem::size_of::<QueryMappingsIn>(), 8);
    }
}
