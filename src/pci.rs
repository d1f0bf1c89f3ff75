// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Minimal PCI device access through the tenstorrent kernel driver.
//!
//! Opens a per-interface device node, identifies the chip from its PCI device
//! id and maps the BARs needed for register access. Wormhole keeps its ARC
//! registers behind the BAR4 system-register window, everything below that
//! window is reached through BAR0.

use std::os::{fd::AsRawFd, unix::prelude::FileTypeExt};

use crate::error::{PciError, PciOpenError};
use crate::ioctl::{self, GetDeviceInfo, GetDeviceInfoOut, Mapping, QueryMappings};

const ERROR_VALUE: u32 = 0xffffffff;
const ARC_SCRATCH6_ADDR: u32 = 0x1ff30078;

// Registers at or above this address live in the BAR4 system-register window.
const WH_SYSTEM_REG_START_OFFSET: u32 = (512 - 16) * 1024 * 1024;
const WH_SYSTEM_REG_OFFSET_ADJUST: u32 = (512 - 32) * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    Grayskull,
    Wormhole,
    Blackhole,
    Unknown(u16),
}

impl From<&GetDeviceInfoOut> for Arch {
    fn from(value: &GetDeviceInfoOut) -> Self {
        match value.device_id {
            0xfaca => Arch::Grayskull,
            0x401e => Arch::Wormhole,
            0xb140 => Arch::Blackhole,
            id => Arch::Unknown(id),
        }
    }
}

pub struct PciDevice {
    pub id: usize,
    pub arch: Arch,

    // The mappings below borrow from this fd for the lifetime of the device.
    #[allow(dead_code)]
    device_fd: std::fs::File,

    bar0_uc: memmap2::MmapMut,

    system_reg_mapping: Option<memmap2::MmapMut>,
    system_reg_start_offset: u32,
    system_reg_offset_adjust: u32,
}

impl PciDevice {
    pub fn open(device_id: usize) -> Result<PciDevice, PciOpenError> {
        let fd = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/dev/tenstorrent/{device_id}"))
            .map_err(|source| PciOpenError::DeviceOpenFailed {
                id: device_id,
                source,
            })?;

        let mut device_info = GetDeviceInfo::default();
        unsafe { ioctl::get_device_info(fd.as_raw_fd(), &mut device_info) }.map_err(|source| {
            PciOpenError::IoctlError {
                name: "get_device_info".to_string(),
                id: device_id,
                source,
            }
        })?;

        let arch = Arch::from(&device_info.output);

        let mut mappings = QueryMappings::<8>::default();
        unsafe { ioctl::query_mappings(fd.as_raw_fd(), &mut mappings) }.map_err(|source| {
            PciOpenError::IoctlError {
                name: "query_mappings".to_string(),
                id: device_id,
                source,
            }
        })?;

        let mut bar0_uc_mapping = Mapping::default();
        let mut bar2_uc_mapping = Mapping::default();
        for mapping in mappings.output.mappings.iter() {
            match mapping.mapping_id {
                ioctl::MAPPING_RESOURCE0_UC => bar0_uc_mapping = *mapping,
                ioctl::MAPPING_RESOURCE2_UC => bar2_uc_mapping = *mapping,
                _ => {}
            }
        }

        if bar0_uc_mapping.mapping_id != ioctl::MAPPING_RESOURCE0_UC {
            return Err(PciOpenError::BarMappingError {
                name: "bar0_uc".to_string(),
                id: device_id,
            });
        }

        let bar0_uc = unsafe {
            memmap2::MmapOptions::default()
                .len(bar0_uc_mapping.mapping_size as usize)
                .offset(bar0_uc_mapping.mapping_base)
                .map_mut(fd.as_raw_fd())
        }
        .map_err(|_| PciOpenError::BarMappingError {
            name: "bar0_uc".to_string(),
            id: device_id,
        })?;

        let mut system_reg_mapping = None;
        let mut system_reg_start_offset = 0;
        let mut system_reg_offset_adjust = 0;
        if arch == Arch::Wormhole {
            if bar2_uc_mapping.mapping_id != ioctl::MAPPING_RESOURCE2_UC {
                return Err(PciOpenError::BarMappingError {
                    name: "bar2_uc".to_string(),
                    id: device_id,
                });
            }

            let system_reg = unsafe {
                memmap2::MmapOptions::default()
                    .len(bar2_uc_mapping.mapping_size as usize)
                    .offset(bar2_uc_mapping.mapping_base)
                    .map_mut(fd.as_raw_fd())
            }
            .map_err(|_| PciOpenError::BarMappingError {
                name: "bar2_uc".to_string(),
                id: device_id,
            })?;

            system_reg_mapping = Some(system_reg);
            system_reg_start_offset = WH_SYSTEM_REG_START_OFFSET;
            system_reg_offset_adjust = WH_SYSTEM_REG_OFFSET_ADJUST;
        }

        tracing::debug!(device_id, ?arch, "opened pci device");

        Ok(PciDevice {
            id: device_id,
            arch,
            device_fd: fd,
            bar0_uc,
            system_reg_mapping,
            system_reg_start_offset,
            system_reg_offset_adjust,
        })
    }

    /// Lists the interface ids of all device nodes under /dev/tenstorrent.
    pub fn scan() -> Vec<usize> {
        let entries = match std::fs::read_dir("/dev/tenstorrent") {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut output = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;

                if !entry.file_type().ok()?.is_char_device() {
                    return None;
                }

                let path = entry.path();
                let file_name = path.file_name()?.to_str()?;
                file_name.parse::<usize>().ok()
            })
            .collect::<Vec<_>>();

        output.sort();

        output
    }

    unsafe fn register_address<T>(&self, mut register_addr: u32) -> *const T {
        let reg_mapping: *const u8;

        match self.system_reg_mapping.as_ref() {
            Some(mapping) if register_addr >= self.system_reg_start_offset => {
                register_addr -= self.system_reg_offset_adjust;
                reg_mapping = mapping.as_ptr();
            }
            _ => {
                reg_mapping = self.bar0_uc.as_ptr();
            }
        }

        reg_mapping.offset(register_addr as isize) as *const T
    }

    #[inline]
    fn detect_ffffffff_read(&self, data_read: Option<u32>) -> Result<(), PciError> {
        let data_read = data_read.unwrap_or(ERROR_VALUE);

        if data_read == ERROR_VALUE {
            let scratch_data = unsafe {
                self.register_address::<u32>(ARC_SCRATCH6_ADDR)
                    .read_volatile()
            };

            if scratch_data == ERROR_VALUE {
                return Err(PciError::BrokenConnection);
            }
        }

        Ok(())
    }

    #[inline]
    pub fn read32(&self, addr: u32) -> Result<u32, PciError> {
        let data = unsafe { self.register_address::<u32>(addr).read_volatile() };
        self.detect_ffffffff_read(Some(data))?;

        Ok(data)
    }

    #[inline]
    pub fn write32(&mut self, addr: u32, data: u32) -> Result<(), PciError> {
        unsafe {
            (self.register_address::<u32>(addr) as *mut u32).write_volatile(data);
        }
        self.detect_ffffffff_read(None)?;

        Ok(())
    }
}
