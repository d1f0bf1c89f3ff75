// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::pci::Arch;

#[derive(Error, Debug)]
pub enum PciOpenError {
    #[error("Failed to open device /dev/tenstorrent/{id}: {source}")]
    DeviceOpenFailed { id: usize, source: std::io::Error },

    #[error("ioctl {name} failed for device {id} with: {source}")]
    IoctlError {
        name: String,
        id: usize,
        source: nix::Error,
    },

    #[error("Failed to map {name} from device {id}")]
    BarMappingError { name: String, id: usize },

    #[error("Device {id} is not a Wormhole, found {arch:?}")]
    WrongArch { id: usize, arch: Arch },
}

#[derive(Error, Debug)]
pub enum PciError {
    #[error("Read 0xffffffff from ARC scratch[6]: you should reset the board.")]
    BrokenConnection,
}
