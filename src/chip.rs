// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-interface chip handle.
//!
//! A [`WormholeChip`] is bound 1:1 to a PCI interface and owned by the reset
//! sequence for the duration of one batch. It exposes the two capabilities
//! the sequence needs: posting ARC messages and sampling the free-running
//! refclk counter used as a reset-detection heartbeat.

use crate::arc_msg::{self, ArcMsgAddr, ArcMsgError, ArcMsgOk, ArcMsgOptions};
use crate::error::{PciError, PciOpenError};
use crate::pci::{Arch, PciDevice};

pub const ARC_RESET_BASE: u32 = 0x1FF3_0000;
pub const ARC_RESET_SCRATCH_BASE: u32 = ARC_RESET_BASE + 0x60;
pub const ARC_MISC_CNTL_ADDR: u32 = ARC_RESET_BASE + 0x100;

/// Free-running 64-bit counter in the ARC reset unit, split across two
/// registers. It only advances while the chip is powered and clocked.
pub const REFCLK_COUNTER_LOW_ADDR: u32 = ARC_RESET_BASE + 0x1B0;
pub const REFCLK_COUNTER_HIGH_ADDR: u32 = ARC_RESET_BASE + 0x1B4;

/// Chip capabilities consumed by the reset sequence.
pub trait ChipImpl {
    /// The PCI interface this handle is bound to.
    fn interface_id(&self) -> usize;

    /// Send a message to the ARC microcontroller.
    fn arc_msg(&mut self, options: ArcMsgOptions) -> Result<ArcMsgOk, ArcMsgError>;

    /// Sample the refclk counter. Reading has no side effects on the chip.
    fn refclk_counter(&mut self) -> Result<u64, PciError>;
}

pub struct WormholeChip {
    device: PciDevice,
}

impl WormholeChip {
    pub fn open(interface: usize) -> Result<Self, PciOpenError> {
        let device = PciDevice::open(interface)?;

        if device.arch != Arch::Wormhole {
            return Err(PciOpenError::WrongArch {
                id: interface,
                arch: device.arch,
            });
        }

        Ok(Self { device })
    }
}

impl ChipImpl for WormholeChip {
    fn interface_id(&self) -> usize {
        self.device.id
    }

    fn arc_msg(&mut self, options: ArcMsgOptions) -> Result<ArcMsgOk, ArcMsgError> {
        let (msg_reg, return_reg) = if options.use_second_mailbox {
            (2, 4)
        } else {
            (5, 3)
        };

        let addrs = ArcMsgAddr {
            scratch_base: ARC_RESET_SCRATCH_BASE,
            arc_misc_cntl: ARC_MISC_CNTL_ADDR,
        };

        arc_msg::arc_msg(
            &mut self.device,
            &options.msg,
            options.wait_for_done,
            options.timeout,
            msg_reg,
            return_reg,
            &addrs,
        )
    }

    fn refclk_counter(&mut self) -> Result<u64, PciError> {
        let high = self.device.read32(REFCLK_COUNTER_HIGH_ADDR)?;
        let mut low = self.device.read32(REFCLK_COUNTER_LOW_ADDR)?;
        let high2 = self.device.read32(REFCLK_COUNTER_HIGH_ADDR)?;

        // The low word carried into the high word between the two reads.
        if high2 != high {
            low = self.device.read32(REFCLK_COUNTER_LOW_ADDR)?;
        }

        Ok(((high2 as u64) << 32) | low as u64)
    }
}
