// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! PCIe link-level reset for Tenstorrent Wormhole boards.
//!
//! Recovers a hung chip, or restores a batch of chips to a known state before
//! a firmware reload. The reset sequence isolates each board's PCIe link,
//! walks the ARC fw into the A3 safe state, fires the reset trigger, restores
//! the links and then verifies against the refclk counter that each chip
//! actually went down.

pub mod arc_msg;
pub mod chip;
pub mod error;
pub mod ioctl;
pub mod pci;
pub mod reset;

pub use chip::{ChipImpl, WormholeChip};
pub use reset::{full_lds_reset, reset_chips, Opts, RefclkFailure, ResetError, ResetReport};
