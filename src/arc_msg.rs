// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! ARC mailbox messaging.
//!
//! Messages are posted to the ARC microcontroller by writing the message code
//! into a scratch register and raising the firmware interrupt bit in
//! `ARC_MISC_CNTL`. A blocking send polls the scratch register until the fw
//! echoes the message code back; a non-blocking send returns as soon as the
//! interrupt is raised, which is the only option for messages (like a reset
//! trigger) that tear down the response path.

use std::time::Duration;

use thiserror::Error;

use crate::error::PciError;
use crate::pci::PciDevice;

const MSG_ERROR_REPLY: u32 = 0xffffffff;
const ARC_GO_TO_SLEEP_CODE: u16 = 0xaa55;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcState {
    A0,
    A1,
    A3,
    A5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcMsg {
    Nop,

    /// Move the ARC power-state machine. A3 is the safe state in which no
    /// regulator or clock change requests remain pending; it is required
    /// before triggering a reset.
    SetArcState { state: ArcState },

    /// Fire the chip reset. `m3` selects the M3 board-level variant instead
    /// of the default chip-level reset.
    TriggerReset { m3: bool },
}

impl ArcMsg {
    pub fn msg_code(&self) -> u16 {
        let code = match self {
            ArcMsg::Nop => 0x11,
            ArcMsg::SetArcState { state } => match state {
                ArcState::A0 => 0xA0,
                ArcState::A1 => 0xA1,
                ArcState::A3 => 0xA3,
                ArcState::A5 => 0xA5,
            },
            ArcMsg::TriggerReset { .. } => 0x56,
        };

        0xaa00 | code
    }

    pub fn args(&self) -> (u16, u16) {
        match self {
            ArcMsg::TriggerReset { m3: true } => (3, 0),
            ArcMsg::Nop | ArcMsg::SetArcState { .. } | ArcMsg::TriggerReset { m3: false } => (0, 0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArcMsgOptions {
    pub msg: ArcMsg,
    pub wait_for_done: bool,

    /// How long a blocking send will wait for the fw acknowledgment. `None`
    /// (the default) waits forever; a chip that never responds stalls the
    /// caller. Opting into a timeout does not change the message itself.
    pub timeout: Option<Duration>,
    pub use_second_mailbox: bool,
}

impl Default for ArcMsgOptions {
    fn default() -> Self {
        Self {
            msg: ArcMsg::Nop,
            wait_for_done: true,
            timeout: None,
            use_second_mailbox: false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ArcMsgError {
    #[error("Message 0x{0:04x} not recognized by ARC fw")]
    MsgNotRecognized(u16),

    #[error("Timed out while waiting {0:?} for ARC to respond")]
    Timeout(Duration),

    #[error("ARC is asleep")]
    ArcAsleep,

    #[error("Failed to trigger FW interrupt")]
    FwIntFailed,

    #[error(transparent)]
    Pci(#[from] PciError),
}

pub enum ArcMsgOk {
    Ok { rc: u32, arg: u32 },
    OkNoWait,
}

#[derive(Clone, Debug)]
pub struct ArcMsgAddr {
    pub scratch_base: u32,
    pub arc_misc_cntl: u32,
}

/// Returns true if a new interrupt was triggered, or false if the fw is
/// currently busy. The message IRQ handler should only take a couple dozen
/// cycles, so false probably means something went wrong.
fn trigger_fw_int(device: &mut PciDevice, addrs: &ArcMsgAddr) -> Result<bool, PciError> {
    let misc = device.read32(addrs.arc_misc_cntl)?;

    if misc & (1 << 16) != 0 {
        return Ok(false);
    }

    device.write32(addrs.arc_misc_cntl, misc | (1 << 16))?;

    Ok(true)
}

pub fn arc_msg(
    device: &mut PciDevice,
    msg: &ArcMsg,
    wait_for_done: bool,
    timeout: Option<Duration>,
    msg_reg: u32,
    return_reg: u32,
    addrs: &ArcMsgAddr,
) -> Result<ArcMsgOk, ArcMsgError> {
    let (arg0, arg1) = msg.args();
    let code = msg.msg_code();

    let current_code = device.read32(addrs.scratch_base + msg_reg * 4)?;
    if (current_code & 0xFFFF) as u16 == ARC_GO_TO_SLEEP_CODE {
        return Err(ArcMsgError::ArcAsleep);
    }

    device.write32(
        addrs.scratch_base + return_reg * 4,
        arg0 as u32 | ((arg1 as u32) << 16),
    )?;
    device.write32(addrs.scratch_base + msg_reg * 4, code as u32)?;

    if !trigger_fw_int(device, addrs)? {
        return Err(ArcMsgError::FwIntFailed);
    }

    if wait_for_done {
        let start = std::time::Instant::now();
        loop {
            let status = device.read32(addrs.scratch_base + msg_reg * 4)?;
            if (status & 0xFFFF) as u16 == code & 0xFF {
                let rc = (status >> 16) & 0xFFFF;
                let arg = device.read32(addrs.scratch_base + return_reg * 4)?;

                return Ok(ArcMsgOk::Ok { rc, arg });
            } else if status == MSG_ERROR_REPLY {
                return Err(ArcMsgError::MsgNotRecognized(code));
            }

            std::thread::sleep(Duration::from_millis(1));
            if let Some(timeout) = timeout {
                if start.elapsed() > timeout {
                    return Err(ArcMsgError::Timeout(timeout));
                }
            }
        }
    }

    Ok(ArcMsgOk::OkNoWait)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_codes_carry_wire_prefix() {
        assert_eq!(ArcMsg::Nop.msg_code(), 0xaa11);
        assert_eq!(
            ArcMsg::SetArcState {
                state: ArcState::A3
            }
            .msg_code(),
            0xaaa3
        );
        assert_eq!(ArcMsg::TriggerReset { m3: false }.msg_code(), 0xaa56);
        assert_eq!(ArcMsg::TriggerReset { m3: true }.msg_code(), 0xaa56);
    }

    #[test]
    fn trigger_reset_arg_selects_board_level() {
        assert_eq!(ArcMsg::TriggerReset { m3: false }.args(), (0, 0));
        assert_eq!(ArcMsg::TriggerReset { m3: true }.args(), (3, 0));
    }

    #[test]
    fn blocking_send_has_no_timeout_by_default() {
        let options = ArcMsgOptions::default();
        assert!(options.wait_for_done);
        assert!(options.timeout.is_none());
        assert!(!options.use_second_mailbox);
    }
}
