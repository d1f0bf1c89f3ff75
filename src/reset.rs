// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! PCIe link-level reset sequence for Wormhole boards.
//!
//! The sequence runs batch-wide, preserving the input interface order within
//! every phase:
//!
//! 1. Isolate the PCIe link of every interface (result unchecked).
//! 2. Bind one chip handle per interface; any failure aborts the batch.
//! 3. Sample the refclk counter of every chip as a baseline.
//! 4. Drive every chip into the A3 safe state, settling after each one.
//! 5. Fire the reset trigger on every chip without waiting for an ack.
//! 6. Wait once for the batch to settle, then restore every link.
//! 7. Resample the refclk counters and compare against the baselines.
//!
//! A chip whose counter kept counting never actually reset; those failures
//! are collected across the whole batch and reported together.
//!
//! # Examples
//!
//! ```no_run
//! use wh_reset::reset::{reset_chips, Opts};
//!
//! let report = reset_chips(&[0, 1], &Opts::default()).unwrap();
//! for failure in &report.failures {
//!     println!("interface {} did not reset", failure.interface);
//! }
//! ```

use std::os::fd::AsRawFd;
use std::time::Duration;

use thiserror::Error;

use crate::arc_msg::{ArcMsg, ArcMsgError, ArcMsgOptions, ArcState};
use crate::chip::{ChipImpl, WormholeChip};
use crate::error::{PciError, PciOpenError};
use crate::ioctl::{self, RESET_DEVICE_RESET_PCIE_LINK, RESET_DEVICE_RESTORE_STATE};

/// How long the A3 state takes to propagate through the regulators.
pub const A3_STATE_PROP_TIME: Duration = Duration::from_millis(30);

/// How long the batch settles between the last reset trigger and link restore.
pub const POST_RESET_MSG_WAIT_TIME: Duration = Duration::from_secs(2);

/// Errors that abort a reset batch.
#[derive(Error, Debug)]
pub enum ResetError {
    /// Failed to open the device node for a reset_device control call.
    #[error("Failed to open device /dev/tenstorrent/{interface}: {source}")]
    DeviceOpenFailed {
        interface: usize,
        #[source]
        source: std::io::Error,
    },

    /// The driver rejected the reset_device control call.
    #[error("reset_device ioctl failed for interface {interface} with: {source}")]
    IoctlFailed { interface: usize, source: nix::Error },

    /// Failed to bind a chip handle after link isolation.
    #[error("Failed to open chip {interface}: {source}")]
    ChipOpenFailed {
        interface: usize,
        #[source]
        source: PciOpenError,
    },

    #[error(transparent)]
    ArcMsg(#[from] ArcMsgError),

    #[error(transparent)]
    Pci(#[from] PciError),
}

/// Options for controlling reset behavior.
///
/// The timing fields default to the values the fw expects; tighten them only
/// in tests.
#[derive(Debug, Clone)]
pub struct Opts {
    /// Request the M3 board-level reset instead of the default chip-level
    /// reset. Applies uniformly to every chip in the batch.
    pub reset_m3: bool,

    /// Per-chip settle after the A3 safe-state ack.
    pub a3_prop_time: Duration,

    /// One batch-wide settle after all reset triggers are sent.
    pub post_reset_wait: Duration,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            reset_m3: false,
            a3_prop_time: A3_STATE_PROP_TIME,
            post_reset_wait: POST_RESET_MSG_WAIT_TIME,
        }
    }
}

/// An interface whose refclk counter kept counting across the reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefclkFailure {
    pub interface: usize,
    pub before: u64,
    pub after: u64,
}

/// Outcome of one reset batch.
///
/// `chips` always holds every bound handle in input order, including handles
/// for interfaces that failed verification.
pub struct ResetReport<C> {
    pub chips: Vec<C>,
    pub failures: Vec<RefclkFailure>,
}

impl<C> ResetReport<C> {
    /// Returns true if every chip in the batch actually reset.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Issues one reset_device control call against an interface's device node.
///
/// The node handle is opened for this single call and released on every exit
/// path. Returns the driver's verdict on the request; open or ioctl failures
/// are hard errors.
pub fn reset_device_ioctl(interface: usize, flags: u32) -> Result<bool, ResetError> {
    let fd = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(format!("/dev/tenstorrent/{interface}"))
        .map_err(|source| ResetError::DeviceOpenFailed { interface, source })?;

    let mut reset_device = ioctl::ResetDevice {
        input: ioctl::ResetDeviceIn {
            flags,
            ..Default::default()
        },
        ..Default::default()
    };

    unsafe { ioctl::reset_device(fd.as_raw_fd(), &mut reset_device) }
        .map_err(|source| ResetError::IoctlFailed { interface, source })?;

    Ok(reset_device.output.result == 0)
}

/// The two collaborators the sequence drives: the per-interface link control
/// gateway and the chip binder.
pub trait ResetBackend {
    type Chip: ChipImpl;

    /// Issue one reset_device control call for an interface.
    fn reset_device(&mut self, interface: usize, flags: u32) -> Result<bool, ResetError>;

    /// Bind a chip handle to an interface whose link is isolated.
    fn open_chip(&mut self, interface: usize) -> Result<Self::Chip, ResetError>;
}

/// Production backend going through the kernel driver.
pub struct KmdBackend;

impl ResetBackend for KmdBackend {
    type Chip = WormholeChip;

    fn reset_device(&mut self, interface: usize, flags: u32) -> Result<bool, ResetError> {
        reset_device_ioctl(interface, flags)
    }

    fn open_chip(&mut self, interface: usize) -> Result<WormholeChip, ResetError> {
        WormholeChip::open(interface)
            .map_err(|source| ResetError::ChipOpenFailed { interface, source })
    }
}

/// Performs a full LDS reset of a list of chips.
///
/// Returns the bound chip handles (in input order, failures included) along
/// with every interface whose refclk counter shows the reset never happened.
pub fn full_lds_reset<B: ResetBackend>(
    backend: &mut B,
    interfaces: &[usize],
    opts: &Opts,
) -> Result<ResetReport<B::Chip>, ResetError> {
    tracing::info!(?interfaces, reset_m3 = opts.reset_m3, "starting link reset");

    for &interface in interfaces {
        // Best-effort: a link that is already down still gets the rest of
        // the sequence, so the result code is unchecked.
        let _ = backend.reset_device(interface, RESET_DEVICE_RESET_PCIE_LINK)?;
    }

    let mut chips = Vec::with_capacity(interfaces.len());
    for &interface in interfaces {
        chips.push(backend.open_chip(interface)?);
    }

    let mut before = Vec::with_capacity(chips.len());
    for chip in chips.iter_mut() {
        before.push(chip.refclk_counter()?);
    }

    for chip in chips.iter_mut() {
        tracing::debug!(interface = chip.interface_id(), "entering A3 safe state");
        chip.arc_msg(ArcMsgOptions {
            msg: ArcMsg::SetArcState {
                state: ArcState::A3,
            },
            ..Default::default()
        })?;
        std::thread::sleep(opts.a3_prop_time);
    }

    for chip in chips.iter_mut() {
        tracing::debug!(interface = chip.interface_id(), "triggering reset");
        chip.arc_msg(ArcMsgOptions {
            msg: ArcMsg::TriggerReset { m3: opts.reset_m3 },
            wait_for_done: false,
            ..Default::default()
        })?;
    }

    std::thread::sleep(opts.post_reset_wait);

    for &interface in interfaces {
        let _ = backend.reset_device(interface, RESET_DEVICE_RESTORE_STATE)?;
    }

    let mut failures = Vec::new();
    for (chip, &before) in chips.iter_mut().zip(before.iter()) {
        let after = chip.refclk_counter()?;
        if after > before {
            tracing::warn!(
                interface = chip.interface_id(),
                before,
                after,
                "refclk kept counting, reset did not go through"
            );
            failures.push(RefclkFailure {
                interface: chip.interface_id(),
                before,
                after,
            });
        }
    }

    Ok(ResetReport { chips, failures })
}

/// Resets a batch of chips through the kernel driver.
pub fn reset_chips(
    interfaces: &[usize],
    opts: &Opts,
) -> Result<ResetReport<WormholeChip>, ResetError> {
    full_lds_reset(&mut KmdBackend, interfaces, opts)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::arc_msg::ArcMsgOk;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Link { interface: usize, flags: u32 },
        Open { interface: usize },
        ArcMsg { interface: usize, msg: ArcMsg, wait: bool },
        Refclk { interface: usize },
    }

    type Log = Rc<RefCell<Vec<Event>>>;

    struct MockChip {
        interface: usize,
        refclk: Vec<u64>,
        reads: usize,
        log: Log,
    }

    impl ChipImpl for MockChip {
        fn interface_id(&self) -> usize {
            self.interface
        }

        fn arc_msg(&mut self, options: ArcMsgOptions) -> Result<ArcMsgOk, ArcMsgError> {
            self.log.borrow_mut().push(Event::ArcMsg {
                interface: self.interface,
                msg: options.msg,
                wait: options.wait_for_done,
            });

            Ok(if options.wait_for_done {
                ArcMsgOk::Ok { rc: 0, arg: 0 }
            } else {
                ArcMsgOk::OkNoWait
            })
        }

        fn refclk_counter(&mut self) -> Result<u64, PciError> {
            self.log.borrow_mut().push(Event::Refclk {
                interface: self.interface,
            });
            let value = self.refclk[self.reads];
            self.reads += 1;
            Ok(value)
        }
    }

    struct MockBackend {
        log: Log,
        // (before, after) refclk samples keyed by position in the batch.
        refclk: Vec<(u64, u64)>,
        bound: usize,
        fail_open: Option<usize>,
    }

    impl MockBackend {
        fn new(refclk: Vec<(u64, u64)>) -> Self {
            Self {
                log: Rc::new(RefCell::new(Vec::new())),
                refclk,
                bound: 0,
                fail_open: None,
            }
        }

        fn events(&self) -> Vec<Event> {
            self.log.borrow().clone()
        }
    }

    impl ResetBackend for MockBackend {
        type Chip = MockChip;

        fn reset_device(&mut self, interface: usize, flags: u32) -> Result<bool, ResetError> {
            self.log.borrow_mut().push(Event::Link { interface, flags });
            Ok(true)
        }

        fn open_chip(&mut self, interface: usize) -> Result<MockChip, ResetError> {
            if self.fail_open == Some(interface) {
                return Err(ResetError::ChipOpenFailed {
                    interface,
                    source: PciOpenError::DeviceOpenFailed {
                        id: interface,
                        source: std::io::Error::from(std::io::ErrorKind::NotFound),
                    },
                });
            }

            self.log.borrow_mut().push(Event::Open { interface });
            let (before, after) = self.refclk[self.bound];
            self.bound += 1;

            Ok(MockChip {
                interface,
                refclk: vec![before, after],
                reads: 0,
                log: Rc::clone(&self.log),
            })
        }
    }

    fn test_opts() -> Opts {
        Opts {
            reset_m3: false,
            a3_prop_time: Duration::ZERO,
            post_reset_wait: Duration::ZERO,
        }
    }

    #[test]
    fn sequence_order_is_fixed() {
        let mut backend = MockBackend::new(vec![(1000, 10), (2000, 20)]);
        let report = full_lds_reset(&mut backend, &[7, 3], &test_opts()).unwrap();

        assert!(report.is_success());

        let a3 = ArcMsg::SetArcState {
            state: ArcState::A3,
        };
        let trigger = ArcMsg::TriggerReset { m3: false };

        assert_eq!(
            backend.events(),
            vec![
                Event::Link {
                    interface: 7,
                    flags: RESET_DEVICE_RESET_PCIE_LINK
                },
                Event::Link {
                    interface: 3,
                    flags: RESET_DEVICE_RESET_PCIE_LINK
                },
                Event::Open { interface: 7 },
                Event::Open { interface: 3 },
                Event::Refclk { interface: 7 },
                Event::Refclk { interface: 3 },
                Event::ArcMsg {
                    interface: 7,
                    msg: a3,
                    wait: true
                },
                Event::ArcMsg {
                    interface: 3,
                    msg: a3,
                    wait: true
                },
                Event::ArcMsg {
                    interface: 7,
                    msg: trigger,
                    wait: false
                },
                Event::ArcMsg {
                    interface: 3,
                    msg: trigger,
                    wait: false
                },
                Event::Link {
                    interface: 7,
                    flags: RESET_DEVICE_RESTORE_STATE
                },
                Event::Link {
                    interface: 3,
                    flags: RESET_DEVICE_RESTORE_STATE
                },
                Event::Refclk { interface: 7 },
                Event::Refclk { interface: 3 },
            ]
        );
    }

    #[test]
    fn link_control_called_exactly_twice_per_interface() {
        let mut backend = MockBackend::new(vec![(100, 0), (100, 0), (100, 0)]);
        full_lds_reset(&mut backend, &[0, 1, 2], &test_opts()).unwrap();

        let links: Vec<Event> = backend
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Link { .. }))
            .collect();

        assert_eq!(links.len(), 6);
        for (i, interface) in [0usize, 1, 2].iter().enumerate() {
            assert_eq!(
                links[i],
                Event::Link {
                    interface: *interface,
                    flags: RESET_DEVICE_RESET_PCIE_LINK
                }
            );
            assert_eq!(
                links[i + 3],
                Event::Link {
                    interface: *interface,
                    flags: RESET_DEVICE_RESTORE_STATE
                }
            );
        }
    }

    #[test]
    fn refclk_samples_bracket_the_trigger() {
        let mut backend = MockBackend::new(vec![(500, 5)]);
        full_lds_reset(&mut backend, &[0], &test_opts()).unwrap();

        let events = backend.events();
        let first_sample = events
            .iter()
            .position(|e| matches!(e, Event::Refclk { .. }))
            .unwrap();
        let trigger = events
            .iter()
            .position(|e| matches!(e, Event::ArcMsg { wait: false, .. }))
            .unwrap();
        let second_sample = events
            .iter()
            .rposition(|e| matches!(e, Event::Refclk { .. }))
            .unwrap();

        assert!(first_sample < trigger);
        assert!(trigger < second_sample);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, Event::Refclk { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn m3_arg_applies_to_every_chip() {
        let mut backend = MockBackend::new(vec![(100, 0), (100, 0)]);
        let opts = Opts {
            reset_m3: true,
            ..test_opts()
        };
        full_lds_reset(&mut backend, &[0, 1], &opts).unwrap();

        let triggers: Vec<Event> = backend
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::ArcMsg { wait: false, .. }))
            .collect();

        assert_eq!(triggers.len(), 2);
        for event in triggers {
            assert!(matches!(
                event,
                Event::ArcMsg {
                    msg: ArcMsg::TriggerReset { m3: true },
                    ..
                }
            ));
        }
    }

    #[test]
    fn bind_failure_aborts_before_any_messaging() {
        let mut backend = MockBackend::new(vec![(100, 0), (100, 0)]);
        backend.fail_open = Some(1);

        let result = full_lds_reset(&mut backend, &[0, 1], &test_opts());
        assert!(matches!(
            result,
            Err(ResetError::ChipOpenFailed { interface: 1, .. })
        ));

        let events = backend.events();
        assert!(!events
            .iter()
            .any(|e| matches!(e, Event::ArcMsg { .. } | Event::Refclk { .. })));
        assert!(!events.iter().any(|e| matches!(
            e,
            Event::Link {
                flags: RESET_DEVICE_RESTORE_STATE,
                ..
            }
        )));
    }

    #[test]
    fn running_refclk_fails_that_interface_only() {
        // Chip 0 reset (counter wrapped back), chip 1 kept counting.
        let mut backend = MockBackend::new(vec![(1000, 50), (2000, 2500)]);
        let report = full_lds_reset(&mut backend, &[0, 1], &test_opts()).unwrap();

        assert!(!report.is_success());
        assert_eq!(
            report.failures,
            vec![RefclkFailure {
                interface: 1,
                before: 2000,
                after: 2500,
            }]
        );

        // Handles are never filtered down to the successes.
        assert_eq!(report.chips.len(), 2);
        assert_eq!(report.chips[0].interface_id(), 0);
        assert_eq!(report.chips[1].interface_id(), 1);
    }

    #[test]
    fn halted_refclk_is_a_success() {
        let mut backend = MockBackend::new(vec![(500, 10)]);
        let report = full_lds_reset(&mut backend, &[0], &test_opts()).unwrap();

        assert!(report.is_success());
        assert!(report.failures.is_empty());
        assert_eq!(report.chips.len(), 1);
    }

    #[test]
    fn equal_refclk_is_a_success() {
        let mut backend = MockBackend::new(vec![(500, 500)]);
        let report = full_lds_reset(&mut backend, &[0], &test_opts()).unwrap();

        assert!(report.is_success());
    }

    #[test]
    fn options_default_to_fw_timings() {
        let opts = Opts::default();
        assert!(!opts.reset_m3);
        assert_eq!(opts.a3_prop_time, Duration::from_millis(30));
        assert_eq!(opts.post_reset_wait, Duration::from_secs(2));
    }
}
