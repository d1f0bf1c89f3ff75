// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use wh_reset::pci::PciDevice;
use wh_reset::reset::{reset_chips, Opts};

#[derive(Parser)]
#[command(
    name = "wh-reset",
    about = "PCIe link-level reset for Tenstorrent Wormhole boards",
    version
)]
struct Cli {
    /// PCI interface ids to reset (defaults to every device under /dev/tenstorrent)
    interfaces: Vec<usize>,

    /// Trigger an M3 board-level reset instead of the default chip-level reset
    #[arg(long)]
    m3: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    let interfaces = if cli.interfaces.is_empty() {
        PciDevice::scan()
    } else {
        cli.interfaces
    };

    if interfaces.is_empty() {
        eprintln!("No Tenstorrent devices found");
        return ExitCode::FAILURE;
    }

    println!("Resetting {} chips", interfaces.len());

    let opts = Opts {
        reset_m3: cli.m3,
        ..Default::default()
    };

    let report = match reset_chips(&interfaces, &opts) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    for failure in &report.failures {
        eprintln!(
            "Reset for pci {} didn't go through! Refclk didn't reset. Value before: {}, value after: {}",
            failure.interface, failure.before, failure.after
        );
    }

    if report.is_success() {
        println!("Reset complete for {} chips", report.chips.len());
        ExitCode::SUCCESS
    } else {
        eprintln!("Reset failed for one or more boards, returning with non-zero exit code");
        ExitCode::FAILURE
    }
}
