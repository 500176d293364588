// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "otapply", version, about = "OTA update package processing engine")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Log noise level passed to env_logger (error, warn, info, debug)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the update pipeline of a signed package against the device
    Update {
        /// Signed outer package (zip with signature comment)
        package: PathBuf,

        /// Scratch directory for stash, records and backups
        #[arg(long, default_value = "/data/updater")]
        work_dir: PathBuf,

        /// Directory holding the partition block device nodes
        #[arg(long, default_value = "/dev/block/by-name")]
        device_dir: PathBuf,

        /// The misc partition carrying cross-boot state
        #[arg(long, default_value = "/dev/block/by-name/misc")]
        misc: PathBuf,

        /// Force a resumed run even when misc carries no retry state
        #[arg(long)]
        retry: bool,
    },

    /// Print the package layout and inner file table
    Info {
        package: PathBuf,

        /// Emit machine-readable JSON instead of a table
        #[arg(long)]
        json: bool,

        /// Skip the outer signature (inspection only)
        #[arg(long)]
        no_verify: bool,
    },

    /// Extract one inner file
    Extract {
        package: PathBuf,

        /// Inner file name
        name: String,

        /// Output path
        #[arg(short, long)]
        out: PathBuf,

        /// Skip the outer signature (inspection only)
        #[arg(long)]
        no_verify: bool,
    },

    /// Check the outer package signature and digest
    Verify { package: PathBuf },
}
