// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

pub mod args;
pub mod commands;

use anyhow::Result;
use args::{Args, Command};
use clap::Parser;

pub fn run() -> Result<i32> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    match args.command {
        Command::Update {
            package,
            work_dir,
            device_dir,
            misc,
            retry,
        } => commands::run_update(package, work_dir, device_dir, misc, retry),
        Command::Info {
            package,
            json,
            no_verify,
        } => commands::run_info(package, json, no_verify),
        Command::Extract {
            package,
            name,
            out,
            no_verify,
        } => commands::run_extract(package, name, out, no_verify),
        Command::Verify { package } => commands::run_verify(package),
    }
}
