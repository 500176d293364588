// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use otapply::constants::{UPDATER_RETRY_TAG, UPDATE_SCRIPT_FILE};
use otapply::errors::ExitCode;
use otapply::package::manager::PkgManager;
use otapply::script::{InstructionRegistry, ScriptError, ScriptRunner};
use otapply::stream::PkgStream;
use otapply::updater::env::UpdateEnv;
use otapply::updater::fault_retry::HwFaultRetry;
use otapply::updater::misc::read_misc_msg;
use otapply::utils::format_size;
use otapply::verify::verify_util::verify_package_sign;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(message.to_string());
    pb
}

fn load_manager(package: &Path, verify: bool) -> Result<Arc<PkgManager>> {
    let pb = spinner(&format!("Loading {}", package.display()));
    let manager = PkgManager::new();
    let names = if verify {
        manager.load_package(package)
    } else {
        manager.load_package_unverified(package)
    }
    .map_err(|e| anyhow!("load package failed: {}", e))?;
    pb.finish_with_message(format!("Loaded {} inner files", names.len()));
    Ok(Arc::new(manager))
}

/// The update pipeline: verify, arm the hash verifier, run the package
/// script, and hand failures to the retry controller.
pub fn run_update(
    package: PathBuf,
    work_dir: PathBuf,
    device_dir: PathBuf,
    misc: PathBuf,
    force_retry: bool,
) -> Result<i32> {
    std::fs::create_dir_all(&work_dir).context("create work dir")?;

    let misc_msg = read_misc_msg(&misc).map_err(|e| anyhow!("read misc failed: {}", e))?;
    let retry = force_retry || misc_msg.retry_count > 0;
    info!(
        "update start: retry={} count={} fault={:?}",
        retry, misc_msg.retry_count, misc_msg.fault_info
    );

    let manager = match load_manager(&package, true) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{}", e);
            println!("subProcessResult:{}", ExitCode::ReadPackageError.code());
            return Ok(ExitCode::ReadPackageError.code());
        }
    };

    // every message the engine posts is one line on the parent pipe
    let faults: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let fault_sink = Arc::clone(&faults);
    let mut env = UpdateEnv::new(
        Arc::clone(&manager),
        work_dir,
        device_dir,
        misc.clone(),
        retry,
        Box::new(move |cmd, content| {
            println!("{}:{}", cmd, content);
            if cmd == UPDATER_RETRY_TAG {
                fault_sink.lock().unwrap().push(content.to_string());
            }
        }),
    );
    env.hash_verifier = Some(
        manager
            .create_hash_verifier()
            .map_err(|e| anyhow!("arm hash verifier failed: {}", e))?,
    );

    let script = match manager.extract_to_memory(UPDATE_SCRIPT_FILE) {
        Ok(bytes) => bytes,
        Err(_) => {
            println!("subProcessResult:{}", ExitCode::ScriptNotFound.code());
            return Ok(ExitCode::ScriptNotFound.code());
        }
    };
    if !env.verify_inner_file(UPDATE_SCRIPT_FILE, &script) {
        println!("subProcessResult:{}", ExitCode::ReadPackageError.code());
        return Ok(ExitCode::ReadPackageError.code());
    }
    let script = String::from_utf8_lossy(&script).into_owned();

    let registry = InstructionRegistry::with_builtins();
    let result = ScriptRunner::new(&registry, &env).run(&script);
    let code = match result {
        Ok(()) => {
            env.record.clear().ok();
            otapply::updater::misc::clear_misc_msg(&misc).ok();
            ExitCode::Success
        }
        Err(ScriptError::Parse) => ExitCode::ScriptParseError,
        Err(ScriptError::Execute(e)) => {
            warn!("script execution failed: {}", e);
            // a recorded fault escalates to the reboot-to-retry controller;
            // the launcher performs the actual reboot
            if let Some(fault) = faults.lock().unwrap().first() {
                let mut hw = HwFaultRetry::new(
                    misc.clone(),
                    Arc::new(|target| info!("reboot to {} requested", target)),
                );
                hw.set_fault_info(fault);
                hw.set_retry_count(misc_msg.retry_count);
                hw.do_retry_action();
            }
            ExitCode::ScriptExecError
        }
    };
    println!("subProcessResult:{}", code.code());
    Ok(code.code())
}

#[derive(Serialize)]
struct InnerFileMetadata {
    name: String,
    packed_size: u64,
    unpacked_size: u64,
    packed_size_readable: String,
    data_offset: u64,
    compression: String,
}

#[derive(Serialize)]
struct PackageMetadata {
    package: String,
    entry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    software_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    product_update_id: Option<String>,
    files: Vec<InnerFileMetadata>,
}

pub fn run_info(package: PathBuf, json: bool, no_verify: bool) -> Result<i32> {
    let manager = load_manager(&package, !no_verify)?;
    let upgrade = manager.upgrade_info();
    let mut files = Vec::new();
    for name in manager.file_names() {
        let Some(info) = manager.file_info(&name) else {
            continue;
        };
        files.push(InnerFileMetadata {
            name,
            packed_size: info.packed_size,
            unpacked_size: info.unpacked_size,
            packed_size_readable: format_size(info.packed_size),
            data_offset: info.data_offset,
            compression: format!("{:?}", info.pack_method),
        });
    }
    let metadata = PackageMetadata {
        package: package.display().to_string(),
        entry_count: manager.pkg_info().entry_count,
        software_version: upgrade.as_ref().map(|u| u.software_version.clone()),
        product_update_id: upgrade.as_ref().map(|u| u.product_update_id.clone()),
        files,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
    } else {
        println!("{} ({} entries)", metadata.package, metadata.entry_count);
        for file in &metadata.files {
            println!(
                "  {:<40} {:>12} -> {:>12}  {}",
                file.name,
                file.packed_size,
                file.unpacked_size,
                file.compression
            );
        }
    }
    Ok(0)
}

pub fn run_extract(package: PathBuf, name: String, out: PathBuf, no_verify: bool) -> Result<i32> {
    let manager = load_manager(&package, !no_verify)?;
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let mut stream = PkgStream::open_write(&name, &out)
        .map_err(|e| anyhow!("create {} failed: {}", out.display(), e))?;
    let size = manager
        .extract_file(&name, &mut stream)
        .map_err(|e| anyhow!("extract {} failed: {}", name, e))?;
    println!("extracted {} ({}) to {}", name, format_size(size), out.display());
    Ok(0)
}

pub fn run_verify(package: PathBuf) -> Result<i32> {
    let pb = spinner("Verifying signature...");
    let mut stream = PkgStream::open_read(&package.to_string_lossy(), &package)
        .map_err(|e| anyhow!("open package failed: {}", e))?;
    match verify_package_sign(&mut stream) {
        Ok(_) => {
            pb.finish_with_message("Signature OK");
            Ok(0)
        }
        Err(e) => {
            pb.finish_with_message(format!("Signature check failed: {}", e));
            Ok(1)
        }
    }
}
