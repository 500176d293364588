// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::constants::{
    IO_FAILED_REBOOT, MAX_RETRY_COUNT, PROCESS_BIN_FAIL_RETRY, VERIFY_FAILED_REBOOT,
};
use crate::errors::PkgResult;
use crate::updater::misc::{read_misc_msg, write_misc_msg};
use log::{error, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Injected reboot action; the library never calls the reboot syscall
/// itself.
pub type RebootFn = Arc<dyn Fn(&str) + Send + Sync>;

type RetryFunc = Arc<dyn Fn(&HwFaultRetry) -> bool + Send + Sync>;

/// Records fault kind and retry counter into the misc area and requests a
/// reboot back into the updater, bounded by `MAX_RETRY_COUNT`.
pub struct HwFaultRetry {
    fault_info: String,
    retry_count: u32,
    misc_path: PathBuf,
    reboot: RebootFn,
    handlers: HashMap<String, RetryFunc>,
}

impl HwFaultRetry {
    pub fn new(misc_path: PathBuf, reboot: RebootFn) -> HwFaultRetry {
        let mut retry = HwFaultRetry {
            fault_info: String::new(),
            retry_count: 0,
            misc_path,
            reboot,
            handlers: HashMap::new(),
        };
        let reboot_func: RetryFunc = Arc::new(|hw| hw.reboot_retry());
        retry.register_func(VERIFY_FAILED_REBOOT, Arc::clone(&reboot_func));
        retry.register_func(IO_FAILED_REBOOT, Arc::clone(&reboot_func));
        retry.register_func(PROCESS_BIN_FAIL_RETRY, reboot_func);
        retry
    }

    pub fn register_func(&mut self, fault_info: &str, func: RetryFunc) {
        if self.handlers.insert(fault_info.to_string(), func).is_some() {
            error!("handler for {} registered twice", fault_info);
        }
    }

    pub fn set_fault_info(&mut self, fault_info: &str) {
        self.fault_info = fault_info.to_string();
    }

    pub fn set_retry_count(&mut self, count: u32) {
        self.retry_count = count;
    }

    pub fn fault_info(&self) -> &str {
        &self.fault_info
    }

    /// Runs the handler registered for the current fault. Returns whether a
    /// reboot was requested.
    pub fn do_retry_action(&self) -> bool {
        let Some(func) = self.handlers.get(&self.fault_info) else {
            error!("no retry func for {}", self.fault_info);
            return false;
        };
        func(self)
    }

    fn reboot_retry(&self) -> bool {
        if self.retry_count >= MAX_RETRY_COUNT {
            info!(
                "retried {} times already, no more retries",
                self.retry_count
            );
            return false;
        }
        if let Err(e) = self.set_info_to_misc() {
            warn!("set misc for retry failed: {}", e);
            return false;
        }
        (self.reboot)("updater");
        true
    }

    fn set_info_to_misc(&self) -> PkgResult<()> {
        let mut msg = read_misc_msg(&self.misc_path)?;
        msg.command = "boot_updater".to_string();
        msg.retry_count = self.retry_count + 1;
        msg.fault_info = self.fault_info.clone();
        info!(
            "misc retry message: fault {} count {}",
            msg.fault_info, msg.retry_count
        );
        write_misc_msg(&self.misc_path, &msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::updater::misc::read_misc_msg;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_reboot(counter: Arc<AtomicU32>) -> RebootFn {
        Arc::new(move |target| {
            assert_eq!(target, "updater");
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn reboot_count_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let misc = dir.path().join("misc");
        let reboots = Arc::new(AtomicU32::new(0));

        // first entry into the updater marks retry_count 1 in misc; each
        // simulated boot reads the counter back like the real boot path
        let mut msg = crate::updater::misc::UpdateMessage {
            command: "boot_updater".into(),
            retry_count: 1,
            ..Default::default()
        };
        crate::updater::misc::write_misc_msg(&misc, &msg).unwrap();

        let mut boots = 0;
        loop {
            let mut hw = HwFaultRetry::new(misc.clone(), counting_reboot(Arc::clone(&reboots)));
            hw.set_fault_info(VERIFY_FAILED_REBOOT);
            hw.set_retry_count(msg.retry_count);
            if !hw.do_retry_action() {
                break;
            }
            boots += 1;
            assert!(boots < 10, "retry loop did not terminate");
            msg = read_misc_msg(&misc).unwrap();
        }
        // at most MAX_RETRY_COUNT - 1 reboots for one fault
        assert_eq!(reboots.load(Ordering::SeqCst), MAX_RETRY_COUNT - 1);
        assert_eq!(read_misc_msg(&misc).unwrap().retry_count, MAX_RETRY_COUNT);
    }

    #[test]
    fn unknown_fault_has_no_handler() {
        let dir = tempfile::tempdir().unwrap();
        let reboots = Arc::new(AtomicU32::new(0));
        let mut hw = HwFaultRetry::new(
            dir.path().join("misc"),
            counting_reboot(Arc::clone(&reboots)),
        );
        hw.set_fault_info("SOMETHING_ELSE");
        assert!(!hw.do_retry_action());
        assert_eq!(reboots.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn misc_message_carries_fault_info() {
        let dir = tempfile::tempdir().unwrap();
        let misc = dir.path().join("misc");
        let mut hw = HwFaultRetry::new(misc.clone(), Arc::new(|_| {}));
        hw.set_fault_info(IO_FAILED_REBOOT);
        hw.set_retry_count(0);
        assert!(hw.do_retry_action());

        let msg = read_misc_msg(&misc).unwrap();
        assert_eq!(msg.command, "boot_updater");
        assert_eq!(msg.fault_info, IO_FAILED_REBOOT);
        assert_eq!(msg.retry_count, 1);
    }
}
