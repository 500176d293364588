// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

pub mod bin_flow;
pub mod instructions;

use crate::errors::PkgError;
use crate::updater::env::UpdateEnv;
use log::{error, info};
use std::collections::HashMap;

/// One executor behind a script-visible instruction name.
pub trait Instruction: Send + Sync {
    fn execute(&self, env: &UpdateEnv, args: &[&str]) -> Result<(), PkgError>;
}

/// Explicit instruction table handed to the runner; nothing is looked up
/// through process-wide state.
#[derive(Default)]
pub struct InstructionRegistry {
    map: HashMap<&'static str, Box<dyn Instruction>>,
}

impl InstructionRegistry {
    pub fn new() -> InstructionRegistry {
        InstructionRegistry::default()
    }

    /// The contract between package scripts and this executor.
    pub fn with_builtins() -> InstructionRegistry {
        let mut registry = InstructionRegistry::new();
        registry.register("sha_check", Box::new(instructions::ShaCheck));
        registry.register("first_block_check", Box::new(instructions::FirstBlockCheck));
        registry.register("block_update", Box::new(instructions::BlockUpdate));
        registry.register("raw_image_write", Box::new(instructions::RawImageWrite));
        registry.register("update_partitions", Box::new(instructions::UpdatePartitions));
        registry.register("image_patch", Box::new(instructions::ImagePatch));
        registry.register("image_sha_check", Box::new(instructions::ImageShaCheck));
        registry.register("pkg_extract", Box::new(instructions::PkgExtract));
        registry.register("pkg_extract_no_ret", Box::new(instructions::PkgExtractNoRet));
        registry.register("update_from_bin", Box::new(instructions::UpdateFromBin));
        registry
    }

    pub fn register(&mut self, name: &'static str, instruction: Box<dyn Instruction>) {
        self.map.insert(name, instruction);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Instruction> {
        self.map.get(name).map(|b| b.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    /// Empty script or an instruction name outside the contract.
    Parse,
    /// An instruction ran and failed.
    Execute(PkgError),
}

/// Walks the package script line by line, one instruction per line:
/// `name arg1 arg2 …`. Commands execute strictly in file order; the first
/// failure aborts the run.
pub struct ScriptRunner<'a> {
    registry: &'a InstructionRegistry,
    env: &'a UpdateEnv,
}

impl<'a> ScriptRunner<'a> {
    pub fn new(registry: &'a InstructionRegistry, env: &'a UpdateEnv) -> ScriptRunner<'a> {
        ScriptRunner { registry, env }
    }

    pub fn run(&self, script: &str) -> Result<(), ScriptError> {
        let lines: Vec<&str> = script
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();
        if lines.is_empty() {
            error!("script carries no instructions");
            return Err(ScriptError::Parse);
        }

        let total = lines.len() as f32;
        for (index, line) in lines.iter().enumerate() {
            let mut tokens = line.split_whitespace();
            let name = tokens.next().ok_or(ScriptError::Parse)?;
            let args: Vec<&str> = tokens.collect();
            let Some(instruction) = self.registry.get(name) else {
                error!("unknown instruction {}", name);
                return Err(ScriptError::Parse);
            };
            info!("execute {} {:?}", name, args);
            instruction
                .execute(self.env, &args)
                .map_err(ScriptError::Execute)?;
            self.env.set_progress((index + 1) as f32 / total);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applypatch::block_set::BlockSet;
    use crate::applypatch::writer::read_blocks;
    use crate::constants::{BLOCK_SIZE, UPDATER_RETRY_TAG, VERIFY_FAILED_REBOOT};
    use crate::package::info::{
        ComponentInfo, DigestMethod, FileInfo, PackMethod, PkgInfo, PkgKind, SignMethod,
        UpgradePkgInfo, UPGRADE_FILE_VERSION_V1,
    };
    use crate::package::manager::PkgManager;
    use crate::package::upgrade_file::UpgradePkgFile;
    use crate::package::zip_file::ZipPkgFile;
    use crate::stream::PkgStream;
    use crate::utils::sha256_hex;
    use crate::verify::hash_data::testutil::build_hash_signed_data;
    use crate::verify::pkcs7::testutil::TestSigner;
    use crate::verify::zip_parse::write_zip_signed_data;
    use sha2::{Digest, Sha256};
    use std::fs::File;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    type Messages = Arc<Mutex<Vec<(String, String)>>>;

    struct Fixture {
        _dir: tempfile::TempDir,
        work_dir: PathBuf,
        device_dir: PathBuf,
        pkg_path: PathBuf,
        messages: Messages,
    }

    impl Fixture {
        fn env(&self, retry: bool) -> UpdateEnv {
            let manager = Arc::new(PkgManager::new());
            manager.load_package(&self.pkg_path).unwrap();
            let sink = Arc::clone(&self.messages);
            let mut env = UpdateEnv::new(
                Arc::clone(&manager),
                self.work_dir.clone(),
                self.device_dir.clone(),
                self.work_dir.join("misc"),
                retry,
                Box::new(move |cmd, content| {
                    sink.lock().unwrap().push((cmd.to_string(), content.to_string()));
                }),
            );
            env.hash_verifier = Some(manager.create_hash_verifier().unwrap());
            env
        }

        fn device(&self, name: &str) -> PathBuf {
            self.device_dir.join(name)
        }

        fn posted(&self, cmd: &str, content: &str) -> bool {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .any(|(c, t)| c == cmd && t == content)
        }
    }

    fn make_device(path: &Path, blocks: u64, fill: u8) {
        File::create(path)
            .unwrap()
            .write_all(&vec![fill; (blocks * BLOCK_SIZE) as usize])
            .unwrap();
    }

    /// Builds a signed outer package: the given inner files plus an
    /// update_script and the hash_signed_data covering the verifiable ones.
    fn build_fixture(signer: &TestSigner, script: &str, files: &[(&str, Vec<u8>)]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().join("work");
        let device_dir = dir.path().join("dev");
        std::fs::create_dir_all(&work_dir).unwrap();
        std::fs::create_dir_all(&device_dir).unwrap();

        let mut signed_files: Vec<(&str, &[u8])> = vec![("update_script", script.as_bytes())];
        for (name, data) in files {
            signed_files.push((*name, data.as_slice()));
        }
        let table = build_hash_signed_data(signer, &signed_files);

        let mut zip = ZipPkgFile::new(PkgStream::memory("pkg.zip", Vec::new()));
        let mut add = |name: &str, data: &[u8]| {
            let mut input = PkgStream::memory(name, data.to_vec());
            zip.add_entry(name, &mut input, 8).unwrap();
        };
        add("update_script", script.as_bytes());
        add("hash_signed_data", &table);
        for (name, data) in files {
            add(name, data.as_slice());
        }
        zip.save().unwrap();
        let plain = zip.into_stream().into_buffer().unwrap();

        let digest = Sha256::digest(&plain[..plain.len() - 2]).to_vec();
        let p7 = signer.build_signed_data(&digest);
        let mut input = PkgStream::memory("src.zip", plain);
        let mut out = PkgStream::memory("signed.zip", Vec::new());
        write_zip_signed_data(&mut out, &p7, &mut input).unwrap();
        let bytes = out.into_buffer().unwrap();

        let pkg_path = dir.path().join("updater.zip");
        File::create(&pkg_path).unwrap().write_all(&bytes).unwrap();

        Fixture {
            _dir: dir,
            work_dir,
            device_dir,
            pkg_path,
            messages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[test]
    fn unknown_instruction_is_a_parse_error() {
        let signer = TestSigner::new();
        let fixture = build_fixture(&signer, "definitely_not_registered\n", &[]);
        let env = fixture.env(false);
        let registry = InstructionRegistry::with_builtins();
        assert_eq!(
            ScriptRunner::new(&registry, &env).run("definitely_not_registered\n"),
            Err(ScriptError::Parse)
        );
        assert_eq!(
            ScriptRunner::new(&registry, &env).run("\n# only a comment\n"),
            Err(ScriptError::Parse)
        );
    }

    #[test]
    fn block_update_applies_new_data_end_to_end() {
        let signer = TestSigner::new();
        let new_data: Vec<u8> = (0..2 * BLOCK_SIZE).map(|i| (i % 211) as u8).collect();
        let transfer = "1\n2\n0\n0\nnew 2,0,2\n".as_bytes().to_vec();
        let script = "block_update /system system.transfer.list system.new.dat system.patch.dat\n";
        let fixture = build_fixture(
            &signer,
            script,
            &[
                ("system.transfer.list", transfer),
                ("system.new.dat", new_data.clone()),
                ("system.patch.dat", Vec::new()),
            ],
        );
        make_device(&fixture.device("system"), 2, 0x00);

        let env = fixture.env(false);
        let registry = InstructionRegistry::with_builtins();
        ScriptRunner::new(&registry, &env).run(script).unwrap();

        let device = File::open(fixture.device("system")).unwrap();
        let got = read_blocks(&device, &BlockSet::parse("2 0 2").unwrap()).unwrap();
        assert_eq!(got, new_data);
        assert!(env.record.is_partition_updated("/system"));
    }

    #[test]
    fn move_with_bad_source_posts_verify_failed() {
        let signer = TestSigner::new();
        let zero_hash = sha256_hex(&vec![0u8; 2 * BLOCK_SIZE as usize]);
        let transfer = format!("1\n4\n0\n0\nmove {} 2 0 1 - 2 2 3\n", zero_hash).into_bytes();
        let script = "block_update /system system.transfer.list system.new.dat system.patch.dat\n";
        let fixture = build_fixture(
            &signer,
            script,
            &[
                ("system.transfer.list", transfer),
                ("system.new.dat", Vec::new()),
                ("system.patch.dat", Vec::new()),
            ],
        );
        // blocks 2..3 hold 0xFF, not the zeros the hash promises
        make_device(&fixture.device("system"), 4, 0xFF);

        let env = fixture.env(false);
        let registry = InstructionRegistry::with_builtins();
        assert_eq!(
            ScriptRunner::new(&registry, &env).run(script),
            Err(ScriptError::Execute(PkgError::InvalidDigest))
        );
        assert!(fixture.posted(UPDATER_RETRY_TAG, VERIFY_FAILED_REBOOT));
        assert!(!env.record.is_partition_updated("/system"));
    }

    #[test]
    fn retry_skips_recorded_partition_and_applies_the_rest() {
        let signer = TestSigner::new();
        let sys_data: Vec<u8> = vec![0x11u8; BLOCK_SIZE as usize];
        let ven_data: Vec<u8> = vec![0x22u8; BLOCK_SIZE as usize];
        let transfer = "1\n1\n0\n0\nnew 2,0,1\n".as_bytes().to_vec();
        let script = "block_update /system system.transfer.list system.new.dat system.patch.dat\n\
                      block_update /vendor vendor.transfer.list vendor.new.dat vendor.patch.dat\n";
        let fixture = build_fixture(
            &signer,
            script,
            &[
                ("system.transfer.list", transfer.clone()),
                ("system.new.dat", sys_data),
                ("system.patch.dat", Vec::new()),
                ("vendor.transfer.list", transfer),
                ("vendor.new.dat", ven_data.clone()),
                ("vendor.patch.dat", Vec::new()),
            ],
        );
        make_device(&fixture.device("system"), 1, 0xAB);
        make_device(&fixture.device("vendor"), 1, 0x00);

        // a previous run recorded /system as applied before dying
        let env = fixture.env(true);
        env.record
            .record_partition_update_status("/system", true)
            .unwrap();

        let registry = InstructionRegistry::with_builtins();
        ScriptRunner::new(&registry, &env).run(script).unwrap();

        // system untouched, vendor applied
        let system = File::open(fixture.device("system")).unwrap();
        let sys = read_blocks(&system, &BlockSet::parse("2 0 1").unwrap()).unwrap();
        assert!(sys.iter().all(|&b| b == 0xAB));
        let vendor = File::open(fixture.device("vendor")).unwrap();
        let ven = read_blocks(&vendor, &BlockSet::parse("2 0 1").unwrap()).unwrap();
        assert_eq!(ven, ven_data);
    }

    #[test]
    fn sha_check_accepts_target_hash_only_on_retry() {
        let signer = TestSigner::new();
        let script = "sha_check /system 2,0,1 0 2,0,1 0\n"; // placeholder, rebuilt below
        let fixture = build_fixture(&signer, script, &[]);
        make_device(&fixture.device("system"), 1, 0x77);

        let device = File::open(fixture.device("system")).unwrap();
        let current = sha256_hex(&read_blocks(&device, &BlockSet::parse("2 0 1").unwrap()).unwrap());
        let stale = sha256_hex(b"something else");

        let registry = InstructionRegistry::with_builtins();
        // fresh run, pre-patch hash wrong: fail even though target matches
        let env = fixture.env(false);
        let line = format!("sha_check /system 2,0,1 {} 2,0,1 {}\n", stale, current);
        assert!(ScriptRunner::new(&registry, &env).run(&line).is_err());
        // retry run: the target hash is enough
        let env = fixture.env(true);
        ScriptRunner::new(&registry, &env).run(&line).unwrap();
    }

    #[test]
    fn raw_image_write_and_pkg_extract() {
        let signer = TestSigner::new();
        let image: Vec<u8> = (0..3000u32).map(|i| (i % 199) as u8).collect();
        let script = "raw_image_write /boot boot.img\npkg_extract boot.img OUT\n";
        let fixture = build_fixture(&signer, script, &[("boot.img", image.clone())]);
        make_device(&fixture.device("boot"), 1, 0x00);

        let out_path = fixture.work_dir.join("boot_copy");
        let script = format!(
            "raw_image_write /boot boot.img\npkg_extract boot.img {}\n",
            out_path.display()
        );
        let env = fixture.env(false);
        let registry = InstructionRegistry::with_builtins();
        ScriptRunner::new(&registry, &env).run(&script).unwrap();

        let mut written = std::fs::read(fixture.device("boot")).unwrap();
        written.truncate(image.len());
        assert_eq!(written, image);
        assert_eq!(std::fs::read(&out_path).unwrap(), image);
    }

    fn build_update_bin(signer: &TestSigner, comps: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let info = UpgradePkgInfo {
            pkg_info: PkgInfo {
                entry_count: comps.len() as u32,
                digest_method: DigestMethod::Sha256,
                sign_method: SignMethod::Rsa,
                pkg_type: PkgKind::Upgrade,
                ..Default::default()
            },
            update_file_version: UPGRADE_FILE_VERSION_V1,
            product_update_id: "product/demo".into(),
            software_version: "3.1.0".into(),
            date: "2025.01.02".into(),
            time: "11:22:33".into(),
            descript_package_id: "demo".into(),
        };
        let mut pkg = UpgradePkgFile::new(PkgStream::memory("update.bin", Vec::new()), info);
        for (name, data) in comps {
            let comp = ComponentInfo {
                file: FileInfo {
                    identity: name.to_string(),
                    unpacked_size: data.len() as u64,
                    pack_method: PackMethod::None,
                    ..Default::default()
                },
                version: "1.0.0".into(),
                ..Default::default()
            };
            let mut input = PkgStream::memory(name, data.clone());
            pkg.add_entry(&comp, &mut input).unwrap();
        }
        pkg.save_package(&|digest| Ok(signer.sign_prehash_vec(digest)))
            .unwrap();
        pkg.into_stream().into_buffer().unwrap()
    }

    #[test]
    fn update_from_bin_streams_components_to_partitions() {
        let signer = TestSigner::new();
        let boot: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i % 177) as u8).collect();
        let kernel: Vec<u8> = vec![0x99u8; 2 * BLOCK_SIZE as usize];
        let bin = build_update_bin(&signer, &[("/boot", boot.clone()), ("/kernel", kernel.clone())]);
        let script = "update_from_bin update.bin\n";
        let fixture = build_fixture(&signer, script, &[("update.bin", bin)]);

        let env = fixture.env(false);
        let registry = InstructionRegistry::with_builtins();
        ScriptRunner::new(&registry, &env).run(script).unwrap();

        let mut got = std::fs::read(fixture.device("boot")).unwrap();
        got.truncate(boot.len());
        assert_eq!(got, boot);
        let mut got = std::fs::read(fixture.device("kernel")).unwrap();
        got.truncate(kernel.len());
        assert_eq!(got, kernel);
        assert!(env.record.is_partition_updated("/boot"));
        assert!(env.record.is_partition_updated("/kernel"));
    }

    #[test]
    fn update_from_bin_rejects_foreign_signature() {
        let signer = TestSigner::new();
        let stranger = TestSigner::new();
        let bin = build_update_bin(&stranger, &[("/boot", vec![1u8; 64])]);
        let script = "update_from_bin update.bin\n";
        let fixture = build_fixture(&signer, script, &[("update.bin", bin)]);

        let env = fixture.env(false);
        let registry = InstructionRegistry::with_builtins();
        assert_eq!(
            ScriptRunner::new(&registry, &env).run(script),
            Err(ScriptError::Execute(PkgError::InvalidSignature))
        );
        assert!(fixture.posted(UPDATER_RETRY_TAG, crate::constants::PROCESS_BIN_FAIL_RETRY));
    }

    #[test]
    fn image_patch_and_sha_check_round() {
        let signer = TestSigner::new();
        // patch = IMGDIFF2 raw chunk producing the new image
        let src: Vec<u8> = vec![0x10u8; 4096];
        let dst: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let patch = crate::applypatch::image_patch::testutil::imgdiff(&[
            crate::applypatch::image_patch::testutil::raw_chunk(&dst),
        ]);
        let src_hash = sha256_hex(&src);
        let dst_hash = sha256_hex(&dst);
        let script = format!(
            "image_sha_check /radio 4096 {sh} 4096 {dh}\nimage_patch /radio 4096 {sh} 4096 {dh} radio.patch\n",
            sh = src_hash,
            dh = dst_hash
        );
        let fixture = build_fixture(&signer, &script, &[("radio.patch", patch)]);
        std::fs::write(fixture.device("radio"), &src).unwrap();

        let env = fixture.env(false);
        let registry = InstructionRegistry::with_builtins();
        ScriptRunner::new(&registry, &env).run(&script).unwrap();

        let mut got = std::fs::read(fixture.device("radio")).unwrap();
        got.truncate(dst.len());
        assert_eq!(got, dst);
        assert!(env.record.is_partition_updated("/radio"));
        // the backup is gone after success
        assert!(!fixture.work_dir.join("radio.backup").exists());

        // running the sha check again on the patched image fails fresh...
        let env = fixture.env(false);
        let check = format!("image_sha_check /radio 4096 {} 4096 {}\n", src_hash, dst_hash);
        assert!(ScriptRunner::new(&registry, &env).run(&check).is_err());
        // ...but passes on a retry boot
        let env = fixture.env(true);
        ScriptRunner::new(&registry, &env).run(&check).unwrap();
    }

    #[test]
    fn write_then_zero_is_idempotent_per_run() {
        let signer = TestSigner::new();
        let transfer = "1\n2\n0\n0\nzero 2,0,1\nnew 2,1,2\n".as_bytes().to_vec();
        let new_data = vec![0x5Cu8; BLOCK_SIZE as usize];
        let script = "block_update /odm odm.transfer.list odm.new.dat odm.patch.dat\n";
        let fixture = build_fixture(
            &signer,
            script,
            &[
                ("odm.transfer.list", transfer),
                ("odm.new.dat", new_data.clone()),
                ("odm.patch.dat", Vec::new()),
            ],
        );
        make_device(&fixture.device("odm"), 2, 0xF0);

        let registry = InstructionRegistry::with_builtins();
        let mut images = Vec::new();
        for _ in 0..2 {
            let env = fixture.env(false);
            env.record.clear().unwrap();
            ScriptRunner::new(&registry, &env).run(script).unwrap();
            images.push(std::fs::read(fixture.device("odm")).unwrap());
        }
        assert_eq!(images[0], images[1]);
        let device = File::open(fixture.device("odm")).unwrap();
        let zeroed = read_blocks(&device, &BlockSet::parse("2 0 1").unwrap()).unwrap();
        assert!(zeroed.iter().all(|&b| b == 0));
        let newed = read_blocks(&device, &BlockSet::parse("2 1 2").unwrap()).unwrap();
        assert_eq!(newed, new_data);
    }
}
