use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use kforge_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::modules::{toolchain, util};
use crate::tools::{self, ToolsConfig};
use crate::variant::{VariantLedger, VariantState};
use crate::workspace::{WorkspacePaths, safe_remove_dir_all};
use crate::{Error, Result};

pub const BUILDS_FILE: &str = "kernel-builds.json";
/// Installed module tree, relative to a fragment's object directory.
pub const MODULES_OUT: &str = "modules_out";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub source_dir: String,
    /// Parent of the per-fragment object directories.
    pub out_dir: String,
    pub arch: String,
    pub cross_compile: String,
    /// 32-bit compat prefix for the vDSO, if the tree needs one.
    pub cross_compile_compat: Option<String>,
    pub cc: String,
    pub llvm: bool,
    pub base_defconfig: String,
    /// Extra make targets after configuration; empty means the default target.
    pub targets: Vec<String>,
    /// 0 = one job per CPU.
    pub jobs: usize,
    /// Delete object directories before building.
    pub clean: bool,
    pub modules_install: bool,
    pub make_vars: BTreeMap<String, String>,
    /// Artifact locations relative to the object directory.
    pub image: String,
    pub dtb: String,
    pub dtbo: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source_dir: "kernel".into(),
            out_dir: "@build/kernel".into(),
            arch: "arm64".into(),
            cross_compile: "aarch64-linux-gnu-".into(),
            cross_compile_compat: None,
            cc: "clang".into(),
            llvm: true,
            base_defconfig: "defconfig".into(),
            targets: Vec::new(),
            jobs: 0,
            clean: false,
            modules_install: true,
            make_vars: BTreeMap::new(),
            image: "arch/arm64/boot/Image".into(),
            dtb: "arch/arm64/boot/dtb.img".into(),
            dtbo: "arch/arm64/boot/dtbo.img".into(),
        }
    }
}

impl KernelConfig {
    pub fn effective_jobs(&self) -> usize {
        if self.jobs == 0 {
            num_cpus::get().max(1)
        } else {
            self.jobs
        }
    }

    /// Object directory for one config fragment.
    pub fn fragment_out_dir(&self, ws: &WorkspacePaths, fragment: &str) -> Result<PathBuf> {
        let base = ws.resolve_config_path(&self.out_dir)?;
        let slug: String = fragment
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Ok(base.join(slug))
    }

    /// Arguments shared by every make invocation for one object directory.
    pub fn make_args(&self, src: &Path, out: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-C".into(),
            src.into(),
            format!("O={}", out.display()).into(),
            format!("ARCH={}", self.arch).into(),
        ];
        if self.llvm {
            args.push("LLVM=1".into());
            args.push("LLVM_IAS=1".into());
        }
        args.push(format!("CROSS_COMPILE={}", self.cross_compile).into());
        if let Some(compat) = self.cross_compile_compat.as_deref() {
            args.push(format!("CROSS_COMPILE_COMPAT={compat}").into());
        }
        args.push(format!("CC={}", self.cc).into());
        for (k, v) in &self.make_vars {
            args.push(format!("{k}={v}").into());
        }
        args.push(format!("-j{}", self.effective_jobs()).into());
        args
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("kernel.image", &self.image),
            ("kernel.dtb", &self.dtb),
            ("kernel.dtbo", &self.dtbo),
        ] {
            util::validate_rel_like_path(value).map_err(|e| e.context(field))?;
        }
        if self.base_defconfig.trim().is_empty() {
            return Err(Error::config("kernel.base_defconfig is empty"));
        }
        Ok(())
    }
}

/// Outputs of one kernel build, shared by every variant using its fragment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KernelBuild {
    pub fragment: String,
    pub out_dir: PathBuf,
    pub image: PathBuf,
    pub dtb: PathBuf,
    pub dtbo: PathBuf,
    pub modules_dir: Option<PathBuf>,
}

pub fn load_builds(run_dir: &Path) -> Result<BTreeMap<String, KernelBuild>> {
    let p = run_dir.join(BUILDS_FILE);
    if !p.exists() {
        return Ok(BTreeMap::new());
    }
    util::read_json(&p)
}

fn save_builds(run_dir: &Path, builds: &BTreeMap<String, KernelBuild>) -> Result<()> {
    util::write_json_pretty(&run_dir.join(BUILDS_FILE), &serde_json::to_value(builds)?)
}

#[Task(
    id = "kernel.compile",
    module = "kernel",
    phase = "build",
    provides = ["kernel:built"],
    after = [
        "firmware.discover",
        "toolchain:ready?",
        "preflight:source?",
        "preflight:tools?"
    ],
    default_label = "Compile kernel",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompileTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for CompileTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl CompileTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let kc: KernelConfig = doc.section("kernel")?;
        kc.validate()?;
        let tools = ToolsConfig::load(doc)?;
        let run_dir = util::run_dir(doc, ctx)?;
        let mut ledger = VariantLedger::load(&run_dir)?;

        // One build per distinct fragment among accepted variants.
        let mut by_fragment: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in ledger.names_in(&["validated"]) {
            if let Some(profile) = ledger.get(&name).and_then(|r| r.profile.as_ref()) {
                by_fragment
                    .entry(profile.fragment.clone())
                    .or_default()
                    .push(name);
            }
        }
        if by_fragment.is_empty() {
            ctx.warn("no validated variants; nothing to compile");
            return Ok(());
        }

        let src = ws.resolve_config_path(&kc.source_dir)?;
        if !src.join("Makefile").is_file() {
            return Err(Error::missing_input(format!(
                "kernel source {} has no Makefile",
                src.display()
            )));
        }
        let make = tools::locate(&tools.make)?;
        let path_env = toolchain::load_record(&run_dir)?
            .map(|rec| prepend_path(&rec.bin_dir))
            .transpose()?;
        ctx.log(&format!(
            "kernel.source_dir = {} ({} fragment(s), -j{})",
            src.display(),
            by_fragment.len(),
            kc.effective_jobs()
        ));

        let mut builds = load_builds(&run_dir)?;
        for (fragment, variants) in &by_fragment {
            ctx.set_task(format!("{}:{fragment}", Self::ID));
            let res = build_fragment(ctx, &ws, &kc, &make, &src, path_env.as_ref(), fragment);
            match res {
                Ok(build) => {
                    builds.insert(fragment.clone(), build);
                    save_builds(&run_dir, &builds)?;
                    for v in variants {
                        ledger.advance(v, VariantState::Built)?;
                    }
                }
                Err(e) => {
                    // A shared build failing takes every variant using it down with it.
                    for v in variants {
                        ledger.advance(
                            v,
                            VariantState::Failed {
                                error: e.to_string(),
                            },
                        )?;
                    }
                    ledger.save(&run_dir)?;
                    return Err(e.context(format!("fragment '{fragment}'")));
                }
            }
            ledger.save(&run_dir)?;
        }
        ctx.set_task(Self::ID);
        Ok(())
    }
}

fn prepend_path(bin: &Path) -> Result<OsString> {
    let current = std::env::var_os("PATH").unwrap_or_default();
    let dirs = std::iter::once(bin.to_path_buf()).chain(std::env::split_paths(&current));
    std::env::join_paths(dirs)
        .map_err(|e| Error::config(format!("invalid toolchain path {}: {e}", bin.display())))
}

fn make_command(make: &Path, base: &[OsString], extra: &[&str], path_env: Option<&OsString>) -> Command {
    let mut cmd = Command::new(make);
    cmd.args(base).args(extra);
    if let Some(p) = path_env {
        cmd.env("PATH", p);
    }
    cmd
}

fn build_fragment(
    ctx: &mut ExecCtx,
    ws: &WorkspacePaths,
    kc: &KernelConfig,
    make: &Path,
    src: &Path,
    path_env: Option<&OsString>,
    fragment: &str,
) -> Result<KernelBuild> {
    let out = kc.fragment_out_dir(ws, fragment)?;
    if kc.clean {
        ctx.log(&format!("clean build: removing {}", out.display()));
        safe_remove_dir_all(&ws.root, &out)?;
    }
    util::ensure_dir(&out)?;

    let base = kc.make_args(src, &out);
    let make_cmd = |extra: &[&str]| make_command(make, &base, extra, path_env);

    ctx.log(&format!("configuring {} + {fragment}", kc.base_defconfig));
    ctx.run_cmd(make_cmd(&[kc.base_defconfig.as_str(), fragment]))?;

    ctx.log("building");
    let targets: Vec<&str> = kc.targets.iter().map(String::as_str).collect();
    ctx.run_cmd(make_cmd(&targets[..]))?;

    let modules_dir = if kc.modules_install {
        let dest = out.join(MODULES_OUT);
        let install_mod_path = format!("INSTALL_MOD_PATH={}", dest.display());
        ctx.run_cmd(make_cmd(&[
            "modules_install",
            install_mod_path.as_str(),
            "INSTALL_MOD_STRIP=1",
        ]))?;
        Some(dest)
    } else {
        None
    };

    let build = KernelBuild {
        fragment: fragment.to_string(),
        image: out.join(&kc.image),
        dtb: out.join(&kc.dtb),
        dtbo: out.join(&kc.dtbo),
        out_dir: out,
        modules_dir,
    };
    for (what, p) in [("kernel image", &build.image), ("dtb", &build.dtb), ("dtbo", &build.dtbo)] {
        if !p.is_file() {
            return Err(Error::tool_failed(format!(
                "build finished but {what} is missing at {}",
                p.display()
            )));
        }
    }
    ctx.log(&format!("kernel image {}", build.image.display()));
    Ok(build)
}

#[Module(id = "kernel", config = KernelConfig, tasks = [CompileTask])]
pub struct KernelModule;

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(kc: &KernelConfig) -> Vec<String> {
        kc.make_args(Path::new("/src/kernel"), Path::new("/build/kernel/a52sxq.config"))
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn make_args_carry_llvm_cross_env_and_jobs() {
        let kc = KernelConfig {
            jobs: 8,
            ..KernelConfig::default()
        };
        assert_eq!(
            args_of(&kc),
            vec![
                "-C",
                "/src/kernel",
                "O=/build/kernel/a52sxq.config",
                "ARCH=arm64",
                "LLVM=1",
                "LLVM_IAS=1",
                "CROSS_COMPILE=aarch64-linux-gnu-",
                "CC=clang",
                "-j8",
            ]
        );
    }

    #[test]
    fn zero_jobs_means_cpu_count() {
        let kc = KernelConfig::default();
        assert_eq!(kc.effective_jobs(), num_cpus::get().max(1));
        assert!(args_of(&kc).contains(&format!("-j{}", num_cpus::get().max(1))));
    }

    #[test]
    fn artifact_paths_must_stay_inside_object_dir() {
        let kc = KernelConfig {
            dtbo: "../dtbo.img".into(),
            ..KernelConfig::default()
        };
        let err = kc.validate().expect_err("escape");
        assert!(err.to_string().starts_with("kernel.dtbo"), "{err}");
    }

    #[test]
    fn missing_builds_file_is_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(load_builds(tmp.path()).expect("load").is_empty());
    }
}
