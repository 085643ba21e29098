use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use kforge_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::modules::firmware::FirmwareConfig;
use crate::modules::{kernel, util};
use crate::tools::{self, ToolsConfig};
use crate::variant::{VariantLedger, VariantState, for_each_variant};
use crate::{Error, Result};

const UPDATE_BINARY: &str = r#"#!/sbin/sh

#################
# Initialization
#################

umask 022

# echo before loading util_functions
ui_print() { echo "$1"; }

require_new_magisk() {
  ui_print "*******************************"
  ui_print " Please install Magisk v20.4+! "
  ui_print "*******************************"
  exit 1
}

#########################
# Load util_functions.sh
#########################

OUTFD=$2
ZIPFILE=$3

mount /data 2>/dev/null

[ -f /data/adb/magisk/util_functions.sh ] || require_new_magisk
. /data/adb/magisk/util_functions.sh
[ $MAGISK_VER_CODE -lt 20400 ] && require_new_magisk

install_module
exit 0
"#;

const UPDATER_SCRIPT: &str = "#MAGISK\n";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub id: String,
    pub name: String,
    pub version: String,
    pub version_code: u32,
    pub author: String,
    pub description: String,
    /// Write a `service.sh` that re-injects boot-state properties.
    #[serde(default = "default_true")]
    pub boot_state_props: bool,
    pub device_state: String,
    pub avb_version: String,
    /// Extra script copied to the package root.
    pub helper_script: Option<String>,
    /// Install location of driver modules inside the package.
    pub modules_subdir: String,
    pub selinux_context: String,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            id: "kforge_modules".into(),
            name: "kforge kernel modules".into(),
            version: "v1.0".into(),
            version_code: 1,
            author: "kforge".into(),
            description: "Vendor kernel modules and boot-state props for a rebuilt kernel".into(),
            boot_state_props: true,
            device_state: "locked".into(),
            avb_version: "1.0".into(),
            helper_script: None,
            modules_subdir: "system/vendor/lib/modules".into(),
            selinux_context: "u:object_r:vendor_file:s0".into(),
        }
    }
}

impl PackageConfig {
    fn validate(&self) -> Result<()> {
        let id_ok = !self.id.is_empty()
            && self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
        if !id_ok {
            return Err(Error::config(format!(
                "package.id '{}' is invalid (allowed: a-zA-Z0-9._-)",
                self.id
            )));
        }
        util::validate_rel_like_path(&self.modules_subdir).map_err(|e| e.context("package.modules_subdir"))
    }

    pub fn archive_name(&self, variant: &str) -> String {
        format!("{}-{variant}.zip", self.id)
    }
}

/// Values `service.sh` injects at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootStateProps {
    pub vbmeta_digest: String,
    pub vbmeta_size: u64,
    pub hash_alg: String,
    pub avb_version: String,
    pub device_state: String,
}

impl BootStateProps {
    /// Digest and size are taken from the rebuilt image bytes every time.
    pub fn from_vbmeta(cfg: &PackageConfig, vbmeta: &Path) -> Result<Self> {
        Ok(Self {
            vbmeta_digest: util::sha256_file_hex(vbmeta)?,
            vbmeta_size: util::file_len(vbmeta)?,
            hash_alg: "sha256".into(),
            avb_version: cfg.avb_version.clone(),
            device_state: cfg.device_state.clone(),
        })
    }
}

pub fn render_module_prop(cfg: &PackageConfig, variant: &str) -> String {
    format!(
        "id={}\nname={} ({variant})\nversion={}\nversionCode={}\nauthor={}\ndescription={}\n",
        cfg.id, cfg.name, cfg.version, cfg.version_code, cfg.author, cfg.description
    )
}

pub fn render_service_sh(props: &BootStateProps) -> String {
    format!(
        "#!/system/bin/sh\n\
         MODDIR=${{0%/*}}\n\
         \n\
         resetprop -n ro.boot.vbmeta.device_state {}\n\
         resetprop -n ro.boot.vbmeta.avb_version {}\n\
         resetprop -n ro.boot.vbmeta.hash_alg {}\n\
         resetprop -n ro.boot.vbmeta.size {}\n\
         resetprop -n ro.boot.vbmeta.digest {}\n",
        props.device_state, props.avb_version, props.hash_alg, props.vbmeta_size, props.vbmeta_digest
    )
}

pub fn render_customize_sh(
    cfg: &PackageConfig,
    variant: &str,
    has_service: bool,
    helper: Option<&str>,
) -> String {
    let mut out = format!(
        "#!/system/bin/sh\n\
         SKIPUNZIP=0\n\
         \n\
         ui_print \"- Installing {} for {variant}\"\n\
         set_perm_recursive \"$MODPATH/{}\" 0 0 0755 0644 {}\n",
        cfg.name, cfg.modules_subdir, cfg.selinux_context
    );
    if has_service {
        out.push_str("set_perm \"$MODPATH/service.sh\" 0 0 0755\n");
    }
    if let Some(h) = helper {
        out.push_str(&format!("set_perm \"$MODPATH/{h}\" 0 0 0755\n"));
    }
    out
}

/// Every `*.ko` under `dir`, sorted by file name.
pub fn collect_modules(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|e| e.to_str()) == Some("ko")
        {
            out.push(entry.into_path());
        }
    }
    out.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    for pair in out.windows(2) {
        if pair[0].file_name() == pair[1].file_name() {
            return Err(Error::msg(format!(
                "module name collision: {} and {}",
                pair[0].display(),
                pair[1].display()
            )));
        }
    }
    Ok(out)
}

#[Task(
    id = "package.module",
    module = "package",
    phase = "package",
    provides = ["package:done"],
    after = ["firmware.discover", "avb:signed?", "kernel:built?"],
    default_label = "Package module",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModuleTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ModuleTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ModuleTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let cfg: PackageConfig = doc.section("package")?;
        cfg.validate()?;
        let fw = FirmwareConfig::load(doc)?;
        let tools_cfg = ToolsConfig::load(doc)?;
        let zip = tools::locate(&tools_cfg.zip)?;
        let run_dir = util::run_dir(doc, ctx)?;
        let mut ledger = VariantLedger::load(&run_dir)?;
        let builds = kernel::load_builds(&run_dir)?;
        let helper = cfg
            .helper_script
            .as_deref()
            .map(|p| ws.resolve_config_path(p))
            .transpose()?;
        let archive_root = ws.resolve_config_path(&fw.output_dir)?;

        let n = for_each_variant(
            ctx,
            &mut ledger,
            &run_dir,
            Self::ID,
            &["metadata_rebuilt"],
            fw.fail_fast,
            |ctx, rec| {
                let out_dir = fw.variant_out_dir(&ws, &rec.name)?;
                let stage = ws.fresh_staging(&[rec.name.as_str(), "package"])?;
                let fragment = rec.profile()?.fragment.clone();

                let modules = match builds.get(&fragment).and_then(|b| b.modules_dir.as_ref()) {
                    Some(dir) if dir.is_dir() => collect_modules(dir)?,
                    _ => {
                        ctx.warn(&format!(
                            "no installed modules for fragment '{fragment}'; packaging without drivers"
                        ));
                        Vec::new()
                    }
                };
                let mod_dir = stage.join(&cfg.modules_subdir);
                util::ensure_dir(&mod_dir)?;
                let mut load_list = String::new();
                for m in &modules {
                    let Some(name) = m.file_name() else { continue };
                    util::copy_file(m, &mod_dir.join(name))?;
                    load_list.push_str(&name.to_string_lossy());
                    load_list.push('\n');
                }
                util::write_text(&mod_dir.join("modules.load"), &load_list)?;
                ctx.log(&format!("{} driver module(s)", modules.len()));

                util::write_text(&stage.join("module.prop"), &render_module_prop(&cfg, &rec.name))?;

                if cfg.boot_state_props {
                    let props = BootStateProps::from_vbmeta(&cfg, &out_dir.join("vbmeta.img"))?;
                    ctx.log(&format!("ro.boot.vbmeta.digest = {}", props.vbmeta_digest));
                    let service = stage.join("service.sh");
                    util::write_text(&service, &render_service_sh(&props))?;
                    util::set_mode(&service, 0o755)?;
                }

                let helper_name = match helper.as_ref() {
                    Some(h) => {
                        let name = h
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .ok_or_else(|| Error::config("package.helper_script has no file name"))?;
                        util::copy_file(h, &stage.join(&name))?;
                        util::set_mode(&stage.join(&name), 0o755)?;
                        Some(name)
                    }
                    None => None,
                };
                util::write_text(
                    &stage.join("customize.sh"),
                    &render_customize_sh(&cfg, &rec.name, cfg.boot_state_props, helper_name.as_deref()),
                )?;

                let meta = stage.join("META-INF/com/google/android");
                util::write_text(&meta.join("update-binary"), UPDATE_BINARY)?;
                util::set_mode(&meta.join("update-binary"), 0o755)?;
                util::write_text(&meta.join("updater-script"), UPDATER_SCRIPT)?;

                let archive = archive_root.join(cfg.archive_name(&rec.name));
                util::ensure_dir(&archive_root)?;
                if archive.exists() {
                    fs::remove_file(&archive).map_err(|e| {
                        Error::msg(format!("failed to remove {}: {e}", archive.display()))
                    })?;
                }
                let mut cmd = Command::new(&zip);
                cmd.current_dir(&stage).arg("-r").arg("-9").arg(&archive).arg(".");
                ctx.run_cmd(cmd)?;
                if !archive.is_file() {
                    return Err(Error::tool_failed(format!(
                        "zip produced no archive at {}",
                        archive.display()
                    )));
                }
                ctx.log(&format!("package written to {}", archive.display()));
                rec.advance(VariantState::Packaged)
            },
        )?;
        if n == 0 {
            ctx.warn("no signed variants to package");
        }
        Ok(())
    }
}

#[Module(id = "package", config = PackageConfig, tasks = [ModuleTask])]
pub struct PackageModule;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_script_carries_fresh_vbmeta_digest() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let vbmeta = tmp.path().join("vbmeta.img");
        fs::write(&vbmeta, vec![0xAAu8; 4096]).expect("write");

        let props = BootStateProps::from_vbmeta(&PackageConfig::default(), &vbmeta).expect("props");
        let script = render_service_sh(&props);

        let digest = script
            .lines()
            .find_map(|l| l.strip_prefix("resetprop -n ro.boot.vbmeta.digest "))
            .expect("digest line");
        assert_eq!(digest, util::sha256_file_hex(&vbmeta).expect("hash"));
        assert!(script.contains("resetprop -n ro.boot.vbmeta.size 4096\n"));
        assert!(script.contains("ro.boot.vbmeta.hash_alg sha256"));
        assert!(script.starts_with("#!/system/bin/sh\nMODDIR=${0%/*}\n"));
    }

    #[test]
    fn module_prop_names_the_variant() {
        let prop = render_module_prop(&PackageConfig::default(), "a52sxqxx");
        assert!(prop.starts_with("id=kforge_modules\n"));
        assert!(prop.contains("name=kforge kernel modules (a52sxqxx)\n"));
        assert!(prop.contains("versionCode=1\n"));
    }

    #[test]
    fn customize_script_labels_modules() {
        let cfg = PackageConfig::default();
        let sh = render_customize_sh(&cfg, "a52sxqxx", true, Some("kforge-helper.sh"));
        assert!(sh.contains(
            "set_perm_recursive \"$MODPATH/system/vendor/lib/modules\" 0 0 0755 0644 u:object_r:vendor_file:s0"
        ));
        assert!(sh.contains("set_perm \"$MODPATH/service.sh\" 0 0 0755"));
        assert!(sh.contains("set_perm \"$MODPATH/kforge-helper.sh\" 0 0 0755"));
    }

    #[test]
    fn collects_ko_files_sorted_and_rejects_collisions() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("lib/modules/5.4.86/kernel");
        fs::create_dir_all(root.join("drivers/net")).expect("mkdir");
        fs::write(root.join("drivers/net/wlan.ko"), b"ko").expect("write");
        fs::write(root.join("exfat.ko"), b"ko").expect("write");
        fs::write(root.join("modules.dep"), b"").expect("write");

        let got = collect_modules(tmp.path()).expect("collect");
        let names: Vec<_> = got
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names, vec!["exfat.ko", "wlan.ko"]);

        fs::create_dir_all(root.join("fs")).expect("mkdir");
        fs::write(root.join("fs/exfat.ko"), b"ko").expect("write");
        assert!(collect_modules(tmp.path()).is_err());
    }

    #[test]
    fn rejects_bad_ids() {
        let cfg = PackageConfig {
            id: "bad id".into(),
            ..PackageConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
