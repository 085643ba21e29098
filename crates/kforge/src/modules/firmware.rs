use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::json;

use kforge_macros::{Module, Task};

use crate::assemble::{Assembler, Splice};
use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::modules::{kernel, util};
use crate::tools::avbtool::Avbtool;
use crate::tools::magiskboot::Magiskboot;
use crate::tools::{self, ToolsConfig};
use crate::variant::{
    REQUIRED_IMAGES, SkipReason, VariantLedger, VariantProfile, VariantRecord, VariantState,
    for_each_variant,
};
use crate::workspace::WorkspacePaths;
use crate::{Error, Result};

pub const DISCOVER_REPORT: &str = "discover.json";
pub const BATCH_REPORT: &str = "report.json";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// One subdirectory per variant, each holding the stock partition images.
    pub root_dir: String,
    /// Rebuilt images land in `<output_dir>/<variant>/`.
    pub output_dir: String,
    /// Key of the boot header line that carries the revision string.
    pub header_key: String,
    /// Abort on the first variant failure instead of reporting at the end.
    pub fail_fast: bool,
    pub variants: BTreeMap<String, VariantProfile>,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root_dir: "firmware".into(),
            output_dir: "@out".into(),
            header_key: "name".into(),
            fail_fast: false,
            variants: BTreeMap::new(),
        }
    }
}

impl FirmwareConfig {
    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        let cfg: Self = doc.section("firmware")?;
        for (name, profile) in &cfg.variants {
            profile.validate(name)?;
        }
        if cfg.header_key.trim().is_empty() || cfg.header_key.contains('=') {
            return Err(Error::config(format!(
                "firmware.header_key '{}' is invalid",
                cfg.header_key
            )));
        }
        Ok(cfg)
    }

    pub fn variant_out_dir(&self, ws: &WorkspacePaths, variant: &str) -> Result<PathBuf> {
        Ok(ws.resolve_config_path(&self.output_dir)?.join(variant))
    }
}

/// Classify every immediate subdirectory of `root`, in name order. File
/// completeness is checked before the variant table, so an incomplete unknown
/// variant is reported as missing files.
pub fn discover(root: &Path, known: &BTreeMap<String, VariantProfile>) -> Result<Vec<VariantRecord>> {
    if !root.is_dir() {
        return Err(Error::missing_input(format!(
            "firmware root {} does not exist",
            root.display()
        )));
    }
    let mut dirs: Vec<(String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(root)
        .map_err(|e| Error::msg(format!("failed to list {}: {e}", root.display())))?
    {
        let entry = entry.map_err(|e| Error::msg(format!("failed to list {}: {e}", root.display())))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        dirs.push((name, path));
    }
    dirs.sort();

    let mut out = Vec::with_capacity(dirs.len());
    for (name, firmware_dir) in dirs {
        let mut rec = VariantRecord {
            name,
            firmware_dir,
            profile: None,
            state: VariantState::Discovered,
        };
        let missing: Vec<String> = REQUIRED_IMAGES
            .iter()
            .filter(|f| !rec.image(f).is_file())
            .map(|f| f.to_string())
            .collect();
        if !missing.is_empty() {
            rec.advance(VariantState::Skipped {
                reason: SkipReason::MissingFiles { missing },
            })?;
        } else if let Some(profile) = known.get(&rec.name) {
            rec.profile = Some(profile.clone());
            rec.advance(VariantState::Validated)?;
        } else {
            rec.advance(VariantState::Skipped {
                reason: SkipReason::UnknownVariant,
            })?;
        }
        out.push(rec);
    }
    Ok(out)
}

#[Task(
    id = "firmware.discover",
    module = "firmware",
    phase = "discover",
    provides = ["firmware:discovered"],
    after = ["core.init", "preflight:tools?"],
    default_label = "Discover variants",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoverTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for DiscoverTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl DiscoverTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let fw = FirmwareConfig::load(doc)?;
        let root = ws.resolve_config_path(&fw.root_dir)?;
        ctx.log(&format!("firmware.root_dir = {}", root.display()));

        let variants = discover(&root, &fw.variants)?;
        let mut report = Vec::with_capacity(variants.len());
        for rec in &variants {
            match &rec.state {
                VariantState::Skipped { reason } => {
                    ctx.warn(&format!("skipping variant '{}': {reason}", rec.name));
                    report.push(json!({ "variant": rec.name, "accepted": false, "reason": reason }));
                }
                _ => {
                    let profile = rec.profile()?;
                    ctx.log(&format!(
                        "accepted variant '{}' (fragment {}, rev {})",
                        rec.name, profile.fragment, profile.rp_rev
                    ));
                    report.push(json!({ "variant": rec.name, "accepted": true, "fragment": profile.fragment }));
                }
            }
        }
        if variants.iter().all(|v| v.state.is_terminal()) {
            ctx.warn("no buildable variants found");
        }

        let run_dir = util::run_dir(doc, ctx)?;
        VariantLedger { variants }.save(&run_dir)?;
        util::write_json_pretty(
            &run_dir.join(DISCOVER_REPORT),
            &json!({ "root": root, "variants": report }),
        )
    }
}

#[Task(
    id = "firmware.assemble",
    module = "firmware",
    phase = "assemble",
    provides = ["firmware:assembled"],
    after = ["firmware.discover", "kernel:built?"],
    default_label = "Assemble partition images"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssembleTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for AssembleTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl AssembleTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let fw = FirmwareConfig::load(doc)?;
        let tools = ToolsConfig::load(doc)?;
        let run_dir = util::run_dir(doc, ctx)?;
        let mut ledger = VariantLedger::load(&run_dir)?;
        let builds = kernel::load_builds(&run_dir)?;

        let images = Magiskboot::new(tools::locate(&tools.magiskboot)?);
        let footers = Avbtool::new(tools::locate(&tools.avbtool)?);
        let asm = Assembler {
            images: &images,
            footers: &footers,
        };

        let n = for_each_variant(
            ctx,
            &mut ledger,
            &run_dir,
            Self::ID,
            &["built"],
            fw.fail_fast,
            |ctx, rec| {
                let profile = rec.profile()?.clone();
                let build = builds.get(&profile.fragment).ok_or_else(|| {
                    Error::missing_input(format!(
                        "no kernel build recorded for fragment '{}'",
                        profile.fragment
                    ))
                })?;
                let out_dir = fw.variant_out_dir(&ws, &rec.name)?;
                util::ensure_dir(&out_dir)?;

                let staging = ws.fresh_staging(&[rec.name.as_str(), "boot"])?;
                let boot = asm.assemble(
                    ctx,
                    &rec.image("boot.img"),
                    &[
                        Splice::entry("kernel", &build.image),
                        Splice::header(&fw.header_key, &profile.rp_rev),
                    ],
                    &staging,
                )?;
                util::copy_file(&boot, &out_dir.join("boot.img"))?;

                let staging = ws.fresh_staging(&[rec.name.as_str(), "vendor_boot"])?;
                let vendor_boot = asm.assemble(
                    ctx,
                    &rec.image("vendor_boot.img"),
                    &[Splice::entry("dtb", &build.dtb)],
                    &staging,
                )?;
                util::copy_file(&vendor_boot, &out_dir.join("vendor_boot.img"))?;

                let dtbo = match profile.dtbo.as_deref() {
                    Some(p) => ws.resolve_config_path(p)?,
                    None => build.dtbo.clone(),
                };
                if !dtbo.is_file() {
                    return Err(Error::missing_input(format!(
                        "dtbo image {} not found",
                        dtbo.display()
                    )));
                }
                util::copy_file(&dtbo, &out_dir.join("dtbo.img"))?;

                ctx.log(&format!("images written to {}", out_dir.display()));
                rec.advance(VariantState::Assembled)
            },
        )?;
        if n == 0 {
            ctx.warn("no built variants to assemble");
        }
        Ok(())
    }
}

#[Task(
    id = "firmware.report",
    module = "firmware",
    phase = "report",
    provides = ["firmware:reported"],
    after = [
        "firmware.discover",
        "firmware:assembled?",
        "avb:signed?",
        "package:done?"
    ],
    default_label = "Report variant results"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ReportTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ReportTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let run_dir = util::run_dir(doc, ctx)?;
        let ledger = VariantLedger::load(&run_dir)?;

        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for rec in &ledger.variants {
            *counts.entry(rec.state.name()).or_default() += 1;
            ctx.log(&format!("{}: {}", rec.name, rec.state));
        }
        let summary = counts
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        ctx.log(&format!("variants: {summary}"));

        util::write_json_pretty(
            &run_dir.join(BATCH_REPORT),
            &json!({
                "build": util::build_name(doc),
                "generated_at": chrono::Local::now().to_rfc3339(),
                "counts": counts,
                "variants": ledger.variants,
            }),
        )?;

        let failed: Vec<&str> = ledger.failed().map(|v| v.name.as_str()).collect();
        if !failed.is_empty() {
            return Err(Error::msg(format!(
                "{} variant(s) failed: {}",
                failed.len(),
                failed.join(", ")
            )));
        }
        Ok(())
    }
}

#[Module(
    id = "firmware",
    config = FirmwareConfig,
    tasks = [DiscoverTask, AssembleTask, ReportTask]
)]
pub struct FirmwareModule;

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(root: &Path, name: &str, files: &[&str]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).expect("mkdir");
        for f in files {
            fs::write(dir.join(f), b"stock").expect("write");
        }
    }

    fn known() -> BTreeMap<String, VariantProfile> {
        BTreeMap::from([(
            "a52sxqxx".to_string(),
            VariantProfile {
                fragment: "a52sxq.config".into(),
                rp_rev: "SRPUE26A001".into(),
                dtbo: None,
            },
        )])
    }

    #[test]
    fn classifies_variants_in_name_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        bundle(tmp.path(), "unknownvariant", &REQUIRED_IMAGES);
        bundle(tmp.path(), "a52sxqxx", &REQUIRED_IMAGES);
        bundle(tmp.path(), "m52xqxx", &["boot.img", "vbmeta.img"]);
        fs::write(tmp.path().join("README.txt"), b"not a variant").expect("write");

        let got = discover(tmp.path(), &known()).expect("discover");
        let names: Vec<_> = got.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a52sxqxx", "m52xqxx", "unknownvariant"]);

        assert_eq!(got[0].state, VariantState::Validated);
        assert_eq!(got[0].profile.as_ref().map(|p| p.rp_rev.as_str()), Some("SRPUE26A001"));
        assert_eq!(
            got[1].state,
            VariantState::Skipped {
                reason: SkipReason::MissingFiles {
                    missing: vec!["dtbo.img".into(), "vendor_boot.img".into()],
                },
            }
        );
        assert_eq!(
            got[2].state,
            VariantState::Skipped {
                reason: SkipReason::UnknownVariant,
            }
        );
    }

    #[test]
    fn incomplete_unknown_variant_reports_missing_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        bundle(tmp.path(), "mystery", &["boot.img"]);
        let got = discover(tmp.path(), &known()).expect("discover");
        assert!(matches!(
            &got[0].state,
            VariantState::Skipped {
                reason: SkipReason::MissingFiles { .. }
            }
        ));
    }

    #[test]
    fn missing_root_is_fatal() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = discover(&tmp.path().join("nope"), &known()).expect_err("missing root");
        assert_eq!(err.kind(), crate::ErrorKind::MissingInput);
    }

    #[test]
    fn config_rejects_empty_fragment() {
        let doc = ConfigDoc::parse(
            "inline.toml",
            "[firmware.variants.a52sxqxx]\nfragment = \"\"\nrp_rev = \"SRPUE26A001\"\n",
        )
        .expect("toml");
        assert!(FirmwareConfig::load(&doc).is_err());
    }
}
