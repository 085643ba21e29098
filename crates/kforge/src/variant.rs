//! Per-variant lifecycle.
//!
//! Every variant found under the firmware root gets one [`VariantRecord`] in a
//! ledger persisted as `variants.json` in the run directory. Tasks load the
//! ledger, advance the variants they handled and save it again, so each stage
//! sees exactly what the previous one produced.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::util;

pub const LEDGER_FILE: &str = "variants.json";

/// The four partition images every firmware bundle must contain.
pub const REQUIRED_IMAGES: [&str; 4] = ["boot.img", "dtbo.img", "vbmeta.img", "vendor_boot.img"];

/// Per-variant build parameters from `[firmware.variants.<name>]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariantProfile {
    /// Kernel config fragment applied after the base defconfig.
    pub fragment: String,
    /// Verification revision written into the boot header's first line.
    pub rp_rev: String,
    /// Prebuilt DTBO to use instead of the kernel build's.
    pub dtbo: Option<String>,
}

impl VariantProfile {
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.fragment.trim().is_empty() {
            return Err(Error::config(format!(
                "firmware.variants.{name}.fragment is empty"
            )));
        }
        if self.rp_rev.trim().is_empty() || self.rp_rev.contains('\n') {
            return Err(Error::config(format!(
                "firmware.variants.{name}.rp_rev must be a single non-empty line"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    MissingFiles { missing: Vec<String> },
    UnknownVariant,
    /// `--vbmeta-only` was requested but no rebuilt images exist yet.
    NoPriorBuild { missing: Vec<String> },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingFiles { missing } => {
                write!(f, "missing firmware files: {}", missing.join(", "))
            }
            SkipReason::UnknownVariant => write!(f, "unknown variant (no [firmware.variants] entry)"),
            SkipReason::NoPriorBuild { missing } => {
                write!(f, "no previously rebuilt images: {}", missing.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum VariantState {
    Discovered,
    Validated,
    Built,
    Assembled,
    Footered,
    MetadataRebuilt,
    Packaged,
    Skipped { reason: SkipReason },
    Failed { error: String },
}

impl VariantState {
    pub fn name(&self) -> &'static str {
        match self {
            VariantState::Discovered => "discovered",
            VariantState::Validated => "validated",
            VariantState::Built => "built",
            VariantState::Assembled => "assembled",
            VariantState::Footered => "footered",
            VariantState::MetadataRebuilt => "metadata_rebuilt",
            VariantState::Packaged => "packaged",
            VariantState::Skipped { .. } => "skipped",
            VariantState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VariantState::Packaged | VariantState::Skipped { .. } | VariantState::Failed { .. }
        )
    }

    /// Legal edges of the lifecycle. `Validated -> Assembled` re-enters the
    /// pipeline with images rebuilt by an earlier run.
    pub fn can_advance_to(&self, next: &VariantState) -> bool {
        use VariantState as S;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, S::Failed { .. }) => !matches!(self, S::Discovered),
            (S::Discovered, S::Validated | S::Skipped { .. }) => true,
            (S::Validated, S::Built | S::Assembled | S::Skipped { .. }) => true,
            (S::Built, S::Assembled) => true,
            (S::Assembled, S::Footered) => true,
            (S::Footered, S::MetadataRebuilt) => true,
            (S::MetadataRebuilt, S::Packaged) => true,
            _ => false,
        }
    }
}

impl fmt::Display for VariantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariantState::Skipped { reason } => write!(f, "skipped ({reason})"),
            VariantState::Failed { error } => write!(f, "failed ({error})"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantRecord {
    pub name: String,
    pub firmware_dir: PathBuf,
    pub profile: Option<VariantProfile>,
    #[serde(flatten)]
    pub state: VariantState,
}

impl VariantRecord {
    pub fn advance(&mut self, next: VariantState) -> Result<()> {
        if !self.state.can_advance_to(&next) {
            return Err(Error::msg(format!(
                "variant '{}': illegal transition {} -> {}",
                self.name,
                self.state.name(),
                next.name()
            )));
        }
        tracing::debug!(variant = %self.name, from = self.state.name(), to = next.name(), "advance");
        self.state = next;
        Ok(())
    }

    /// The profile is always present once a variant has been validated.
    pub fn profile(&self) -> Result<&VariantProfile> {
        self.profile.as_ref().ok_or_else(|| {
            Error::msg(format!("variant '{}' has no resolved profile", self.name))
        })
    }

    pub fn image(&self, file: &str) -> PathBuf {
        self.firmware_dir.join(file)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariantLedger {
    pub variants: Vec<VariantRecord>,
}

impl VariantLedger {
    pub fn path(run_dir: &Path) -> PathBuf {
        run_dir.join(LEDGER_FILE)
    }

    pub fn load(run_dir: &Path) -> Result<Self> {
        let p = Self::path(run_dir);
        if !p.exists() {
            return Err(Error::missing_input(format!(
                "variant ledger {} not found; run firmware.discover first",
                p.display()
            )));
        }
        util::read_json(&p)
    }

    pub fn save(&self, run_dir: &Path) -> Result<()> {
        let v = serde_json::to_value(self)?;
        util::write_json_pretty(&Self::path(run_dir), &v)
    }

    pub fn get(&self, name: &str) -> Option<&VariantRecord> {
        self.variants.iter().find(|v| v.name == name)
    }

    /// Names of variants currently in one of `states` (compared by state name).
    pub fn names_in(&self, states: &[&str]) -> Vec<String> {
        self.variants
            .iter()
            .filter(|v| states.contains(&v.state.name()))
            .map(|v| v.name.clone())
            .collect()
    }

    pub fn advance(&mut self, name: &str, next: VariantState) -> Result<()> {
        let rec = self
            .variants
            .iter_mut()
            .find(|v| v.name == name)
            .ok_or_else(|| Error::msg(format!("variant '{name}' is not in the ledger")))?;
        rec.advance(next)
    }

    pub fn failed(&self) -> impl Iterator<Item = &VariantRecord> {
        self.variants
            .iter()
            .filter(|v| matches!(v.state, VariantState::Failed { .. }))
    }
}

/// Run `step` for every variant whose state is in `from`, logging under
/// `<task_id>:<variant>`. The step advances a copy of the record; on success the
/// copy replaces the original, on error the variant becomes `Failed`. The ledger
/// is saved after every variant. With `fail_fast` the first failure is returned
/// immediately, otherwise failures are left for the report.
pub fn for_each_variant(
    ctx: &mut ExecCtx,
    ledger: &mut VariantLedger,
    run_dir: &Path,
    task_id: &str,
    from: &[&str],
    fail_fast: bool,
    mut step: impl FnMut(&mut ExecCtx, &mut VariantRecord) -> Result<()>,
) -> Result<usize> {
    let names = ledger.names_in(from);
    for name in &names {
        let Some(idx) = ledger.variants.iter().position(|v| &v.name == name) else {
            continue;
        };
        ctx.set_task(format!("{task_id}:{name}"));
        let mut work = ledger.variants[idx].clone();
        match step(ctx, &mut work) {
            Ok(()) => ledger.variants[idx] = work,
            Err(e) => {
                ctx.log(&format!("ERROR: {e}"));
                let failed = VariantState::Failed {
                    error: e.to_string(),
                };
                // Record the failure against the furthest state the step reached.
                if work.state.can_advance_to(&failed) {
                    work.state = failed;
                    ledger.variants[idx] = work;
                } else {
                    ledger.variants[idx].advance(failed)?;
                }
                ledger.save(run_dir)?;
                if fail_fast {
                    ctx.set_task(task_id);
                    return Err(e.context(format!("variant '{name}'")));
                }
                continue;
            }
        }
        ledger.save(run_dir)?;
    }
    ctx.set_task(task_id);
    Ok(names.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(state: VariantState) -> VariantRecord {
        VariantRecord {
            name: "a52sxqxx".into(),
            firmware_dir: PathBuf::from("firmware/a52sxqxx"),
            profile: None,
            state,
        }
    }

    #[test]
    fn happy_path_walks_every_state() {
        let mut rec = record(VariantState::Discovered);
        for next in [
            VariantState::Validated,
            VariantState::Built,
            VariantState::Assembled,
            VariantState::Footered,
            VariantState::MetadataRebuilt,
            VariantState::Packaged,
        ] {
            rec.advance(next).expect("legal transition");
        }
        assert!(rec.state.is_terminal());
    }

    #[test]
    fn rejects_skipping_stages_and_leaving_terminal_states() {
        let mut rec = record(VariantState::Validated);
        let err = rec.advance(VariantState::Footered).expect_err("illegal");
        assert!(err.to_string().contains("validated -> footered"), "{err}");

        let mut rec = record(VariantState::Skipped {
            reason: SkipReason::UnknownVariant,
        });
        assert!(rec.advance(VariantState::Validated).is_err());
        assert!(
            rec.advance(VariantState::Failed {
                error: "x".into()
            })
            .is_err()
        );
    }

    #[test]
    fn ledger_persists_state_and_reasons() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ledger = VariantLedger {
            variants: vec![record(VariantState::Skipped {
                reason: SkipReason::MissingFiles {
                    missing: vec!["dtbo.img".into()],
                },
            })],
        };
        ledger.save(tmp.path()).expect("save");

        let raw = std::fs::read_to_string(VariantLedger::path(tmp.path())).expect("read");
        let v: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(v["variants"][0]["state"], "skipped");
        assert_eq!(v["variants"][0]["reason"]["kind"], "missing_files");

        let back = VariantLedger::load(tmp.path()).expect("load");
        assert_eq!(back.variants[0].state, ledger.variants[0].state);
        assert!(back.names_in(&["skipped"]).contains(&"a52sxqxx".to_string()));
    }

    #[test]
    fn profile_requires_fragment_and_single_line_revision() {
        let ok = VariantProfile {
            fragment: "a52sxq.config".into(),
            rp_rev: "SRPUE26A001".into(),
            dtbo: None,
        };
        assert!(ok.validate("a52sxqxx").is_ok());
        let bad = VariantProfile {
            rp_rev: "a\nb".into(),
            ..ok
        };
        assert!(bad.validate("a52sxqxx").is_err());
    }

    #[test]
    fn per_variant_failures_are_recorded_and_others_continue() {
        use std::sync::Arc;

        let tmp = tempfile::tempdir().expect("tempdir");
        let mut ledger = VariantLedger {
            variants: vec![
                VariantRecord {
                    name: "a52sxqxx".into(),
                    ..record(VariantState::Built)
                },
                VariantRecord {
                    name: "m52xqxx".into(),
                    ..record(VariantState::Built)
                },
            ],
        };
        let sink = Arc::new(crate::executor::RecordingSink::default());
        let mut ctx = ExecCtx::new(false, sink.clone());

        let n = for_each_variant(
            &mut ctx,
            &mut ledger,
            tmp.path(),
            "firmware.assemble",
            &["built"],
            false,
            |_, rec| {
                if rec.name == "a52sxqxx" {
                    return Err(Error::tool_failed("magiskboot failed: exit status: 1"));
                }
                rec.advance(VariantState::Assembled)
            },
        )
        .expect("aggregate mode");

        assert_eq!(n, 2);
        assert_eq!(ledger.names_in(&["failed"]), vec!["a52sxqxx".to_string()]);
        assert_eq!(ledger.names_in(&["assembled"]), vec!["m52xqxx".to_string()]);
        assert!(sink.log_lines().iter().any(|l| l.starts_with("ERROR: magiskboot failed")));
        assert_eq!(ctx.current_task_id.as_deref(), Some("firmware.assemble"));
    }
}
