use std::process::Command;

use serde::Deserialize;

use kforge_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::modules::kernel::KernelConfig;
use crate::modules::toolchain::ToolchainConfig;
use crate::modules::{module_enabled, step_enabled};
use crate::tools::{self, ToolsConfig};
use crate::{Error, ErrorKind, Result};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreflightConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Additional programs that must be resolvable.
    pub extra_tools: Vec<String>,
    pub allowed_branches: Vec<String>,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extra_tools: Vec::new(),
            allowed_branches: vec!["main".into(), "ksu".into()],
        }
    }
}

/// Tools the enabled parts of the build will call, deduplicated, in a stable order.
pub fn required_tools(doc: &ConfigDoc, tools: &ToolsConfig, extra: &[String]) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    let mut need = |t: &str| {
        if !out.iter().any(|x| x == t) {
            out.push(t.to_string());
        }
    };

    if step_enabled(doc, "preflight", "source") {
        need(&tools.git);
    }
    if module_enabled(doc, "toolchain") {
        let tc: ToolchainConfig = doc.section("toolchain")?;
        // A download consented to at the prompt looks tar up when it runs.
        if tc.allow_download {
            need(&tools.tar);
        }
    }
    if module_enabled(doc, "kernel") {
        need(&tools.make);
    }
    if step_enabled(doc, "firmware", "assemble") {
        need(&tools.magiskboot);
        need(&tools.avbtool);
    }
    if module_enabled(doc, "avb") {
        need(&tools.avbtool);
        need(&tools.openssl);
    }
    if module_enabled(doc, "package") {
        need(&tools.zip);
    }
    for t in extra {
        need(t);
    }
    Ok(out)
}

pub fn check_branch(branch: &str, allowed: &[String]) -> Result<()> {
    if allowed.iter().any(|b| b == branch) {
        return Ok(());
    }
    Err(Error::config(format!(
        "kernel source is on branch '{branch}'; allowed: {}",
        allowed.join(", ")
    )))
}

#[Task(
    id = "preflight.tools",
    module = "preflight",
    phase = "preflight",
    provides = ["preflight:tools"],
    after = ["core.init"],
    default_label = "Check host tools",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ToolsTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ToolsTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg: PreflightConfig = doc.section("preflight")?;
        let tools_cfg = ToolsConfig::load(doc)?;
        let mut missing = Vec::new();
        for t in required_tools(doc, &tools_cfg, &cfg.extra_tools)? {
            match tools::locate(&t) {
                Ok(p) => ctx.log(&format!("{t} -> {}", p.display())),
                Err(e) if e.kind() == ErrorKind::MissingTool => missing.push(e.to_string()),
                Err(e) => return Err(e),
            }
        }
        if !missing.is_empty() {
            return Err(Error::missing_tool(missing.join("\n")));
        }
        Ok(())
    }
}

#[Task(
    id = "preflight.source",
    module = "preflight",
    phase = "preflight",
    provides = ["preflight:source"],
    after = ["preflight.tools?"],
    default_label = "Check kernel branch"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for SourceTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl SourceTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let cfg: PreflightConfig = doc.section("preflight")?;
        let kc: KernelConfig = doc.section("kernel")?;
        let git = tools::locate(&ToolsConfig::load(doc)?.git)?;
        let src = ws.resolve_config_path(&kc.source_dir)?;
        if !src.is_dir() {
            return Err(Error::missing_input(format!(
                "kernel source dir {} does not exist",
                src.display()
            )));
        }

        let mut cmd = Command::new(git);
        cmd.arg("-C")
            .arg(&src)
            .args(["rev-parse", "--abbrev-ref", "HEAD"]);
        let branch = ctx
            .run_cmd_capture(cmd)
            .map_err(|e| e.context(format!("{} is not a git checkout", src.display())))?;
        let branch = branch.trim();
        ctx.log(&format!("kernel branch = {branch}"));
        check_branch(branch, &cfg.allowed_branches)
    }
}

#[Module(id = "preflight", config = PreflightConfig, tasks = [ToolsTask, SourceTask])]
pub struct PreflightModule;

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(raw: &str) -> ConfigDoc {
        ConfigDoc::parse("test.toml", raw).expect("parse")
    }

    #[test]
    fn branch_outside_allowlist_is_config_error() {
        let allowed = PreflightConfig::default().allowed_branches;
        assert!(check_branch("main", &allowed).is_ok());
        assert!(check_branch("ksu", &allowed).is_ok());
        let err = check_branch("android12-5.4", &allowed).expect_err("rejected");
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert!(err.to_string().contains("android12-5.4"));
    }

    #[test]
    fn tools_follow_enabled_modules() {
        let d = doc(
            r#"
[preflight]
extra_tools = ["python3"]

[kernel]

[firmware]
[firmware.steps.assemble]
enabled = false

[avb]
enabled = false

[package]
"#,
        );
        let got = required_tools(&d, &ToolsConfig::default(), &["python3".into()]).expect("tools");
        assert_eq!(got, vec!["git", "make", "zip", "python3"]);
    }

    #[test]
    fn configured_paths_replace_names_and_dedupe() {
        let d = doc(
            r#"
[firmware]
[avb]
[tools]
avbtool = "/opt/avb/avbtool"
"#,
        );
        let tools = ToolsConfig::load(&d).expect("tools");
        let got = required_tools(&d, &tools, &[]).expect("tools");
        assert_eq!(got, vec!["magiskboot", "/opt/avb/avbtool", "openssl"]);
    }

    #[test]
    fn tar_only_needed_for_allowed_download() {
        let prepared = doc("[toolchain]\nlocal_dir = \"toolchain\"\n");
        let got = required_tools(&prepared, &ToolsConfig::default(), &[]).expect("tools");
        assert!(got.is_empty(), "{got:?}");

        let download = doc("[toolchain]\nallow_download = true\n");
        let got = required_tools(&download, &ToolsConfig::default(), &[]).expect("tools");
        assert_eq!(got, vec!["tar"]);
    }

    fn git(dir: &std::path::Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=kforge", "-c", "user.email=kforge@localhost"])
            .args(args)
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {args:?} failed");
    }

    #[test]
    fn source_check_reads_checked_out_branch() {
        if which::which("git").is_err() {
            return;
        }
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("kernel");
        std::fs::create_dir_all(&src).expect("mkdir");
        git(&src, &["init", "-q"]);
        git(&src, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(&src, &["commit", "-q", "--allow-empty", "-m", "init"]);

        let d = doc(&format!(
            "[workspace]\nroot_dir = \"{}\"\n\n[preflight]\n\n[kernel]\nsource_dir = \"kernel\"\n",
            tmp.path().display()
        ));
        let run = |d: &ConfigDoc| {
            let mut ctx = ExecCtx::new(false, std::sync::Arc::new(crate::executor::RecordingSink::default()));
            SourceTask::run(&SourceTask::default(), d, &mut ctx)
        };

        run(&d).expect("main is allowed");

        git(&src, &["checkout", "-q", "-b", "android12-5.4"]);
        let err = run(&d).expect_err("off-list branch");
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert!(err.to_string().contains("android12-5.4"), "{err}");
    }
}
