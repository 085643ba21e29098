use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::Module;
use crate::planner::{Plan, Task};
use crate::workspace::WorkspaceConfig;

const KNOWN_TABLES: [&str; 8] = [
    "workspace",
    "tools",
    "preflight",
    "toolchain",
    "kernel",
    "firmware",
    "avb",
    "package",
];

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        // A misspelled table would otherwise silently disable its module.
        if let Some(root) = doc.value.as_table() {
            for (key, value) in root {
                if value.is_table() && !KNOWN_TABLES.contains(&key.as_str()) {
                    return Err(Error::config(format!(
                        "unknown config table '[{key}]' (known: {})",
                        KNOWN_TABLES.join(", ")
                    )));
                }
            }
        }

        plan.add(Task {
            id: "core.init".into(),
            label: "Init workspace".into(),
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:initialized".into()],
        })
    }
}

pub fn init(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws: WorkspaceConfig = doc.section("workspace")?;
    if ctx.dry_run {
        ctx.log(&format!("DRY-RUN: workspace clean = {}", ws.clean.as_str()));
        let paths = crate::workspace::load_paths(&ws)?;
        ctx.set_workspace_paths(paths);
        return Ok(());
    }

    let paths = crate::workspace::init_dirs(&ws)?;
    ctx.log(&format!("workspace.root = {}", paths.root.display()));
    ctx.log(&format!("workspace.build_dir = {}", paths.build_dir.display()));
    ctx.log(&format!("workspace.out_dir = {}", paths.out_dir.display()));
    if ws.clean != Default::default() {
        ctx.log(&format!("workspace.clean = {}", ws.clean.as_str()));
    }
    for (alias, dir) in &paths.named_dirs {
        if !matches!(alias.as_str(), "root" | "build" | "out") {
            ctx.log(&format!("@{alias} = {}", dir.display()));
        }
    }
    ctx.set_workspace_paths(paths);
    Ok(())
}
