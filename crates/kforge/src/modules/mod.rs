use crate::config::ConfigDoc;
use crate::error::Result;
use crate::planner::Plan;

pub mod avb;
pub mod core;
pub mod firmware;
pub mod kernel;
pub mod package;
pub mod preflight;
pub mod toolchain;
pub mod util;

pub trait Module {
    fn id(&self) -> &'static str;
    fn detect(&self, doc: &ConfigDoc) -> bool;
    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()>;
}

pub fn builtin_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(core::CoreModule),
        Box::new(preflight::PreflightModule),
        Box::new(toolchain::ToolchainModule),
        Box::new(firmware::FirmwareModule),
        Box::new(kernel::KernelModule),
        Box::new(avb::AvbModule),
        Box::new(package::PackageModule),
    ]
}

/// Plan every detected module.
pub fn build_plan(doc: &ConfigDoc) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in builtin_modules() {
        if m.detect(doc) {
            tracing::debug!(module = m.id(), "planning");
            m.plan(doc, &mut plan)?;
        }
    }
    Ok(plan)
}

/// A module table is present and not switched off with `enabled = false`.
pub fn module_enabled(doc: &ConfigDoc, id: &str) -> bool {
    doc.has_table_path(id) && flag(doc, &format!("{id}.enabled"))
}

/// Steps default to enabled; only an explicit `enabled = false` turns one off.
pub fn step_enabled(doc: &ConfigDoc, module: &str, step: &str) -> bool {
    module_enabled(doc, module) && flag(doc, &format!("{module}.steps.{step}.enabled"))
}

fn flag(doc: &ConfigDoc, path: &str) -> bool {
    doc.value_path(path)
        .and_then(toml::Value::as_bool)
        .unwrap_or(true)
}
