use std::path::PathBuf;

use kforge::config::ConfigDoc;
use kforge::overrides::RunFlags;
use kforge::planner::Plan;

const FULL: &str = r#"
[preflight]
[toolchain]
[kernel]
[firmware]
[firmware.variants.a52sxqxx]
fragment = "a52sxq.config"
rp_rev = "SRPUE26A002"
[avb]
[package]
"#;

fn doc(raw: &str) -> ConfigDoc {
    ConfigDoc {
        path: PathBuf::from("<mem>"),
        value: toml::from_str(raw).unwrap(),
    }
}

fn order(plan: &Plan) -> Vec<String> {
    plan.ordered().unwrap().iter().map(|t| t.id.clone()).collect()
}

fn pos(ids: &[String], id: &str) -> usize {
    ids.iter()
        .position(|x| x == id)
        .unwrap_or_else(|| panic!("{id} not planned: {ids:?}"))
}

#[test]
fn full_build_orders_stages() {
    let plan = kforge::modules::build_plan(&doc(FULL)).unwrap();
    let ids = order(&plan);
    for (before, after) in [
        ("core.init", "preflight.tools"),
        ("preflight.tools", "preflight.source"),
        ("preflight.tools", "toolchain.resolve"),
        ("firmware.discover", "kernel.compile"),
        ("toolchain.resolve", "kernel.compile"),
        ("preflight.source", "kernel.compile"),
        ("kernel.compile", "firmware.assemble"),
        ("firmware.assemble", "avb.sign"),
        ("avb.sign", "package.module"),
        ("package.module", "firmware.report"),
    ] {
        assert!(pos(&ids, before) < pos(&ids, after), "{before} !< {after}: {ids:?}");
    }
}

#[test]
fn absent_tables_drop_their_modules() {
    let plan = kforge::modules::build_plan(&doc(
        r#"
[firmware]
[avb]
"#,
    ))
    .unwrap();
    let ids = order(&plan);
    assert!(!ids.iter().any(|id| id.starts_with("kernel.")));
    assert!(!ids.iter().any(|id| id.starts_with("package.")));
    assert!(pos(&ids, "firmware.discover") < pos(&ids, "avb.sign"));
}

#[test]
fn vbmeta_only_skips_compile_and_assemble() {
    let mut d = doc(FULL);
    let flags = RunFlags {
        vbmeta_only: true,
        ..RunFlags::default()
    };
    kforge::overrides::apply(&mut d, &flags, &[]).unwrap();
    let ids = order(&kforge::modules::build_plan(&d).unwrap());

    for gone in ["kernel.compile", "toolchain.resolve", "firmware.assemble", "preflight.source"] {
        assert!(!ids.iter().any(|id| id == gone), "{gone} still planned");
    }
    assert!(pos(&ids, "avb.sign") < pos(&ids, "package.module"));
}

#[test]
fn misspelled_table_is_rejected() {
    let err = kforge::modules::build_plan(&doc("[firmwear]\n"))
        .unwrap_err()
        .to_string();
    assert!(err.contains("firmwear"), "unexpected err: {err}");
}

#[test]
fn required_step_cannot_be_disabled() {
    let err = kforge::modules::build_plan(&doc(
        r#"
[firmware]
[firmware.steps.discover]
enabled = false
"#,
    ))
    .unwrap_err()
    .to_string();
    assert!(err.contains("firmware.steps.discover"), "unexpected err: {err}");
}

#[test]
fn set_overrides_reach_the_plan() {
    let mut d = doc(FULL);
    kforge::overrides::apply(&mut d, &RunFlags::default(), &["package.enabled=false".into()]).unwrap();
    let ids = order(&kforge::modules::build_plan(&d).unwrap());
    assert!(!ids.iter().any(|id| id == "package.module"));
}

#[test]
fn dot_output_lists_dependencies() {
    let plan = kforge::modules::build_plan(&doc(FULL)).unwrap();
    let dot = plan.to_dot().unwrap();
    assert!(dot.starts_with("digraph plan {"));
    assert!(dot.contains("\"avb.sign\" -> \"package.module\""), "{dot}");
}
