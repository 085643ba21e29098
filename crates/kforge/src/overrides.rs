//! Command-line overrides applied to a loaded build definition before planning.

use toml::Value;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};

/// Named run modes exposed as CLI flags; each maps onto plain config paths.
#[derive(Debug, Clone, Default)]
pub struct RunFlags {
    /// Wipe prior compiler output before building.
    pub clean: bool,
    /// Skip compilation and image assembly; re-sign previously built images.
    pub vbmeta_only: bool,
    pub allow_download: bool,
}

impl RunFlags {
    fn as_overrides(&self) -> Vec<(&'static str, Value)> {
        let mut out = Vec::new();
        if self.clean {
            out.push(("kernel.clean", Value::Boolean(true)));
        }
        if self.vbmeta_only {
            out.push(("kernel.enabled", Value::Boolean(false)));
            out.push(("toolchain.enabled", Value::Boolean(false)));
            out.push(("firmware.steps.assemble.enabled", Value::Boolean(false)));
            out.push(("preflight.steps.source.enabled", Value::Boolean(false)));
            out.push(("avb.reuse_previous", Value::Boolean(true)));
        }
        if self.allow_download {
            out.push(("toolchain.allow_download", Value::Boolean(true)));
        }
        out
    }
}

pub fn apply(doc: &mut ConfigDoc, flags: &RunFlags, sets: &[String]) -> Result<()> {
    for (path, value) in flags.as_overrides() {
        // Flags only touch modules the build actually declares.
        let root = path.split('.').next().unwrap_or(path);
        if doc.has_table_path(root) {
            doc.set_path(path, value)?;
        }
    }
    for (path, value) in parse_sets(sets)? {
        doc.set_path(&path, value)?;
    }
    Ok(())
}

fn parse_sets(raw: &[String]) -> Result<Vec<(String, Value)>> {
    let mut out = Vec::with_capacity(raw.len());
    for item in raw {
        let Some((k, v)) = item.trim().split_once('=') else {
            return Err(Error::config(format!(
                "invalid --set value '{item}'; expected KEY=VALUE"
            )));
        };
        let key = k.trim();
        if key.is_empty() {
            return Err(Error::config(format!(
                "invalid --set value '{item}'; key is empty"
            )));
        }
        out.push((key.to_string(), parse_raw_value(v)));
    }
    Ok(out)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_raw_value(raw: &str) -> Value {
    let raw = raw.trim();
    if let Some(b) = parse_bool(raw) {
        return Value::Boolean(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Integer(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::Float(f);
    }
    Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(src: &str) -> ConfigDoc {
        ConfigDoc::parse("inline.toml", src).expect("valid toml")
    }

    #[test]
    fn vbmeta_only_disables_compile_and_assemble() {
        let mut d = doc("[kernel]\n[toolchain]\n[firmware]\n[avb]\n");
        let flags = RunFlags {
            vbmeta_only: true,
            ..RunFlags::default()
        };
        apply(&mut d, &flags, &[]).expect("apply");
        assert_eq!(
            d.value_path("kernel.enabled").and_then(Value::as_bool),
            Some(false)
        );
        assert_eq!(
            d.value_path("firmware.steps.assemble.enabled")
                .and_then(Value::as_bool),
            Some(false)
        );
        // [preflight] is not declared, so the flag leaves it alone.
        assert!(!d.has_table_path("preflight"));
    }

    #[test]
    fn set_values_are_typed() {
        let mut d = doc("[kernel]\n");
        apply(
            &mut d,
            &RunFlags::default(),
            &[
                "kernel.jobs=12".into(),
                "kernel.clean=yes".into(),
                "kernel.arch=arm64".into(),
            ],
        )
        .expect("apply");
        assert_eq!(
            d.value_path("kernel.jobs").and_then(Value::as_integer),
            Some(12)
        );
        assert_eq!(
            d.value_path("kernel.clean").and_then(Value::as_bool),
            Some(true)
        );
        assert_eq!(
            d.value_path("kernel.arch").and_then(Value::as_str),
            Some("arm64")
        );
    }

    #[test]
    fn rejects_set_without_equals() {
        let mut d = doc("");
        let err = apply(&mut d, &RunFlags::default(), &["kernel.jobs".into()])
            .expect_err("missing '='");
        assert!(err.to_string().contains("KEY=VALUE"));
    }
}
