//! Build definition loading.
//!
//! A build definition is a TOML document. Two composition mechanisms are supported:
//! a root-level `extends = "base.toml"` (single parent, merged underneath) and
//! `imports = [...]` at any table level (merged underneath that table's own keys).

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn parse(path: impl Into<PathBuf>, raw: &str) -> Result<Self> {
        let value: Value = toml::from_str(raw)?;
        Ok(Self {
            path: path.into(),
            value,
        })
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        path.split('.')
            .try_fold(&self.value, |cur, seg| cur.as_table()?.get(seg))
    }

    pub fn table_path(&self, path: &str) -> Option<&toml::value::Table> {
        self.value_path(path)?.as_table()
    }

    pub fn has_table_path(&self, path: &str) -> bool {
        self.table_path(path).is_some()
    }

    /// Deserialize the value at a dotted path. Missing paths yield `Ok(None)`.
    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        v.clone()
            .try_into()
            .map(Some)
            .map_err(|e| Error::config(format!("invalid config at '{path}': {e}")))
    }

    /// Like `deserialize_path` but falls back to `T::default()`.
    pub fn section<T: DeserializeOwned + Default>(&self, path: &str) -> Result<T> {
        Ok(self.deserialize_path(path)?.unwrap_or_default())
    }

    /// Set a dotted path, creating intermediate tables as needed.
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<()> {
        let segs: Vec<&str> = path.split('.').map(str::trim).collect();
        if segs.iter().any(|s| s.is_empty()) {
            return Err(Error::config(format!("invalid config path '{path}'")));
        }
        let (last, parents) = segs
            .split_last()
            .ok_or_else(|| Error::config("empty config path"))?;

        let mut cur = &mut self.value;
        for seg in parents {
            let tbl = cur.as_table_mut().ok_or_else(|| {
                Error::config(format!("cannot set '{path}': '{seg}' is not a table"))
            })?;
            cur = tbl
                .entry(seg.to_string())
                .or_insert(Value::Table(Default::default()));
        }
        let tbl = cur
            .as_table_mut()
            .ok_or_else(|| Error::config(format!("cannot set '{path}': parent is not a table")))?;
        tbl.insert(last.to_string(), value);
        Ok(())
    }
}

/// Deep-merge `overlay` into `base`. Tables merge key by key; anything else replaces.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(overlay_tbl)) => {
            for (k, v) in overlay_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut loader = Loader::default();
    let value = loader.load_file(path)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

#[derive(Default)]
struct Loader {
    // Files currently being loaded; used to report the full chain on a cycle.
    chain: Vec<PathBuf>,
}

impl Loader {
    fn load_file(&mut self, path: &Path) -> Result<Value> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if self.chain.contains(&canonical) {
            let chain = self
                .chain
                .iter()
                .chain(std::iter::once(&canonical))
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(Error::config(format!("config import cycle: {chain}")));
        }
        self.chain.push(canonical);

        let raw = fs::read_to_string(path).map_err(|e| {
            Error::missing_input(format!("failed to read config {}: {e}", path.display()))
        })?;
        let mut value: Value = toml::from_str(&raw)
            .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

        let mut out = Value::Table(Default::default());
        let parent = value
            .as_table_mut()
            .and_then(|t| t.remove("extends"))
            .map(|v| {
                v.as_str().map(str::to_owned).ok_or_else(|| {
                    Error::config(format!("'extends' in {} must be a string", path.display()))
                })
            })
            .transpose()?;
        if let Some(parent) = parent {
            out = self.load_file(&relative_to(path, &parent))?;
        }

        self.inline_imports(path, &mut value)?;
        merge(&mut out, value);

        self.chain.pop();
        Ok(out)
    }

    fn inline_imports(&mut self, file: &Path, value: &mut Value) -> Result<()> {
        let Value::Table(tbl) = value else {
            return Ok(());
        };

        let imports = take_imports(file, tbl)?;
        if !imports.is_empty() {
            let mut acc = Value::Table(Default::default());
            for imp in imports {
                let loaded = self.load_file(&relative_to(file, &imp))?;
                merge(&mut acc, loaded);
            }
            merge(&mut acc, Value::Table(std::mem::take(tbl)));
            if let Value::Table(merged) = acc {
                *tbl = merged;
            }
        }

        for (_, child) in tbl.iter_mut() {
            self.inline_imports(file, child)?;
        }
        Ok(())
    }
}

fn take_imports(file: &Path, tbl: &mut toml::value::Table) -> Result<Vec<String>> {
    let Some(raw) = tbl.remove("imports") else {
        return Ok(Vec::new());
    };
    let Value::Array(items) = raw else {
        return Err(Error::config(format!(
            "'imports' in {} must be an array of strings",
            file.display()
        )));
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(s) = item.as_str() else {
            return Err(Error::config(format!(
                "invalid imports entry in {} (expected string)",
                file.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn relative_to(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extends_and_imports_merge_in_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::write(
            root.join("base.toml"),
            "[kernel]\narch = \"arm64\"\njobs = 4\n",
        )
        .expect("write base");
        fs::write(
            root.join("variants.toml"),
            "[a52sxqxx]\nfragment = \"a52sxq_eur_open.config\"\nrp_rev = \"SRPUE26A001\"\n",
        )
        .expect("write variants");
        fs::write(
            root.join("build.toml"),
            r#"
extends = "base.toml"

[kernel]
jobs = 8

[firmware.variants]
imports = ["variants.toml"]
"#,
        )
        .expect("write build");

        let doc = load(&root.join("build.toml")).expect("load");
        assert_eq!(
            doc.value_path("kernel.arch").and_then(Value::as_str),
            Some("arm64")
        );
        assert_eq!(
            doc.value_path("kernel.jobs").and_then(Value::as_integer),
            Some(8)
        );
        assert_eq!(
            doc.value_path("firmware.variants.a52sxqxx.rp_rev")
                .and_then(Value::as_str),
            Some("SRPUE26A001")
        );
        assert!(doc.value_path("extends").is_none());
    }

    #[test]
    fn detects_import_cycles() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::write(root.join("a.toml"), "extends = \"b.toml\"\n").expect("write a");
        fs::write(root.join("b.toml"), "extends = \"a.toml\"\n").expect("write b");

        let err = load(&root.join("a.toml")).expect_err("cycle");
        assert!(err.to_string().contains("import cycle"), "{err}");
    }

    #[test]
    fn set_path_creates_tables() {
        let mut doc = ConfigDoc::parse("<mem>", "[kernel]\narch = \"arm64\"\n").expect("doc");
        doc.set_path("kernel.clean", Value::Boolean(true))
            .expect("set");
        doc.set_path("firmware.steps.assemble.enabled", Value::Boolean(false))
            .expect("set nested");
        assert_eq!(
            doc.value_path("kernel.clean").and_then(Value::as_bool),
            Some(true)
        );
        assert!(doc.has_table_path("firmware.steps.assemble"));
        assert!(doc.set_path("kernel.arch.x", Value::Boolean(true)).is_err());
    }
}
