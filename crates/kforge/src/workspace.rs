use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CleanMode {
    #[default]
    None,
    Build,
    Out,
    All,
}

impl CleanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CleanMode::None => "none",
            CleanMode::Build => "build",
            CleanMode::Out => "out",
            CleanMode::All => "all",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub root_dir: String,
    /// Scratch space: kernel objects, staging dirs, run state.
    pub build_dir: String,
    /// Deliverables: one subdirectory per variant plus module packages.
    pub out_dir: String,
    pub paths: BTreeMap<String, String>,
    pub clean: CleanMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: ".".into(),
            build_dir: "build".into(),
            out_dir: "builds".into(),
            paths: BTreeMap::new(),
            clean: CleanMode::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    pub out_dir: PathBuf,
    pub named_dirs: BTreeMap<String, PathBuf>,
}

impl WorkspacePaths {
    // Resolve a user-configured path:
    // - `@alias/...` expands from `[workspace.paths]` (plus built-in root/build/out)
    // - absolute paths are used as-is
    // - relative paths are rooted at workspace root
    pub fn resolve_config_path(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::config("empty path"));
        }

        let Some(after_at) = raw.strip_prefix('@') else {
            let pb = PathBuf::from(raw);
            return Ok(if pb.is_absolute() {
                pb
            } else {
                self.root.join(pb)
            });
        };

        let (alias, rest) = match after_at.split_once('/') {
            Some((a, r)) => (a.trim(), r),
            None => (after_at.trim(), ""),
        };
        let base = self.named_dirs.get(alias).ok_or_else(|| {
            let known = self
                .named_dirs
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            Error::config(format!(
                "unknown workspace path alias '{alias}' in '{raw}' (known: {known})"
            ))
        })?;
        Ok(if rest.is_empty() {
            base.clone()
        } else {
            base.join(rest)
        })
    }

    /// Per-build scratch directory for run state (`variants.json`, build records).
    pub fn run_dir(&self, build: &str) -> PathBuf {
        self.build_dir.join("runs").join(build)
    }

    /// An empty staging directory owned by one scope (e.g. `["a52sxqxx", "boot"]`).
    /// Whatever a previous stage or variant left there is removed first.
    pub fn fresh_staging(&self, scope: &[&str]) -> Result<PathBuf> {
        let mut dir = self.build_dir.join("staging");
        for seg in scope {
            validate_segment(seg)?;
            dir = dir.join(seg);
        }
        safe_remove_dir_all(&self.root, &dir)?;
        fs::create_dir_all(&dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
        Ok(dir)
    }
}

pub fn load_paths(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    let root = join_user_path(&cwd, &cfg.root_dir)?;
    let build_dir = workspace_dir(&root, &cfg.build_dir)?;
    let out_dir = workspace_dir(&root, &cfg.out_dir)?;

    let mut named_dirs = BTreeMap::new();
    named_dirs.insert("root".to_string(), root.clone());
    named_dirs.insert("build".to_string(), build_dir.clone());
    named_dirs.insert("out".to_string(), out_dir.clone());
    for (name, raw) in &cfg.paths {
        let key = name.trim();
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::config(format!(
                "workspace.paths key '{key}' is invalid (allowed: a-zA-Z0-9_-)"
            )));
        }
        if named_dirs.contains_key(key) {
            return Err(Error::config(format!(
                "workspace.paths key '{key}' is reserved"
            )));
        }
        named_dirs.insert(key.to_string(), join_user_path(&root, raw)?);
    }

    Ok(WorkspacePaths {
        root,
        build_dir,
        out_dir,
        named_dirs,
    })
}

pub fn init_dirs(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let paths = load_paths(cfg)?;

    if matches!(cfg.clean, CleanMode::Build | CleanMode::All) {
        safe_remove_dir_all(&paths.root, &paths.build_dir)?;
    }
    if matches!(cfg.clean, CleanMode::Out | CleanMode::All) {
        safe_remove_dir_all(&paths.root, &paths.out_dir)?;
    }

    for dir in [&paths.build_dir, &paths.out_dir] {
        fs::create_dir_all(dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
    }
    Ok(paths)
}

fn workspace_dir(root: &Path, p: &str) -> Result<PathBuf> {
    if Path::new(p.trim())
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::config(format!(
            "invalid workspace dir '{p}' (contains '..')"
        )));
    }
    join_user_path(root, p)
}

fn join_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn validate_segment(seg: &str) -> Result<()> {
    if seg.is_empty() || seg == "." || seg == ".." || seg.contains('/') || seg.contains('\\') {
        return Err(Error::config(format!("invalid staging scope segment '{seg}'")));
    }
    Ok(())
}

pub fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (outside workspace root '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove dir {}: {e}", dir_can.display())))
}
