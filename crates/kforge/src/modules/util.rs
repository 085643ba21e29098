use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;

pub fn build_name(doc: &ConfigDoc) -> String {
    doc.path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("build")
        .to_string()
}

/// Scratch directory holding this build's state files (`variants.json`, build records).
pub fn run_dir(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<PathBuf> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    Ok(ws.run_dir(&build_name(doc)))
}

pub fn validate_rel_like_path(p: &str) -> Result<()> {
    let path = p.trim();
    if path.is_empty() {
        return Err(Error::config("path is empty"));
    }
    let pb = Path::new(path);
    if pb.is_absolute() || pb.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::config(format!(
            "path '{path}' must be relative and must not contain '..'"
        )));
    }
    Ok(())
}

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s).map_err(|e| Error::msg(format!("failed to write {}: {e}", p.display())))
}

pub fn write_json_pretty(p: &Path, v: &serde_json::Value) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
    write_text(p, &s)
}

pub fn read_json<T: serde::de::DeserializeOwned>(p: &Path) -> Result<T> {
    let raw = fs::read_to_string(p).map_err(|e| {
        Error::missing_input(format!("failed to read {}: {e}", p.display()))
    })?;
    serde_json::from_str(&raw)
        .map_err(|e| Error::msg(format!("invalid json in {}: {e}", p.display())))
}

pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    fs::copy(src, dst).map_err(|e| {
        Error::msg(format!(
            "failed to copy {} -> {}: {e}",
            src.display(),
            dst.display()
        ))
    })?;
    Ok(())
}

pub fn file_len(p: &Path) -> Result<u64> {
    fs::metadata(p)
        .map(|m| m.len())
        .map_err(|e| Error::missing_input(format!("failed to stat {}: {e}", p.display())))
}

pub fn sha256_file_hex(p: &Path) -> Result<String> {
    let mut f = fs::File::open(p)
        .map_err(|e| Error::missing_input(format!("failed to open {}: {e}", p.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", p.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(unix)]
pub fn set_mode(p: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(p, fs::Permissions::from_mode(mode))
        .map_err(|e| Error::msg(format!("failed to chmod {}: {e}", p.display())))
}

#[cfg(not(unix))]
pub fn set_mode(_p: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
