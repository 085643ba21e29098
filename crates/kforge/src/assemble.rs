//! Partition image assembly: unpack a stock image, swap selected entries, repack.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::tools::avbtool::VerificationTool;
use crate::tools::magiskboot::ImageTool;

/// Name of the header text entry produced by `unpack -h`.
pub const HEADER_ENTRY: &str = "header";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Splice {
    /// Replace the unpacked entry `name` with the file at `payload`.
    Entry { name: String, payload: PathBuf },
    /// Rewrite the first line of the header entry as `key=value`.
    HeaderField { key: String, value: String },
}

impl Splice {
    pub fn entry(name: impl Into<String>, payload: impl Into<PathBuf>) -> Self {
        Splice::Entry {
            name: name.into(),
            payload: payload.into(),
        }
    }

    pub fn header(key: impl Into<String>, value: impl Into<String>) -> Self {
        Splice::HeaderField {
            key: key.into(),
            value: value.into(),
        }
    }

    fn target(&self) -> &str {
        match self {
            Splice::Entry { name, .. } => name,
            Splice::HeaderField { .. } => HEADER_ENTRY,
        }
    }
}

pub struct Assembler<'a> {
    pub images: &'a dyn ImageTool,
    pub footers: &'a dyn VerificationTool,
}

impl Assembler<'_> {
    /// Build a new image from `stock` inside `staging` (which must be empty and
    /// private to this image). Entries without a splice are carried over as
    /// unpacked. Returns the path of the repacked image inside `staging`.
    pub fn assemble(
        &self,
        ctx: &ExecCtx,
        stock: &Path,
        splices: &[Splice],
        staging: &Path,
    ) -> Result<PathBuf> {
        let mut seen = std::collections::BTreeSet::new();
        for s in splices {
            if !seen.insert(s.target()) {
                return Err(Error::config(format!(
                    "entry '{}' is spliced more than once",
                    s.target()
                )));
            }
        }

        let file_name = stock
            .file_name()
            .ok_or_else(|| Error::msg(format!("invalid image path {}", stock.display())))?;
        let original = staging.join(file_name);
        fs::copy(stock, &original).map_err(|e| {
            Error::missing_input(format!("failed to copy {}: {e}", stock.display()))
        })?;

        self.footers.erase_footer(ctx, &original)?;

        let with_header = splices
            .iter()
            .any(|s| matches!(s, Splice::HeaderField { .. }));
        self.images.unpack(ctx, &original, staging, with_header)?;

        for splice in splices {
            apply_splice(staging, splice)?;
        }

        self.images.repack(ctx, &original, staging)
    }
}

fn apply_splice(dir: &Path, splice: &Splice) -> Result<()> {
    match splice {
        Splice::Entry { name, payload } => {
            let target = dir.join(name);
            if !target.is_file() {
                return Err(Error::tool_failed(format!(
                    "unpacked image has no '{name}' entry to replace"
                )));
            }
            fs::copy(payload, &target).map_err(|e| {
                Error::missing_input(format!(
                    "failed to copy {} into '{name}': {e}",
                    payload.display()
                ))
            })?;
            Ok(())
        }
        Splice::HeaderField { key, value } => {
            let target = dir.join(HEADER_ENTRY);
            let raw = fs::read_to_string(&target).map_err(|e| {
                Error::tool_failed(format!("unpacked image has no readable header: {e}"))
            })?;
            fs::write(&target, rewrite_first_line(&raw, &format!("{key}={value}")))
                .map_err(|e| Error::msg(format!("failed to write {}: {e}", target.display())))
        }
    }
}

/// Replace the first line of `text`, keeping every following line byte-for-byte.
pub fn rewrite_first_line(text: &str, line: &str) -> String {
    match text.split_once('\n') {
        Some((_, rest)) => format!("{line}\n{rest}"),
        None => format!("{line}\n"),
    }
}
