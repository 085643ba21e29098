//! Boot image (un)packing via `magiskboot`.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;

/// Unpacks a partition image into named entries in a directory and packs them back.
pub trait ImageTool {
    /// Unpack `image` into `dir`. With `header`, the image header is also
    /// written as an editable `header` text entry.
    fn unpack(&self, ctx: &ExecCtx, image: &Path, dir: &Path, header: bool) -> Result<()>;

    /// Repack the entries in `dir` using `original` as the layout template and
    /// return the path of the new image.
    fn repack(&self, ctx: &ExecCtx, original: &Path, dir: &Path) -> Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct Magiskboot {
    program: PathBuf,
}

impl Magiskboot {
    /// magiskboot writes its repack result here, relative to the working dir.
    pub const REPACK_OUTPUT: &'static str = "new-boot.img";

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ImageTool for Magiskboot {
    fn unpack(&self, ctx: &ExecCtx, image: &Path, dir: &Path, header: bool) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(dir).arg("unpack");
        if header {
            cmd.arg("-h");
        }
        cmd.arg(image);
        ctx.run_cmd(cmd)
    }

    fn repack(&self, ctx: &ExecCtx, original: &Path, dir: &Path) -> Result<PathBuf> {
        let out = dir.join(Self::REPACK_OUTPUT);
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(dir).arg("repack").arg(original).arg(&out);
        ctx.run_cmd(cmd)?;
        if !out.is_file() {
            return Err(Error::tool_failed(format!(
                "magiskboot repack produced no image at {}",
                out.display()
            )));
        }
        Ok(out)
    }
}
