//! Verification metadata tooling (`avbtool`).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Command;

use regex::Regex;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;

/// Fields read back from a stock `vbmeta` image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbmetaInfo {
    pub algorithm: String,
    pub rollback_index: u64,
}

impl VbmetaInfo {
    /// RSA modulus size implied by the algorithm, e.g. 4096 for `SHA256_RSA4096`.
    pub fn key_bits(&self) -> Result<u32> {
        key_bits(&self.algorithm)
    }
}

pub fn key_bits(algorithm: &str) -> Result<u32> {
    let bits = algorithm
        .rsplit_once("_RSA")
        .and_then(|(_, b)| b.parse::<u32>().ok())
        .ok_or_else(|| {
            Error::config(format!(
                "unsupported verification algorithm '{algorithm}' (expected SHA256_RSA<bits> or SHA512_RSA<bits>)"
            ))
        })?;
    match bits {
        2048 | 4096 | 8192 => Ok(bits),
        _ => Err(Error::config(format!(
            "unsupported RSA key size {bits} in '{algorithm}'"
        ))),
    }
}

fn first_field(text: &str, field: &str) -> Result<Option<String>> {
    let re = Regex::new(&format!(r"(?m)^\s*{}:\s*(\S+)", regex::escape(field)))
        .map_err(|e| Error::msg(format!("invalid field pattern for '{field}': {e}")))?;
    Ok(re.captures(text).map(|c| c[1].to_string()))
}

/// Parse `info_image` output. Only the first `Algorithm:` and `Rollback Index:`
/// lines count; later ones belong to chained descriptors.
pub fn parse_info(text: &str) -> Result<VbmetaInfo> {
    let algorithm = first_field(text, "Algorithm")?
        .ok_or_else(|| Error::parse("info_image output has no 'Algorithm:' line"))?;
    let raw_index = first_field(text, "Rollback Index")?
        .ok_or_else(|| Error::parse("info_image output has no 'Rollback Index:' line"))?;
    let rollback_index = raw_index.parse::<u64>().map_err(|_| {
        Error::parse(format!("unparseable rollback index '{raw_index}'"))
    })?;
    Ok(VbmetaInfo {
        algorithm,
        rollback_index,
    })
}

#[derive(Debug, Clone)]
pub struct HashFooter<'a> {
    pub image: &'a Path,
    pub partition_name: &'a str,
    pub partition_size: u64,
    pub key: &'a Path,
    pub algorithm: &'a str,
    pub salt_hex: &'a str,
}

#[derive(Debug, Clone)]
pub struct VbmetaImage<'a> {
    pub output: &'a Path,
    pub key: &'a Path,
    pub algorithm: &'a str,
    pub rollback_index: u64,
    pub flags: u32,
    pub include_descriptors_from: &'a [PathBuf],
}

/// Operations kforge needs from the verification tool.
/// Size of the trailer avbtool appends to a footered partition image.
pub const FOOTER_SIZE: u64 = 64;
const FOOTER_MAGIC: &[u8; 4] = b"AVBf";

/// Whether `image` ends with a verification footer, read straight from the bytes.
pub fn has_footer(image: &Path) -> Result<bool> {
    let mut f = File::open(image)
        .map_err(|e| Error::missing_input(format!("failed to open {}: {e}", image.display())))?;
    let len = f
        .metadata()
        .map_err(|e| Error::msg(format!("failed to stat {}: {e}", image.display())))?
        .len();
    if len < FOOTER_SIZE {
        return Ok(false);
    }
    let mut magic = [0u8; 4];
    f.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))
        .and_then(|_| f.read_exact(&mut magic))
        .map_err(|e| Error::msg(format!("failed to read footer of {}: {e}", image.display())))?;
    Ok(&magic == FOOTER_MAGIC)
}

pub trait VerificationTool {
    /// Raw `info_image` text.
    fn info_image(&self, ctx: &ExecCtx, image: &Path) -> Result<String>;
    /// Remove a verification footer if the image carries one.
    fn erase_footer(&self, ctx: &ExecCtx, image: &Path) -> Result<()>;
    fn add_hash_footer(&self, ctx: &ExecCtx, req: &HashFooter<'_>) -> Result<()>;
    fn make_vbmeta_image(&self, ctx: &ExecCtx, req: &VbmetaImage<'_>) -> Result<()>;
    fn extract_public_key(&self, ctx: &ExecCtx, key: &Path, out: &Path) -> Result<()>;

    fn inspect(&self, ctx: &ExecCtx, image: &Path) -> Result<VbmetaInfo> {
        let text = self.info_image(ctx, image)?;
        parse_info(&text).map_err(|e| e.context(image.display()))
    }
}

/// `avbtool` invoked as an external command.
#[derive(Debug, Clone)]
pub struct Avbtool {
    program: PathBuf,
}

impl Avbtool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn cmd(&self, sub: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(sub);
        cmd
    }
}

impl VerificationTool for Avbtool {
    fn info_image(&self, ctx: &ExecCtx, image: &Path) -> Result<String> {
        let mut cmd = self.cmd("info_image");
        cmd.arg("--image").arg(image);
        ctx.run_cmd_capture(cmd)
    }

    fn erase_footer(&self, ctx: &ExecCtx, image: &Path) -> Result<()> {
        if !has_footer(image)? {
            ctx.log(&format!("no verification footer on {}", image.display()));
            return Ok(());
        }
        let mut cmd = self.cmd("erase_footer");
        cmd.arg("--image").arg(image);
        ctx.run_cmd(cmd)
    }

    fn add_hash_footer(&self, ctx: &ExecCtx, req: &HashFooter<'_>) -> Result<()> {
        let mut cmd = self.cmd("add_hash_footer");
        cmd.arg("--image")
            .arg(req.image)
            .arg("--partition_name")
            .arg(req.partition_name)
            .arg("--partition_size")
            .arg(req.partition_size.to_string())
            .arg("--key")
            .arg(req.key)
            .arg("--algorithm")
            .arg(req.algorithm)
            .arg("--salt")
            .arg(req.salt_hex);
        ctx.run_cmd(cmd)
    }

    fn make_vbmeta_image(&self, ctx: &ExecCtx, req: &VbmetaImage<'_>) -> Result<()> {
        let mut cmd = self.cmd("make_vbmeta_image");
        cmd.arg("--output")
            .arg(req.output)
            .arg("--key")
            .arg(req.key)
            .arg("--algorithm")
            .arg(req.algorithm)
            .arg("--rollback_index")
            .arg(req.rollback_index.to_string())
            .arg("--flags")
            .arg(req.flags.to_string());
        for image in req.include_descriptors_from {
            cmd.arg("--include_descriptors_from_image").arg(image);
        }
        ctx.run_cmd(cmd)
    }

    fn extract_public_key(&self, ctx: &ExecCtx, key: &Path, out: &Path) -> Result<()> {
        let mut cmd = self.cmd("extract_public_key");
        cmd.arg("--key").arg(key).arg("--output").arg(out);
        ctx.run_cmd(cmd)
    }
}
