use std::fs;
use std::io::{BufRead, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use kforge_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::modules::util;
use crate::tools::{self, ToolsConfig};
use crate::{Error, ErrorKind, Result};

pub const RECORD_FILE: &str = "toolchain.json";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Where a prepared (or downloaded) toolchain lives.
    pub local_dir: String,
    /// Environment variable naming an Android NDK install.
    pub sdk_env: String,
    pub url: String,
    /// Expected SHA-256 of the archive at `url`.
    pub sha256: Option<String>,
    pub allow_download: bool,
    /// Ask on an interactive terminal before downloading.
    pub prompt: bool,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            local_dir: "toolchain".into(),
            sdk_env: "ANDROID_NDK_HOME".into(),
            url: "https://android.googlesource.com/platform/prebuilts/clang/host/linux-x86/+archive/refs/heads/main/clang-r510928.tar.gz".into(),
            sha256: None,
            allow_download: false,
            prompt: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ToolchainSource {
    /// A toolchain already prepared at the configured local path.
    Local { root: PathBuf },
    /// The LLVM prebuilt shipped inside an NDK install.
    Sdk { root: PathBuf },
    /// Nothing usable on disk; fetch an archive and unpack it into `dest`.
    Download { dest: PathBuf },
}

impl ToolchainSource {
    pub fn root(&self) -> &Path {
        match self {
            ToolchainSource::Local { root } | ToolchainSource::Sdk { root } => root,
            ToolchainSource::Download { dest } => dest,
        }
    }
}

pub trait PathProbe {
    fn is_file(&self, p: &Path) -> bool;
}

pub struct FsProbe;

impl PathProbe for FsProbe {
    fn is_file(&self, p: &Path) -> bool {
        p.is_file()
    }
}

/// Host directory name used by NDK prebuilts.
pub fn host_tag() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin-x86_64",
        "windows" => "windows-x86_64",
        _ => "linux-x86_64",
    }
}

fn clang_in(root: &Path) -> PathBuf {
    root.join("bin").join("clang")
}

/// Pick a toolchain: a prepared local copy first, then the NDK, then a download
/// into `local_hint` when allowed. A directory without `bin/clang` does not count.
pub fn resolve_toolchain(
    local_hint: &Path,
    sdk_root: Option<&Path>,
    allow_download: bool,
    probe: &dyn PathProbe,
) -> Result<ToolchainSource> {
    if probe.is_file(&clang_in(local_hint)) {
        return Ok(ToolchainSource::Local {
            root: local_hint.to_path_buf(),
        });
    }
    if let Some(sdk) = sdk_root {
        let prebuilt = sdk
            .join("toolchains")
            .join("llvm")
            .join("prebuilt")
            .join(host_tag());
        if probe.is_file(&clang_in(&prebuilt)) {
            return Ok(ToolchainSource::Sdk { root: prebuilt });
        }
    }
    if allow_download {
        return Ok(ToolchainSource::Download {
            dest: local_hint.to_path_buf(),
        });
    }
    Err(Error::missing_tool(format!(
        "no clang toolchain found (looked for {} and the NDK prebuilt); set the NDK env var, prepare the local path, or rerun with --allow-download",
        clang_in(local_hint).display()
    )))
}

/// What kernel.compile needs to know about the chosen toolchain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainRecord {
    #[serde(flatten)]
    pub source: ToolchainSource,
    pub bin_dir: PathBuf,
}

pub fn record_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RECORD_FILE)
}

#[Task(
    id = "toolchain.resolve",
    module = "toolchain",
    phase = "prepare",
    provides = ["toolchain:ready"],
    after = ["core.init", "preflight:tools?"],
    default_label = "Resolve toolchain",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolveTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ResolveTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ResolveTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let tc: ToolchainConfig = doc.section("toolchain")?;
        let local = ws.resolve_config_path(&tc.local_dir)?;
        let sdk_root = std::env::var_os(&tc.sdk_env)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        ctx.log(&format!("toolchain.local_dir = {}", local.display()));
        if let Some(sdk) = sdk_root.as_ref() {
            ctx.log(&format!("{} = {}", tc.sdk_env, sdk.display()));
        }

        let source = match resolve_toolchain(&local, sdk_root.as_deref(), tc.allow_download, &FsProbe) {
            Ok(found) => found,
            Err(e) if e.kind() == ErrorKind::MissingTool && tc.prompt => {
                if !ask_download(&tc.url)? {
                    return Err(e);
                }
                resolve_toolchain(&local, sdk_root.as_deref(), true, &FsProbe)?
            }
            Err(e) => return Err(e),
        };

        let source = match source {
            ToolchainSource::Download { dest } => {
                download_toolchain(doc, ctx, &tc, &dest)?;
                // The archive must have produced a usable toolchain.
                match resolve_toolchain(&dest, None, false, &FsProbe) {
                    Ok(found) => found,
                    Err(_) => {
                        return Err(Error::missing_tool(format!(
                            "downloaded toolchain has no {}",
                            clang_in(&dest).display()
                        )));
                    }
                }
            }
            found => found,
        };

        let bin_dir = source.root().join("bin");
        ctx.log(&format!("toolchain bin = {}", bin_dir.display()));
        let record = ToolchainRecord { source, bin_dir };
        let run_dir = util::run_dir(doc, ctx)?;
        util::write_json_pretty(&record_path(&run_dir), &serde_json::to_value(&record)?)
    }
}

fn ask_download(url: &str) -> Result<bool> {
    if !std::io::stdin().is_terminal() {
        return Ok(false);
    }
    print!("No clang toolchain found. Download {url}? [y/N] ");
    std::io::stdout()
        .flush()
        .map_err(|e| Error::msg(format!("stdout flush failed: {e}")))?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .map_err(|e| Error::msg(format!("failed to read answer: {e}")))?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "YES"))
}

fn download_toolchain(
    doc: &ConfigDoc,
    ctx: &mut ExecCtx,
    tc: &ToolchainConfig,
    dest: &Path,
) -> Result<()> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    let tools = ToolsConfig::load(doc)?;
    let archive_name = tc
        .url
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("toolchain.tar.gz");
    let archive = ws.build_dir.join("downloads").join(archive_name);
    util::ensure_dir(archive.parent().unwrap_or(&ws.build_dir))?;

    let want = tc
        .sha256
        .as_deref()
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty());
    let reusable = archive.is_file()
        && match want.as_deref() {
            Some(w) => util::sha256_file_hex(&archive)? == w,
            None => false,
        };
    if reusable {
        ctx.log(&format!("reusing verified archive {}", archive.display()));
    } else {
        ctx.log(&format!("downloading {}", tc.url));
        let got = fetch_to_file(&tc.url, &archive)?;
        if let Some(w) = want.as_deref()
            && got != w
        {
            let _ = fs::remove_file(&archive);
            return Err(Error::tool_failed(format!(
                "toolchain archive checksum mismatch: expected {w}, got {got}"
            )));
        }
        ctx.log(&format!("sha256 {got}"));
    }

    util::ensure_dir(dest)?;
    let mut cmd = Command::new(tools::locate(&tools.tar)?);
    cmd.arg("-xf").arg(&archive).arg("-C").arg(dest);
    ctx.run_cmd(cmd)
}

/// Stream `url` into `out`, returning the body's SHA-256.
fn fetch_to_file(url: &str, out: &Path) -> Result<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(1800))
        .build()
        .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
    let mut res = client
        .get(url)
        .send()
        .map_err(|e| Error::tool_failed(format!("toolchain download failed: {e}")))?;
    if !res.status().is_success() {
        return Err(Error::tool_failed(format!(
            "toolchain download failed with status {}",
            res.status()
        )));
    }

    let partial = out.with_extension("part");
    let mut f = fs::File::create(&partial)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", partial.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = res
            .read(&mut buf)
            .map_err(|e| Error::tool_failed(format!("toolchain download interrupted: {e}")))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        f.write_all(&buf[..n])
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", partial.display())))?;
    }
    fs::rename(&partial, out)
        .map_err(|e| Error::msg(format!("failed to move {}: {e}", partial.display())))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Toolchain recorded by `toolchain.resolve` in this run, if that task ran.
pub fn load_record(run_dir: &Path) -> Result<Option<ToolchainRecord>> {
    let p = record_path(run_dir);
    if !p.exists() {
        return Ok(None);
    }
    util::read_json(&p).map(Some)
}

#[Module(
    id = "toolchain",
    config = ToolchainConfig,
    tasks = [ResolveTask]
)]
pub struct ToolchainModule;

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    struct FakeProbe(BTreeSet<PathBuf>);

    impl FakeProbe {
        fn with(files: &[&str]) -> Self {
            Self(files.iter().map(PathBuf::from).collect())
        }
    }

    impl PathProbe for FakeProbe {
        fn is_file(&self, p: &Path) -> bool {
            self.0.contains(p)
        }
    }

    fn ndk_clang() -> String {
        format!("/ndk/toolchains/llvm/prebuilt/{}/bin/clang", host_tag())
    }

    #[test]
    fn local_toolchain_wins_over_sdk() {
        let probe = FakeProbe::with(&["/ws/toolchain/bin/clang", ndk_clang().as_str()]);
        let got = resolve_toolchain(Path::new("/ws/toolchain"), Some(Path::new("/ndk")), false, &probe)
            .expect("resolve");
        assert_eq!(
            got,
            ToolchainSource::Local {
                root: PathBuf::from("/ws/toolchain")
            }
        );
    }

    #[test]
    fn sdk_prebuilt_needs_the_compiler_binary() {
        let probe = FakeProbe::with(&[ndk_clang().as_str()]);
        let got = resolve_toolchain(Path::new("/ws/toolchain"), Some(Path::new("/ndk")), false, &probe)
            .expect("resolve");
        assert!(matches!(got, ToolchainSource::Sdk { .. }));
        assert_eq!(got.root().join("bin/clang"), PathBuf::from(ndk_clang()));

        // The prebuilt directory alone is not enough.
        let empty = FakeProbe::with(&[]);
        let err = resolve_toolchain(Path::new("/ws/toolchain"), Some(Path::new("/ndk")), false, &empty)
            .expect_err("no clang");
        assert_eq!(err.kind(), ErrorKind::MissingTool);
    }

    #[test]
    fn download_only_when_allowed() {
        let probe = FakeProbe::with(&[]);
        let got = resolve_toolchain(Path::new("/ws/toolchain"), None, true, &probe).expect("resolve");
        assert_eq!(
            got,
            ToolchainSource::Download {
                dest: PathBuf::from("/ws/toolchain")
            }
        );
        assert!(resolve_toolchain(Path::new("/ws/toolchain"), None, false, &probe).is_err());
    }
}
