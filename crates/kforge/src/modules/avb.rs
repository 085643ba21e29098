use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use kforge_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::modules::firmware::FirmwareConfig;
use crate::modules::util;
use crate::tools::avbtool::{Avbtool, HashFooter, VbmetaImage, VerificationTool, key_bits};
use crate::tools::{self, ToolsConfig};
use crate::variant::{SkipReason, VariantLedger, VariantRecord, VariantState, for_each_variant};
use crate::{Error, Result};

/// Partitions whose rebuilt images get hash footers, in descriptor order.
pub const SIGNED_PARTITIONS: [&str; 3] = ["boot", "vendor_boot", "dtbo"];
pub const PUBKEY_FILE: &str = "vbmeta_pubkey.bin";

fn default_true() -> bool {
    true
}

fn default_flags() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AvbConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub key_dir: String,
    /// Overrides the algorithm read from the stock image.
    pub algorithm: Option<String>,
    /// vbmeta header flags; 2 disables verification.
    #[serde(default = "default_flags")]
    pub flags: u32,
    /// Re-sign images left in the output directory by an earlier run.
    pub reuse_previous: bool,
}

impl Default for AvbConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_dir: "@out/keys".into(),
            algorithm: None,
            flags: default_flags(),
            reuse_previous: false,
        }
    }
}

/// Salt for a partition's hash descriptor. Derived from the stock image so
/// identical inputs always produce identical descriptors.
pub fn footer_salt(partition: &str, stock_digest_hex: &str) -> String {
    let mut h = Sha256::new();
    h.update(partition.as_bytes());
    h.update(stock_digest_hex.as_bytes());
    hex::encode(h.finalize())
}

pub fn key_path(key_dir: &Path, bits: u32) -> PathBuf {
    key_dir.join(format!("avb_rsa{bits}.pem"))
}

/// Return the signing key for `bits`, generating it with openssl only when it
/// does not exist yet.
pub fn ensure_key(ctx: &ExecCtx, openssl: &str, key_dir: &Path, bits: u32) -> Result<PathBuf> {
    let key = key_path(key_dir, bits);
    if key.is_file() {
        ctx.log(&format!("reusing signing key {}", key.display()));
        return Ok(key);
    }
    util::ensure_dir(key_dir)?;
    ctx.log(&format!("generating {bits}-bit signing key {}", key.display()));
    let mut cmd = Command::new(tools::locate(openssl)?);
    cmd.arg("genrsa").arg("-out").arg(&key).arg(bits.to_string());
    ctx.run_cmd(cmd)?;
    if !key.is_file() {
        return Err(Error::tool_failed(format!(
            "openssl genrsa did not write {}",
            key.display()
        )));
    }
    util::set_mode(&key, 0o600)?;
    Ok(key)
}

/// Inputs for re-signing one variant.
pub struct SignJob<'a> {
    pub stock_dir: &'a Path,
    pub out_dir: &'a Path,
    pub key_dir: &'a Path,
    pub openssl: &'a str,
    pub algorithm_override: Option<&'a str>,
    pub flags: u32,
}

/// Footer the rebuilt images in `job.out_dir` and regenerate `vbmeta.img` next
/// to them, advancing `rec` through `Footered` to `MetadataRebuilt`.
pub fn sign_variant(
    ctx: &ExecCtx,
    avb: &dyn VerificationTool,
    job: &SignJob<'_>,
    rec: &mut VariantRecord,
) -> Result<()> {
    let stock_vbmeta = job.stock_dir.join("vbmeta.img");
    let info = avb.inspect(ctx, &stock_vbmeta)?;
    let algorithm = job
        .algorithm_override
        .map(str::to_string)
        .unwrap_or_else(|| info.algorithm.clone());
    if algorithm.eq_ignore_ascii_case("NONE") {
        return Err(Error::config(format!(
            "{} is unsigned (Algorithm: NONE); refusing to rebuild it",
            stock_vbmeta.display()
        )));
    }
    ctx.log(&format!(
        "stock vbmeta: algorithm {algorithm}, rollback index {}",
        info.rollback_index
    ));
    let key = ensure_key(ctx, job.openssl, job.key_dir, key_bits(&algorithm)?)?;

    let mut footered = Vec::with_capacity(SIGNED_PARTITIONS.len());
    for part in SIGNED_PARTITIONS {
        let file = format!("{part}.img");
        let stock = job.stock_dir.join(&file);
        let image = job.out_dir.join(&file);
        if !image.is_file() {
            return Err(Error::missing_input(format!(
                "rebuilt image {} not found",
                image.display()
            )));
        }
        let partition_size = util::file_len(&stock)?;
        let salt = footer_salt(part, &util::sha256_file_hex(&stock)?);

        // A footer from an earlier signing pass would make the image grow.
        avb.erase_footer(ctx, &image)?;
        avb.add_hash_footer(
            ctx,
            &HashFooter {
                image: &image,
                partition_name: part,
                partition_size,
                key: &key,
                algorithm: &algorithm,
                salt_hex: &salt,
            },
        )?;
        footered.push(image);
    }
    rec.advance(VariantState::Footered)?;

    let output = job.out_dir.join("vbmeta.img");
    avb.make_vbmeta_image(
        ctx,
        &VbmetaImage {
            output: &output,
            key: &key,
            algorithm: &algorithm,
            rollback_index: info.rollback_index,
            flags: job.flags,
            include_descriptors_from: &footered,
        },
    )?;
    avb.extract_public_key(ctx, &key, &job.out_dir.join(PUBKEY_FILE))?;
    ctx.log(&format!("vbmeta rebuilt: {}", output.display()));
    rec.advance(VariantState::MetadataRebuilt)
}

fn missing_rebuilt_images(out_dir: &Path) -> Vec<String> {
    SIGNED_PARTITIONS
        .iter()
        .map(|p| format!("{p}.img"))
        .filter(|f| !out_dir.join(f).is_file())
        .collect()
}

#[Task(
    id = "avb.sign",
    module = "avb",
    phase = "sign",
    provides = ["avb:signed"],
    after = ["firmware.discover", "firmware:assembled?"],
    default_label = "Rebuild vbmeta",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for SignTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl SignTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let cfg: AvbConfig = doc.section("avb")?;
        let fw = FirmwareConfig::load(doc)?;
        let tools_cfg = ToolsConfig::load(doc)?;
        let run_dir = util::run_dir(doc, ctx)?;
        let mut ledger = VariantLedger::load(&run_dir)?;
        let key_dir = ws.resolve_config_path(&cfg.key_dir)?;
        let avb = Avbtool::new(tools::locate(&tools_cfg.avbtool)?);

        let from: &[&str] = if cfg.reuse_previous {
            &["assembled", "validated"]
        } else {
            &["assembled"]
        };
        let n = for_each_variant(
            ctx,
            &mut ledger,
            &run_dir,
            Self::ID,
            from,
            fw.fail_fast,
            |ctx, rec| {
                let out_dir = fw.variant_out_dir(&ws, &rec.name)?;
                if matches!(rec.state, VariantState::Validated) {
                    let missing = missing_rebuilt_images(&out_dir);
                    if !missing.is_empty() {
                        let reason = SkipReason::NoPriorBuild { missing };
                        ctx.warn(&format!("skipping variant '{}': {reason}", rec.name));
                        return rec.advance(VariantState::Skipped { reason });
                    }
                    ctx.log(&format!("re-signing images in {}", out_dir.display()));
                    rec.advance(VariantState::Assembled)?;
                }
                let stock_dir = rec.firmware_dir.clone();
                let job = SignJob {
                    stock_dir: &stock_dir,
                    out_dir: &out_dir,
                    key_dir: &key_dir,
                    openssl: &tools_cfg.openssl,
                    algorithm_override: cfg.algorithm.as_deref(),
                    flags: cfg.flags,
                };
                sign_variant(ctx, &avb, &job, rec)
            },
        )?;
        if n == 0 {
            ctx.warn("no assembled variants to sign");
        }
        Ok(())
    }
}

#[Module(id = "avb", config = AvbConfig, tasks = [SignTask])]
pub struct AvbModule;

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fs;
    use std::sync::Arc;

    use super::*;
    use crate::executor::RecordingSink;

    /// Records calls and appends a marker instead of a real footer.
    struct FakeAvb {
        info: String,
        calls: RefCell<Vec<String>>,
    }

    impl FakeAvb {
        fn new(algorithm: &str, rollback: u64) -> Self {
            Self {
                info: format!("Algorithm:                {algorithm}\nRollback Index:           {rollback}\n"),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl VerificationTool for FakeAvb {
        fn info_image(&self, _: &ExecCtx, _: &Path) -> Result<String> {
            Ok(self.info.clone())
        }
        fn erase_footer(&self, _: &ExecCtx, image: &Path) -> Result<()> {
            let raw = fs::read_to_string(image)?;
            let kept = raw.split("|footer").next().unwrap_or_default().to_string();
            fs::write(image, kept)?;
            Ok(())
        }
        fn add_hash_footer(&self, _: &ExecCtx, req: &HashFooter<'_>) -> Result<()> {
            let mut raw = fs::read_to_string(req.image)?;
            raw.push_str(&format!("|footer {} {} {}", req.partition_name, req.partition_size, req.salt_hex));
            fs::write(req.image, raw)?;
            self.calls
                .borrow_mut()
                .push(format!("footer {} {}", req.partition_name, req.salt_hex));
            Ok(())
        }
        fn make_vbmeta_image(&self, _: &ExecCtx, req: &VbmetaImage<'_>) -> Result<()> {
            let mut body = format!("vbmeta {} {} {}\n", req.algorithm, req.rollback_index, req.flags);
            for img in req.include_descriptors_from {
                body.push_str(&fs::read_to_string(img)?);
                body.push('\n');
            }
            fs::write(req.output, body)?;
            self.calls.borrow_mut().push("vbmeta".into());
            Ok(())
        }
        fn extract_public_key(&self, _: &ExecCtx, key: &Path, out: &Path) -> Result<()> {
            fs::copy(key, out)?;
            Ok(())
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        stock: PathBuf,
        out: PathBuf,
        keys: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().expect("tempdir");
        let stock = tmp.path().join("firmware/a52sxqxx");
        let out = tmp.path().join("builds/a52sxqxx");
        let keys = tmp.path().join("builds/keys");
        for d in [&stock, &out, &keys] {
            fs::create_dir_all(d).expect("mkdir");
        }
        for p in SIGNED_PARTITIONS {
            fs::write(stock.join(format!("{p}.img")), format!("stock-{p}-padded")).expect("stock");
            fs::write(out.join(format!("{p}.img")), format!("new-{p}")).expect("rebuilt");
        }
        fs::write(stock.join("vbmeta.img"), "stock-vbmeta").expect("vbmeta");
        // Pre-existing key: openssl must never be invoked.
        fs::write(key_path(&keys, 4096), "EXISTING KEY").expect("key");
        Fixture {
            _tmp: tmp,
            stock,
            out,
            keys,
        }
    }

    fn record(stock: &Path) -> VariantRecord {
        VariantRecord {
            name: "a52sxqxx".into(),
            firmware_dir: stock.to_path_buf(),
            profile: None,
            state: VariantState::Assembled,
        }
    }

    fn sign(fx: &Fixture, avb: &FakeAvb) -> VariantRecord {
        let ctx = ExecCtx::new(false, Arc::new(RecordingSink::default()));
        let job = SignJob {
            stock_dir: &fx.stock,
            out_dir: &fx.out,
            key_dir: &fx.keys,
            openssl: "openssl-not-installed-for-tests",
            algorithm_override: None,
            flags: 2,
        };
        let mut rec = record(&fx.stock);
        sign_variant(&ctx, avb, &job, &mut rec).expect("sign");
        rec
    }

    #[test]
    fn rebuilds_vbmeta_with_stock_rollback_index_and_existing_key() {
        let fx = fixture();
        let avb = FakeAvb::new("SHA256_RSA4096", 7);
        let rec = sign(&fx, &avb);

        assert_eq!(rec.state, VariantState::MetadataRebuilt);
        let vbmeta = fs::read_to_string(fx.out.join("vbmeta.img")).expect("vbmeta");
        assert!(vbmeta.starts_with("vbmeta SHA256_RSA4096 7 2\n"), "{vbmeta}");
        for p in SIGNED_PARTITIONS {
            assert!(vbmeta.contains(&format!("new-{p}|footer {p} ")), "{vbmeta}");
        }
        assert_eq!(
            fs::read_to_string(key_path(&fx.keys, 4096)).expect("key"),
            "EXISTING KEY"
        );
        assert_eq!(
            fs::read_to_string(fx.out.join(PUBKEY_FILE)).expect("pubkey"),
            "EXISTING KEY"
        );
    }

    #[test]
    fn signing_twice_gives_identical_descriptors() {
        let fx = fixture();
        let first_avb = FakeAvb::new("SHA256_RSA4096", 0);
        sign(&fx, &first_avb);
        let first = fs::read(fx.out.join("vbmeta.img")).expect("first");

        let second_avb = FakeAvb::new("SHA256_RSA4096", 0);
        sign(&fx, &second_avb);
        let second = fs::read(fx.out.join("vbmeta.img")).expect("second");

        assert_eq!(first, second);
        assert_eq!(*first_avb.calls.borrow(), *second_avb.calls.borrow());
    }

    #[test]
    fn unsigned_stock_image_is_rejected() {
        let fx = fixture();
        let avb = FakeAvb::new("NONE", 0);
        let ctx = ExecCtx::new(false, Arc::new(RecordingSink::default()));
        let job = SignJob {
            stock_dir: &fx.stock,
            out_dir: &fx.out,
            key_dir: &fx.keys,
            openssl: "openssl",
            algorithm_override: None,
            flags: 2,
        };
        let mut rec = record(&fx.stock);
        let err = sign_variant(&ctx, &avb, &job, &mut rec).expect_err("NONE");
        assert!(err.to_string().contains("Algorithm: NONE"));
        assert_eq!(rec.state, VariantState::Assembled);
        assert!(avb.calls.borrow().is_empty());
    }

    #[test]
    fn salt_depends_on_partition_and_stock_digest() {
        let a = footer_salt("boot", "00ff");
        assert_eq!(a, footer_salt("boot", "00ff"));
        assert_ne!(a, footer_salt("dtbo", "00ff"));
        assert_ne!(a, footer_salt("boot", "00fe"));
        assert_eq!(a.len(), 64);
    }
}
