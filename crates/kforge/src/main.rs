use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kforge::Result;
use kforge::config::ConfigDoc;
use kforge::executor::{ExecCtx, StdoutSink};
use kforge::modules::firmware::{self, FirmwareConfig};
use kforge::overrides::RunFlags;
use kforge::workspace::{self, WorkspaceConfig};

#[derive(Debug, Parser)]
#[command(author, version, about, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    cmd: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compile, repack, re-sign and package every variant (default)
    Run(RunArgs),
    /// Load config and print the computed task plan
    Plan {
        /// Path to a build definition TOML
        #[arg(default_value = "kforge.toml")]
        build: PathBuf,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
        #[arg(long = "set", value_name = "KEY=VALUE")]
        sets: Vec<String>,
    },
    /// Load config and print the fully-resolved TOML (after imports/extends)
    Resolve {
        #[arg(default_value = "kforge.toml")]
        build: PathBuf,
    },
    /// Classify the firmware tree without building anything
    Variants {
        #[arg(default_value = "kforge.toml")]
        build: PathBuf,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Path to a build definition TOML
    #[arg(default_value = "kforge.toml")]
    build: PathBuf,
    /// Remove previous kernel objects before compiling
    #[arg(short, long)]
    clean: bool,
    /// Only rebuild verification metadata for previously built images
    #[arg(long)]
    vbmeta_only: bool,
    /// Download the toolchain without asking when none is found
    #[arg(long)]
    allow_download: bool,
    /// Print what would run without executing task bodies
    #[arg(long)]
    dry_run: bool,
    /// Override a config value, e.g. `--set kernel.jobs=8`
    #[arg(long = "set", value_name = "KEY=VALUE")]
    sets: Vec<String>,
}

fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KFORGE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let res = match cli.cmd {
        None => cmd_run(&cli.run),
        Some(Command::Run(args)) => cmd_run(&args),
        Some(Command::Plan { build, dot, sets }) => cmd_plan(&build, dot, &sets),
        Some(Command::Resolve { build }) => cmd_resolve(&build),
        Some(Command::Variants { build }) => cmd_variants(&build),
    };
    if let Err(e) = res {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

fn load(path: &Path, flags: &RunFlags, sets: &[String]) -> Result<ConfigDoc> {
    let mut doc = kforge::config::load(path)?;
    kforge::overrides::apply(&mut doc, flags, sets)?;
    Ok(doc)
}

fn cmd_plan(path: &Path, dot: bool, sets: &[String]) -> Result<()> {
    let doc = load(path, &RunFlags::default(), sets)?;
    let plan = kforge::modules::build_plan(&doc)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }

    let ordered = plan.ordered()?;
    for (i, task) in ordered.iter().enumerate() {
        println!(
            "{:>2}. {:<22}  {:<10} {:<10}  {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = kforge::config::load(path)?;
    let s = toml::to_string_pretty(&doc.value)
        .map_err(|e| kforge::Error::msg(format!("failed to render config: {e}")))?;
    print!("{s}");
    Ok(())
}

fn cmd_variants(path: &Path) -> Result<()> {
    let doc = kforge::config::load(path)?;
    let ws_cfg: WorkspaceConfig = doc.section("workspace")?;
    let ws = workspace::load_paths(&ws_cfg)?;
    let fw = FirmwareConfig::load(&doc)?;
    let root = ws.resolve_config_path(&fw.root_dir)?;
    for rec in firmware::discover(&root, &fw.variants)? {
        println!("{:<20} {}", rec.name, rec.state);
    }
    Ok(())
}

fn cmd_run(args: &RunArgs) -> Result<()> {
    let flags = RunFlags {
        clean: args.clean,
        vbmeta_only: args.vbmeta_only,
        allow_download: args.allow_download,
    };
    let doc = load(&args.build, &flags, &args.sets)?;
    let plan = kforge::modules::build_plan(&doc)?;
    let reg = kforge::executor::builtin_registry()?;

    let ws_cfg: WorkspaceConfig = doc.section("workspace")?;
    let ws = workspace::load_paths(&ws_cfg)?;
    let sink = Arc::new(StdoutSink::with_error_logs(ws.build_dir.join("error-logs")));
    let mut ctx = ExecCtx::new(args.dry_run, sink);

    kforge::executor::execute_plan(&doc, &plan, &reg, &mut ctx)
}
