use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_log_line;
use crate::planner::Plan;
use crate::workspace::{WorkspaceConfig, WorkspacePaths};

pub type TaskExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Narrates progress on stdout and writes a log file for every failed task.
#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
    error_logs_root: Option<PathBuf>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_ok: usize,
    tasks_failed: usize,
    warnings: usize,
    task_logs: BTreeMap<String, VecDeque<String>>,
    error_logs_dir: Option<PathBuf>,
    error_log_paths: Vec<PathBuf>,
}

impl StdoutSink {
    /// Failed-task logs go to `<root>/<timestamp>/<task>.log`.
    pub fn with_error_logs(root: PathBuf) -> Self {
        Self {
            state: Mutex::default(),
            error_logs_root: Some(root),
        }
    }
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        let Ok(mut s) = self.state.lock() else {
            return;
        };
        match ev {
            ExecEvent::TaskStarted { id } => {
                s.started_at.get_or_insert_with(Instant::now);
                println!("RUN: {id}");
            }
            ExecEvent::TaskLog { id, line } => {
                if line.starts_with("WARNING:") {
                    s.warnings += 1;
                }
                append_task_log_line(&mut s.task_logs, &id, &line);
                println!("[{id}] {line}");
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if ok {
                    s.tasks_ok += 1;
                    s.task_logs.remove(&id);
                    println!("DONE: {id} ({elapsed_ms}ms)");
                    return;
                }
                s.tasks_failed += 1;
                let err_text = error.unwrap_or_default();
                println!("FAIL: {id} ({elapsed_ms}ms) {err_text}");
                if let Some(root) = self.error_logs_root.as_ref() {
                    match write_task_error_log(&mut s, root, &id, &err_text, elapsed_ms) {
                        Ok(path) => println!("ERROR_LOG: {id} => {}", path.display()),
                        Err(e) => println!("WARNING: failed to write error log for {id}: {e}"),
                    }
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                println!("SUMMARY:");
                println!("  status: {}", if ok { "ok" } else { "failed" });
                println!(
                    "  tasks: ok={} failed={} warnings={}",
                    s.tasks_ok, s.tasks_failed, s.warnings
                );
                println!("  elapsed: {}", format_elapsed_hms(wall.as_secs()));
                for p in &s.error_log_paths {
                    println!("  error_log: {}", p.display());
                }
                if let Some(e) = error {
                    println!("  error: {e}");
                }
                *s = StdoutSinkState::default();
            }
        }
    }
}

/// Keeps every event in memory; handy for asserting on warnings in tests.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ExecEvent>>,
}

impl RecordingSink {
    pub fn log_lines(&self) -> Vec<String> {
        self.events
            .lock()
            .map(|evs| {
                evs.iter()
                    .filter_map(|ev| match ev {
                        ExecEvent::TaskLog { line, .. } => Some(line.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl ExecSink for RecordingSink {
    fn emit(&self, ev: ExecEvent) {
        if let Ok(mut evs) = self.events.lock() {
            evs.push(ev);
        }
    }
}

pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_task_id: Option<String>,
    workspace: Option<WorkspacePaths>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            sink,
            current_task_id: None,
            workspace: None,
        }
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    pub fn set_workspace_paths(&mut self, paths: WorkspacePaths) {
        self.workspace = Some(paths);
    }

    // Directories are created here but only core.init applies `workspace.clean`.
    pub fn workspace_paths_or_init(&mut self, doc: &ConfigDoc) -> Result<WorkspacePaths> {
        if let Some(p) = self.workspace.as_ref() {
            return Ok(p.clone());
        }
        let mut ws: WorkspaceConfig = doc.section("workspace")?;
        ws.clean = Default::default();
        let paths = crate::workspace::init_dirs(&ws)?;
        self.workspace = Some(paths.clone());
        Ok(paths)
    }

    pub fn log(&self, msg: &str) {
        let id = self
            .current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::TaskLog {
            id,
            line: msg.to_string(),
        });
    }

    /// Non-fatal problems, e.g. a variant being skipped.
    pub fn warn(&self, msg: &str) {
        tracing::warn!(task = self.current_task_id.as_deref(), "{msg}");
        self.log(&format!("WARNING: {msg}"));
    }

    /// Run a command, streaming its output into the task log line by line.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<()> {
        let program = program_name(&cmd);
        if self.dry_run {
            self.log(&format!("DRY-RUN: {cmd:?}"));
            return Ok(());
        }
        tracing::debug!(command = ?cmd, "spawning");

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::tool_failed(format!("failed to spawn {program}: {e}")))?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_log_line(&line);
            if !line.is_empty() {
                self.log(&line);
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::tool_failed(format!("wait for {program} failed: {e}")))?;
        if !status.success() {
            return Err(Error::tool_failed(format!("{program} failed: {status}")));
        }
        Ok(())
    }

    /// Run a command and return its stdout. Stderr is forwarded to the task log.
    pub fn run_cmd_capture(&self, mut cmd: Command) -> Result<String> {
        let program = program_name(&cmd);
        tracing::debug!(command = ?cmd, "spawning (captured)");
        let out = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::tool_failed(format!("failed to spawn {program}: {e}")))?;
        for line in String::from_utf8_lossy(&out.stderr).lines() {
            let line = sanitize_log_line(line);
            if !line.is_empty() {
                self.log(&line);
            }
        }
        if !out.status.success() {
            return Err(Error::tool_failed(format!(
                "{program} failed: {}",
                out.status
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate task executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        self.exec.get(id).copied()
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

/// Run every task in plan order, stopping at the first failure.
pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    let res = run_ordered(doc, plan, reg, ctx);
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: res.is_ok(),
        error: res.as_ref().err().map(|e| e.to_string()),
    });
    res
}

fn run_ordered(doc: &ConfigDoc, plan: &Plan, reg: &TaskRegistry, ctx: &mut ExecCtx) -> Result<()> {
    for task in plan.ordered()? {
        let exec = reg.get(&task.id).ok_or_else(|| {
            Error::msg(format!("no executor registered for task '{}'", task.id))
        })?;
        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
        });
        ctx.set_task(task.id.clone());
        let start = Instant::now();
        let res = exec(doc, ctx);
        // Tasks may retarget the log id (e.g. `firmware.assemble:<variant>`).
        ctx.set_task(task.id.clone());
        let elapsed_ms = start.elapsed().as_millis();
        ctx.sink.emit(ExecEvent::TaskFinished {
            id: task.id.clone(),
            ok: res.is_ok(),
            error: res.as_ref().err().map(|e| e.to_string()),
            elapsed_ms,
        });
        res.map_err(|e| e.context(format!("task '{}' failed", task.id)))?;
    }
    Ok(())
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    use crate::modules::{avb, firmware, kernel, package, preflight, toolchain};

    let mut reg = TaskRegistry::default();
    reg.add("core.init", crate::modules::core::init)?;
    preflight::PreflightModule::register_tasks(&mut reg)?;
    toolchain::ToolchainModule::register_tasks(&mut reg)?;
    firmware::FirmwareModule::register_tasks(&mut reg)?;
    kernel::KernelModule::register_tasks(&mut reg)?;
    avb::AvbModule::register_tasks(&mut reg)?;
    package::PackageModule::register_tasks(&mut reg)?;
    Ok(reg)
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>| {
        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(pending).into_owned());
            pending.clear();
        }
    };

    while let Ok(n) = r.read(&mut buf) {
        if n == 0 {
            break;
        }
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                flush(&mut pending);
            } else {
                pending.push(b);
                if pending.len() >= MAX_PENDING_BYTES {
                    flush(&mut pending);
                }
            }
        }
    }
    flush(&mut pending);
}

fn append_task_log_line(
    task_logs: &mut BTreeMap<String, VecDeque<String>>,
    task_id: &str,
    line: &str,
) {
    const MAX_LINES: usize = 4000;

    let mut push = |id: &str| {
        let q = task_logs.entry(id.to_string()).or_default();
        while q.len() >= MAX_LINES {
            q.pop_front();
        }
        q.push_back(line.to_string());
    };

    push(task_id);
    // Per-variant sub-ids also feed the parent task's log.
    if let Some((parent, _)) = task_id.split_once(':')
        && !parent.trim().is_empty()
    {
        push(parent);
    }
}

fn write_task_error_log(
    state: &mut StdoutSinkState,
    root: &std::path::Path,
    task_id: &str,
    error: &str,
    elapsed_ms: u128,
) -> Result<PathBuf> {
    let dir = match state.error_logs_dir.as_ref() {
        Some(d) => d.clone(),
        None => {
            let d = root.join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
            fs::create_dir_all(&d)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", d.display())))?;
            state.error_logs_dir = Some(d.clone());
            d
        }
    };
    let path = dir.join(format!("{}.log", sanitize_filename_component(task_id)));

    let mut body = format!("task: {task_id}\nstatus: failed\nelapsed_ms: {elapsed_ms}\n");
    if !error.trim().is_empty() {
        body.push_str(&format!("error: {error}\n"));
    }
    body.push_str("\nlogs:\n");
    for line in state.task_logs.get(task_id).into_iter().flatten() {
        body.push_str(line);
        body.push('\n');
    }

    fs::write(&path, body)
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))?;
    state.error_log_paths.push(path.clone());
    Ok(path)
}

fn sanitize_filename_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "task".into() } else { out }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_cmd_reports_tool_failure_kind() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = ExecCtx::new(false, sink.clone());
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo building; exit 3");
        let err = ctx.run_cmd(cmd).expect_err("non-zero exit");
        assert_eq!(err.kind(), crate::error::ErrorKind::ToolFailed);
        assert!(sink.log_lines().iter().any(|l| l == "building"));
    }

    #[test]
    fn run_cmd_capture_returns_stdout() {
        let ctx = ExecCtx::new(false, Arc::new(RecordingSink::default()));
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf 'Algorithm: SHA256_RSA4096\\n'");
        let out = ctx.run_cmd_capture(cmd).expect("capture");
        assert_eq!(out, "Algorithm: SHA256_RSA4096\n");
    }

    #[test]
    fn warn_prefixes_log_line() {
        let sink = Arc::new(RecordingSink::default());
        let mut ctx = ExecCtx::new(false, sink.clone());
        ctx.set_task("firmware.discover");
        ctx.warn("skipping variant 'x'");
        assert_eq!(sink.log_lines(), vec!["WARNING: skipping variant 'x'"]);
    }

    #[test]
    fn filename_component_is_sanitized() {
        assert_eq!(
            sanitize_filename_component("avb.sign:a52sxqxx"),
            "avb.sign_a52sxqxx"
        );
        assert_eq!(sanitize_filename_component(""), "task");
    }
}
