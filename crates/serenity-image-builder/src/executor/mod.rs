use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Local};

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::planner::Plan;
use crate::workspace::{WorkspaceConfig, WorkspacePaths};

mod confirm;
mod runner;

pub use confirm::{Confirm, FixedAnswer, TerminalConfirm, prompt_yes_no};
pub use runner::{CmdOutput, CommandRunner, ProcessRunner, describe_exit, format_command};

pub type TaskExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

/// Local wall-clock stamp used on every log line.
pub fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn log_line(msg: &str) {
    println!("[{}] {msg}", timestamp());
}

#[derive(Default)]
struct SharedExecState {
    // Set by core.init, read by every later stage.
    workspace_paths: Mutex<Option<WorkspacePaths>>,
    // Outputs one stage hands to a later one, keyed by name.
    artifacts: Mutex<BTreeMap<String, PathBuf>>,
}

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskStarted {
        id: String,
        label: String,
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

/// Prints a timestamped build log to stdout.
#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_ok: usize,
    tasks_failed: usize,
    log_lines: usize,
    failed_tasks: Vec<String>,
    // Recent lines per task, replayed when that task fails.
    recent: BTreeMap<String, VecDeque<String>>,
}

const FAILURE_REPLAY_LINES: usize = 25;

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        let Ok(mut s) = self.state.lock() else {
            return;
        };
        match ev {
            ExecEvent::TaskStarted { id, label } => {
                s.started_at.get_or_insert_with(Instant::now);
                log_line(&format!("==> {label} ({id})"));
            }
            ExecEvent::TaskLog { id, line } => {
                s.log_lines = s.log_lines.saturating_add(1);
                let q = s.recent.entry(id).or_default();
                if q.len() == FAILURE_REPLAY_LINES {
                    q.pop_front();
                }
                q.push_back(line.clone());
                log_line(&line);
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                let recent = s.recent.remove(&id).unwrap_or_default();
                if ok {
                    s.tasks_ok = s.tasks_ok.saturating_add(1);
                    log_line(&format!("DONE: {id} ({})", format_elapsed_ms(elapsed_ms)));
                } else {
                    s.tasks_failed = s.tasks_failed.saturating_add(1);
                    s.failed_tasks.push(id.clone());
                    log_line(&format!(
                        "FAIL: {id} ({}) {}",
                        format_elapsed_ms(elapsed_ms),
                        error.unwrap_or_default()
                    ));
                    if !recent.is_empty() {
                        log_line(&format!("last {} log lines of {id}:", recent.len()));
                        for line in recent {
                            println!("    {line}");
                        }
                    }
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                log_line(&format!(
                    "SUMMARY: status={} ok={} failed={} log_lines={} elapsed={}",
                    if ok { "ok" } else { "failed" },
                    s.tasks_ok,
                    s.tasks_failed,
                    s.log_lines,
                    format_elapsed_hms(wall.as_secs())
                ));
                if !s.failed_tasks.is_empty() {
                    log_line(&format!("failed tasks: {}", s.failed_tasks.join(", ")));
                }
                if let Some(e) = error {
                    log_line(&format!("error: {e}"));
                }
                *s = StdoutSinkState::default();
            }
        }
    }
}

/// Everything a stage may touch besides its immutable config: the command
/// runner, operator prompts, host environment, and shared run state.
#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    /// Continue past soft failures without asking.
    pub force: bool,
    pub cancel: Arc<AtomicBool>,
    pub sink: Arc<dyn ExecSink>,
    pub runner: Arc<dyn CommandRunner>,
    pub confirm: Arc<dyn Confirm>,
    pub current_task_id: Option<String>,
    build_time: DateTime<Local>,
    host_env: Arc<BTreeMap<String, String>>,
    shared: Arc<SharedExecState>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            force: false,
            cancel: Arc::new(AtomicBool::new(false)),
            sink,
            runner: Arc::new(ProcessRunner),
            confirm: Arc::new(TerminalConfirm),
            current_task_id: None,
            build_time: Local::now(),
            host_env: Arc::new(std::env::vars().collect()),
            shared: Arc::new(SharedExecState::default()),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_confirm(mut self, confirm: Arc<dyn Confirm>) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Replace the host environment snapshot stages consult (CI detection).
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.host_env = Arc::new(env);
        self
    }

    pub fn with_build_time(mut self, at: DateTime<Local>) -> Self {
        self.build_time = at;
        self
    }

    /// Fixed for the whole run so the artifact date stamp and manifest agree.
    pub fn build_time(&self) -> DateTime<Local> {
        self.build_time
    }

    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.host_env.get(name).map(String::as_str)
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || crate::signal::interrupted()
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    pub fn set_workspace_paths(&self, paths: WorkspacePaths) {
        if let Ok(mut g) = self.shared.workspace_paths.lock() {
            *g = Some(paths);
        }
    }

    pub fn workspace_paths(&self) -> Option<WorkspacePaths> {
        self.shared
            .workspace_paths
            .lock()
            .ok()
            .and_then(|g| g.clone())
    }

    pub fn workspace_paths_or_init(&self, doc: &ConfigDoc) -> Result<WorkspacePaths> {
        if let Some(p) = self.workspace_paths() {
            return Ok(p);
        }
        let ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
        let paths = crate::workspace::init_dirs(&ws)?;
        self.set_workspace_paths(paths.clone());
        Ok(paths)
    }

    pub fn set_artifact(&self, name: &str, path: PathBuf) {
        if let Ok(mut g) = self.shared.artifacts.lock() {
            g.insert(name.to_string(), path);
        }
    }

    pub fn artifact(&self, name: &str) -> Option<PathBuf> {
        self.shared
            .artifacts
            .lock()
            .ok()
            .and_then(|g| g.get(name).cloned())
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

    pub fn warn(&self, msg: &str) {
        tracing::warn!(task = ?self.current_task_id, "{msg}");
        self.log(&format!("WARNING: {msg}"));
    }

    /// Run an external command to completion; a non-zero exit is an error.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<CmdOutput> {
        let shown = format_command(&cmd);
        let out = self.spawn_logged(&mut cmd, &shown)?;
        if !out.success() {
            return Err(Error::msg(format!(
                "command failed with {}: {shown}",
                describe_exit(out.code)
            )));
        }
        Ok(out)
    }

    /// Like `run_cmd`, but the exit status is returned instead of judged.
    pub fn probe_cmd(&self, mut cmd: Command) -> Result<CmdOutput> {
        let shown = format_command(&cmd);
        self.spawn_logged(&mut cmd, &shown)
    }

    fn spawn_logged(&self, cmd: &mut Command, shown: &str) -> Result<CmdOutput> {
        if self.cancelled() {
            return Err(Error::interrupted());
        }
        self.log(&format!("Running: {shown}"));

        tracing::debug!(command = %shown, "spawning external command");
        let start = Instant::now();
        let out = self.runner.run(cmd, &mut |line: &str| self.log(line))?;
        tracing::debug!(
            command = %shown,
            code = ?out.code,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "external command finished"
        );

        // The signal handler forwarded the interrupt to the child; report it
        // rather than the child's resulting exit status.
        if self.cancelled() {
            return Err(Error::interrupted());
        }
        Ok(out)
    }
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

/// Run every planned task in order, stopping at the first failure or
/// interrupt. Nothing already produced is rolled back.
pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    for task in plan.ordered()? {
        let Some(exec) = reg.get(&task.id) else {
            return Err(Error::msg(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        };
        if ctx.cancelled() {
            ctx.sink.emit(ExecEvent::ExecutorDone {
                ok: false,
                error: Some(format!("interrupted before '{}'", task.id)),
            });
            return Err(Error::interrupted());
        }

        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
            label: task.label.clone(),
        });
        ctx.set_task(task.id.clone());
        let start = Instant::now();
        let res = if ctx.dry_run {
            ctx.log(&format!(
                "DRY-RUN: {} ({}/{})",
                task.id, task.module, task.phase
            ));
            Ok(())
        } else {
            exec(doc, ctx)
        };
        let elapsed_ms = start.elapsed().as_millis();

        if let Err(e) = res {
            ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: false,
                error: Some(e.to_string()),
                elapsed_ms,
            });
            let e = e.context(format!("task '{}' failed", task.id));
            ctx.sink.emit(ExecEvent::ExecutorDone {
                ok: false,
                error: Some(e.to_string()),
            });
            return Err(e);
        }
        ctx.sink.emit(ExecEvent::TaskFinished {
            id: task.id.clone(),
            ok: true,
            error: None,
            elapsed_ms,
        });
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    let mut reg = TaskRegistry::default();
    reg.add("core.init", core_init)?;
    crate::modules::serenity::SerenityModule::register_tasks(&mut reg)?;
    Ok(reg)
}

fn core_init(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
    ctx.log(&format!("config = {}", doc.path.display()));
    ctx.log(&format!("workspace.root_dir = {}", ws.root_dir));

    let paths = crate::workspace::init_dirs(&ws)?;
    ctx.set_workspace_paths(paths.clone());
    ctx.log(&format!("workspace.root = {}", paths.root.display()));
    ctx.log(&format!("workspace.source = {}", paths.source_dir.display()));
    ctx.log(&format!("workspace.manifest = {}", paths.manifest.display()));
    Ok(())
}

fn format_elapsed_ms(ms: u128) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format_elapsed_hms((ms / 1000) as u64)
    }
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
    fn elapsed_formats() {
        assert_eq!(format_elapsed_ms(250), "250ms");
        assert_eq!(format_elapsed_ms(3_725_000), "01:02:05");
    }

    #[test]
    fn artifacts_are_shared_between_clones() {
        let sink = Arc::new(StdoutSink::default());
        let ctx = ExecCtx::new(false, sink);
        let other = ctx.clone();
        ctx.set_artifact("image", PathBuf::from("/tmp/a.img.gz"));
        assert_eq!(other.artifact("image"), Some(PathBuf::from("/tmp/a.img.gz")));
        assert_eq!(other.artifact("missing"), None);
    }

    #[test]
    fn dry_run_announces_tasks_without_running_them() {
        struct Exploding;
        impl CommandRunner for Exploding {
            fn run(&self, _: &mut Command, _: &mut dyn FnMut(&str)) -> Result<CmdOutput> {
                panic!("runner must not be called in dry-run mode");
            }
        }
        let doc = ConfigDoc::defaults();
        let plan = crate::modules::plan_for(&doc).expect("plan");
        let reg = builtin_registry().expect("registry");
        let mut ctx = ExecCtx::new(true, Arc::new(StdoutSink::default()))
            .with_runner(Arc::new(Exploding));
        execute_plan(&doc, &plan, &reg, &mut ctx).expect("dry run");
        assert!(ctx.workspace_paths().is_none(), "core.init body must not run");
    }

    #[test]
    fn cancelled_run_stops_before_the_next_task() {
        let doc = ConfigDoc::defaults();
        let plan = crate::modules::plan_for(&doc).expect("plan");
        let reg = builtin_registry().expect("registry");
        let mut ctx = ExecCtx::new(false, Arc::new(StdoutSink::default()));
        ctx.request_cancel();
        let err = execute_plan(&doc, &plan, &reg, &mut ctx).unwrap_err();
        assert!(err.is_interrupted());
        assert!(ctx.workspace_paths().is_none(), "core.init must not have run");
    }

    #[test]
    fn non_zero_exit_names_the_command() {
        struct Fails;
        impl CommandRunner for Fails {
            fn run(&self, _: &mut Command, on_line: &mut dyn FnMut(&str)) -> Result<CmdOutput> {
                on_line("ninja: error: unknown target");
                Ok(CmdOutput {
                    code: Some(1),
                    lines: vec!["ninja: error: unknown target".into()],
                })
            }
        }
        let ctx = ExecCtx::new(false, Arc::new(StdoutSink::default()))
            .with_runner(Arc::new(Fails));
        let mut cmd = Command::new("ninja");
        cmd.arg("grub-uefi-image");
        let err = ctx.run_cmd(cmd).unwrap_err().to_string();
        assert_eq!(err, "command failed with exit code 1: ninja grub-uefi-image");

        let probed = ctx.probe_cmd(Command::new("ninja")).expect("probe");
        assert_eq!(probed.code, Some(1));
    }
}
