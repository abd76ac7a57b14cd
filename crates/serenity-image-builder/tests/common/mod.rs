#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use chrono::{Local, TimeZone};
use serenity_image_builder::Result;
use serenity_image_builder::executor::{CmdOutput, CommandRunner, ExecCtx, ExecEvent, ExecSink};

/// What the fake saw for one command.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl Recorded {
    /// `program arg1 arg2 ...`
    pub fn line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

type Script = dyn Fn(&Recorded) -> CmdOutput + Send + Sync;

/// Records every command and answers through a script instead of spawning.
pub struct FakeRunner {
    calls: Mutex<Vec<Recorded>>,
    script: Box<Script>,
}

impl FakeRunner {
    pub fn new(script: impl Fn(&Recorded) -> CmdOutput + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            script: Box::new(script),
        })
    }

    /// Every command succeeds with no output.
    pub fn succeeding() -> Arc<Self> {
        Self::new(|_| CmdOutput::ok())
    }

    pub fn calls(&self) -> Vec<Recorded> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(Recorded::line).collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, cmd: &mut Command, on_line: &mut dyn FnMut(&str)) -> Result<CmdOutput> {
        let rec = Recorded {
            program: cmd.get_program().to_string_lossy().into_owned(),
            args: cmd
                .get_args()
                .map(|a| a.to_string_lossy().into_owned())
                .collect(),
            cwd: cmd.get_current_dir().map(Path::to_path_buf),
            env: cmd
                .get_envs()
                .filter_map(|(k, v)| {
                    v.map(|v| {
                        (
                            k.to_string_lossy().into_owned(),
                            v.to_string_lossy().into_owned(),
                        )
                    })
                })
                .collect(),
        };
        let out = (self.script)(&rec);
        for line in &out.lines {
            on_line(line);
        }
        self.calls.lock().expect("lock").push(rec);
        Ok(out)
    }
}

pub fn exit(code: i32, lines: &[&str]) -> CmdOutput {
    CmdOutput {
        code: Some(code),
        lines: lines.iter().map(|s| s.to_string()).collect(),
    }
}

/// Keeps every event for assertions.
#[derive(Default)]
pub struct CollectSink {
    pub events: Mutex<Vec<ExecEvent>>,
}

impl CollectSink {
    pub fn log_lines(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("lock")
            .iter()
            .filter_map(|e| match e {
                ExecEvent::TaskLog { line, .. } => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn started(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("lock")
            .iter()
            .filter_map(|e| match e {
                ExecEvent::TaskStarted { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ExecSink for CollectSink {
    fn emit(&self, ev: ExecEvent) {
        self.events.lock().expect("lock").push(ev);
    }
}

/// Context wired to the fake runner, an empty host environment and a fixed
/// build time of 2025-06-01 12:30:00.
pub fn ctx_with(runner: Arc<FakeRunner>, sink: Arc<CollectSink>) -> ExecCtx {
    let at = Local
        .with_ymd_and_hms(2025, 6, 1, 12, 30, 0)
        .single()
        .expect("valid time");
    ExecCtx::new(false, sink)
        .with_runner(runner)
        .with_env(BTreeMap::new())
        .with_build_time(at)
}

pub const ARTIFACT_NAME: &str = "serenity-x86_64-grub-uefi-20250601.img.gz";
