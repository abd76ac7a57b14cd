use std::collections::VecDeque;
use std::ffi::OsStr;
use std::io::{BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::mpsc;

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_log_line;
use crate::signal;

// Enough context to diagnose a failing step without holding a full
// toolchain build log in memory.
const MAX_CAPTURED_LINES: usize = 400;

/// Exit code (None when killed by a signal) and the tail of merged
/// stdout/stderr.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    pub code: Option<i32>,
    pub lines: Vec<String>,
}

impl CmdOutput {
    pub fn ok() -> Self {
        Self {
            code: Some(0),
            lines: Vec::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Runs one external command to completion.
///
/// Implementations must call `on_line` for every output line as it arrives
/// and must not interpret the exit status; policy lives in `ExecCtx`.
pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: &mut Command, on_line: &mut dyn FnMut(&str)) -> Result<CmdOutput>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, cmd: &mut Command, on_line: &mut dyn FnMut(&str)) -> Result<CmdOutput> {
        let program = cmd.get_program().to_string_lossy().into_owned();

        // Own process group, so an interrupt can stop the whole subtree
        // (a toolchain script and every compiler it started).
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            // A background process group reading the terminal would be
            // stopped by SIGTTIN.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("failed to spawn '{program}': {e}")))?;
        signal::track_child(child.id());
        if signal::interrupted() {
            kill_group(child.id());
        }

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(std::thread::spawn(move || pump_lines(out, tx)));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(std::thread::spawn(move || pump_lines(err, tx)));
        }
        drop(tx);

        let mut tail = VecDeque::with_capacity(64);
        for raw in rx {
            let line = sanitize_log_line(&raw);
            if line.is_empty() {
                continue;
            }
            on_line(&line);
            if tail.len() == MAX_CAPTURED_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        for r in readers {
            let _ = r.join();
        }

        let status = child.wait();
        signal::untrack_child();
        let status =
            status.map_err(|e| Error::msg(format!("failed to wait for '{program}': {e}")))?;
        Ok(CmdOutput {
            code: status.code(),
            lines: tail.into(),
        })
    }
}

fn kill_group(pgid: u32) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = i32::try_from(pgid) {
            // Negative pid targets the process group.
            let _ = unsafe { libc::kill(-pgid, libc::SIGTERM) };
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
    }
}

// Split on both '\n' and '\r' so progress redraws become separate lines.
fn pump_lines<R: Read>(reader: R, tx: mpsc::Sender<String>) {
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

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
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

/// Shell-like rendering of a command for the build log, including
/// environment overrides and the working directory.
pub fn format_command(cmd: &Command) -> String {
    let mut parts: Vec<String> = Vec::new();
    for (k, v) in cmd.get_envs() {
        if let Some(v) = v {
            parts.push(format!("{}={}", k.to_string_lossy(), quote_arg(v)));
        }
    }
    parts.push(quote_arg(cmd.get_program()));
    parts.extend(cmd.get_args().map(quote_arg));
    let mut out = parts.join(" ");
    if let Some(dir) = cmd.get_current_dir() {
        out.push_str(&format!(" (in {})", dir.display()));
    }
    out
}

fn quote_arg(arg: &OsStr) -> String {
    let s = arg.to_string_lossy();
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@+,%".contains(c));
    if plain {
        s.into_owned()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

pub fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "termination by signal".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_includes_env_args_and_dir() {
        let mut cmd = Command::new("./Meta/serenity.sh");
        cmd.arg("build")
            .env("SERENITY_ARCH", "x86_64")
            .current_dir("/work/serenity");
        assert_eq!(
            format_command(&cmd),
            "SERENITY_ARCH=x86_64 ./Meta/serenity.sh build (in /work/serenity)"
        );
    }

    #[test]
    fn format_quotes_awkward_args() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo 'hi there'");
        assert_eq!(format_command(&cmd), r"sh -c 'echo '\''hi there'\'''");
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_merges_streams_and_reports_code() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err 1>&2; exit 3");
        let mut seen = Vec::new();
        let out = ProcessRunner
            .run(&mut cmd, &mut |l: &str| seen.push(l.to_string()))
            .expect("run sh");
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        seen.sort();
        assert_eq!(seen, vec!["err".to_string(), "out".to_string()]);
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let mut cmd = Command::new("definitely-not-a-real-program-xyz");
        let err = ProcessRunner.run(&mut cmd, &mut |_: &str| {}).unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }
}
