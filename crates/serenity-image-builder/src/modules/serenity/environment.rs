use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;
use serenity_image_builder_macros::Task;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::serenity::{EnvironmentConfig, SerenityConfig, SudoMode};

static VERSION_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b(\d+)\.(\d+)(?:\.(\d+))?\b").ok());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentOutcome {
    /// CI runner (or config) provides the environment; nothing ran.
    Skipped { reason: String },
    Prepared { compiler: CompilerCheck },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilerCheck {
    Matched { version: String },
    /// Mismatch or missing compiler accepted by force, config or operator.
    Accepted { problem: String },
}

#[Task(
    id = "serenity.environment",
    module = "serenity",
    phase = "environment",
    config = SerenityConfig,
    provides = ["serenity:host-ready"],
    after = ["serenity.source"],
    default_label = "Prepare build environment"
)]
pub struct EnvironmentTask;

impl EnvironmentTask {
    pub fn run(cfg: &SerenityConfig, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        ctx.workspace_paths_or_init(doc)?;
        prepare_environment(cfg, ctx).map(|_| ())
    }
}

pub fn prepare_environment(cfg: &SerenityConfig, ctx: &ExecCtx) -> Result<EnvironmentOutcome> {
    let env_cfg = &cfg.environment;
    if env_cfg.skip {
        ctx.log("Environment preparation disabled by config, skipping package installation");
        return Ok(EnvironmentOutcome::Skipped {
            reason: "serenity.environment.skip".into(),
        });
    }
    if let Some(var) = ci_marker(env_cfg, ctx) {
        ctx.log(&format!(
            "Running in CI ({var} is set), assuming dependencies are pre-installed"
        ));
        return Ok(EnvironmentOutcome::Skipped { reason: var });
    }

    install_packages(env_cfg, ctx)?;
    let compiler = check_compiler(env_cfg, ctx)?;
    ctx.log("Build environment ready");
    Ok(EnvironmentOutcome::Prepared { compiler })
}

fn truthy(value: &str) -> bool {
    let v = value.trim();
    !(v.is_empty() || v == "0" || v.eq_ignore_ascii_case("false"))
}

/// First configured CI variable that is set to a truthy value.
pub fn ci_marker(cfg: &EnvironmentConfig, ctx: &ExecCtx) -> Option<String> {
    cfg.ci_env_vars
        .iter()
        .find(|name| ctx.env_var(name).is_some_and(truthy))
        .cloned()
}

fn use_sudo(mode: SudoMode) -> bool {
    match mode {
        SudoMode::Always => true,
        SudoMode::Never => false,
        SudoMode::Auto => {
            // SAFETY: geteuid has no preconditions and cannot fail.
            let euid = unsafe { libc::geteuid() };
            euid != 0
        }
    }
}

fn privileged(cfg: &EnvironmentConfig, args: &[&str]) -> Command {
    let mut cmd = if use_sudo(cfg.sudo) {
        // Commands cannot prompt on the terminal, so never wait for a password.
        let mut c = Command::new("sudo");
        c.arg("-n").arg(&cfg.package_manager);
        c
    } else {
        Command::new(&cfg.package_manager)
    };
    cmd.args(args);
    cmd
}

fn install_packages(cfg: &EnvironmentConfig, ctx: &ExecCtx) -> Result<()> {
    ctx.log("Installing system dependencies...");
    ctx.run_cmd(privileged(cfg, &["update"])).map_err(|e| {
        if use_sudo(cfg.sudo) && !e.is_interrupted() {
            e.context("package index update failed (sudo needs cached credentials: run `sudo -v` first)")
        } else {
            e
        }
    })?;
    if cfg.packages.is_empty() {
        ctx.warn("serenity.environment.packages is empty, nothing to install");
        return Ok(());
    }
    let mut install = privileged(cfg, &["install", "-y"]);
    install.args(&cfg.packages);
    ctx.run_cmd(install)?;
    ctx.log("Dependencies installed");
    Ok(())
}

/// Extract `major.minor[.patch]` from `--version` output.
pub fn parse_version(output: &str) -> Option<(u32, String)> {
    let caps = VERSION_RE.as_ref()?.captures(output)?;
    let major = caps.get(1)?.as_str().parse().ok()?;
    Some((major, caps.get(0)?.as_str().to_string()))
}

fn check_compiler(cfg: &EnvironmentConfig, ctx: &ExecCtx) -> Result<CompilerCheck> {
    let want = cfg.compiler_version;
    let mut probe = Command::new(&cfg.compiler);
    probe.arg("--version");

    let problem = match ctx.probe_cmd(probe) {
        // Keep interrupts as interrupts; only a failed probe is soft.
        Err(e) if e.is_interrupted() => return Err(e),
        Err(e) => format!("{} could not be run: {e}", cfg.compiler),
        Ok(out) if !out.success() => format!("{} --version exited unsuccessfully", cfg.compiler),
        Ok(out) => match parse_version(&out.text()) {
            Some((major, version)) if major == want => {
                ctx.log(&format!("Found {} {version}", cfg.compiler));
                return Ok(CompilerCheck::Matched { version });
            }
            Some((_, version)) => {
                format!("{} reports version {version}, expected {want}.x", cfg.compiler)
            }
            None => format!("could not find a version number in {} output", cfg.compiler),
        },
    };

    ctx.warn(&problem);
    if ctx.force || cfg.allow_compiler_mismatch {
        ctx.warn("continuing despite compiler mismatch");
        return Ok(CompilerCheck::Accepted { problem });
    }
    if ctx.confirm.confirm(&format!("{problem}. Continue anyway?"))? {
        ctx.log("Operator chose to continue");
        Ok(CompilerCheck::Accepted { problem })
    } else {
        Err(Error::msg(format!("aborted by operator: {problem}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_sudo_follows_effective_uid() {
        let root = unsafe { libc::geteuid() } == 0;
        assert_eq!(use_sudo(SudoMode::Auto), !root);
        assert!(use_sudo(SudoMode::Always));
        assert!(!use_sudo(SudoMode::Never));
    }

    #[test]
    fn version_parsing() {
        let out = "gcc-13 (Ubuntu 13.2.0-4ubuntu3) 13.2.0\nCopyright (C) 2023";
        assert_eq!(parse_version(out), Some((13, "13.2.0".to_string())));
        assert_eq!(
            parse_version("gcc (GCC) 12.1\n"),
            Some((12, "12.1".to_string()))
        );
        assert_eq!(parse_version("no digits here"), None);
    }

    #[test]
    fn truthiness() {
        assert!(truthy("true"));
        assert!(truthy("1"));
        assert!(!truthy(""));
        assert!(!truthy("0"));
        assert!(!truthy("FALSE"));
    }
}
