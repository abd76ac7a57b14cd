use std::process::Command;

use serenity_image_builder_macros::Task;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::serenity::{SerenityConfig, apply_command_env};
use crate::workspace::WorkspacePaths;

#[Task(
    id = "serenity.toolchain",
    module = "serenity",
    phase = "toolchain",
    config = SerenityConfig,
    provides = ["serenity:toolchain"],
    after = ["serenity.environment"],
    default_label = "Build cross toolchain"
)]
pub struct ToolchainTask;

impl ToolchainTask {
    pub fn run(cfg: &SerenityConfig, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        build_toolchain(cfg, &ws, ctx)
    }
}

/// Build the cross toolchain with SerenityOS' own script. The script skips
/// work it has already done, so re-runs are cheap.
pub fn build_toolchain(cfg: &SerenityConfig, ws: &WorkspacePaths, ctx: &ExecCtx) -> Result<()> {
    if !ws.source_dir.is_dir() {
        return Err(Error::msg(format!(
            "source directory not found: {} (did the source stage run?)",
            ws.source_dir.display()
        )));
    }
    let toolchain_dir = ws.source_dir.join("Toolchain");
    let script = toolchain_dir.join(cfg.toolchain.build_script());

    ctx.log(&format!(
        "Building {} toolchain for {}...",
        cfg.toolchain.as_str(),
        cfg.arch
    ));
    let mut cmd = Command::new(&script);
    let mut env = cfg.build_env();
    env.insert("ARCH".into(), cfg.arch.clone());
    apply_command_env(&mut cmd, &env);
    cmd.current_dir(&toolchain_dir);
    ctx.run_cmd(cmd)?;
    ctx.log("Toolchain ready");
    Ok(())
}
