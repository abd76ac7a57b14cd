use std::process::Command;

use serenity_image_builder_macros::Task;

use crate::config::ConfigDoc;
use crate::error::Result;
use crate::executor::ExecCtx;
use crate::modules::serenity::{SerenityConfig, apply_command_env};
use crate::workspace::WorkspacePaths;

#[Task(
    id = "serenity.build",
    module = "serenity",
    phase = "build",
    config = SerenityConfig,
    provides = ["serenity:install-root"],
    after = ["serenity.toolchain"],
    default_label = "Build SerenityOS"
)]
pub struct BuildTask;

impl BuildTask {
    pub fn run(cfg: &SerenityConfig, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        build_system(cfg, &ws, ctx)
    }
}

/// Compile the system and populate the install root under the build dir.
pub fn build_system(cfg: &SerenityConfig, ws: &WorkspacePaths, ctx: &ExecCtx) -> Result<()> {
    ctx.log("Building SerenityOS...");
    let env = cfg.build_env();

    let mut build = Command::new(ws.source_dir.join("Meta").join("serenity.sh"));
    build.arg("build");
    apply_command_env(&mut build, &env);
    build.current_dir(&ws.source_dir);
    ctx.run_cmd(build)?;

    let mut install = Command::new("ninja");
    install.arg("install");
    apply_command_env(&mut install, &env);
    install.current_dir(ws.build_dir(&cfg.build_dir_name()));
    ctx.run_cmd(install)?;

    ctx.log("SerenityOS build completed");
    Ok(())
}
