use std::process::Command;

use serenity_image_builder_macros::Task;

use crate::config::ConfigDoc;
use crate::error::Result;
use crate::executor::ExecCtx;
use crate::modules::serenity::SerenityConfig;
use crate::workspace::WorkspacePaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// A checkout was already present and left untouched.
    Reused,
    Cloned,
}

#[Task(
    id = "serenity.source",
    module = "serenity",
    phase = "source",
    config = SerenityConfig,
    provides = ["serenity:source"],
    after = ["core.init"],
    default_label = "Fetch SerenityOS source"
)]
pub struct SourceTask;

impl SourceTask {
    pub fn run(cfg: &SerenityConfig, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        clone_repository(cfg, &ws, ctx).map(|_| ())
    }
}

/// Shallow-clone the repository unless the checkout directory exists.
///
/// Presence of the directory is the only check; a stale or partial checkout
/// is reused as is and left for the later stages to trip over.
pub fn clone_repository(
    cfg: &SerenityConfig,
    ws: &WorkspacePaths,
    ctx: &ExecCtx,
) -> Result<SourceState> {
    if ws.source_dir.exists() {
        ctx.log(&format!(
            "SerenityOS source already present at {}, skipping clone",
            ws.source_dir.display()
        ));
        return Ok(SourceState::Reused);
    }

    ctx.log(&format!("Cloning {} ...", cfg.repo));
    let mut cmd = Command::new("git");
    cmd.arg("clone").arg("--depth").arg("1");
    if let Some(branch) = cfg.branch.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
        cmd.arg("--branch").arg(branch);
    }
    cmd.arg(&cfg.repo).arg(&ws.source_dir).current_dir(&ws.root);
    ctx.run_cmd(cmd)?;
    ctx.log("Repository cloned");
    Ok(SourceState::Cloned)
}
