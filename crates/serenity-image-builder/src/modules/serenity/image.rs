use std::fs;
use std::path::PathBuf;
use std::process::Command;

use serenity_image_builder_macros::Task;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::serenity::{IMAGE_FILE_NAME, IMAGE_TARGET, SerenityConfig, apply_command_env};
use crate::workspace::WorkspacePaths;

#[Task(
    id = "serenity.image",
    module = "serenity",
    phase = "image",
    config = SerenityConfig,
    provides = ["serenity:disk-image"],
    after = ["serenity.build"],
    default_label = "Assemble GRUB UEFI disk image"
)]
pub struct ImageTask;

impl ImageTask {
    pub fn run(cfg: &SerenityConfig, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        assemble_image(cfg, &ws, ctx).map(|_| ())
    }
}

/// Run the image target and return the path of the fresh disk image.
pub fn assemble_image(cfg: &SerenityConfig, ws: &WorkspacePaths, ctx: &ExecCtx) -> Result<PathBuf> {
    let build_dir = ws.build_dir(&cfg.build_dir_name());
    if !build_dir.is_dir() {
        return Err(Error::msg(format!(
            "build directory not found: {}",
            build_dir.display()
        )));
    }

    // A leftover image from an earlier run must not pass the check below.
    let image = build_dir.join(IMAGE_FILE_NAME);
    if image.exists() {
        ctx.log(&format!("Removing stale disk image {}", image.display()));
        fs::remove_file(&image).map_err(|e| {
            Error::msg(format!(
                "failed to remove stale disk image {}: {e}",
                image.display()
            ))
        })?;
    }

    ctx.log("Building GRUB UEFI disk image...");
    let mut cmd = Command::new("ninja");
    cmd.arg(IMAGE_TARGET);
    apply_command_env(&mut cmd, &cfg.build_env());
    cmd.current_dir(&build_dir);
    ctx.run_cmd(cmd)?;

    if !image.is_file() {
        return Err(Error::msg(format!(
            "ninja {IMAGE_TARGET} reported success but produced no disk image at {}",
            image.display()
        )));
    }
    ctx.log(&format!("Disk image ready: {}", image.display()));
    Ok(image)
}
