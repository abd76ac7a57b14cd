use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use filetime::FileTime;
use flate2::{Compression, GzBuilder};
use serenity_image_builder_macros::Task;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::serenity::{
    BOOTLOADER_SLUG, IMAGE_ARTIFACT, IMAGE_FILE_NAME, SerenityConfig,
};
use crate::workspace::WorkspacePaths;

/// The compressed, publishable artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedImage {
    pub path: PathBuf,
    pub original_size: u64,
    pub compressed_size: u64,
}

impl CompressedImage {
    /// Percentage saved relative to the raw image.
    pub fn reduction_percent(&self) -> f64 {
        if self.original_size == 0 {
            return 0.0;
        }
        (1.0 - self.compressed_size as f64 / self.original_size as f64) * 100.0
    }
}

pub fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[Task(
    id = "serenity.compress",
    module = "serenity",
    phase = "compress",
    config = SerenityConfig,
    provides = ["serenity:artifact"],
    after = ["serenity.image"],
    default_label = "Compress disk image"
)]
pub struct CompressTask;

impl CompressTask {
    pub fn run(cfg: &SerenityConfig, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        compress_image(cfg, &ws, ctx).map(|_| ())
    }
}

/// `serenity-<arch>-grub-uefi-<YYYYMMDD>.img`
pub fn artifact_file_name(arch: &str, at: DateTime<Local>) -> String {
    format!(
        "serenity-{arch}-{BOOTLOADER_SLUG}-{}.img",
        at.format("%Y%m%d")
    )
}

/// Copy the disk image out of the build tree and gzip it next to the
/// workspace root. The build output itself is left alone.
pub fn compress_image(
    cfg: &SerenityConfig,
    ws: &WorkspacePaths,
    ctx: &ExecCtx,
) -> Result<CompressedImage> {
    let source = ws.disk_image(&cfg.build_dir_name(), IMAGE_FILE_NAME);
    if !source.is_file() {
        return Err(Error::msg(format!(
            "disk image not found: {}",
            source.display()
        )));
    }

    let name = artifact_file_name(&cfg.arch, ctx.build_time());
    let copy = ws.root.join(&name);
    let target = ws.root.join(format!("{name}.gz"));

    ctx.log(&format!("Copying image to {}", copy.display()));
    copy_preserving_times(&source, &copy)?;

    ctx.log(&format!("Compressing to {}", target.display()));
    let gz = gzip_file(&copy, &name, &target);
    // The uncompressed copy goes either way; only the .gz is kept.
    let cleanup = fs::remove_file(&copy);
    gz?;
    cleanup.map_err(|e| Error::msg(format!("failed to remove {}: {e}", copy.display())))?;

    let original_size = fs::metadata(&source)?.len();
    let compressed_size = fs::metadata(&target)?.len();
    let out = CompressedImage {
        path: target,
        original_size,
        compressed_size,
    };
    ctx.log(&format!(
        "Original image size: {:.2} MB",
        megabytes(out.original_size)
    ));
    ctx.log(&format!(
        "Compressed image size: {:.2} MB ({:.1}% smaller)",
        megabytes(out.compressed_size),
        out.reduction_percent()
    ));
    ctx.log(&format!("Output file: {}", out.path.display()));
    ctx.set_artifact(IMAGE_ARTIFACT, out.path.clone());
    Ok(out)
}

fn copy_preserving_times(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to).map_err(|e| {
        Error::msg(format!(
            "failed to copy {} to {}: {e}",
            from.display(),
            to.display()
        ))
    })?;
    let meta = fs::metadata(from)?;
    filetime::set_file_times(
        to,
        FileTime::from_last_access_time(&meta),
        FileTime::from_last_modification_time(&meta),
    )?;
    Ok(())
}

// Writes to `<dest>.partial` and renames, so a crash never leaves a
// truncated archive under the final name.
fn gzip_file(input: &Path, stored_name: &str, dest: &Path) -> Result<()> {
    let partial = dest.with_extension("gz.partial");
    let res = (|| -> io::Result<()> {
        let mut reader = BufReader::new(File::open(input)?);
        let writer = BufWriter::new(File::create(&partial)?);
        let mut enc = GzBuilder::new()
            .filename(stored_name)
            .mtime(0)
            .write(writer, Compression::best());
        io::copy(&mut reader, &mut enc)?;
        let writer = enc.finish()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(e) = res {
        let _ = fs::remove_file(&partial);
        return Err(Error::msg(format!(
            "failed to compress {}: {e}",
            input.display()
        )));
    }
    fs::rename(&partial, dest).map_err(|e| {
        Error::msg(format!(
            "failed to move {} into place: {e}",
            dest.display()
        ))
    })
}
