use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serenity_image_builder_macros::Task;
use sha2::{Digest, Sha256};

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::serenity::compress::megabytes;
use crate::modules::serenity::{BOOTLOADER_LABEL, IMAGE_ARTIFACT, SerenityConfig};
use crate::workspace::WorkspacePaths;

/// Facts about the artifact that end up in `build-info.txt`.
#[derive(Debug, Clone)]
pub struct ManifestInfo<'a> {
    pub built_at: DateTime<Local>,
    pub arch: &'a str,
    pub toolchain: &'a str,
    pub file_name: &'a str,
    pub size_bytes: u64,
    pub sha256: &'a str,
}

#[Task(
    id = "serenity.manifest",
    module = "serenity",
    phase = "manifest",
    config = SerenityConfig,
    provides = ["serenity:manifest"],
    after = ["serenity.compress"],
    default_label = "Write build manifest"
)]
pub struct ManifestTask;

impl ManifestTask {
    pub fn run(cfg: &SerenityConfig, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let Some(image) = ctx.artifact(IMAGE_ARTIFACT) else {
            return Err(Error::msg(
                "no compressed image recorded (serenity.compress must run first)",
            ));
        };
        write_manifest(cfg, &ws, &image, ctx).map(|_| ())
    }
}

/// Overwrite the manifest describing `image`; returns the manifest path.
pub fn write_manifest(
    cfg: &SerenityConfig,
    ws: &WorkspacePaths,
    image: &Path,
    ctx: &ExecCtx,
) -> Result<PathBuf> {
    let size_bytes = fs::metadata(image)
        .map_err(|e| Error::msg(format!("cannot stat {}: {e}", image.display())))?
        .len();
    let sha256 = sha256_file(image)?;
    let file_name = image
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::msg(format!("invalid artifact path {}", image.display())))?;

    let text = render_manifest(&ManifestInfo {
        built_at: ctx.build_time(),
        arch: &cfg.arch,
        toolchain: cfg.toolchain.as_str(),
        file_name,
        size_bytes,
        sha256: &sha256,
    });
    fs::write(&ws.manifest, text).map_err(|e| {
        Error::msg(format!(
            "failed to write {}: {e}",
            ws.manifest.display()
        ))
    })?;
    ctx.log(&format!("Created build info file: {}", ws.manifest.display()));
    Ok(ws.manifest.clone())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn render_manifest(info: &ManifestInfo<'_>) -> String {
    let raw = info.file_name.strip_suffix(".gz").unwrap_or(info.file_name);
    let mut s = String::new();
    let rule = "=".repeat(50);

    // Writing to a String cannot fail.
    let _ = writeln!(s, "SerenityOS Build Information");
    let _ = writeln!(s, "{rule}");
    let _ = writeln!(
        s,
        "Build Date: {}",
        info.built_at.format("%Y-%m-%d %H:%M:%S")
    );
    let _ = writeln!(s, "Architecture: {}", info.arch);
    let _ = writeln!(s, "Toolchain: {}", info.toolchain);
    let _ = writeln!(s, "Bootloader: {BOOTLOADER_LABEL}");
    let _ = writeln!(s, "Image File: {}", info.file_name);
    let _ = writeln!(
        s,
        "Image Size: {:.2} MB ({} bytes)",
        megabytes(info.size_bytes),
        info.size_bytes
    );
    let _ = writeln!(s, "SHA-256: {}", info.sha256);

    let _ = writeln!(s);
    let _ = writeln!(s, "Usage Instructions:");
    let _ = writeln!(s, "1. Extract: gunzip {}", info.file_name);
    let _ = writeln!(
        s,
        "2. Write to USB: sudo dd if={raw} of=/dev/sdX bs=4M status=progress"
    );
    let _ = writeln!(
        s,
        "3. Boot in QEMU: qemu-system-{} -m 2G -bios /usr/share/ovmf/OVMF.fd -drive file={raw},format=raw",
        info.arch
    );
    let _ = writeln!(
        s,
        "4. Or attach {raw} as a disk in VirtualBox/VMware with EFI enabled"
    );

    let _ = writeln!(s);
    let _ = writeln!(s, "Minimum Hardware Requirements:");
    let _ = writeln!(s, "- {} CPU with UEFI firmware", info.arch);
    let _ = writeln!(s, "- 2 GB RAM");
    let _ = writeln!(s, "- 4 GB storage (USB drive or virtual disk)");

    let _ = writeln!(s);
    let _ = writeln!(s, "Default Credentials:");
    let _ = writeln!(s, "- User: anon / Password: foo");
    let _ = writeln!(s, "- Root: root / Password: foo");
    s
}
