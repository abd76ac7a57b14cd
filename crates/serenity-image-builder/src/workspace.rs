use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Directory name of the SerenityOS checkout under the workspace root.
pub const SOURCE_DIR_NAME: &str = "serenity";
/// Fixed name of the text manifest written next to the artifact.
pub const MANIFEST_FILE_NAME: &str = "build-info.txt";

fn default_root_dir() -> String {
    ".".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
        }
    }
}

/// Absolute locations of everything the pipeline reads or leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub source_dir: PathBuf,
    pub manifest: PathBuf,
}

impl WorkspacePaths {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            source_dir: root.join(SOURCE_DIR_NAME),
            manifest: root.join(MANIFEST_FILE_NAME),
            root,
        }
    }

    /// `<source>/Build/<name>`, produced by the SerenityOS build driver.
    /// The name is the arch, suffixed for non-GNU toolchains.
    pub fn build_dir(&self, name: &str) -> PathBuf {
        self.source_dir.join("Build").join(name)
    }

    pub fn disk_image(&self, build_dir_name: &str, file_name: &str) -> PathBuf {
        self.build_dir(build_dir_name).join(file_name)
    }
}

pub fn load_paths(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    let raw = cfg.root_dir.trim();
    if raw.is_empty() {
        return Err(Error::msg("workspace.root_dir is empty"));
    }
    let root = PathBuf::from(raw);
    let root = if root.is_absolute() {
        root
    } else {
        cwd.join(root)
    };
    Ok(WorkspacePaths::at(normalize(&root)))
}

/// Resolve paths and make sure the root exists. Nothing is ever cleaned:
/// earlier checkouts and toolchains are what makes re-runs cheap.
pub fn init_dirs(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let paths = load_paths(cfg)?;
    fs::create_dir_all(&paths.root).map_err(|e| {
        Error::msg(format!(
            "failed to create workspace root {}: {e}",
            paths.root.display()
        ))
    })?;
    Ok(paths)
}

// Lexical cleanup of `.` segments so logged paths read naturally.
fn normalize(p: &Path) -> PathBuf {
    p.components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect()
}
