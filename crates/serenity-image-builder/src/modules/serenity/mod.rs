//! The SerenityOS GRUB UEFI image pipeline.
//!
//! Seven stages, each a task with a fixed predecessor:
//! source → environment → toolchain → build → image → compress → manifest.
//! Every stage takes the immutable [`SerenityConfig`] plus the resolved
//! [`WorkspacePaths`](crate::workspace::WorkspacePaths) and reports failure
//! through `Result`; only the binary decides to exit.

use std::collections::BTreeMap;
use std::process::Command;

use serde::Deserialize;

use serenity_image_builder_macros::Module;

use crate::error::{Error, Result};
use crate::modules::StepConfig;

pub mod build;
pub mod compress;
pub mod environment;
pub mod image;
pub mod manifest;
pub mod source;
pub mod toolchain;

pub use build::BuildTask;
pub use compress::CompressTask;
pub use environment::EnvironmentTask;
pub use image::ImageTask;
pub use manifest::ManifestTask;
pub use source::SourceTask;
pub use toolchain::ToolchainTask;

/// Ninja target that packs the install tree into a GRUB UEFI disk.
pub const IMAGE_TARGET: &str = "grub-uefi-image";
/// File the image target leaves in the build directory.
pub const IMAGE_FILE_NAME: &str = "grub_uefi_disk_image";
/// Bootloader slug used in artifact names.
pub const BOOTLOADER_SLUG: &str = "grub-uefi";
pub const BOOTLOADER_LABEL: &str = "GRUB UEFI";

/// Artifact key under which the compress stage records its output.
pub const IMAGE_ARTIFACT: &str = "image";

fn default_repo() -> String {
    "https://github.com/SerenityOS/serenity.git".into()
}

fn default_arch() -> String {
    "x86_64".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Toolchain {
    #[default]
    #[serde(rename = "GNU")]
    Gnu,
    #[serde(rename = "Clang")]
    Clang,
}

impl Toolchain {
    pub fn as_str(self) -> &'static str {
        match self {
            Toolchain::Gnu => "GNU",
            Toolchain::Clang => "Clang",
        }
    }

    /// Script under `Toolchain/` that builds (or reuses) this toolchain.
    pub fn build_script(self) -> &'static str {
        match self {
            Toolchain::Gnu => "BuildGNU.sh",
            Toolchain::Clang => "BuildClang.sh",
        }
    }

    /// Appended to the arch to form the build directory name (`x86_64clang`).
    pub fn build_dir_suffix(self) -> &'static str {
        match self {
            Toolchain::Gnu => "",
            Toolchain::Clang => "clang",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SudoMode {
    /// Use sudo unless already running as root.
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub skip: bool,
    pub ci_env_vars: Vec<String>,
    pub sudo: SudoMode,
    pub package_manager: String,
    pub packages: Vec<String>,
    pub compiler: String,
    pub compiler_version: u32,
    pub allow_compiler_mismatch: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            skip: false,
            ci_env_vars: vec!["CI".into(), "GITHUB_ACTIONS".into()],
            sudo: SudoMode::Auto,
            package_manager: "apt-get".into(),
            packages: [
                "build-essential",
                "cmake",
                "curl",
                "libmpfr-dev",
                "libmpc-dev",
                "libgmp-dev",
                "e2fsprogs",
                "ninja-build",
                "qemu-system-gui",
                "qemu-system-x86",
                "qemu-utils",
                "ccache",
                "rsync",
                "unzip",
                "texinfo",
                "libssl-dev",
                "zlib1g-dev",
                "gcc-13",
                "g++-13",
                "grub-efi-amd64-bin",
                "mtools",
                "dosfstools",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            compiler: "gcc-13".into(),
            compiler_version: 13,
            allow_compiler_mismatch: false,
        }
    }
}

/// Immutable pipeline configuration, `[serenity]` in the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerenityConfig {
    #[serde(default = "default_repo")]
    pub repo: String,
    pub branch: Option<String>,
    #[serde(default = "default_arch")]
    pub arch: String,
    pub toolchain: Toolchain,
    pub environment: EnvironmentConfig,
    pub steps: BTreeMap<String, StepConfig>,
}

impl Default for SerenityConfig {
    fn default() -> Self {
        Self {
            repo: default_repo(),
            branch: None,
            arch: default_arch(),
            toolchain: Toolchain::Gnu,
            environment: EnvironmentConfig::default(),
            steps: BTreeMap::new(),
        }
    }
}

impl SerenityConfig {
    /// Directory under `Build/` that `Meta/serenity.sh` uses for this
    /// arch and toolchain.
    pub fn build_dir_name(&self) -> String {
        format!("{}{}", self.arch, self.toolchain.build_dir_suffix())
    }

    pub fn validate(&self) -> Result<()> {
        if self.repo.trim().is_empty() {
            return Err(Error::msg("serenity.repo is empty"));
        }
        // The arch ends up in directory and file names.
        let arch = self.arch.as_str();
        if arch.is_empty() || !arch.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::msg(format!(
                "serenity.arch '{arch}' is invalid (allowed: a-zA-Z0-9_)"
            )));
        }
        if self.environment.compiler.trim().is_empty() {
            return Err(Error::msg("serenity.environment.compiler is empty"));
        }
        const STEPS: &[&str] = &[
            "source",
            "environment",
            "toolchain",
            "build",
            "image",
            "compress",
            "manifest",
        ];
        if let Some(unknown) = self.steps.keys().find(|k| !STEPS.contains(&k.as_str())) {
            return Err(Error::msg(format!(
                "unknown step 'serenity.steps.{unknown}' (known: {})",
                STEPS.join(", ")
            )));
        }
        Ok(())
    }

    /// Variables SerenityOS' build drivers read to pick target and toolchain.
    pub fn build_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("SERENITY_ARCH".into(), self.arch.clone());
        env.insert("SERENITY_TOOLCHAIN".into(), self.toolchain.as_str().into());
        env
    }
}

pub fn apply_command_env(cmd: &mut Command, envs: &BTreeMap<String, String>) {
    for (k, v) in envs {
        cmd.env(k, v);
    }
}

#[Module(
    id = "serenity",
    config = SerenityConfig,
    required = true,
    tasks = [
        SourceTask,
        EnvironmentTask,
        ToolchainTask,
        BuildTask,
        ImageTask,
        CompressTask,
        ManifestTask
    ]
)]
pub struct SerenityModule;
