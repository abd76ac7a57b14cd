mod common;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common::{ARTIFACT_NAME, CollectSink, FakeRunner, Recorded, ctx_with, exit};
use serenity_image_builder::config::{self, ConfigDoc};
use serenity_image_builder::executor::{CmdOutput, builtin_registry, execute_plan};
use serenity_image_builder::modules::plan_for;

fn doc_for(root: &Path) -> ConfigDoc {
    let raw = format!(
        r#"
[workspace]
root_dir = "{}"
"#,
        root.display()
    );
    let build_file = root.join("build.toml");
    fs::write(&build_file, raw).expect("write config");
    config::load(&build_file).expect("load config")
}

/// Behaves like the real tools: clone creates the checkout, the build creates
/// the build dir, packaging writes the disk image (unless told to fail).
fn simulated_tools(root: &Path, packaging_fails: Arc<AtomicBool>) -> Arc<FakeRunner> {
    let root: PathBuf = root.to_path_buf();
    FakeRunner::new(move |rec: &Recorded| {
        let build_dir = root.join("serenity/Build/x86_64");
        match (rec.program.as_str(), rec.args.first().map(String::as_str)) {
            ("git", Some("clone")) => {
                fs::create_dir_all(root.join("serenity/Toolchain")).expect("mkdir");
                exit(0, &["Cloning into 'serenity'..."])
            }
            (p, Some("build")) if p.ends_with("Meta/serenity.sh") => {
                fs::create_dir_all(&build_dir).expect("mkdir");
                exit(0, &["[100/100] Linking Kernel"])
            }
            ("ninja", Some("grub-uefi-image")) => {
                if packaging_fails.load(Ordering::SeqCst) {
                    return exit(1, &["grub-install: error: cannot find EFI directory."]);
                }
                fs::write(build_dir.join("grub_uefi_disk_image"), vec![0u8; 64 * 1024])
                    .expect("write image");
                exit(0, &[])
            }
            _ => CmdOutput::ok(),
        }
    })
}

fn ci_env() -> BTreeMap<String, String> {
    BTreeMap::from([("GITHUB_ACTIONS".to_string(), "true".to_string())])
}

#[test]
fn full_pipeline_produces_artifact_and_manifest() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    let doc = doc_for(root);
    let plan = plan_for(&doc).expect("plan");
    let reg = builtin_registry().expect("registry");

    let runner = simulated_tools(root, Arc::new(AtomicBool::new(false)));
    let sink = Arc::new(CollectSink::default());
    let mut ctx = ctx_with(runner.clone(), sink.clone()).with_env(ci_env());
    execute_plan(&doc, &plan, &reg, &mut ctx).expect("run");

    assert_eq!(
        sink.started(),
        vec![
            "core.init",
            "serenity.source",
            "serenity.environment",
            "serenity.toolchain",
            "serenity.build",
            "serenity.image",
            "serenity.compress",
            "serenity.manifest",
        ]
    );
    let lines = runner.lines();
    assert!(lines[0].starts_with("git clone --depth 1 "));
    assert!(lines[1].ends_with("Toolchain/BuildGNU.sh"));
    assert!(lines[2].ends_with("Meta/serenity.sh build"));
    assert_eq!(lines[3], "ninja install");
    assert_eq!(lines[4], "ninja grub-uefi-image");
    assert_eq!(lines.len(), 5, "CI run installs no packages");

    assert!(root.join(ARTIFACT_NAME).is_file());
    let manifest = fs::read_to_string(root.join("build-info.txt")).expect("manifest");
    assert!(manifest.contains(ARTIFACT_NAME));
    assert!(
        sink.log_lines()
            .iter()
            .any(|l| l.starts_with("Running: git clone"))
    );
}

#[test]
fn packaging_failure_stops_before_compression() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    let doc = doc_for(root);
    let plan = plan_for(&doc).expect("plan");
    let reg = builtin_registry().expect("registry");

    let runner = simulated_tools(root, Arc::new(AtomicBool::new(true)));
    let sink = Arc::new(CollectSink::default());
    let mut ctx = ctx_with(runner.clone(), sink.clone()).with_env(ci_env());
    let err = execute_plan(&doc, &plan, &reg, &mut ctx).unwrap_err();

    let msg = err.to_string();
    assert!(msg.starts_with("task 'serenity.image' failed"), "{msg}");
    assert!(msg.contains("exit code 1"), "{msg}");
    assert!(!sink.started().iter().any(|id| id == "serenity.compress"));
    assert!(!root.join(ARTIFACT_NAME).exists());
    assert!(!root.join("build-info.txt").exists());
}

#[test]
fn rerun_reuses_checkout_and_replaces_outputs() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    let doc = doc_for(root);
    let plan = plan_for(&doc).expect("plan");
    let reg = builtin_registry().expect("registry");

    let fail = Arc::new(AtomicBool::new(true));
    let runner = simulated_tools(root, fail.clone());
    let mut ctx = ctx_with(runner.clone(), Arc::new(CollectSink::default())).with_env(ci_env());
    assert!(execute_plan(&doc, &plan, &reg, &mut ctx).is_err());

    // Second attempt after the packaging problem is fixed.
    fail.store(false, Ordering::SeqCst);
    let runner2 = simulated_tools(root, fail);
    let mut ctx = ctx_with(runner2.clone(), Arc::new(CollectSink::default())).with_env(ci_env());
    execute_plan(&doc, &plan, &reg, &mut ctx).expect("second run");
    assert!(
        !runner2.lines().iter().any(|l| l.starts_with("git clone")),
        "existing checkout must be reused"
    );

    // And a third run over complete outputs still succeeds.
    let runner3 = simulated_tools(root, Arc::new(AtomicBool::new(false)));
    let mut ctx = ctx_with(runner3, Arc::new(CollectSink::default())).with_env(ci_env());
    execute_plan(&doc, &plan, &reg, &mut ctx).expect("third run");
    assert!(root.join(ARTIFACT_NAME).is_file());
    assert!(root.join("build-info.txt").is_file());
}

#[test]
fn dry_run_touches_nothing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    let doc = doc_for(root);
    let plan = plan_for(&doc).expect("plan");
    let reg = builtin_registry().expect("registry");

    let runner = FakeRunner::succeeding();
    let sink = Arc::new(CollectSink::default());
    let mut ctx = ctx_with(runner.clone(), sink.clone());
    ctx.dry_run = true;
    execute_plan(&doc, &plan, &reg, &mut ctx).expect("dry run");

    assert!(runner.calls().is_empty());
    assert_eq!(sink.started().len(), 8);
    assert!(!root.join("serenity").exists());
    let logs = sink.log_lines();
    assert!(
        logs.iter()
            .any(|l| l == "DRY-RUN: serenity.image (serenity/image)"),
        "{logs:?}"
    );
    assert!(!logs.iter().any(|l| l.starts_with("Running: ")));
}
