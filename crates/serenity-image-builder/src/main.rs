use clap::{Args, Parser, Subcommand};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use serenity_image_builder::Result;
use serenity_image_builder::config::{self, ConfigDoc};
use serenity_image_builder::executor::{self, ExecCtx, StdoutSink, log_line};
use serenity_image_builder::modules::serenity::IMAGE_ARTIFACT;

#[derive(Debug, Parser)]
#[command(author, version, about = "Build a SerenityOS GRUB UEFI disk image")]
struct Cli {
    /// Enable debug diagnostics on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the whole pipeline (the default)
    Run(RunArgs),
    /// Print the ordered stage plan
    Plan {
        /// Optional build config TOML
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Print the fully-resolved TOML config (after extends)
    Resolve {
        /// Optional build config TOML
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Optional build config TOML
    #[arg(long)]
    config: Option<PathBuf>,
    /// Workspace root (defaults to the current directory)
    #[arg(long)]
    work_dir: Option<PathBuf>,
    /// Log what would run without executing anything
    #[arg(long)]
    dry_run: bool,
    /// Continue past a compiler version mismatch without asking
    #[arg(long)]
    force: bool,
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    panic::set_hook(Box::new(|info| {
        let bt = std::backtrace::Backtrace::force_capture();
        log_line(&format!("FATAL ERROR: {info}"));
        eprintln!("{bt}");
    }));

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match cli.cmd {
        None => cmd_run(RunArgs::default()),
        Some(Command::Run(args)) => cmd_run(args),
        Some(Command::Plan { config, dot }) => cmd_plan(config.as_deref(), dot),
        Some(Command::Resolve { config }) => cmd_resolve(config.as_deref()),
    }));

    match outcome {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) if e.is_interrupted() => {
            log_line("Build interrupted by user");
            ExitCode::FAILURE
        }
        Ok(Err(e)) => {
            log_line(&format!("FATAL ERROR: {e}"));
            ExitCode::FAILURE
        }
        // Already reported by the panic hook.
        Err(_) => ExitCode::FAILURE,
    }
}

fn load_config(path: Option<&Path>) -> Result<ConfigDoc> {
    let doc = config::load_or_default(path)?;
    tracing::debug!(config = %doc.path.display(), "configuration loaded");
    Ok(doc)
}

fn cmd_plan(path: Option<&Path>, dot: bool) -> Result<()> {
    let doc = load_config(path)?;
    let plan = serenity_image_builder::modules::plan_for(&doc)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }

    for (i, task) in plan.ordered()?.iter().enumerate() {
        println!(
            "{:>2}. {:<22}  {:<10} {:<12}  {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn cmd_resolve(path: Option<&Path>) -> Result<()> {
    let doc = load_config(path)?;
    let s = toml::to_string_pretty(&doc.value).unwrap_or_else(|_| format!("{:?}", doc.value));
    print!("{s}");
    Ok(())
}

fn cmd_run(args: RunArgs) -> Result<()> {
    serenity_image_builder::signal::install_handlers()?;

    let mut doc = load_config(args.config.as_deref())?;
    if let Some(dir) = &args.work_dir {
        doc.set(
            "workspace.root_dir",
            toml::Value::String(dir.display().to_string()),
        );
    }
    let plan = serenity_image_builder::modules::plan_for(&doc)?;
    let reg = executor::builtin_registry()?;

    let rule = "=".repeat(60);
    log_line(&rule);
    log_line("SerenityOS Builder Starting");
    log_line(&rule);

    let sink = Arc::new(StdoutSink::default());
    let mut ctx = ExecCtx::new(args.dry_run, sink).with_force(args.force);
    executor::execute_plan(&doc, &plan, &reg, &mut ctx)?;

    log_line(&rule);
    log_line("Build completed successfully!");
    if let Some(image) = ctx.artifact(IMAGE_ARTIFACT) {
        log_line(&format!("Artifact ready: {}", image.display()));
    }
    log_line(&rule);
    Ok(())
}
