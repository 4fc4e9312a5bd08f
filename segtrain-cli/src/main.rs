//! segtrain CLI: launch a COCO instance-segmentation training run.
//!
//! The launcher process opens the tracked run and spawns one worker per GPU;
//! each worker runs the driver. A single-GPU run executes in-process.

use clap::Parser;
use segtrain_core::comm::{LaunchOptions, WorkerEnv, launch};
use segtrain_core::tracking::{ENV_RUN_ID, NullTracker, open_tracker};
use segtrain_core::workspace::{AutoApprove, DeletionApprover};
use segtrain_core::{
    ApprovalDecision, ConfigSources, DriverArgs, RunContext, RunStatus, Tracker, TrackingSettings,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Train, evaluate and report on a COCO instance-segmentation dataset
#[derive(Parser, Debug, Clone)]
#[command(name = "segtrain", version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// COCO instances file of the training split
    #[arg(long)]
    train_label_path: PathBuf,

    /// COCO instances file of the test split
    #[arg(long)]
    test_label_path: PathBuf,

    /// Image directory of the training split (defaults to the label file's directory)
    #[arg(long)]
    train_image_root: Option<PathBuf>,

    /// Image directory of the test split (defaults to the label file's directory)
    #[arg(long)]
    test_image_root: Option<PathBuf>,

    /// Class names, in ascending category-id order
    #[arg(long, value_delimiter = ',', required = true)]
    thing_classes: Vec<String>,

    /// Output directory (overrides `output_dir` from the config)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Resume from the last checkpoint in the output directory
    #[arg(long)]
    resume: bool,

    /// Only evaluate the configured or resumed weights
    #[arg(long)]
    eval_only: bool,

    /// Worker processes per machine
    #[arg(long, default_value_t = 1)]
    num_gpus: usize,

    /// Total number of machines
    #[arg(long, default_value_t = 1)]
    num_machines: usize,

    /// Rank of this machine
    #[arg(long, default_value_t = 0)]
    machine_rank: usize,

    /// Rendezvous URL (`tcp://host:port`), or `auto` on a single machine
    #[arg(long, default_value = "auto")]
    dist_url: String,

    /// Name of the tracked run (ignored when attaching to MLFLOW_RUN_ID)
    #[arg(long)]
    run_name: Option<String>,

    /// Delete a previous run's output without asking
    #[arg(short, long)]
    yes: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Configuration overrides as `KEY=VALUE` pairs, e.g. `solver.max_iter=500`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    opts: Vec<String>,
}

impl Cli {
    fn driver_args(&self) -> DriverArgs {
        DriverArgs {
            train_label_path: self.train_label_path.clone(),
            test_label_path: self.test_label_path.clone(),
            train_image_root: self.train_image_root.clone(),
            test_image_root: self.test_image_root.clone(),
            thing_classes: self
                .thing_classes
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            config: ConfigSources {
                config_file: self.config_file.clone(),
                overrides: self.opts.clone(),
                output_dir: self.output_dir.clone(),
                ..ConfigSources::with_env()
            },
            resume: self.resume,
            eval_only: self.eval_only,
        }
    }

    fn tracking_settings(&self) -> TrackingSettings {
        let settings = TrackingSettings::from_env();
        match &self.run_name {
            Some(name) => settings.with_run_name(name.trim()),
            None => settings,
        }
    }

    fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            num_gpus: self.num_gpus,
            num_machines: self.num_machines,
            machine_rank: self.machine_rank,
            dist_url: self.dist_url.clone(),
            ..LaunchOptions::default()
        }
    }
}

/// Asks on the terminal before a previous run's output is deleted.
struct PromptApprover;

impl DeletionApprover for PromptApprover {
    fn approve(&self, root: &Path, entries: &[PathBuf]) -> ApprovalDecision {
        const SHOWN: usize = 20;
        eprintln!(
            "\n  The output directory {} holds a previous run:",
            root.display()
        );
        for entry in entries.iter().take(SHOWN) {
            eprintln!("    {}", entry.display());
        }
        if entries.len() > SHOWN {
            eprintln!("    ... and {} more", entries.len() - SHOWN);
        }
        match dialoguer::Confirm::new()
            .with_prompt("Delete these entries and start a fresh run? (use --resume to keep them)")
            .default(false)
            .interact()
        {
            Ok(true) => ApprovalDecision::Approved,
            Ok(false) => ApprovalDecision::Denied,
            Err(e) => {
                tracing::warn!(error = %e, "could not ask for deletion approval");
                ApprovalDecision::Denied
            }
        }
    }
}

fn init_tracing(cli: &Cli, worker: Option<&WorkerEnv>) -> tracing_appender::non_blocking::WorkerGuard {
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // Human-readable layer for stderr (always active)
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer, one file per rank. Kept out of the output directory,
    // which a fresh run wipes.
    let log_dir = directories::ProjectDirs::from("dev", "segtrain", "segtrain")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_name = match worker {
        Some(env) => format!("segtrain.rank{}.log", env.world.rank),
        None if cli.num_gpus * cli.num_machines <= 1 => "segtrain.rank0.log".to_string(),
        None => format!("segtrain.launcher{}.log", cli.machine_rank),
    };
    let file_appender = tracing_appender::rolling::daily(&log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let worker_env = WorkerEnv::from_env()?;
    let _guard = init_tracing(&cli, worker_env.as_ref());

    if worker_env.is_none() {
        println!("Command Line Args: {cli:#?}");
    }

    // The launcher on the first machine owns the tracked run; workers attach to it.
    let launcher_tracker: Option<Arc<dyn Tracker>> =
        if worker_env.is_none() && cli.machine_rank == 0 {
            Some(open_tracker(&cli.tracking_settings()).await?)
        } else {
            None
        };

    let mut options = cli.launch_options();
    if let Some(tracker) = &launcher_tracker {
        let run_id = tracker.record().await.run_id;
        if !run_id.is_empty() {
            options.worker_env.push((ENV_RUN_ID.to_string(), run_id));
        }
    }

    let approver: Arc<dyn DeletionApprover> = if cli.yes {
        Arc::new(AutoApprove)
    } else {
        Arc::new(PromptApprover)
    };
    let args = cli.driver_args();
    let inline_tracker = launcher_tracker.clone();

    let result = launch(&options, move |world, comm| async move {
        let tracker: Arc<dyn Tracker> = match inline_tracker {
            Some(tracker) if !world.is_distributed() => tracker,
            _ if world.is_main_process() => open_tracker(&TrackingSettings::from_env()).await?,
            _ => Arc::new(NullTracker::new()),
        };
        let ctx = RunContext::new(world, comm, tracker, approver);
        let summary = segtrain_core::run(&ctx, &args).await?;
        if world.is_main_process() {
            tracing::info!(
                mode = ?summary.mode,
                iterations = summary.iterations_run,
                images = summary.comparison_images.len(),
                output_dir = %summary.output_dir.display(),
                "run complete"
            );
            for (key, value) in &summary.metrics {
                println!("{key}: {value:.4}");
            }
        }
        Ok(())
    })
    .await;

    if let Some(tracker) = &launcher_tracker {
        let status = if result.is_ok() {
            RunStatus::Finished
        } else {
            RunStatus::Failed
        };
        if let Err(e) = tracker.finish(status).await {
            tracing::warn!(error = %e, "failed to close the tracked run");
        }
    }
    result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_full_command_line() {
        let cli = Cli::try_parse_from([
            "segtrain",
            "--train-label-path",
            "data/train/labels.json",
            "--test-label-path",
            "data/test/labels.json",
            "--thing-classes",
            "cat, dog",
            "--num-gpus",
            "2",
            "--resume",
            "solver.max_iter=10",
            "test.eval_period=5",
        ])
        .unwrap();
        let args = cli.driver_args();
        assert_eq!(args.thing_classes, vec!["cat".to_string(), "dog".to_string()]);
        assert_eq!(
            args.config.overrides,
            vec!["solver.max_iter=10".to_string(), "test.eval_period=5".to_string()]
        );
        assert_eq!(args.config.env_prefix.as_deref(), Some("SEGTRAIN_"));
        assert!(args.resume);
        assert!(!args.eval_only);
        let options = cli.launch_options();
        assert_eq!(options.world_size(), 2);
        assert_eq!(options.dist_url, "auto");
        assert_eq!(cli.run_name, None);
    }

    #[test]
    fn test_run_name_reaches_tracking_settings() {
        let cli = Cli::try_parse_from([
            "segtrain",
            "--train-label-path",
            "a.json",
            "--test-label-path",
            "b.json",
            "--thing-classes",
            "cat",
            "--run-name",
            "baseline ",
        ])
        .unwrap();
        assert_eq!(cli.tracking_settings().run_name.as_deref(), Some("baseline"));
    }

    #[test]
    fn test_label_paths_are_required() {
        assert!(Cli::try_parse_from(["segtrain", "--thing-classes", "a"]).is_err());
    }
}
