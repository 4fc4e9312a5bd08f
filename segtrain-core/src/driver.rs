//! The training driver: one linear pass from dataset registration to the
//! sample comparison report.
//!
//! Everything the driver touches arrives through [`RunContext`]; nothing is
//! looked up from process-wide state.

use crate::backend::{TrainBackend, device_for_local_rank};
use crate::checkpoint::DetectionCheckpointer;
use crate::comm::{Comm, World};
use crate::config::{ConfigSources, RunConfig};
use crate::data::{DatasetRegistry, register_dataset};
use crate::engine::{
    DistributedDataParallel, EngineContext, Trainable, do_evaluate, do_train,
};
use crate::error::{Result, SegTrainError};
use crate::evaluation::EvaluationResults;
use crate::modeling::build_model;
use crate::persistence::atomic_write_json;
use crate::report::SampleComparison;
use crate::reproducibility::EnvironmentSnapshot;
use crate::tracking::Tracker;
use crate::workspace::{DeletionApprover, OutputWorkspace, SAMPLE_DIR};
use burn::module::AutodiffModule;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Artifact path of the logged trained model.
pub const MODEL_ARTIFACT: &str = "model_best";

/// Per-process collaborators of one run.
#[derive(Clone)]
pub struct RunContext {
    pub world: World,
    pub comm: Comm,
    pub tracker: Arc<dyn Tracker>,
    pub approver: Arc<dyn DeletionApprover>,
}

impl RunContext {
    pub fn new(
        world: World,
        comm: Comm,
        tracker: Arc<dyn Tracker>,
        approver: Arc<dyn DeletionApprover>,
    ) -> Self {
        Self {
            world,
            comm,
            tracker,
            approver,
        }
    }
}

/// What the command line asks of a run.
#[derive(Debug, Clone, Default)]
pub struct DriverArgs {
    pub train_label_path: PathBuf,
    pub test_label_path: PathBuf,
    pub train_image_root: Option<PathBuf>,
    pub test_image_root: Option<PathBuf>,
    pub thing_classes: Vec<String>,
    pub config: ConfigSources,
    pub resume: bool,
    pub eval_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    EvalOnly,
    Train,
}

/// What a run did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub mode: RunMode,
    pub output_dir: PathBuf,
    pub wrapped_for_ddp: bool,
    pub iterations_run: usize,
    /// Evaluation results as returned by the evaluator.
    pub results: EvaluationResults,
    /// Metrics logged to the tracker (main process only).
    pub metrics: BTreeMap<String, f64>,
    pub comparison_images: Vec<PathBuf>,
}

/// Run one training (or evaluation-only) job on this process.
pub async fn run(ctx: &RunContext, args: &DriverArgs) -> Result<RunSummary> {
    let main = ctx.world.is_main_process();
    let device = device_for_local_rank(ctx.world.local_rank);

    let mut registry = DatasetRegistry::new();
    let (train_name, num_classes) = register_dataset(
        &mut registry,
        &args.train_label_path,
        &args.thing_classes,
        args.train_image_root.as_deref(),
    )?;
    let (test_name, test_classes) = register_dataset(
        &mut registry,
        &args.test_label_path,
        &args.thing_classes,
        args.test_image_root.as_deref(),
    )?;
    if num_classes != test_classes {
        return Err(SegTrainError::dataset(format!(
            "train split has {num_classes} classes but test split has {test_classes}"
        )));
    }

    let (cfg, hyperparameters) =
        RunConfig::assemble(&args.config, &train_name, &test_name, num_classes)?;

    let workspace = OutputWorkspace::new(&cfg.output_dir);
    if main {
        let report = workspace.prepare(args.resume, ctx.approver.as_ref())?;
        tracing::info!(
            dir = %workspace.root().display(),
            deleted = report.deleted.len(),
            resume = args.resume,
            "output directory ready"
        );
    }
    ctx.comm.barrier().await?;

    if main {
        ctx.tracker.log_params(&hyperparameters).await?;
    }
    let model = build_model::<TrainBackend>(&cfg, &device)?;

    let engine = EngineContext {
        world: ctx.world,
        comm: &ctx.comm,
        registry: &registry,
    };

    if args.eval_only {
        let checkpointer = DetectionCheckpointer::new(&cfg.output_dir, main);
        let (model, _) = checkpointer.resume_or_load(
            model.valid(),
            cfg.model.weights.as_deref(),
            args.resume,
            &device,
        )?;
        let results = do_evaluate(&engine, &cfg, &model, &device).await?;
        let metrics = log_results(ctx, &results, 0).await?;
        return Ok(RunSummary {
            mode: RunMode::EvalOnly,
            output_dir: cfg.output_dir.clone(),
            wrapped_for_ddp: false,
            iterations_run: 0,
            results,
            metrics,
            comparison_images: Vec::new(),
        });
    }

    let trainable = if ctx.world.is_distributed() {
        Trainable::DataParallel(
            DistributedDataParallel::wrap::<TrainBackend>(model, ctx.comm.clone(), &device)
                .await?,
        )
    } else {
        Trainable::Local(model)
    };
    let wrapped_for_ddp = trainable.is_data_parallel();

    let (model, train_report) = do_train(&engine, &cfg, trainable, args.resume, &device).await?;
    let final_iter = (train_report.start_iter + train_report.iterations_run) as u64;

    if main {
        let artifact_dir = cfg.output_dir.join(MODEL_ARTIFACT);
        std::fs::create_dir_all(&artifact_dir)?;
        DetectionCheckpointer::new(&artifact_dir, true)
            .export(&model, &artifact_dir.join("model.bin"))?;
        atomic_write_json(
            &artifact_dir.join("environment.json"),
            &EnvironmentSnapshot::capture(),
        )?;
        cfg.dump(&artifact_dir.join("config.toml"))?;
        ctx.tracker
            .log_artifacts(&artifact_dir, Some(MODEL_ARTIFACT))
            .await?;
    }

    let results = do_evaluate(&engine, &cfg, &model, &device).await?;
    let metrics = log_results(ctx, &results, final_iter).await?;

    let mut comparison_images = Vec::new();
    if main {
        let records = registry.get(&test_name)?;
        comparison_images = SampleComparison::default().compare_gt(
            &cfg,
            &records,
            &workspace.model_best_path(),
            workspace.sample_dir(),
            &device,
        )?;
        ctx.tracker
            .log_artifacts(workspace.sample_dir(), Some(SAMPLE_DIR))
            .await?;
    }
    ctx.comm.barrier().await?;

    Ok(RunSummary {
        mode: RunMode::Train,
        output_dir: cfg.output_dir.clone(),
        wrapped_for_ddp,
        iterations_run: train_report.iterations_run,
        results,
        metrics,
        comparison_images,
    })
}

/// Log `<metric><task>` keys for every task; returns what was logged.
async fn log_results(
    ctx: &RunContext,
    results: &EvaluationResults,
    step: u64,
) -> Result<BTreeMap<String, f64>> {
    if !ctx.world.is_main_process() {
        return Ok(BTreeMap::new());
    }
    let mut metrics = BTreeMap::new();
    for task in results.0.keys() {
        metrics.extend(results.suffixed(task));
    }
    ctx.tracker.log_metrics(&metrics, step).await?;
    Ok(metrics)
}
