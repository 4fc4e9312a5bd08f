//! The training loop.

use super::ddp::all_reduce_gradients;
use super::evaluate::do_evaluate;
use super::hooks::{EvalHook, HookAction, LossSpikeMonitor, NonFiniteLossGuard, TrainHook};
use super::metrics::{EventStorage, IterationEvent};
use super::{EngineContext, Trainable};
use crate::backend::{DefaultBackend, DefaultDevice, TrainBackend};
use crate::checkpoint::{
    BEST_CHECKPOINT, BestCheckpointer, DetectionCheckpointer, PeriodicCheckpointer, TrainingState,
};
use crate::config::{RunConfig, SolverConfig};
use crate::data::{DatasetRecord, TrainLoader};
use crate::error::{Result, SegTrainError};
use crate::evaluation::EvaluationResults;
use crate::modeling::{LossBreakdown, MaskDetector, detection_losses};
use crate::reproducibility::seed_for;
use burn::module::AutodiffModule;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Metric that selects `model_best`.
pub const BEST_METRIC: (&str, &str) = ("bbox", "AP50");
const LOG_PERIOD: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainReport {
    pub start_iter: usize,
    pub iterations_run: usize,
    pub final_losses: Option<LossBreakdown>,
    pub best_metric: Option<f64>,
    /// Evaluations run during training, by completed iteration count.
    pub evaluations: Vec<(usize, EvaluationResults)>,
    pub total_time_secs: f64,
}

/// Linear warm-up from `warmup_factor`, then `x gamma` at each step.
pub fn learning_rate(solver: &SolverConfig, iteration: usize) -> f64 {
    let warmup = if iteration < solver.warmup_iters {
        let alpha = iteration as f64 / solver.warmup_iters as f64;
        solver.warmup_factor * (1.0 - alpha) + alpha
    } else {
        1.0
    };
    let decays = solver.steps.iter().filter(|&&s| s <= iteration).count();
    solver.base_lr * warmup * solver.gamma.powi(decays as i32)
}

/// Train to `solver.max_iter`, resuming from the last checkpoint when asked.
/// Returns the model in inference mode.
pub async fn do_train(
    ctx: &EngineContext<'_>,
    cfg: &RunConfig,
    model: Trainable,
    resume: bool,
    device: &DefaultDevice,
) -> Result<(MaskDetector<DefaultBackend>, TrainReport)> {
    let (model, ddp_comm) = model.into_parts();
    let main = ctx.world.is_main_process();
    let checkpointer = DetectionCheckpointer::new(&cfg.output_dir, main);
    let mut optim = AdamWConfig::new()
        .with_weight_decay(cfg.solver.weight_decay)
        .init::<TrainBackend, MaskDetector<TrainBackend>>();

    let (mut model, resumed) =
        checkpointer.resume_or_load(model, cfg.model.weights.as_deref(), resume, device)?;
    let mut best = BestCheckpointer::new(format!("{}/{}", BEST_METRIC.0, BEST_METRIC.1), None);
    let mut start_iter = 0;
    if let Some((name, state)) = resumed {
        start_iter = state.iteration;
        best.best = state.best_metric;
        if let Some(record) = checkpointer.load_optimizer::<TrainBackend, _>(&name, device)? {
            optim = optim.load_record(record);
        }
    }

    let max_iter = cfg.solver.max_iter;
    let mut report = TrainReport {
        start_iter,
        ..TrainReport::default()
    };
    let start = Instant::now();

    if start_iter < max_iter {
        let mut train_records: Vec<DatasetRecord> = Vec::new();
        for name in &cfg.datasets.train {
            train_records.extend(ctx.registry.get(name)?.iter().cloned());
        }
        if train_records.is_empty() {
            return Err(SegTrainError::training("no training datasets configured"));
        }
        let mut loader = TrainLoader::new(
            Arc::new(train_records),
            ctx.world.rank,
            ctx.world.world_size,
            cfg.images_per_worker(ctx.world.world_size)?,
            cfg.input.size,
            cfg.model.mask_resolution,
            seed_for(cfg.seed, ctx.world.rank).wrapping_add(start_iter as u64),
        )?;

        let periodic = PeriodicCheckpointer::new(
            cfg.solver.checkpoint_period,
            max_iter,
            cfg.solver.max_to_keep,
        );
        let mut hooks: Vec<Box<dyn TrainHook>> = vec![
            Box::new(NonFiniteLossGuard),
            Box::new(LossSpikeMonitor::new(5.0, LOG_PERIOD)),
            Box::new(periodic.clone()),
            Box::new(EvalHook {
                period: cfg.test.eval_period,
                max_iter,
            }),
        ];
        let mut storage = EventStorage::new(
            main.then(|| cfg.output_dir.join("metrics.json")),
            LOG_PERIOD,
        );
        tracing::info!(start_iter, max_iter, "starting training");

        for iteration in start_iter..max_iter {
            let step_start = Instant::now();
            let batch = loader.next_batch::<TrainBackend>(device)?;
            let output = model.forward(batch.images);
            let losses = detection_losses(&output, &batch.targets, cfg.model.mask_resolution)?;
            let mut breakdown = losses.breakdown()?;

            let grads = GradientsParams::from_grads(losses.total().backward(), &model);
            let grads = match &ddp_comm {
                Some(comm) => {
                    let grads = all_reduce_gradients::<TrainBackend, _>(comm, &model, grads).await?;
                    breakdown = reduce_losses(comm, breakdown).await?;
                    grads
                }
                None => grads,
            };
            let lr = learning_rate(&cfg.solver, iteration);
            model = optim.step(lr, model, grads);

            storage.record(
                IterationEvent {
                    iteration,
                    lr,
                    time: step_start.elapsed().as_secs_f64(),
                    losses: breakdown,
                },
                max_iter,
            )?;
            report.iterations_run += 1;
            report.final_losses = Some(breakdown);

            let actions: Vec<HookAction> = hooks
                .iter_mut()
                .map(|hook| hook.after_step(iteration, &breakdown))
                .collect();
            for action in actions {
                match action {
                    HookAction::Continue => {}
                    HookAction::Stop { reason } => return Err(SegTrainError::training(reason)),
                    HookAction::Checkpoint { name } => {
                        let state = TrainingState {
                            iteration: iteration + 1,
                            best_metric: best.best,
                        };
                        checkpointer.save::<TrainBackend, _, _>(
                            &name,
                            &model,
                            Some(optim.to_record()),
                            state,
                        )?;
                        periodic.prune(&checkpointer)?;
                    }
                    HookAction::Evaluate => {
                        let results = do_evaluate(ctx, cfg, &model.valid(), device).await?;
                        if let Some(value) = results.get(BEST_METRIC.0, BEST_METRIC.1) {
                            if best.improves(value) {
                                tracing::info!(iteration, metric = %best.metric, value, "new best model");
                                let state = TrainingState {
                                    iteration: iteration + 1,
                                    best_metric: best.best,
                                };
                                checkpointer.save::<TrainBackend, _, _>(
                                    BEST_CHECKPOINT,
                                    &model,
                                    Some(optim.to_record()),
                                    state,
                                )?;
                            }
                        }
                        report.evaluations.push((iteration + 1, results));
                    }
                }
            }
        }
    } else {
        tracing::info!(start_iter, max_iter, "checkpoint already reached max_iter");
    }

    if main {
        if !checkpointer.model_path("model_final").exists() {
            checkpointer.save::<TrainBackend, _, _>(
                "model_final",
                &model,
                Some(optim.to_record()),
                TrainingState {
                    iteration: start_iter + report.iterations_run,
                    best_metric: best.best,
                },
            )?;
        }
        best.ensure_best(&checkpointer)?;
    }
    ctx.comm.barrier().await?;

    report.best_metric = best.best;
    report.total_time_secs = start.elapsed().as_secs_f64();
    tracing::info!(
        iterations = report.iterations_run,
        seconds = report.total_time_secs,
        "training finished"
    );
    Ok((model.valid(), report))
}

async fn reduce_losses(comm: &crate::comm::Comm, losses: LossBreakdown) -> Result<LossBreakdown> {
    let mut values = [
        losses.loss_objectness,
        losses.loss_box_reg,
        losses.loss_cls,
        losses.loss_mask,
        losses.total_loss,
    ];
    comm.all_reduce_mean(&mut values).await?;
    Ok(LossBreakdown {
        loss_objectness: values[0],
        loss_box_reg: values[1],
        loss_cls: values[2],
        loss_mask: values[3],
        total_loss: values[4],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solver() -> SolverConfig {
        SolverConfig {
            base_lr: 0.1,
            warmup_iters: 10,
            warmup_factor: 0.001,
            steps: vec![20, 30],
            gamma: 0.1,
            ..SolverConfig::default()
        }
    }

    #[test]
    fn test_warmup_starts_at_factor() {
        let s = solver();
        assert!((learning_rate(&s, 0) - 0.1 * 0.001).abs() < 1e-12);
        let mid = 0.1 * (0.001 * 0.5 + 0.5);
        assert!((learning_rate(&s, 5) - mid).abs() < 1e-12);
        assert!((learning_rate(&s, 10) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_steps_decay_by_gamma() {
        let s = solver();
        assert!((learning_rate(&s, 19) - 0.1).abs() < 1e-12);
        assert!((learning_rate(&s, 20) - 0.01).abs() < 1e-12);
        assert!((learning_rate(&s, 35) - 0.001).abs() < 1e-12);
    }
}
