//! Training hooks: loss guards, checkpoint and evaluation scheduling.

use crate::checkpoint::PeriodicCheckpointer;
use crate::modeling::LossBreakdown;

/// Action a hook can request after a training step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    Stop { reason: String },
    Checkpoint { name: String },
    Evaluate,
}

/// Called after every optimizer step with the 0-based iteration.
pub trait TrainHook: Send {
    fn after_step(&mut self, iteration: usize, losses: &LossBreakdown) -> HookAction;
}

/// Fails the run as soon as any loss term is NaN or infinite.
#[derive(Debug, Clone, Default)]
pub struct NonFiniteLossGuard;

impl TrainHook for NonFiniteLossGuard {
    fn after_step(&mut self, iteration: usize, losses: &LossBreakdown) -> HookAction {
        if losses.is_finite() {
            HookAction::Continue
        } else {
            HookAction::Stop {
                reason: format!("loss became non-finite at iteration {iteration}: {losses:?}"),
            }
        }
    }
}

/// Warns when the total loss jumps above `threshold x` the recent mean.
#[derive(Debug, Clone)]
pub struct LossSpikeMonitor {
    pub threshold: f64,
    window: Vec<f64>,
    window_size: usize,
}

impl LossSpikeMonitor {
    pub fn new(threshold: f64, window_size: usize) -> Self {
        Self {
            threshold,
            window: Vec::new(),
            window_size: window_size.max(1),
        }
    }

    /// Returns true when `loss` is a spike relative to the window.
    pub fn observe(&mut self, loss: f64) -> bool {
        let spike = self.window.len() >= 3 && {
            let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
            loss > mean * self.threshold
        };
        self.window.push(loss);
        if self.window.len() > self.window_size {
            self.window.remove(0);
        }
        spike
    }
}

impl TrainHook for LossSpikeMonitor {
    fn after_step(&mut self, iteration: usize, losses: &LossBreakdown) -> HookAction {
        let loss = losses.total_loss as f64;
        if loss.is_finite() && self.observe(loss) {
            tracing::warn!(iteration, loss, "loss spike");
        }
        HookAction::Continue
    }
}

impl TrainHook for PeriodicCheckpointer {
    fn after_step(&mut self, iteration: usize, _losses: &LossBreakdown) -> HookAction {
        match self.checkpoint_name(iteration) {
            Some(name) => HookAction::Checkpoint { name },
            None => HookAction::Continue,
        }
    }
}

/// Requests an evaluation every `period` iterations, except after the last
/// one where the caller evaluates anyway.
#[derive(Debug, Clone)]
pub struct EvalHook {
    pub period: usize,
    pub max_iter: usize,
}

impl TrainHook for EvalHook {
    fn after_step(&mut self, iteration: usize, _losses: &LossBreakdown) -> HookAction {
        let next = iteration + 1;
        if self.period > 0 && next % self.period == 0 && next != self.max_iter {
            HookAction::Evaluate
        } else {
            HookAction::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn losses(total: f32) -> LossBreakdown {
        LossBreakdown {
            total_loss: total,
            ..LossBreakdown::default()
        }
    }

    #[test]
    fn test_non_finite_stops() {
        let mut guard = NonFiniteLossGuard;
        assert_eq!(guard.after_step(0, &losses(1.0)), HookAction::Continue);
        assert!(matches!(
            guard.after_step(1, &losses(f32::NAN)),
            HookAction::Stop { .. }
        ));
    }

    #[test]
    fn test_spike_detected_after_warmup() {
        let mut monitor = LossSpikeMonitor::new(3.0, 5);
        assert!(!monitor.observe(1.0));
        assert!(!monitor.observe(1.0));
        assert!(!monitor.observe(1.0));
        assert!(monitor.observe(10.0));
        assert!(!monitor.observe(1.0));
    }

    #[test]
    fn test_eval_hook_skips_last_iteration() {
        let mut hook = EvalHook {
            period: 5,
            max_iter: 10,
        };
        assert_eq!(hook.after_step(4, &losses(1.0)), HookAction::Evaluate);
        assert_eq!(hook.after_step(5, &losses(1.0)), HookAction::Continue);
        assert_eq!(hook.after_step(9, &losses(1.0)), HookAction::Continue);
    }

    #[test]
    fn test_periodic_checkpoint_hook() {
        let mut hook = PeriodicCheckpointer::new(2, 5, 3);
        assert_eq!(
            hook.after_step(1, &losses(1.0)),
            HookAction::Checkpoint {
                name: "model_0000001".into()
            }
        );
        assert_eq!(
            hook.after_step(4, &losses(1.0)),
            HookAction::Checkpoint {
                name: "model_final".into()
            }
        );
    }
}
