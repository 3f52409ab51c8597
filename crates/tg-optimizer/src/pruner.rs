//! Median stopping rule.

use serde::{Deserialize, Serialize};

use crate::trial::{ObjectiveDirection, TrialResult, TrialState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PruneDecision {
    Continue,
    Prune,
}

/// Stops a trial whose intermediate value is strictly worse than the median
/// of completed trials at the same step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MedianPruner {
    /// Completed trials required before any pruning happens.
    pub n_startup_trials: usize,
    /// Steps reported before a trial becomes prunable.
    pub n_warmup_steps: u64,
    /// Pruning is checked every `interval_steps` steps after warm-up.
    pub interval_steps: u64,
}

impl Default for MedianPruner {
    fn default() -> Self {
        Self {
            n_startup_trials: 5,
            n_warmup_steps: 5,
            interval_steps: 1,
        }
    }
}

impl MedianPruner {
    pub fn new(n_startup_trials: usize, n_warmup_steps: u64, interval_steps: u64) -> Self {
        Self {
            n_startup_trials,
            n_warmup_steps,
            interval_steps: interval_steps.max(1),
        }
    }

    /// Decide on `value` reported at `step`; `history` is every earlier
    /// trial of the session.
    pub fn decide(
        &self,
        step: u64,
        value: f64,
        history: &[TrialResult],
        direction: ObjectiveDirection,
    ) -> PruneDecision {
        if step < self.n_warmup_steps {
            return PruneDecision::Continue;
        }
        if (step - self.n_warmup_steps) % self.interval_steps.max(1) != 0 {
            return PruneDecision::Continue;
        }

        let completed: Vec<&TrialResult> = history
            .iter()
            .filter(|t| t.state == TrialState::Completed)
            .collect();
        if completed.len() < self.n_startup_trials {
            return PruneDecision::Continue;
        }
        if value.is_nan() {
            return PruneDecision::Prune;
        }

        let mut peers: Vec<f64> = completed
            .iter()
            .filter_map(|t| t.intermediate_values.get(&step).copied())
            .filter(|v| !v.is_nan())
            .collect();
        let Some(median) = median(&mut peers) else {
            return PruneDecision::Continue;
        };

        if direction.improves(median, value) {
            PruneDecision::Prune
        } else {
            PruneDecision::Continue
        }
    }
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(number: usize, curve: &[f64]) -> TrialResult {
        let mut trial = TrialResult::new(number);
        for (step, value) in curve.iter().enumerate() {
            trial.intermediate_values.insert(step as u64, *value);
        }
        trial.mark_completed(*curve.last().unwrap_or(&0.0)).unwrap();
        trial
    }

    fn history(n: usize) -> Vec<TrialResult> {
        (0..n)
            .map(|i| completed(i, &[0.5, 0.6, 0.7, 0.8, 0.9, 1.0, 1.1]))
            .collect()
    }

    #[test]
    fn median_of_even_and_odd_sets() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&mut [4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(&mut []), None);
    }

    #[test]
    fn no_pruning_during_warmup() {
        let pruner = MedianPruner::default();
        let decision = pruner.decide(4, -100.0, &history(10), ObjectiveDirection::Maximize);
        assert_eq!(decision, PruneDecision::Continue);
    }

    #[test]
    fn no_pruning_before_startup_trials() {
        let pruner = MedianPruner::default();
        let decision = pruner.decide(5, -100.0, &history(4), ObjectiveDirection::Maximize);
        assert_eq!(decision, PruneDecision::Continue);
    }

    #[test]
    fn worse_than_median_is_pruned_after_warmup() {
        let pruner = MedianPruner::default();
        let peers = history(5);
        let dir = ObjectiveDirection::Maximize;

        assert_eq!(pruner.decide(5, 0.99, &peers, dir), PruneDecision::Prune);
        assert_eq!(pruner.decide(5, 1.0, &peers, dir), PruneDecision::Continue);
        assert_eq!(pruner.decide(6, 1.5, &peers, dir), PruneDecision::Continue);
    }

    #[test]
    fn minimize_flips_the_comparison() {
        let pruner = MedianPruner::new(1, 0, 1);
        let peers = vec![completed(0, &[0.5])];
        let dir = ObjectiveDirection::Minimize;

        assert_eq!(pruner.decide(0, 0.6, &peers, dir), PruneDecision::Prune);
        assert_eq!(pruner.decide(0, 0.4, &peers, dir), PruneDecision::Continue);
    }

    #[test]
    fn interval_skips_intermediate_steps() {
        let pruner = MedianPruner::new(5, 5, 2);
        let peers = history(5);
        let dir = ObjectiveDirection::Maximize;

        assert_eq!(pruner.decide(6, 0.0, &peers, dir), PruneDecision::Continue);
        assert_eq!(pruner.decide(5, 0.0, &peers, dir), PruneDecision::Prune);
    }

    #[test]
    fn nan_is_pruned_and_unknown_step_is_not() {
        let pruner = MedianPruner::default();
        let peers = history(5);
        let dir = ObjectiveDirection::Maximize;

        assert_eq!(pruner.decide(5, f64::NAN, &peers, dir), PruneDecision::Prune);
        assert_eq!(pruner.decide(50, -1.0, &peers, dir), PruneDecision::Continue);
    }

    #[test]
    fn pruned_and_failed_peers_are_ignored() {
        let pruner = MedianPruner::new(1, 0, 1);
        let mut pruned = TrialResult::new(0);
        pruned.intermediate_values.insert(0, 10.0);
        pruned.mark_pruned().unwrap();
        let mut failed = TrialResult::new(1);
        failed.mark_failed("boom").unwrap();

        let decision = pruner.decide(0, 0.0, &[pruned, failed], ObjectiveDirection::Maximize);
        assert_eq!(decision, PruneDecision::Continue);
    }
}
