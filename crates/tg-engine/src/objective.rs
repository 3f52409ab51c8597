//! Hyperparameter search objective backed by a [`Trainer`].

use tg_optimizer::{Objective, TrialContext, TrialOutcome, THRESHOLD_ATTR};
use tg_types::{ParamValue, Params, TgResult};

use crate::training::{Trainer, TrainingRun};

/// Suggests architecture and optimizer parameters, trains, and scores the
/// trial by overall f1.
#[derive(Debug)]
pub struct TrainingObjective<T> {
    base: Params,
    trainer: T,
}

impl<T: Trainer> TrainingObjective<T> {
    pub fn new(base: Params, trainer: T) -> Self {
        Self { base, trainer }
    }

    pub fn into_trainer(self) -> T {
        self.trainer
    }

    fn suggest_params(&self, trial: &mut TrialContext<'_>) -> TgResult<Params> {
        let mut params = self.base.clone();
        for name in ["embedding_dim", "num_filters", "hidden_dim"] {
            let value = trial.suggest_int(name, 128, 512)?;
            params.set(name, &ParamValue::Int(value))?;
        }
        params.dropout_p = trial.suggest_uniform("dropout_p", 0.3, 0.8)?;
        params.lr = trial.suggest_log_uniform("lr", 5e-5, 5e-4)?;
        Ok(params)
    }
}

impl<T: Trainer> Objective for TrainingObjective<T> {
    fn evaluate(&mut self, trial: &mut TrialContext<'_>) -> TgResult<TrialOutcome> {
        let params = self.suggest_params(trial)?;
        tracing::debug!(
            "Trial {} training with lr={} dropout_p={}",
            trial.number(),
            params.lr,
            params.dropout_p
        );

        let artifacts = match self.trainer.train(&params, &mut *trial)? {
            TrainingRun::Finished(artifacts) => artifacts,
            TrainingRun::Pruned { .. } => return Ok(TrialOutcome::Pruned),
        };

        let overall = &artifacts.performance.overall;
        if let Some(threshold) = artifacts.params.threshold {
            trial.set_user_attr(THRESHOLD_ATTR, threshold);
        }
        trial.set_user_attr("precision", overall.precision);
        trial.set_user_attr("recall", overall.recall);
        trial.set_user_attr("f1", overall.f1);
        Ok(TrialOutcome::Completed(overall.f1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTrainer;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tg_data::LocalRunStore;
    use tg_optimizer::{MedianPruner, RandomSampler, TrialScheduler, TrialState};

    fn scheduler(dir: &std::path::Path) -> TrialScheduler {
        TrialScheduler::new(
            Arc::new(LocalRunStore::open(dir).unwrap()),
            MedianPruner::default(),
            Box::new(RandomSampler::new(1234)),
        )
    }

    #[test]
    fn test_search_returns_best_suggestions_with_threshold() {
        let dir = tempdir().unwrap();
        let base = Params::default();
        let mut objective = TrainingObjective::new(base.clone(), ScriptedTrainer::default());

        let study = scheduler(dir.path())
            .run_study("optimization", &mut objective, 4)
            .unwrap();
        let best = study.best_trial().unwrap();
        assert_eq!(best.user_attrs[THRESHOLD_ATTR], ParamValue::Float(0.5));
        assert_eq!(best.user_attrs["f1"], best.params["dropout_p"]);

        let dir = tempdir().unwrap();
        let mut objective = TrainingObjective::new(base.clone(), ScriptedTrainer::default());
        let merged = scheduler(dir.path())
            .search(&base, &mut objective, 4, "optimization")
            .unwrap();
        assert_eq!(merged.dropout_p, best.params["dropout_p"].as_f64().unwrap());
        assert_eq!(i64::from(merged.hidden_dim), best.params["hidden_dim"].as_i64().unwrap());
        assert!((5e-5..=5e-4).contains(&merged.lr));
        assert_eq!(merged.threshold, Some(0.5));
        assert_eq!(merged.num_epochs, base.num_epochs);
    }

    #[test]
    fn test_trainer_failures_fail_trials() {
        let dir = tempdir().unwrap();
        let trainer = ScriptedTrainer {
            fail_with: Some("loss is nan".to_string()),
            ..Default::default()
        };
        let mut objective = TrainingObjective::new(Params::default(), trainer);

        let study = scheduler(dir.path())
            .run_study("broken", &mut objective, 2)
            .unwrap();
        assert_eq!(study.count(TrialState::Failed), 2);
        assert_eq!(objective.into_trainer().calls, 2);
    }

    #[test]
    fn test_low_scoring_trials_get_pruned() {
        let dir = tempdir().unwrap();
        let trainer = ScriptedTrainer {
            epochs: 8,
            ..Default::default()
        };
        let mut objective = TrainingObjective::new(Params::default(), trainer);

        let study = scheduler(dir.path())
            .run_study("pruned", &mut objective, 20)
            .unwrap();
        // every value is -(1 - dropout_p); anything below the running median stops at step 5
        for trial in study.trials.iter().filter(|t| t.state == TrialState::Pruned) {
            assert_eq!(trial.last_intermediate().map(|(step, _)| step), Some(5));
        }
        assert!(study.count(TrialState::Pruned) > 0);
        assert_eq!(study.count(TrialState::Failed), 0);
    }
}
