//! Sequential trial scheduling with median pruning.

use std::collections::BTreeMap;
use std::sync::Arc;

use tg_data::RunStore;
use tg_types::{ParamValue, Params, RunStatus, TgError, TgResult};

use crate::pruner::{MedianPruner, PruneDecision};
use crate::search::{ParameterKind, Sampler, SearchSpace};
use crate::trial::{ObjectiveDirection, TrialResult, TrialState};

/// Metric name under which a completed trial's value is logged
pub const TRIAL_METRIC: &str = "f1";
/// Metric name for the last value a pruned trial reported
pub const INTERMEDIATE_METRIC: &str = "intermediate_value";
/// User attribute merged into the returned parameters
pub const THRESHOLD_ATTR: &str = "threshold";

/// Receives intermediate objective values during training.
pub trait IntermediateReporter {
    /// Record `value` at `step` and say whether the trial should stop.
    fn report(&mut self, step: u64, value: f64) -> PruneDecision;
}

/// How an objective run ended
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrialOutcome {
    Completed(f64),
    Pruned,
}

/// The function being optimized. Errors mark the trial failed.
pub trait Objective {
    fn evaluate(&mut self, trial: &mut TrialContext<'_>) -> TgResult<TrialOutcome>;
}

/// Adapts a closure into an [`Objective`].
pub struct FnObjective<F>(F);

pub fn objective_fn<F>(f: F) -> FnObjective<F>
where
    F: FnMut(&mut TrialContext<'_>) -> TgResult<TrialOutcome>,
{
    FnObjective(f)
}

impl<F> Objective for FnObjective<F>
where
    F: FnMut(&mut TrialContext<'_>) -> TgResult<TrialOutcome>,
{
    fn evaluate(&mut self, trial: &mut TrialContext<'_>) -> TgResult<TrialOutcome> {
        (self.0)(trial)
    }
}

/// Handle given to the objective for one trial.
pub struct TrialContext<'a> {
    trial: TrialResult,
    space: SearchSpace,
    sampler: &'a mut dyn Sampler,
    pruner: &'a MedianPruner,
    history: &'a [TrialResult],
    direction: ObjectiveDirection,
    prune_requested: bool,
}

impl<'a> TrialContext<'a> {
    fn new(
        number: usize,
        sampler: &'a mut dyn Sampler,
        pruner: &'a MedianPruner,
        history: &'a [TrialResult],
        direction: ObjectiveDirection,
    ) -> Self {
        Self {
            trial: TrialResult::new(number),
            space: SearchSpace::new(),
            sampler,
            pruner,
            history,
            direction,
            prune_requested: false,
        }
    }

    pub fn number(&self) -> usize {
        self.trial.number
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    /// Sample `name` from `kind`; a parameter already suggested in this
    /// trial keeps its first value.
    pub fn suggest(&mut self, name: &str, kind: ParameterKind) -> TgResult<ParamValue> {
        if let Some(existing) = self.trial.params.get(name) {
            return Ok(existing.clone());
        }
        kind.validate(name)?;

        let value = self.sampler.sample(name, &kind);
        self.trial.params.insert(name.to_string(), value.clone());
        self.space.parameters.push(crate::search::ParameterDef {
            name: name.to_string(),
            kind,
        });
        Ok(value)
    }

    pub fn suggest_int(&mut self, name: &str, low: i64, high: i64) -> TgResult<i64> {
        let value = self.suggest(name, ParameterKind::IntRange { low, high })?;
        value
            .as_i64()
            .ok_or_else(|| TgError::Validation(format!("'{name}' was suggested as {value}")))
    }

    pub fn suggest_uniform(&mut self, name: &str, low: f64, high: f64) -> TgResult<f64> {
        let value = self.suggest(name, ParameterKind::FloatRange { low, high })?;
        value
            .as_f64()
            .ok_or_else(|| TgError::Validation(format!("'{name}' was suggested as {value}")))
    }

    pub fn suggest_log_uniform(&mut self, name: &str, low: f64, high: f64) -> TgResult<f64> {
        let value = self.suggest(name, ParameterKind::LogUniform { low, high })?;
        value
            .as_f64()
            .ok_or_else(|| TgError::Validation(format!("'{name}' was suggested as {value}")))
    }

    pub fn suggest_categorical(&mut self, name: &str, values: Vec<ParamValue>) -> TgResult<ParamValue> {
        self.suggest(name, ParameterKind::Choice { values })
    }

    pub fn set_user_attr(&mut self, name: &str, value: impl Into<ParamValue>) {
        self.trial.user_attrs.insert(name.to_string(), value.into());
    }

    fn into_parts(self) -> (TrialResult, bool) {
        (self.trial, self.prune_requested)
    }
}

impl IntermediateReporter for TrialContext<'_> {
    fn report(&mut self, step: u64, value: f64) -> PruneDecision {
        self.trial.intermediate_values.insert(step, value);
        let decision = self
            .pruner
            .decide(step, value, self.history, self.direction);
        if decision == PruneDecision::Prune {
            self.prune_requested = true;
        }
        decision
    }
}

/// All trials of one search session, in submission order
#[derive(Debug, Clone, PartialEq)]
pub struct Study {
    pub name: String,
    pub direction: ObjectiveDirection,
    pub trials: Vec<TrialResult>,
}

impl Study {
    /// Best completed trial; the earliest wins ties.
    pub fn best_trial(&self) -> Option<&TrialResult> {
        let mut best: Option<(&TrialResult, f64)> = None;
        for trial in self.trials.iter().filter(|t| t.state == TrialState::Completed) {
            let Some(value) = trial.value else { continue };
            match best {
                Some((_, incumbent)) if !self.direction.improves(value, incumbent) => {}
                _ => best = Some((trial, value)),
            }
        }
        best.map(|(trial, _)| trial)
    }

    pub fn count(&self, state: TrialState) -> usize {
        self.trials.iter().filter(|t| t.state == state).count()
    }
}

/// Runs trials one at a time and logs each to the run store.
#[derive(Debug)]
pub struct TrialScheduler {
    store: Arc<dyn RunStore>,
    pruner: MedianPruner,
    sampler: Box<dyn Sampler>,
    direction: ObjectiveDirection,
}

impl TrialScheduler {
    pub fn new(store: Arc<dyn RunStore>, pruner: MedianPruner, sampler: Box<dyn Sampler>) -> Self {
        Self {
            store,
            pruner,
            sampler,
            direction: ObjectiveDirection::Maximize,
        }
    }

    pub fn with_direction(mut self, direction: ObjectiveDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Run `num_trials` attempts of `objective` under `study_name`.
    pub fn run_study<O: Objective + ?Sized>(
        &mut self,
        study_name: &str,
        objective: &mut O,
        num_trials: usize,
    ) -> TgResult<Study> {
        tracing::info!(
            "Starting study '{}' with {} trials ({} sampler)",
            study_name,
            num_trials,
            self.sampler.name()
        );
        self.store.get_or_create_experiment(study_name)?;

        let mut trials: Vec<TrialResult> = Vec::with_capacity(num_trials);
        for number in 0..num_trials {
            let mut ctx = TrialContext::new(
                number,
                self.sampler.as_mut(),
                &self.pruner,
                &trials,
                self.direction,
            );
            let outcome = objective.evaluate(&mut ctx);
            let (mut trial, prune_requested) = ctx.into_parts();

            match outcome {
                Ok(_) if prune_requested => trial.mark_pruned()?,
                Ok(TrialOutcome::Pruned) => trial.mark_pruned()?,
                Ok(TrialOutcome::Completed(value)) if value.is_finite() => {
                    trial.mark_completed(value)?
                }
                Ok(TrialOutcome::Completed(value)) => {
                    trial.mark_failed(format!("objective returned non-finite value {value}"))?
                }
                Err(e) => trial.mark_failed(e.to_string())?,
            }

            match trial.state {
                TrialState::Failed => tracing::warn!(
                    "Trial {} failed: {}",
                    trial.number,
                    trial.error.as_deref().unwrap_or("unknown error")
                ),
                state => tracing::info!(
                    "Trial {} {} with value {:?} after {}s",
                    trial.number,
                    state,
                    trial.value,
                    trial.duration_seconds().unwrap_or_default()
                ),
            }

            self.log_trial(study_name, &trial)?;
            trials.push(trial);
        }

        Ok(Study {
            name: study_name.to_string(),
            direction: self.direction,
            trials,
        })
    }

    fn log_trial(&self, study_name: &str, trial: &TrialResult) -> TgResult<()> {
        let run = self
            .store
            .create_run(study_name, &format!("trial-{}", trial.number))?;

        let params: BTreeMap<String, serde_json::Value> = trial
            .params
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        self.store.log_params(&run.run_id, &params)?;

        let metric = match trial.state {
            TrialState::Completed => Some(TRIAL_METRIC),
            TrialState::Pruned => Some(INTERMEDIATE_METRIC),
            _ => None,
        };
        if let (Some(metric), Some(value)) = (metric, trial.value) {
            let metrics = BTreeMap::from([(metric.to_string(), value)]);
            self.store.log_metrics(&run.run_id, &metrics)?;
        }

        let mut tags = BTreeMap::from([
            ("state".to_string(), trial.state.to_string()),
            ("trial_number".to_string(), trial.number.to_string()),
        ]);
        for (name, value) in &trial.user_attrs {
            tags.insert(format!("user_attr.{name}"), value.to_string());
        }
        self.store.set_tags(&run.run_id, &tags)?;

        let status = match trial.state {
            TrialState::Failed => RunStatus::Failed,
            _ => RunStatus::Finished,
        };
        self.store.finish_run(&run.run_id, status)
    }

    /// Search and merge the best trial's parameters and its threshold over `base`.
    pub fn search<O: Objective + ?Sized>(
        &mut self,
        base: &Params,
        objective: &mut O,
        num_trials: usize,
        study_name: &str,
    ) -> TgResult<Params> {
        let study = self.run_study(study_name, objective, num_trials)?;
        let best = study.best_trial().ok_or_else(|| TgError::SearchExhausted {
            study: study_name.to_string(),
            attempted: study.trials.len(),
        })?;

        let threshold = best
            .user_attrs
            .get(THRESHOLD_ATTR)
            .and_then(ParamValue::as_f64)
            .ok_or_else(|| {
                TgError::Validation(format!(
                    "best trial {} has no numeric '{THRESHOLD_ATTR}' attribute",
                    best.number
                ))
            })?;

        tracing::info!(
            "Best trial {} of '{}': value {:?} ({} completed, {} pruned, {} failed)",
            best.number,
            study_name,
            best.value,
            study.count(TrialState::Completed),
            study.count(TrialState::Pruned),
            study.count(TrialState::Failed)
        );
        base.merged(&best.params, threshold)
    }
}
