//! # tg-optimizer
//!
//! Hyperparameter search for Tagifai.
//!
//! Provides search space definitions, a seeded random sampler, the median
//! pruner, trial records with an explicit lifecycle, and the sequential
//! scheduler that ranks trials and merges the best one into a parameter set.

mod pruner;
mod scheduler;
mod search;
mod trial;

pub use pruner::{MedianPruner, PruneDecision};
pub use scheduler::{
    objective_fn, FnObjective, IntermediateReporter, INTERMEDIATE_METRIC, Objective, Study, TrialContext,
    TrialOutcome, TrialScheduler, THRESHOLD_ATTR, TRIAL_METRIC,
};
pub use search::{ParameterDef, ParameterKind, RandomSampler, Sampler, SearchSpace};
pub use trial::{ObjectiveDirection, TrialResult, TrialState};
