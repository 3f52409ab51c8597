//! Trial records and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use tg_types::{ParamValue, TgError, TgResult};

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    #[default]
    Maximize,
    Minimize,
}

impl ObjectiveDirection {
    /// Whether `candidate` strictly improves on `incumbent`.
    pub fn improves(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    Running,
    Completed,
    Pruned,
    Failed,
}

impl TrialState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// running -> {completed | pruned | failed}; finished states are final.
    pub fn can_transition_to(&self, next: TrialState) -> bool {
        matches!(self, Self::Running) && next.is_finished()
    }
}

impl std::fmt::Display for TrialState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Pruned => "pruned",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A single trial of a search session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    /// Submission order within the session, starting at 0.
    pub number: usize,
    pub params: BTreeMap<String, ParamValue>,
    /// Final objective for completed trials, last reported value for pruned ones.
    pub value: Option<f64>,
    pub state: TrialState,
    pub user_attrs: BTreeMap<String, ParamValue>,
    /// Intermediate values keyed by step.
    pub intermediate_values: BTreeMap<u64, f64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TrialResult {
    pub fn new(number: usize) -> Self {
        Self {
            number,
            params: BTreeMap::new(),
            value: None,
            state: TrialState::Running,
            user_attrs: BTreeMap::new(),
            intermediate_values: BTreeMap::new(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    fn transition(&mut self, next: TrialState) -> TgResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(TgError::Internal(format!(
                "trial {} cannot move from {} to {}",
                self.number, self.state, next
            )));
        }
        self.state = next;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_completed(&mut self, value: f64) -> TgResult<()> {
        self.transition(TrialState::Completed)?;
        self.value = Some(value);
        Ok(())
    }

    /// The last intermediate value is kept as the trial's value.
    pub fn mark_pruned(&mut self) -> TgResult<()> {
        self.transition(TrialState::Pruned)?;
        self.value = self.last_intermediate().map(|(_, value)| value);
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> TgResult<()> {
        self.transition(TrialState::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn last_intermediate(&self) -> Option<(u64, f64)> {
        self.intermediate_values
            .iter()
            .next_back()
            .map(|(step, value)| (*step, *value))
    }

    pub fn duration_seconds(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trial_lifecycle() {
        let mut trial = TrialResult::new(0);
        assert_eq!(trial.state, TrialState::Running);
        assert!(trial.finished_at.is_none());

        trial.mark_completed(0.8).unwrap();
        assert_eq!(trial.state, TrialState::Completed);
        assert_eq!(trial.value, Some(0.8));
        assert!(trial.duration_seconds().is_some());
    }

    #[test]
    fn finished_states_are_final() {
        let mut trial = TrialResult::new(1);
        trial.mark_failed("objective raised").unwrap();

        assert!(trial.mark_completed(1.0).is_err());
        assert!(trial.mark_pruned().is_err());
        assert_eq!(trial.state, TrialState::Failed);
        assert_eq!(trial.error.as_deref(), Some("objective raised"));
        assert_eq!(trial.value, None);
    }

    #[test]
    fn pruned_trial_keeps_last_intermediate_value() {
        let mut trial = TrialResult::new(2);
        trial.intermediate_values.insert(0, 0.1);
        trial.intermediate_values.insert(6, 0.3);
        trial.intermediate_values.insert(3, 0.2);

        trial.mark_pruned().unwrap();
        assert_eq!(trial.value, Some(0.3));
    }

    #[test]
    fn direction_comparison_is_strict() {
        assert!(ObjectiveDirection::Maximize.improves(0.9, 0.5));
        assert!(!ObjectiveDirection::Maximize.improves(0.5, 0.5));
        assert!(ObjectiveDirection::Minimize.improves(0.1, 0.5));
        assert_eq!(ObjectiveDirection::default(), ObjectiveDirection::Maximize);
    }
}
