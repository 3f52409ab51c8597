//! Model collaborator interfaces.

use tg_types::{Device, Params, TgResult, WeightBlob};

/// A multi-label classifier over token id sequences
pub trait TagModel: Send + Sync + std::fmt::Debug {
    /// Class probabilities, one row per input sequence.
    fn predict_proba(&self, sequences: &[Vec<u32>]) -> TgResult<Vec<Vec<f64>>>;

    /// Serialized weights.
    fn state_dict(&self) -> TgResult<WeightBlob>;

    /// Replace the weights with `weights`; fails if they do not fit this model.
    fn load_state(&mut self, weights: &WeightBlob) -> TgResult<()>;

    fn device(&self) -> Device;
}

/// Builds untrained models sized for a vocabulary and class set
pub trait ModelFactory: Send + Sync + std::fmt::Debug {
    fn initialize(
        &self,
        params: &Params,
        vocab_size: usize,
        num_classes: usize,
        device: Device,
    ) -> TgResult<Box<dyn TagModel>>;
}

/// Class indices whose probability reaches `threshold`.
pub fn apply_threshold(probabilities: &[Vec<f64>], threshold: f64) -> Vec<Vec<u8>> {
    probabilities
        .iter()
        .map(|row| row.iter().map(|p| u8::from(*p >= threshold)).collect())
        .collect()
}
