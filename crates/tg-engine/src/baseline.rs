//! Baseline collaborator: a multi-label logistic model over token presence.
//!
//! Each class has an independent sigmoid unit over the set of token ids that
//! occur in a text. Training is plain SGD on binary cross-entropy with early
//! stopping on validation loss.

use std::collections::BTreeMap;
use std::path::Path;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use tg_data::{load_features, FeatureRow};
use tg_optimizer::{IntermediateReporter, PruneDecision};
use tg_types::{
    validation_error, Device, Metrics, MultiLabelEncoder, Params, PerformanceReport, TgResult, Tokenizer,
    WeightBlob, OVERALL_SLICE,
};

use crate::behavioral::BehavioralSuite;
use crate::loader::{preprocess, InferenceContext};
use crate::model::{apply_threshold, ModelFactory, TagModel};
use crate::training::{Trainer, TrainingArtifacts, TrainingRun};

const MAGIC: &[u8; 4] = b"TGLR";
const HEADER_LEN: usize = 12;

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogisticModel {
    vocab_size: usize,
    num_classes: usize,
    /// Row-major `[num_classes][vocab_size]`
    weights: Vec<f64>,
    bias: Vec<f64>,
    device: Device,
}

impl LogisticModel {
    pub fn new(vocab_size: usize, num_classes: usize, device: Device) -> Self {
        Self {
            vocab_size,
            num_classes,
            weights: vec![0.0; vocab_size * num_classes],
            bias: vec![0.0; num_classes],
            device,
        }
    }

    /// Distinct in-vocabulary token ids, padding excluded.
    fn features(&self, sequence: &[u32]) -> Vec<usize> {
        let mut ids: Vec<usize> = sequence
            .iter()
            .map(|id| *id as usize)
            .filter(|id| *id != 0 && *id < self.vocab_size)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn probabilities(&self, features: &[usize]) -> Vec<f64> {
        (0..self.num_classes)
            .map(|c| {
                let row = &self.weights[c * self.vocab_size..(c + 1) * self.vocab_size];
                sigmoid(self.bias[c] + features.iter().map(|f| row[*f]).sum::<f64>())
            })
            .collect()
    }

    /// One gradient step summed over `batch`.
    fn step(&mut self, batch: &[&Example], lr: f64) {
        let mut grad_w: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        let mut grad_b = vec![0.0; self.num_classes];
        for example in batch {
            let probs = self.probabilities(&example.features);
            for (c, (p, y)) in probs.iter().zip(&example.labels).enumerate() {
                let error = p - f64::from(*y);
                grad_b[c] += error;
                for f in &example.features {
                    *grad_w.entry((c, *f)).or_default() += error;
                }
            }
        }
        for ((c, f), g) in grad_w {
            self.weights[c * self.vocab_size + f] -= lr * g;
        }
        for (b, g) in self.bias.iter_mut().zip(grad_b) {
            *b -= lr * g;
        }
    }

    /// Mean binary cross-entropy per label.
    fn loss(&self, examples: &[Example]) -> f64 {
        if examples.is_empty() || self.num_classes == 0 {
            return 0.0;
        }
        let eps = 1e-12;
        let total: f64 = examples
            .iter()
            .map(|example| {
                self.probabilities(&example.features)
                    .iter()
                    .zip(&example.labels)
                    .map(|(p, y)| {
                        let p = p.clamp(eps, 1.0 - eps);
                        if *y == 1 {
                            -p.ln()
                        } else {
                            -(1.0 - p).ln()
                        }
                    })
                    .sum::<f64>()
            })
            .sum();
        total / (examples.len() * self.num_classes) as f64
    }
}

impl TagModel for LogisticModel {
    fn predict_proba(&self, sequences: &[Vec<u32>]) -> TgResult<Vec<Vec<f64>>> {
        Ok(sequences
            .iter()
            .map(|s| self.probabilities(&self.features(s)))
            .collect())
    }

    /// `TGLR`, vocab and class counts as u32 LE, then weights and biases as f64 LE.
    fn state_dict(&self) -> TgResult<WeightBlob> {
        let dims = |n: usize| {
            u32::try_from(n).map_err(|_| validation_error!("dimension {n} too large"))
        };
        let mut bytes = Vec::with_capacity(HEADER_LEN + 8 * (self.weights.len() + self.bias.len()));
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&dims(self.vocab_size)?.to_le_bytes());
        bytes.extend_from_slice(&dims(self.num_classes)?.to_le_bytes());
        for value in self.weights.iter().chain(&self.bias) {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Ok(WeightBlob::new(bytes).on(self.device))
    }

    fn load_state(&mut self, blob: &WeightBlob) -> TgResult<()> {
        let bytes = &blob.bytes;
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Err(validation_error!("not a logistic model state"));
        }
        let read_u32 = |at: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(word) as usize
        };
        let (vocab_size, num_classes) = (read_u32(4), read_u32(8));
        if vocab_size != self.vocab_size || num_classes != self.num_classes {
            return Err(validation_error!(
                "state is {vocab_size}x{num_classes}, model is {}x{}",
                self.vocab_size, self.num_classes
            ));
        }
        let expected = HEADER_LEN + 8 * (vocab_size * num_classes + num_classes);
        if bytes.len() != expected {
            return Err(validation_error!(
                "state has {} bytes, expected {expected}",
                bytes.len()
            ));
        }

        let values: Vec<f64> = bytes[HEADER_LEN..]
            .chunks_exact(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                f64::from_le_bytes(word)
            })
            .collect();
        let (weights, bias) = values.split_at(vocab_size * num_classes);
        self.weights = weights.to_vec();
        self.bias = bias.to_vec();
        self.device = blob.device;
        Ok(())
    }

    fn device(&self) -> Device {
        self.device
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogisticFactory;

impl ModelFactory for LogisticFactory {
    fn initialize(
        &self,
        _params: &Params,
        vocab_size: usize,
        num_classes: usize,
        device: Device,
    ) -> TgResult<Box<dyn TagModel>> {
        Ok(Box::new(LogisticModel::new(vocab_size, num_classes, device)))
    }
}

#[derive(Debug, Clone)]
struct Example {
    text: String,
    features: Vec<usize>,
    labels: Vec<u8>,
}

/// Trains [`LogisticModel`]s on computed feature rows
#[derive(Debug, Clone)]
pub struct BaselineTrainer {
    rows: Vec<FeatureRow>,
    suite: BehavioralSuite,
}

impl BaselineTrainer {
    pub fn new(rows: Vec<FeatureRow>) -> Self {
        Self {
            rows,
            suite: BehavioralSuite::default(),
        }
    }

    pub fn from_features_file(path: &Path) -> TgResult<Self> {
        Ok(Self::new(load_features(path)?))
    }

    pub fn with_suite(mut self, suite: BehavioralSuite) -> Self {
        self.suite = suite;
        self
    }
}

/// Deterministic 70/15/15 split; every part is non-empty.
fn split<T>(mut items: Vec<T>) -> TgResult<(Vec<T>, Vec<T>, Vec<T>)> {
    let n = items.len();
    if n < 3 {
        return Err(validation_error!(
            "need at least 3 labelled samples to train, got {n}"
        ));
    }
    let n_train = ((n as f64 * 0.7) as usize).clamp(1, n - 2);
    let n_val = (((n - n_train) as f64) / 2.0).ceil() as usize;
    let test = items.split_off(n_train + n_val);
    let val = items.split_off(n_train);
    Ok((items, val, test))
}

/// Support-weighted precision, recall and f1 over all classes.
fn weighted_metrics(truth: &[Vec<u8>], predicted: &[Vec<u8>], num_classes: usize) -> (Metrics, Vec<Metrics>) {
    let mut per_class = Vec::with_capacity(num_classes);
    let mut overall = Metrics {
        num_samples: truth.len() as u64,
        ..Metrics::default()
    };
    let mut total_support = 0u64;

    for c in 0..num_classes {
        let (mut tp, mut fp, mut fneg) = (0u64, 0u64, 0u64);
        for (t, p) in truth.iter().zip(predicted) {
            match (t[c], p[c]) {
                (1, 1) => tp += 1,
                (0, 1) => fp += 1,
                (1, 0) => fneg += 1,
                _ => {}
            }
        }
        let ratio = |num: u64, den: u64| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fneg);
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };
        let support = tp + fneg;
        total_support += support;
        overall.precision += precision * support as f64;
        overall.recall += recall * support as f64;
        overall.f1 += f1 * support as f64;
        per_class.push(Metrics {
            precision,
            recall,
            f1,
            num_samples: support,
        });
    }

    if total_support > 0 {
        let total = total_support as f64;
        overall.precision /= total;
        overall.recall /= total;
        overall.f1 /= total;
    }
    (overall, per_class)
}

impl BaselineTrainer {
    fn evaluate(
        model: &LogisticModel,
        examples: &[&Example],
        threshold: f64,
        num_classes: usize,
    ) -> (Metrics, Vec<Metrics>) {
        let truth: Vec<Vec<u8>> = examples.iter().map(|e| e.labels.clone()).collect();
        let probs: Vec<Vec<f64>> = examples
            .iter()
            .map(|e| model.probabilities(&e.features))
            .collect();
        weighted_metrics(&truth, &apply_threshold(&probs, threshold), num_classes)
    }

    /// Threshold from 0.05 to 0.95 that maximizes validation f1; lowest wins ties.
    fn best_threshold(model: &LogisticModel, val: &[Example], num_classes: usize) -> f64 {
        let val: Vec<&Example> = val.iter().collect();
        let mut best = (0.5, f64::NEG_INFINITY);
        for i in 1..=19 {
            let threshold = f64::from(i) * 0.05;
            let (metrics, _) = Self::evaluate(model, &val, threshold, num_classes);
            if metrics.f1 > best.1 {
                best = (threshold, metrics.f1);
            }
        }
        best.0
    }
}

impl Trainer for BaselineTrainer {
    fn train(
        &mut self,
        params: &Params,
        reporter: &mut dyn IntermediateReporter,
    ) -> TgResult<TrainingRun> {
        let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
        let mut rows: Vec<&FeatureRow> = self.rows.iter().filter(|r| !r.tags.is_empty()).collect();
        if let Some(subset) = params.subset {
            rows.truncate(usize::try_from(subset).unwrap_or(usize::MAX));
        }
        if params.shuffle {
            rows.shuffle(&mut rng);
        }

        let texts: Vec<String> = rows.iter().map(|r| preprocess(&r.text, params.lower)).collect();
        let tags: Vec<Vec<String>> = rows.iter().map(|r| r.tags.clone()).collect();
        let label_encoder = MultiLabelEncoder::fit(&tags);
        let labels = label_encoder.encode(&tags);

        let (train_idx, val_idx, test_idx) = split((0..texts.len()).collect::<Vec<_>>())?;
        let train_texts: Vec<&String> = train_idx.iter().map(|i| &texts[*i]).collect();
        let mut tokenizer = Tokenizer::new(params.char_level);
        tokenizer.fit_on_texts(&train_texts, None);

        let device = if params.cuda { Device::Cuda(0) } else { Device::Cpu };
        let num_classes = label_encoder.len();
        let mut model = LogisticModel::new(tokenizer.len(), num_classes, device);

        let sequences = tokenizer.texts_to_sequences(&texts);
        let examples: Vec<Example> = sequences
            .iter()
            .zip(labels)
            .zip(&texts)
            .map(|((sequence, labels), text)| Example {
                text: text.clone(),
                features: model.features(sequence),
                labels,
            })
            .collect();
        let pick = |idx: &[usize]| -> Vec<Example> { idx.iter().map(|i| examples[*i].clone()).collect() };
        let (train, val, test) = (pick(&train_idx), pick(&val_idx), pick(&test_idx));

        let batch_size = params.batch_size.max(1) as usize;
        let mut order: Vec<&Example> = train.iter().collect();
        let mut best = (f64::INFINITY, model.clone());
        let mut patience = params.patience;

        for epoch in 0..u64::from(params.num_epochs) {
            if params.shuffle {
                order.shuffle(&mut rng);
            }
            for batch in order.chunks(batch_size) {
                model.step(batch, params.lr);
            }

            let val_loss = model.loss(&val);
            tracing::debug!("epoch {epoch}: val_loss {val_loss:.5}");
            if reporter.report(epoch, -val_loss) == PruneDecision::Prune {
                return Ok(TrainingRun::Pruned { step: epoch });
            }

            if val_loss < best.0 {
                best = (val_loss, model.clone());
                patience = params.patience;
            } else {
                patience = patience.saturating_sub(1);
                if patience == 0 {
                    tracing::info!("Stopping early at epoch {epoch}");
                    break;
                }
            }
        }

        let (best_val_loss, model) = best;
        let threshold = Self::best_threshold(&model, &val, num_classes);
        let mut performance = PerformanceReport::default();

        let test_refs: Vec<&Example> = test.iter().collect();
        let (overall, per_class) = Self::evaluate(&model, &test_refs, threshold, num_classes);
        performance.overall = overall;
        performance.class = label_encoder
            .classes()
            .iter()
            .cloned()
            .zip(per_class)
            .collect();

        let short_text: Vec<&Example> = test
            .iter()
            .filter(|e| e.text.split_whitespace().count() < 8)
            .collect();
        let nlp_cnn: Vec<&Example> = test
            .iter()
            .filter(|e| {
                let nlp = label_encoder
                    .classes()
                    .iter()
                    .position(|c| c == "natural-language-processing")
                    .map_or(false, |c| e.labels[c] == 1);
                nlp && e.text.split_whitespace().any(|w| w == "cnn")
            })
            .collect();
        let sliced: Vec<&Example> = test
            .iter()
            .filter(|e| short_text.iter().chain(&nlp_cnn).any(|s| std::ptr::eq(*s, *e)))
            .collect();
        for (name, slice) in [("short_text", &short_text), ("nlp_cnn", &nlp_cnn), (OVERALL_SLICE, &sliced)] {
            let (metrics, _) = Self::evaluate(&model, slice, threshold, num_classes);
            performance.slices.insert(name.to_string(), metrics);
        }

        let mut used = params.clone();
        used.threshold = Some(threshold);
        let ctx = InferenceContext {
            run_id: String::new(),
            params: used,
            label_encoder,
            tokenizer,
            model: Box::new(model),
            performance,
        };
        let mut performance = ctx.performance.clone();
        performance.behavioral = self.suite.evaluate_context(&ctx)?;

        tracing::info!(
            "Trained baseline: f1 {:.3}, best val loss {:.5}, threshold {:.2}",
            performance.overall.f1,
            best_val_loss,
            threshold
        );
        Ok(TrainingRun::Finished(TrainingArtifacts {
            params: ctx.params,
            label_encoder: ctx.label_encoder,
            tokenizer: ctx.tokenizer,
            model: ctx.model,
            performance,
            loss: best_val_loss,
        }))
    }
}
