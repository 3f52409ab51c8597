//! Artifact bundle codec.
//!
//! A bundle is five independently formatted files inside one directory. The
//! codec only touches the filesystem; publication is the run store's job.

use std::path::Path;

use tg_types::{
    ArtifactComponent, ArtifactState, Device, MultiLabelEncoder, Params, PerformanceReport,
    TgError, TgResult, Tokenizer, WeightBlob,
};

use crate::fsio::{write_atomic, write_json_atomic};

/// Everything a training run persists
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactBundle {
    pub params: Params,
    pub label_encoder: MultiLabelEncoder,
    pub tokenizer: Tokenizer,
    pub weights: WeightBlob,
    pub performance: PerformanceReport,
}

/// Reads and writes [`ArtifactBundle`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactCodec;

impl ArtifactCodec {
    pub fn new() -> Self {
        Self
    }

    /// Writes all five components into `dir`.
    pub fn write(&self, bundle: &ArtifactBundle, dir: &Path) -> TgResult<()> {
        std::fs::create_dir_all(dir)?;

        write_json_atomic(&dir.join(ArtifactComponent::Params.file_name()), &bundle.params)?;
        self.write_state(dir, ArtifactComponent::LabelEncoder, &bundle.label_encoder)?;
        self.write_state(dir, ArtifactComponent::Tokenizer, &bundle.tokenizer)?;
        write_atomic(
            &dir.join(ArtifactComponent::Weights.file_name()),
            &bundle.weights.bytes,
        )?;
        self.write_performance(&bundle.performance, dir)?;

        tracing::debug!(
            "Wrote bundle to {} ({} weight bytes)",
            dir.display(),
            bundle.weights.len()
        );
        Ok(())
    }

    /// Replaces only `performance.json` inside `dir`.
    pub fn write_performance(&self, performance: &PerformanceReport, dir: &Path) -> TgResult<()> {
        write_json_atomic(
            &dir.join(ArtifactComponent::Performance.file_name()),
            performance,
        )
    }

    fn write_state<T: ArtifactState>(
        &self,
        dir: &Path,
        component: ArtifactComponent,
        value: &T,
    ) -> TgResult<()> {
        write_json_atomic(&dir.join(component.file_name()), &value.to_state())
    }

    /// Reads a full bundle, placing the weights on `device`.
    pub fn read(&self, dir: &Path, device: Device) -> TgResult<ArtifactBundle> {
        let params = self.read_params(dir)?;
        let label_encoder = self.read_state(dir, ArtifactComponent::LabelEncoder)?;
        let tokenizer = self.read_state(dir, ArtifactComponent::Tokenizer)?;
        let weights = WeightBlob::new(read_component(dir, ArtifactComponent::Weights)?).on(device);
        let performance = self.read_performance(dir)?;

        Ok(ArtifactBundle {
            params,
            label_encoder,
            tokenizer,
            weights,
            performance,
        })
    }

    /// A malformed params file is a `Parse` error; a missing one is corruption.
    pub fn read_params(&self, dir: &Path) -> TgResult<Params> {
        let component = ArtifactComponent::Params;
        let raw = read_component(dir, component)?;
        let text = String::from_utf8(raw).map_err(|e| TgError::corruption(component, e))?;
        Params::from_json_str(&text).map_err(|e| match e {
            TgError::Parse { message, .. } => {
                TgError::parse(dir.join(component.file_name()).display(), message)
            }
            other => other,
        })
    }

    pub fn read_performance(&self, dir: &Path) -> TgResult<PerformanceReport> {
        let component = ArtifactComponent::Performance;
        let raw = read_component(dir, component)?;
        serde_json::from_slice(&raw).map_err(|e| TgError::corruption(component, e))
    }

    fn read_state<T: ArtifactState>(&self, dir: &Path, component: ArtifactComponent) -> TgResult<T> {
        let raw = read_component(dir, component)?;
        let state = serde_json::from_slice(&raw).map_err(|e| TgError::corruption(component, e))?;
        T::from_state(state).map_err(|e| TgError::corruption(component, e))
    }
}

fn read_component(dir: &Path, component: ArtifactComponent) -> TgResult<Vec<u8>> {
    let path = dir.join(component.file_name());
    std::fs::read(&path).map_err(|e| {
        TgError::corruption(component, format!("cannot read {}: {e}", path.display()))
    })
}
