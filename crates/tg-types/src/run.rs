use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::TgError;
use crate::params::Params;
use crate::performance::MetricsSnapshot;

/// Opaque run identifier assigned by the run store
pub type RunId = String;

/// Lifecycle state of a tracked run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Finished => write!(f, "finished"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Tracking-backend view of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: RunId,
    pub run_name: String,
    pub experiment_id: String,
    pub experiment_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Tracking-backend view of an experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentInfo {
    pub experiment_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A committed training run
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub experiment_name: String,
    pub params: Params,
    pub metrics: MetricsSnapshot,
    pub artifact_location: PathBuf,
}

/// Compute target for model weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

impl FromStr for Device {
    type Err = TgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse().ok())
                .map(Self::Cuda)
                .ok_or_else(|| TgError::Config(format!("unknown device '{other}'"))),
        }
    }
}

/// Raw model weights together with the device they are placed on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightBlob {
    pub bytes: Vec<u8>,
    pub device: Device,
}

impl WeightBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            device: Device::Cpu,
        }
    }

    pub fn on(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_parse() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:2".parse::<Device>().unwrap(), Device::Cuda(2));
        assert!("tpu".parse::<Device>().is_err());
        assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
    }

    #[test]
    fn test_weight_blob_device() {
        let blob = WeightBlob::new(vec![1, 2, 3]).on(Device::Cuda(0));
        assert_eq!(blob.device, Device::Cuda(0));
        assert_eq!(blob.len(), 3);
    }
}
