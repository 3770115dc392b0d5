//! Pipeline configuration.
//!
//! Every stage receives the same immutable [Config] at construction time.
//! The file is optional TOML; missing sections fall back to the values the
//! fingerprinting models were calibrated with.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub features: FeatureConfig,
    pub resample: ResampleConfig,
    pub fit: FitConfig,
    pub model: ModelConfig,
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from file if given, otherwise returns defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn generate_default() -> String {
        toml::to_string_pretty(&Config::default())
            .unwrap_or_else(|_| "# Failed to generate config".to_string())
    }

    pub fn validate(&self) -> Result<()> {
        if self.tracker.packet_size == 0 {
            anyhow::bail!("tracker.packet_size must be greater than 0");
        }
        for net in &self.tracker.local_networks {
            LocalNetwork::from_str(net)
                .with_context(|| format!("Invalid tracker.local_networks entry: {net}"))?;
        }
        if self.features.max_features == 0 {
            anyhow::bail!("features.max_features must be greater than 0");
        }
        if self.resample.sample_size == 0 || self.resample.candidates < 2 {
            anyhow::bail!("resample.sample_size must be > 0 and resample.candidates >= 2");
        }
        if self.resample.smoothing_window == 0 {
            anyhow::bail!("resample.smoothing_window must be greater than 0");
        }
        if self.fit.max_degree == 0 {
            anyhow::bail!("fit.max_degree must be greater than 0");
        }
        if self.model.regularization <= 0.0 || self.model.density_floor <= 0.0 {
            anyhow::bail!("model.regularization and model.density_floor must be positive");
        }
        if self.model.min_training_samples == 0 || self.model.top_k == 0 {
            anyhow::bail!("model.min_training_samples and model.top_k must be greater than 0");
        }
        if self.model.feature_slot == 0 {
            anyhow::bail!("model.feature_slot is 1-based");
        }
        Ok(())
    }
}

/// Flow Tracker parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Cushion added to every BiF estimate, and the step of the duplicate ack correction
    pub packet_size: i64,
    /// Estimates a flow must have before duplicate acks trigger the loss correction
    pub dup_ack_warmup: usize,
    /// CIDR ranges the local endpoint is detected in, checked in order
    pub local_networks: Vec<String>,
}

impl TrackerConfig {
    pub fn networks(&self) -> Vec<LocalNetwork> {
        self.local_networks
            .iter()
            .filter_map(|net| match LocalNetwork::from_str(net) {
                Ok(net) => Some(net),
                Err(e) => {
                    log::warn!("Ignoring local network {net}: {e}");
                    None
                }
            })
            .collect()
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            packet_size: 88,
            dup_ack_warmup: 10,
            local_networks: vec!["10.0.0.0/24".to_string(), "100.64.0.0/24".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Maximum number of growth/loss segments kept per flow
    pub max_features: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self { max_features: 3 }
    }
}

/// Resampler and Smoother parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResampleConfig {
    /// Number of samples drawn per segment
    pub sample_size: usize,
    /// Number of uniformly spaced candidate timestamps
    pub candidates: usize,
    pub seed: u64,
    pub smoothing: bool,
    pub smoothing_window: usize,
}

impl Default for ResampleConfig {
    fn default() -> Self {
        Self {
            sample_size: 225,
            candidates: 1000,
            seed: 0,
            smoothing: true,
            smoothing_window: 25,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FitConfig {
    pub max_degree: usize,
    /// Smallest normalized value range still worth fitting
    pub min_variation: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_degree: 5,
            min_variation: 1e-6,
        }
    }
}

/// Gaussian trainer and classifier parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelConfig {
    pub regularization: f64,
    /// Diagonal variance used when a CCA has a single sample
    pub single_sample_variance: f64,
    pub density_floor: f64,
    pub min_training_samples: usize,
    pub top_k: usize,
    /// 1-based feature index used for training and classification
    pub feature_slot: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            regularization: 1e-6,
            single_sample_variance: 0.1,
            density_floor: 1e-10,
            min_training_samples: 2,
            top_k: 3,
            feature_slot: 1,
        }
    }
}

/// A CIDR range the local endpoint may live in, e.g. `10.0.0.0/24` or `fd00::/8`.
/// A bare address is a host range.
pub type LocalNetwork = IpNetwork;
