//! Per-CCA Gaussian models over padded fingerprint vectors.
//!
//! Fingerprints of different traces have different lengths, so the aggregator pads every
//! coefficient vector with trailing zeros to the longest one seen anywhere in the corpus. Each
//! CCA is then modelled as a multivariate normal over those vectors, and an unknown vector is
//! ranked against all models by normalized density.
use std::collections::BTreeMap;
use std::f64::consts::PI;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{PipelineError, Result};
use super::containers::Candidate;

/// Coefficient vectors grouped by CCA, trace and feature.
#[derive(Debug, Default)]
pub struct CoefficientAggregator {
    traces: BTreeMap<String, Vec<Vec<Vec<f64>>>>,
}

impl CoefficientAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one trace's coefficient vectors, in feature order.
    pub fn add_trace(&mut self, cca: &str, features: Vec<Vec<f64>>) {
        self.traces.entry(cca.to_string()).or_default().push(features);
    }

    pub fn merge(&mut self, other: CoefficientAggregator) {
        for (cca, traces) in other.traces {
            self.traces.entry(cca).or_default().extend(traces);
        }
    }

    /// Longest coefficient vector across every CCA and feature.
    pub fn max_len(&self) -> usize {
        self.traces
            .values()
            .flatten()
            .flatten()
            .map(Vec::len)
            .max()
            .unwrap_or(0)
    }

    pub fn padded(&self) -> PaddedCoefficients {
        let dimension = self.max_len();
        log::info!("Maximum polynomial length found: {dimension}");

        let mut slots: BTreeMap<String, BTreeMap<usize, Vec<Vec<f64>>>> = BTreeMap::new();
        for (cca, traces) in &self.traces {
            let by_feature = slots.entry(cca.clone()).or_default();
            for trace in traces {
                for (index, features) in trace.iter().enumerate() {
                    by_feature
                        .entry(index + 1)
                        .or_default()
                        .push(pad(features, dimension));
                }
            }
        }
        PaddedCoefficients { dimension, slots }
    }
}

/// Zero-padded vectors, all of length `dimension`, keyed by CCA then 1-based feature index.
#[derive(Debug)]
pub struct PaddedCoefficients {
    pub dimension: usize,
    pub slots: BTreeMap<String, BTreeMap<usize, Vec<Vec<f64>>>>,
}

impl PaddedCoefficients {
    pub fn slot(&self, cca: &str, feature: usize) -> &[Vec<f64>] {
        self.slots
            .get(cca)
            .and_then(|features| features.get(&feature))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Appends zeros up to `len`. Vectors already at least that long are returned unchanged.
pub fn pad(vector: &[f64], len: usize) -> Vec<f64> {
    let mut padded = vector.to_vec();
    if padded.len() < len {
        padded.resize(len, 0.0);
    }
    padded
}

/// Pads an unknown vector to a model dimension; longer vectors cannot be compared.
pub fn pad_to(vector: &[f64], dimension: usize) -> Result<Vec<f64>> {
    if vector.len() > dimension {
        return Err(PipelineError::DimensionMismatch {
            expected: dimension,
            got: vector.len(),
        });
    }
    Ok(pad(vector, dimension))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GaussianModel {
    pub mean: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
}

impl GaussianModel {
    /// Sample mean and regularized sample covariance of equal-length vectors.
    pub fn fit(samples: &[Vec<f64>], config: &ModelConfig) -> Result<Self> {
        let first = samples.first().ok_or_else(|| PipelineError::InsufficientTrainingData {
            cca: String::new(),
            required: 1,
            actual: 0,
        })?;
        let dim = first.len();
        if let Some(bad) = samples.iter().find(|s| s.len() != dim) {
            return Err(PipelineError::DimensionMismatch {
                expected: dim,
                got: bad.len(),
            });
        }

        let n = samples.len() as f64;
        let mean: Vec<f64> = (0..dim)
            .map(|j| samples.iter().map(|s| s[j]).sum::<f64>() / n)
            .collect();

        let covariance = if samples.len() == 1 {
            scaled_identity(dim, config.single_sample_variance)
        } else {
            let mut cov = vec![vec![0.0; dim]; dim];
            for sample in samples {
                for i in 0..dim {
                    for j in 0..dim {
                        cov[i][j] += (sample[i] - mean[i]) * (sample[j] - mean[j]);
                    }
                }
            }
            for (i, row) in cov.iter_mut().enumerate() {
                row.iter_mut().for_each(|c| *c /= n - 1.0);
                row[i] += config.regularization;
            }
            cov
        };

        Ok(Self { mean, covariance })
    }

    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    /// Log-density of `x`.
    ///
    /// Non-finite inputs or parameters, covariances that fail to factorize and non-finite
    /// results yield `ln(floor)` rather than an error; only a length mismatch is an error.
    /// Finite densities are returned as computed, however small.
    pub fn log_density(&self, x: &[f64], floor: f64) -> Result<f64> {
        if x.len() != self.dimension() {
            return Err(PipelineError::DimensionMismatch {
                expected: self.dimension(),
                got: x.len(),
            });
        }
        let log_floor = floor.ln();

        let finite = x.iter().chain(self.mean.iter()).all(|v| v.is_finite())
            && self.covariance.iter().flatten().all(|v| v.is_finite());
        if !finite {
            return Ok(log_floor);
        }
        let l = match cholesky(&self.covariance) {
            Some(l) => l,
            None => return Ok(log_floor),
        };

        // Forward substitution L z = x - mean.
        let dim = self.dimension();
        let mut z = vec![0.0; dim];
        for i in 0..dim {
            let partial: f64 = (0..i).map(|k| l[i][k] * z[k]).sum();
            z[i] = (x[i] - self.mean[i] - partial) / l[i][i];
        }
        let mahalanobis: f64 = z.iter().map(|v| v * v).sum();
        let log_det: f64 = 2.0 * (0..dim).map(|i| l[i][i].ln()).sum::<f64>();
        let log_pdf = -0.5 * (dim as f64 * (2.0 * PI).ln() + log_det + mahalanobis);

        if log_pdf.is_finite() {
            Ok(log_pdf)
        } else {
            Ok(log_floor)
        }
    }
}

fn scaled_identity(dim: usize, scale: f64) -> Vec<Vec<f64>> {
    (0..dim)
        .map(|i| (0..dim).map(|j| if i == j { scale } else { 0.0 }).collect())
        .collect()
}

/// Lower-triangular Cholesky factor, `None` unless the matrix is square and positive definite.
fn cholesky(m: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let n = m.len();
    if m.iter().any(|row| row.len() != n) {
        return None;
    }
    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let s: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let d = m[i][i] - s;
                if !(d > 0.0) {
                    return None;
                }
                l[i][i] = d.sqrt();
            } else {
                l[i][j] = (m[i][j] - s) / l[j][j];
            }
        }
    }
    Some(l)
}

/// Trained models for every CCA that had enough samples.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelSet {
    /// Length every fingerprint vector is padded to
    pub dimension: usize,
    /// 1-based feature index the models were trained on
    pub feature_slot: usize,
    pub trained_at: DateTime<Utc>,
    pub samples: BTreeMap<String, usize>,
    pub models: BTreeMap<String, GaussianModel>,
}

impl ModelSet {
    /// Fits one model per CCA from the configured feature slot.
    pub fn train(padded: &PaddedCoefficients, config: &ModelConfig) -> Self {
        let mut models = BTreeMap::new();
        let mut samples = BTreeMap::new();

        for cca in padded.slots.keys() {
            let data = padded.slot(cca, config.feature_slot);
            if data.len() < config.min_training_samples {
                let e = PipelineError::InsufficientTrainingData {
                    cca: cca.clone(),
                    required: config.min_training_samples,
                    actual: data.len(),
                };
                log::warn!("{e}, excluding it");
                continue;
            }
            log::info!(
                "Training Gaussian model for {cca}: {} samples, {} dimensions",
                data.len(),
                padded.dimension
            );
            match GaussianModel::fit(data, config) {
                Ok(model) => {
                    samples.insert(cca.clone(), data.len());
                    models.insert(cca.clone(), model);
                }
                Err(e) => log::warn!("Error creating Gaussian model for {cca}: {e}"),
            }
        }

        Self {
            dimension: padded.dimension,
            feature_slot: config.feature_slot,
            trained_at: Utc::now(),
            samples,
            models,
        }
    }

    /// Ranks every CCA for one padded vector, best first, at most `top_k` entries.
    pub fn classify(&self, vector: &[f64], config: &ModelConfig) -> Result<Vec<Candidate>> {
        if vector.len() != self.dimension {
            return Err(PipelineError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }

        let mut scored = Vec::with_capacity(self.models.len());
        for (cca, model) in &self.models {
            scored.push((cca, model.log_density(vector, config.density_floor)?));
        }
        let (first_cca, first_log) = match scored.first() {
            Some(&(cca, log)) => (cca, log),
            None => return Ok(Vec::new()),
        };

        if scored.iter().all(|&(_, log)| log == first_log) {
            return Ok(vec![Candidate {
                cca: first_cca.clone(),
                score: 1.0,
                log_density: first_log,
            }]);
        }

        let max_log = scored.iter().map(|&(_, log)| log).fold(f64::NEG_INFINITY, f64::max);
        let weights: Vec<f64> = scored.iter().map(|&(_, log)| (log - max_log).exp()).collect();
        let total: f64 = weights.iter().sum();

        let mut candidates: Vec<Candidate> = scored
            .iter()
            .zip(weights)
            .map(|(&(cca, log), weight)| Candidate {
                cca: cca.clone(),
                score: weight / total,
                log_density: log,
            })
            .collect();
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(config.top_k);
        Ok(candidates)
    }
}
