use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use rayon::prelude::*;
use serde::Serialize;

use crate::config::Config;
use crate::error::PipelineError;
use super::containers::{
    Candidate, Curve, FeatureFingerprint, Fingerprint, FlowState, FlowSummary, PacketRecord,
    Segment, TraceScale,
};
use super::fit::PolynomialFitter;
use super::model::{pad_to, CoefficientAggregator, ModelSet};
use super::segment::find_features;
use super::shape::{shape, Resampler};
use super::tracker::track;
use super::utils::{self, TraceName};

/// Everything extracted from one flow.
#[derive(Clone, Debug, Serialize)]
pub struct FlowAnalysis {
    pub summary: FlowSummary,
    pub features: Vec<FeatureFingerprint>,
}

/// Everything extracted from one capture.
#[derive(Clone, Debug, Serialize)]
pub struct TraceAnalysis {
    pub local_addr: Option<IpAddr>,
    pub scale: TraceScale,
    pub skipped_records: usize,
    pub flows: Vec<FlowAnalysis>,
}

impl TraceAnalysis {
    /// Coefficient vectors of every flow that produced at least one feature.
    pub fn coefficient_sets(&self) -> Vec<Vec<Vec<f64>>> {
        self.flows
            .iter()
            .filter(|flow| !flow.features.is_empty())
            .map(|flow| {
                flow.features
                    .iter()
                    .map(|feature| feature.fingerprint.coefficients.clone())
                    .collect()
            })
            .collect()
    }
}

/// Runs the tracker and the per-segment pipeline over one capture's records.
pub fn analyse(records: &[PacketRecord], scale: &TraceScale, config: &Config) -> TraceAnalysis {
    log::info!("Starting analysis of {} records.", records.len());
    let tracked = track(records, &config.tracker);
    log::info!(
        "{} of {} flows have enough samples to fingerprint.",
        tracked.usable_flows().count(),
        tracked.flows.len()
    );
    let fitter = PolynomialFitter::new(config.fit.max_degree);
    let mut resampler = Resampler::new(&config.resample);

    let flows = tracked
        .flows
        .values()
        .map(|flow| FlowAnalysis {
            summary: flow.summary(),
            features: fingerprint_flow(flow, &mut resampler, &fitter, scale, config),
        })
        .collect();

    TraceAnalysis {
        local_addr: tracked.local_addr,
        scale: *scale,
        skipped_records: tracked.skipped,
        flows,
    }
}

fn fingerprint_flow(
    flow: &FlowState,
    resampler: &mut Resampler,
    fitter: &PolynomialFitter,
    scale: &TraceScale,
    config: &Config,
) -> Vec<FeatureFingerprint> {
    if !flow.is_usable() {
        log::debug!("Flow {} has {} samples, skipping", flow.port, flow.len());
        return Vec::new();
    }
    let curve = flow.curve();

    find_features(flow, config.features.max_features)
        .into_iter()
        .enumerate()
        .map(|(index, segment)| FeatureFingerprint {
            port: flow.port,
            feature: index + 1,
            segment,
            fingerprint: fingerprint_segment(&curve, &segment, resampler, fitter, scale, config),
        })
        .collect()
}

/// Resamples, smooths, normalizes and fits one segment of a flow's curve.
///
/// Degenerate segments (flat raw values, or a normalized range too small to fit) yield a
/// constant fingerprint instead of a fit.
pub fn fingerprint_segment(
    curve: &Curve,
    segment: &Segment,
    resampler: &mut Resampler,
    fitter: &PolynomialFitter,
    scale: &TraceScale,
    config: &Config,
) -> Fingerprint {
    let raw = curve.slice(segment);
    if let Err(e) = check_variation(&raw, 0.0) {
        log::debug!("{e}");
        return Fingerprint::constant(raw.value[0]);
    }

    let normalized = shape(resampler, &config.resample, &raw, scale);
    if normalized.len() < 2 {
        return fitter.fit(&normalized);
    }
    if let Err(e) = check_variation(&normalized, config.fit.min_variation) {
        log::debug!("{e}");
        let mean = normalized.value.iter().sum::<f64>() / normalized.len() as f64;
        return Fingerprint::constant(mean);
    }
    fitter.fit(&normalized)
}

fn check_variation(curve: &Curve, min_variation: f64) -> Result<(), PipelineError> {
    if curve.value.iter().any(|v| !v.is_finite()) {
        return Err(PipelineError::DegenerateSegment("non-finite values".to_string()));
    }
    let range = curve.value_range();
    if range <= min_variation {
        return Err(PipelineError::DegenerateSegment(format!(
            "value range {range:e} over {} points",
            curve.len()
        )));
    }
    Ok(())
}

/// Reads and analyses one trace file. The scale comes from `scale` when given, otherwise
/// from the trace name.
pub fn analyse_file(path: &Path, scale: Option<TraceScale>, config: &Config) -> anyhow::Result<TraceAnalysis> {
    let scale = match scale.or_else(|| TraceName::from_path(path).map(|name| name.scale)) {
        Some(scale) => scale,
        None => anyhow::bail!(
            "Cannot derive RTT/BDP from '{}', pass them explicitly",
            path.display()
        ),
    };
    let records = utils::load_file(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    Ok(analyse(&records, &scale, config))
}

/// Labeled traces of a corpus directory, skipping names that do not follow the convention.
pub fn labeled_traces(files: &[PathBuf]) -> Vec<(PathBuf, TraceName)> {
    files
        .iter()
        .filter_map(|path| match TraceName::from_path(path) {
            Some(name) => Some((path.clone(), name)),
            None => {
                log::warn!("Skipping {}: unrecognized trace name", path.display());
                None
            }
        })
        .collect()
}

/// Fingerprints every trace in parallel and aggregates the coefficient vectors by CCA.
///
/// A trace that fails to load is logged and left out.
pub fn collect_corpus(traces: &[(PathBuf, TraceName)], config: &Config) -> CoefficientAggregator {
    let partials: Vec<CoefficientAggregator> = traces
        .par_iter()
        .filter_map(|(path, name)| match analyse_file(path, Some(name.scale), config) {
            Ok(analysis) => {
                let mut partial = CoefficientAggregator::new();
                for features in analysis.coefficient_sets() {
                    partial.add_trace(&name.cca, features);
                }
                Some(partial)
            }
            Err(e) => {
                log::warn!("Skipping {}: {e:#}", path.display());
                None
            }
        })
        .collect();

    let mut aggregator = CoefficientAggregator::new();
    for partial in partials {
        aggregator.merge(partial);
    }
    aggregator
}

/// Trains one Gaussian model per CCA from a labeled corpus.
pub fn train(traces: &[(PathBuf, TraceName)], config: &Config) -> ModelSet {
    log::info!("Training on {} traces.", traces.len());
    let aggregator = collect_corpus(traces, config);
    ModelSet::train(&aggregator.padded(), &config.model)
}

/// Ranking of one feature of one flow.
#[derive(Debug, Serialize)]
pub struct FeatureRanking {
    pub port: u16,
    pub feature: usize,
    pub candidates: Vec<Candidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Pads one fingerprint to the model dimension and ranks it.
pub fn classify_fingerprint(
    fingerprint: &Fingerprint,
    models: &ModelSet,
    config: &Config,
) -> Result<Vec<Candidate>, PipelineError> {
    let vector = pad_to(&fingerprint.coefficients, models.dimension)?;
    models.classify(&vector, &config.model)
}

/// Ranks every feature of every flow in an analysed trace.
pub fn classify_trace(analysis: &TraceAnalysis, models: &ModelSet, config: &Config) -> Vec<FeatureRanking> {
    analysis
        .flows
        .iter()
        .flat_map(|flow| flow.features.iter())
        .map(|feature| match classify_fingerprint(&feature.fingerprint, models, config) {
            Ok(candidates) => FeatureRanking {
                port: feature.port,
                feature: feature.feature,
                candidates,
                error: None,
            },
            Err(e) => {
                log::warn!("Flow {} feature {}: {e}", feature.port, feature.feature);
                FeatureRanking {
                    port: feature.port,
                    feature: feature.feature,
                    candidates: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        })
        .collect()
}

/// Confusion matrix of top-1 predictions, rows are the truth.
#[derive(Debug, Default, Serialize)]
pub struct Evaluation {
    pub ccas: Vec<String>,
    pub matrix: BTreeMap<String, BTreeMap<String, usize>>,
    pub errors: BTreeMap<String, usize>,
}

impl Evaluation {
    pub fn record(&mut self, truth: &str, predicted: Option<&str>) {
        match predicted {
            Some(predicted) => {
                *self
                    .matrix
                    .entry(truth.to_string())
                    .or_default()
                    .entry(predicted.to_string())
                    .or_default() += 1;
            }
            None => *self.errors.entry(truth.to_string()).or_default() += 1,
        }
    }

    pub fn count(&self, truth: &str, predicted: &str) -> usize {
        self.matrix
            .get(truth)
            .and_then(|row| row.get(predicted))
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self, truth: &str) -> usize {
        self.matrix.get(truth).map_or(0, |row| row.values().sum())
    }

    /// Share of correctly classified samples, `None` when nothing was classified.
    pub fn accuracy(&self, truth: &str) -> Option<f64> {
        let total = self.total(truth);
        (total > 0).then(|| self.count(truth, truth) as f64 / total as f64)
    }

    pub fn overall_accuracy(&self) -> Option<f64> {
        let total: usize = self.ccas.iter().map(|cca| self.total(cca)).sum();
        let correct: usize = self.ccas.iter().map(|cca| self.count(cca, cca)).sum();
        (total > 0).then(|| correct as f64 / total as f64)
    }
}

/// Classifies the trained feature slot of every flow of every labeled trace.
pub fn evaluate(traces: &[(PathBuf, TraceName)], models: &ModelSet, config: &Config) -> Evaluation {
    let outcomes: Vec<(String, Vec<Option<String>>)> = traces
        .par_iter()
        .filter_map(|(path, name)| match analyse_file(path, Some(name.scale), config) {
            Ok(analysis) => {
                let predictions = analysis
                    .flows
                    .iter()
                    .filter_map(|flow| {
                        flow.features
                            .iter()
                            .find(|feature| feature.feature == models.feature_slot)
                    })
                    .map(|feature| {
                        match classify_fingerprint(&feature.fingerprint, models, config) {
                            Ok(candidates) => candidates.first().map(|c| c.cca.clone()),
                            Err(e) => {
                                log::warn!("{}: {e}", path.display());
                                None
                            }
                        }
                    })
                    .collect();
                Some((name.cca.clone(), predictions))
            }
            Err(e) => {
                log::warn!("Skipping {}: {e:#}", path.display());
                None
            }
        })
        .collect();

    let mut evaluation = Evaluation::default();
    let mut ccas: Vec<String> = models.models.keys().cloned().collect();
    for (truth, predictions) in &outcomes {
        if !ccas.contains(truth) {
            ccas.push(truth.clone());
        }
        for predicted in predictions {
            evaluation.record(truth, predicted.as_deref());
        }
    }
    evaluation.ccas = ccas;
    evaluation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::tracker::tests::{ack, data};

    const SCALE: TraceScale = TraceScale { rtt: 0.11, bdp: 5500.0 };

    /// A sender that grows its window by one packet per ack until a loss every `period`
    /// packets, receiving data in order and acking every packet.
    fn sawtooth(cycles: usize, period: i64, growth: impl Fn(i64) -> i64) -> Vec<PacketRecord> {
        let mut records = Vec::new();
        let mut time = 0.0;
        let mut acked = 0;
        for _ in 0..cycles {
            for step in 1..=period {
                let window = growth(step);
                time += 0.001;
                records.push(data(time, acked + window));
                time += 0.001;
                acked += 100;
                records.push(ack(time, acked));
            }
        }
        records
    }

    #[test]
    fn test_constant_flow_yields_constant_fingerprint() {
        let flow = {
            let mut flow = FlowState::new(50000, None, None);
            flow.bif_series = vec![500; 5];
            flow.time_series = vec![0.0, 0.1, 0.2, 0.3, 0.4];
            flow
        };
        let config = Config::default();
        let mut resampler = Resampler::new(&config.resample);
        let fitter = PolynomialFitter::new(config.fit.max_degree);

        let features = fingerprint_flow(&flow, &mut resampler, &fitter, &SCALE, &config);
        assert_eq!(features.len(), 1);
        assert_eq!(
            features[0].fingerprint,
            Fingerprint {
                degree: 1,
                coefficients: vec![500.0],
                errors: vec![0.0],
            }
        );
    }

    #[test]
    fn test_growth_segment_is_fitted() {
        let curve = Curve::new(
            (0..400).map(|i| i as f64 * 0.005).collect(),
            (0..400).map(|i| 1000.0 + (i * i) as f64 * 0.5).collect(),
        );
        let config = Config::default();
        let mut resampler = Resampler::new(&config.resample);
        let fitter = PolynomialFitter::new(config.fit.max_degree);
        let segment = Segment { start: 0, end: 399 };

        let fingerprint = fingerprint_segment(&curve, &segment, &mut resampler, &fitter, &SCALE, &config);
        assert_eq!(fingerprint.degree, config.fit.max_degree);
        assert_eq!(fingerprint.coefficients.len(), config.fit.max_degree + 1);
        assert!(fingerprint.coefficients.iter().all(|c| c.is_finite()));
    }

    #[test]
    fn test_flattened_segment_falls_back() {
        let curve = Curve::new(
            (0..100).map(|i| i as f64 * 0.01).collect(),
            (0..100).map(|i| 1000.0 + i as f64).collect(),
        );
        let config = Config::default();
        let mut resampler = Resampler::new(&config.resample);
        let fitter = PolynomialFitter::new(config.fit.max_degree);
        let huge = TraceScale { rtt: 0.1, bdp: 1e15 };

        let fingerprint = fingerprint_segment(
            &curve,
            &Segment { start: 0, end: 99 },
            &mut resampler,
            &fitter,
            &huge,
            &config,
        );
        assert_eq!(fingerprint.degree, 1);
        assert_eq!(fingerprint.coefficients.len(), 1);
    }

    #[test]
    fn test_analyse_produces_features_per_flow() {
        let records = sawtooth(3, 60, |step| step * 150);
        let analysis = analyse(&records, &SCALE, &Config::default());

        assert_eq!(analysis.flows.len(), 1);
        let flow = &analysis.flows[0];
        assert_eq!(flow.summary.port, 50000);
        assert_eq!(flow.summary.samples, records.len());
        assert!(!flow.features.is_empty());
        for feature in &flow.features {
            assert!(feature.segment.start < feature.segment.end);
            assert!(feature.segment.end < records.len());
        }
        assert_eq!(analysis.coefficient_sets().len(), 1);
    }

    #[test]
    fn test_analysis_is_reproducible() {
        let records = sawtooth(2, 80, |step| step * step * 4);
        let config = Config::default();
        let first = analyse(&records, &SCALE, &config);
        let second = analyse(&records, &SCALE, &config);
        assert_eq!(first.coefficient_sets(), second.coefficient_sets());
    }

    #[test]
    fn test_classify_trace_against_own_model() {
        let config = Config::default();
        let linear: Vec<TraceAnalysis> = (0..3)
            .map(|k| analyse(&sawtooth(1, 70 + k * 5, |step| step * 120), &SCALE, &config))
            .collect();
        let cubic: Vec<TraceAnalysis> = (0..3)
            .map(|k| analyse(&sawtooth(1, 70 + k * 5, |step| step * step * step / 40), &SCALE, &config))
            .collect();

        let mut aggregator = CoefficientAggregator::new();
        for analysis in &linear {
            for features in analysis.coefficient_sets() {
                aggregator.add_trace("linear", features);
            }
        }
        for analysis in &cubic {
            for features in analysis.coefficient_sets() {
                aggregator.add_trace("cubic", features);
            }
        }
        let models = ModelSet::train(&aggregator.padded(), &config.model);
        assert_eq!(models.models.len(), 2);

        let rankings = classify_trace(&linear[0], &models, &config);
        assert!(!rankings.is_empty());
        assert!(rankings.iter().all(|r| r.error.is_none()));
        assert!(rankings.iter().all(|r| !r.candidates.is_empty()));
    }

    #[test]
    fn test_oversized_fingerprint_is_rejected() {
        let models = crate::analyser::model::tests::trained(&[(
            "reno",
            vec![vec![1.0, 2.0], vec![1.5, 2.5]],
        )]);
        let fingerprint = Fingerprint {
            degree: 2,
            coefficients: vec![1.0, 2.0, 3.0],
            errors: vec![0.0, 0.0],
        };
        assert_eq!(
            classify_fingerprint(&fingerprint, &models, &Config::default()),
            Err(PipelineError::DimensionMismatch { expected: 2, got: 3 })
        );
    }

    #[test]
    fn test_evaluation_accuracy() {
        let mut evaluation = Evaluation {
            ccas: vec!["cubic".to_string(), "reno".to_string(), "vegas".to_string()],
            ..Evaluation::default()
        };
        evaluation.record("cubic", Some("cubic"));
        evaluation.record("cubic", Some("cubic"));
        evaluation.record("cubic", Some("reno"));
        evaluation.record("reno", Some("reno"));
        evaluation.record("reno", None);

        assert_eq!(evaluation.count("cubic", "reno"), 1);
        assert_eq!(evaluation.accuracy("cubic"), Some(2.0 / 3.0));
        assert_eq!(evaluation.accuracy("reno"), Some(1.0));
        assert_eq!(evaluation.accuracy("vegas"), None);
        assert_eq!(evaluation.overall_accuracy(), Some(0.75));
        assert_eq!(evaluation.errors["reno"], 1);
    }
}
