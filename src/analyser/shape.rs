//! Turns a raw segment into a canonical curve: resample, smooth, normalize.
use std::f64::consts::PI;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use statrs::statistics::Statistics;

use crate::config::ResampleConfig;
use super::containers::{Curve, TraceScale};

/// Draws a fixed number of samples from a segment of any length.
///
/// Candidate timestamps are spread uniformly over the segment; which candidates are used is
/// decided by `cos` of uniformly drawn angles, so the selection is the same for every segment
/// resampled with the same seed.
pub struct Resampler {
    sample_size: usize,
    candidates: usize,
    rng: ChaCha8Rng,
}

impl Resampler {
    pub fn new(config: &ResampleConfig) -> Self {
        Self {
            sample_size: config.sample_size,
            candidates: config.candidates,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
        }
    }

    /// Returns exactly `sample_size` points sorted by time, or an empty curve when the
    /// segment has fewer than two points.
    pub fn resample(&mut self, curve: &Curve) -> Curve {
        if curve.len() < 2 || curve.time.len() != curve.value.len() {
            return Curve::default();
        }
        let last = curve.len() - 1;
        let t0 = curve.time[0];
        let step = (curve.time[last] - t0) / self.candidates as f64;
        let scale = (self.candidates - 1) as f64 / 2.0;

        let mut picks: Vec<usize> = (0..self.sample_size)
            .map(|_| {
                let angle: f64 = self.rng.gen_range(0.0..PI);
                ((angle.cos() + 1.0) * scale).round() as usize
            })
            .collect();
        picks.sort_unstable();

        let mut out = Curve::default();
        for pick in picks {
            let t = t0 + pick as f64 * step;
            let i = curve.time.partition_point(|&x| x < t).min(last);

            let (time, value) = if round6(t) == round6(curve.time[i]) || i == 0 || i == last {
                (curve.time[i], curve.value[i])
            } else {
                (
                    (curve.time[i - 1] + curve.time[i]) / 2.0,
                    (curve.value[i - 1] + curve.value[i]) / 2.0,
                )
            };
            out.time.push(time);
            out.value.push(value);
        }
        out
    }
}

fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

/// Centered moving average over both axes. Incomplete windows at the edges are dropped, so the
/// output has `len - window + 1` points (none if the curve is shorter than the window).
pub fn smooth(curve: &Curve, window: usize) -> Curve {
    if window == 0 || curve.len() < window {
        return Curve::default();
    }
    let average = |series: &[f64]| -> Vec<f64> {
        series.windows(window).map(|w| w.iter().mean()).collect()
    };
    Curve {
        time: average(&curve.time),
        value: average(&curve.value),
    }
}

/// Rescales time by RTT and value by BDP (in percent), then shifts both axes to start at 0.
pub fn normalize(curve: &Curve, scale: &TraceScale) -> Curve {
    let time: Vec<f64> = curve.time.iter().map(|t| t / scale.rtt).collect();
    let value: Vec<f64> = curve.value.iter().map(|v| v / scale.bdp * 100.0).collect();
    Curve {
        time: shift_to_zero(time),
        value: shift_to_zero(value),
    }
}

fn shift_to_zero(mut series: Vec<f64>) -> Vec<f64> {
    let min = series.iter().copied().fold(f64::INFINITY, f64::min);
    if min.is_finite() {
        series.iter_mut().for_each(|x| *x -= min);
    }
    series
}

/// Full shaping of one raw segment.
pub fn shape(resampler: &mut Resampler, config: &ResampleConfig, raw: &Curve, scale: &TraceScale) -> Curve {
    let sampled = resampler.resample(raw);
    let smoothed = if config.smoothing {
        smooth(&sampled, config.smoothing_window)
    } else {
        sampled
    };
    normalize(&smoothed, scale)
}
