//! Locates growth-then-loss cycles ("features") in a flow's BiF series.
use super::containers::{FlowState, Segment};

/// Returns up to `max_features` segments of the flow, in time order.
///
/// Retransmissions split the series into candidate windows (the whole series when there are
/// none); each window is then trimmed to run from its low point in the first half to its peak in
/// the second half.
pub fn find_features(flow: &FlowState, max_features: usize) -> Vec<Segment> {
    if !flow.is_usable() {
        return Vec::new();
    }

    let features: Vec<Segment> = candidate_windows(&flow.time_series, &flow.retransmission_times)
        .into_iter()
        .filter_map(|(start, end)| trim_window(&flow.bif_series, start, end))
        .take(max_features)
        .collect();

    log::debug!("Flow {}: {} features", flow.port, features.len());
    features
}

/// Splits `[0, times.len() - 1]` into disjoint windows at the samples matching the given loss
/// times. A loss sample closes its window.
pub fn candidate_windows(times: &[f64], loss_times: &[f64]) -> Vec<(usize, usize)> {
    if times.len() < 2 {
        return Vec::new();
    }
    let last = times.len() - 1;

    let mut bounds: Vec<usize> = loss_times
        .iter()
        .map(|&t| times.partition_point(|&x| x < t).min(last))
        .collect();
    bounds.push(0);
    bounds.push(last);
    bounds.sort_unstable();
    bounds.dedup();

    // Later windows start past the shared bound so no sample belongs to two windows.
    bounds
        .windows(2)
        .enumerate()
        .map(|(i, pair)| if i == 0 { (pair[0], pair[1]) } else { (pair[0] + 1, pair[1]) })
        .filter(|(start, end)| start < end)
        .collect()
}

/// Trims `values[start..=end]` to `[argmin of first half, argmax of second half]`.
///
/// Returns `None` unless the peak strictly follows the low point.
pub fn trim_window(values: &[i64], start: usize, end: usize) -> Option<Segment> {
    if end >= values.len() || end <= start {
        return None;
    }
    let window = &values[start..=end];
    let half = window.len() / 2;

    let low = first_extreme(&window[..half], |candidate, best| candidate < best)?;
    let peak = first_extreme(&window[half..], |candidate, best| candidate > best)? + half;

    if peak > low {
        Some(Segment {
            start: start + low,
            end: start + peak,
        })
    } else {
        None
    }
}

/// Index of the first element that no later element beats.
fn first_extreme(values: &[i64], beats: impl Fn(i64, i64) -> bool) -> Option<usize> {
    let mut best: Option<(usize, i64)> = None;
    for (index, &value) in values.iter().enumerate() {
        match best {
            Some((_, current)) if !beats(value, current) => {}
            _ => best = Some((index, value)),
        }
    }
    best.map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(values: &[i64], retransmissions: &[f64]) -> FlowState {
        let mut flow = FlowState::new(50000, None, None);
        flow.bif_series = values.to_vec();
        flow.time_series = (0..values.len()).map(|i| i as f64 * 0.1).collect();
        flow.retransmission_times = retransmissions.to_vec();
        flow
    }

    #[test]
    fn test_single_growth_cycle() {
        let flow = flow(&[1000, 2000, 3000, 4000, 1000, 1500, 2500, 3500], &[]);
        let features = find_features(&flow, 3);
        assert_eq!(features, vec![Segment { start: 0, end: 7 }]);
    }

    #[test]
    fn test_constant_series_keeps_first_occurrences() {
        let flow = flow(&[500, 500, 500, 500, 500], &[]);
        assert_eq!(find_features(&flow, 3), vec![Segment { start: 0, end: 2 }]);
    }

    #[test]
    fn test_decreasing_series_keeps_middle_pair() {
        // Low of the first half is its last sample, peak of the second half its first.
        let flow = flow(&[5000, 4000, 3000, 2000, 1000, 500], &[]);
        assert_eq!(find_features(&flow, 3), vec![Segment { start: 2, end: 3 }]);
    }

    #[test]
    fn test_retransmissions_split_windows() {
        // Two sawtooth cycles, loss marked at the first peak.
        let values = [100, 200, 300, 400, 500, 150, 250, 350, 450, 550];
        let flow = flow(&values, &[0.4]);

        assert_eq!(candidate_windows(&flow.time_series, &flow.retransmission_times), vec![(0, 4), (5, 9)]);
        assert_eq!(
            find_features(&flow, 3),
            vec![Segment { start: 0, end: 4 }, Segment { start: 5, end: 9 }]
        );
        assert_eq!(find_features(&flow, 1).len(), 1);
    }

    #[test]
    fn test_short_flow_yields_nothing() {
        assert!(find_features(&flow(&[100], &[]), 3).is_empty());
        assert!(trim_window(&[100, 200], 1, 1).is_none());
        assert!(trim_window(&[100, 200], 0, 5).is_none());
    }

    #[test]
    fn test_segments_stay_in_bounds() {
        let values: Vec<i64> = (0..200).map(|i| ((i * 37) % 101) as i64 * 10 + (i % 13) as i64).collect();
        let losses: Vec<f64> = vec![2.5, 7.0, 13.3, 19.9, 50.0];
        let flow = flow(&values, &losses);

        let segments = find_features(&flow, 10);
        for segment in &segments {
            assert!(segment.start < segment.end);
            assert!(segment.end < values.len());
        }
        assert!(segments.windows(2).all(|pair| pair[0].end < pair[1].start));
    }

    #[test]
    fn test_windows_do_not_share_bounds() {
        let times: Vec<f64> = (0..10).map(|i| i as f64 * 0.1).collect();
        let windows = candidate_windows(&times, &[0.2, 0.6]);
        assert_eq!(windows, vec![(0, 2), (3, 6), (7, 9)]);

        // Sample 4 is both the peak before the loss and the lowest point after it.
        let values = [100, 200, 300, 400, 500, 600, 700, 800, 900, 1000];
        let flow = flow(&values, &[0.4]);
        assert_eq!(
            find_features(&flow, 3),
            vec![Segment { start: 0, end: 4 }, Segment { start: 5, end: 9 }]
        );
    }
}
