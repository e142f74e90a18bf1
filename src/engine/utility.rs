/// A mark may be ranked, averaged or classified only if it is finite and in [0, 100].
pub fn is_valid_mark(mark: f64) -> bool {
    mark.is_finite() && (0.0..=100.0).contains(&mark)
}

/// Filters an optional mark down to a rankable one.
pub fn valid(mark: Option<f64>) -> Option<f64> {
    mark.filter(|m| is_valid_mark(*m))
}

/// Rounds to two decimal places, half away from zero.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Sums values, returning 0.0 for empty input.
pub fn sum(values: &[f64]) -> f64 {
    values.iter().sum::<f64>()
}
