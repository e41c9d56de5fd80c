// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Weights recent closes more heavily than the SMA, so a live chart overlay
// reacts faster to the in-progress bar.
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = value_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The series is seeded with the SMA of the first `period` values.
// =============================================================================

use super::sma::latest_sma;

/// Compute the EMA series for `values` with the given look-back `period`.
/// Element `i` of the result corresponds to `values[period - 1 + i]`.
///
/// Returns an empty `Vec` when `period` is zero or there are fewer values
/// than `period`. A non-finite intermediate value truncates the series —
/// downstream consumers should not trust anything past it.
pub fn calculate_ema(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    let Some(seed) = latest_sma(&values[..period], period) else {
        return Vec::new();
    };

    let mut result = Vec::with_capacity(values.len() - period + 1);
    result.push(seed);

    let mut previous = seed;
    for &value in &values[period..] {
        let ema = value * multiplier + previous * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        previous = ema;
    }

    result
}

/// The most recent EMA value, or `None` when there is not enough data.
pub fn latest_ema(values: &[f64], period: usize) -> Option<f64> {
    calculate_ema(values, period).last().copied()
}
