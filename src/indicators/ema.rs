use crate::error::{BotError, Result};

/// Exponential moving average over a series.
///
/// Smoothing factor k = 2 / (period + 1). The first output is the first
/// input value (seed); each subsequent value is prev + k * (x - prev).
/// The output has the same length as the input. Defined for period >= 1.
pub fn ema(series: &[f64], period: usize) -> Result<Vec<f64>> {
    if series.is_empty() {
        return Err(BotError::InsufficientData("ema: empty series".to_string()));
    }

    let k = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(series.len());
    let mut prev = series[0];
    out.push(prev);

    for &x in &series[1..] {
        prev += k * (x - prev);
        out.push(prev);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_length_matches_input() {
        let series = vec![100.0, 102.0, 101.0, 103.0, 105.0];
        let out = ema(&series, 3).unwrap();
        assert_eq!(out.len(), series.len());
    }

    #[test]
    fn test_ema_seeds_with_first_value() {
        let series = vec![42.0, 50.0, 60.0];
        let out = ema(&series, 10).unwrap();
        assert_eq!(out[0], 42.0);
    }

    #[test]
    fn test_ema_known_values() {
        // period 3 => k = 0.5
        let series = vec![10.0, 20.0, 30.0];
        let out = ema(&series, 3).unwrap();
        assert_eq!(out, vec![10.0, 15.0, 22.5]);
    }

    #[test]
    fn test_ema_constant_series() {
        let series = vec![5.0; 10];
        let out = ema(&series, 4).unwrap();
        assert!(out.iter().all(|&v| v == 5.0));
    }

    #[test]
    fn test_ema_empty_series() {
        let err = ema(&[], 5).unwrap_err();
        assert!(matches!(err, BotError::InsufficientData(_)));
    }

    #[test]
    fn test_ema_deterministic() {
        let series = vec![1.0, 2.5, 3.7, 2.2, 4.8, 3.3];
        let a = ema(&series, 5).unwrap();
        let b = ema(&series, 5).unwrap();
        assert_eq!(a, b);
    }
}
