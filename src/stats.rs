//! Statistical utility functions shared across modules
//!
//! Contains the small scalar helpers used by normalization, dispersion
//! estimation, and the diagnostics surface.

/// Median of a slice. Non-finite entries are ignored; returns NaN when
/// nothing finite remains.
pub fn median(values: &[f64]) -> f64 {
    let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return f64::NAN;
    }
    finite.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = finite.len();
    if n % 2 == 0 {
        (finite[n / 2 - 1] + finite[n / 2]) / 2.0
    } else {
        finite[n / 2]
    }
}

/// MAD^2 (squared median absolute deviation) with the 1.4826 consistency
/// constant, matching R's mad()
pub fn mad_squared(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let med = median(values);
    if !med.is_finite() {
        return 0.0;
    }
    let abs_devs: Vec<f64> = values
        .iter()
        .filter(|v| v.is_finite())
        .map(|&x| (x - med).abs())
        .collect();
    let mad = median(&abs_devs) * 1.4826;
    mad * mad
}

/// Geometric mean of the positive entries of a slice.
/// The divisor is the number of positive entries; returns 0 when none exist.
pub fn geometric_mean_positive(values: &[f64]) -> f64 {
    let mut log_sum = 0.0;
    let mut n_pos = 0usize;
    for &v in values {
        if v > 0.0 {
            log_sum += v.ln();
            n_pos += 1;
        }
    }
    if n_pos == 0 {
        0.0
    } else {
        (log_sum / n_pos as f64).exp()
    }
}

/// Trigamma function (derivative of digamma)
pub fn trigamma(x: f64) -> f64 {
    if x < 0.5 {
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).powi(2) - trigamma(1.0 - x);
    }

    if x >= 8.0 {
        let mut result = 1.0 / x + 0.5 / (x * x);
        let x2 = x * x;
        result += 1.0 / (6.0 * x2 * x);
        result -= 1.0 / (30.0 * x2 * x2 * x);
        return result;
    }

    let mut result = 0.0;
    let mut z = x;
    while z < 8.0 {
        result += 1.0 / (z * z);
        z += 1.0;
    }
    result + trigamma(z)
}

/// Pearson correlation between two equal-length slices.
/// Returns NaN for degenerate inputs (length < 2 or zero variance).
pub fn pearson_correlation(x: &[f64], y: &[f64]) -> f64 {
    if x.len() != y.len() || x.len() < 2 {
        return f64::NAN;
    }
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (&xi, &yi) in x.iter().zip(y.iter()) {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= 0.0 || var_y <= 0.0 {
        return f64::NAN;
    }
    cov / (var_x.sqrt() * var_y.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
    }

    #[test]
    fn test_median_ignores_nan() {
        assert_eq!(median(&[1.0, f64::NAN, 3.0]), 2.0);
        assert!(median(&[f64::NAN]).is_nan());
    }

    #[test]
    fn test_mad_squared() {
        // Symmetric data around 3: deviations (2,1,0,1,2), median dev 1
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        let expected = (1.0_f64 * 1.4826).powi(2);
        assert!((mad_squared(&v) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_geometric_mean_positive() {
        let v = [1.0, 0.0, 4.0];
        // Only positive entries count: sqrt(1*4) = 2
        assert!((geometric_mean_positive(&v) - 2.0).abs() < 1e-12);
        assert_eq!(geometric_mean_positive(&[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_trigamma_known_values() {
        // trigamma(1) = pi^2/6
        let pi = std::f64::consts::PI;
        assert!((trigamma(1.0) - pi * pi / 6.0).abs() < 1e-8);
        // Recurrence: trigamma(x+1) = trigamma(x) - 1/x^2
        assert!((trigamma(2.5) - (trigamma(1.5) - 1.0 / (1.5 * 1.5))).abs() < 1e-8);
    }

    #[test]
    fn test_pearson_correlation() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [2.0, 4.0, 6.0, 8.0];
        assert!((pearson_correlation(&x, &y) - 1.0).abs() < 1e-12);

        let y_neg = [8.0, 6.0, 4.0, 2.0];
        assert!((pearson_correlation(&x, &y_neg) + 1.0).abs() < 1e-12);
    }
}
