//! Numeric routines shared by the scripting context and the sync engine.
//!
//! Time-domain statistics, FFT-based dominant-frequency estimation, and the
//! correlation measures used for multi-channel sync-quality scoring. The FFT
//! path follows the same windowed `rustfft` approach as the rest of our data
//! processing code.

use num_complex::Complex;
use rustfft::FftPlanner;

/// Window function applied before an FFT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Window {
    None,
    Hanning,
    Blackman,
}

impl Window {
    /// Parse a window name; unknown names fall back to `None` (rectangular),
    /// matching the analysis template's behavior.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "hanning" | "hann" => Window::Hanning,
            "blackman" => Window::Blackman,
            _ => Window::None,
        }
    }

    /// Window coefficients for a given length.
    pub fn coefficients(&self, len: usize) -> Vec<f64> {
        if len < 2 {
            return vec![1.0; len];
        }
        let denom = (len - 1) as f64;
        (0..len)
            .map(|i| {
                let x = i as f64 / denom;
                match self {
                    Window::None => 1.0,
                    Window::Hanning => 0.5 * (1.0 - (2.0 * std::f64::consts::PI * x).cos()),
                    Window::Blackman => {
                        0.42 - 0.5 * (2.0 * std::f64::consts::PI * x).cos()
                            + 0.08 * (4.0 * std::f64::consts::PI * x).cos()
                    }
                }
            })
            .collect()
    }
}

/// Arithmetic mean; 0.0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Root-mean-square; 0.0 for an empty slice.
pub fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

/// Max minus min; 0.0 for an empty slice.
pub fn peak_to_peak(values: &[f64]) -> f64 {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &v in values {
        min = min.min(v);
        max = max.max(v);
    }
    if min.is_finite() && max.is_finite() {
        max - min
    } else {
        0.0
    }
}

/// Dominant non-DC frequency of a sampled signal, in Hz.
///
/// Applies `window`, runs a forward FFT and returns the frequency of the
/// largest-magnitude positive bin, skipping bin 0 (DC). Returns 0.0 when the
/// signal is too short to hold a non-DC bin or the sample interval is not
/// positive.
pub fn dominant_frequency(samples: &[f64], sample_interval: f64, window: Window) -> f64 {
    let n = samples.len();
    if n < 4 || sample_interval <= 0.0 {
        return 0.0;
    }

    // The mean is removed before windowing; otherwise a DC offset leaks
    // through the window into the low bins and masks the actual tone.
    let offset = mean(samples);
    let coeffs = window.coefficients(n);
    let mut buffer: Vec<Complex<f64>> = samples
        .iter()
        .zip(coeffs.iter())
        .map(|(&v, &w)| Complex::new((v - offset) * w, 0.0))
        .collect();

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n);
    fft.process(&mut buffer);

    let num_bins = n / 2;
    let mut best_idx = 0usize;
    let mut best_mag = f64::NEG_INFINITY;
    for (i, value) in buffer.iter().enumerate().take(num_bins).skip(1) {
        let mag = value.norm();
        if mag > best_mag {
            best_mag = mag;
            best_idx = i;
        }
    }
    if best_idx == 0 {
        return 0.0;
    }

    let freq_resolution = 1.0 / (sample_interval * n as f64);
    best_idx as f64 * freq_resolution
}

/// Pearson correlation coefficient between two equal-purpose signals.
///
/// Operates on the common prefix when lengths differ; returns 0.0 when either
/// signal is constant (zero variance) or empty.
pub fn pearson_correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let (a, b) = (&a[..n], &b[..n]);
    let mean_a = mean(a);
    let mean_b = mean(b);

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    let denom = (var_a * var_b).sqrt();
    if denom == 0.0 {
        0.0
    } else {
        cov / denom
    }
}

/// Lag (in samples) of `signal` relative to `reference` at the maximum of the
/// full cross-correlation, taking the largest absolute peak.
///
/// A lag of 0 means the signals are aligned; positive means `signal` is
/// delayed with respect to `reference`.
pub fn cross_correlation_lag(reference: &[f64], signal: &[f64]) -> i64 {
    let n = reference.len();
    let m = signal.len();
    if n == 0 || m == 0 {
        return 0;
    }

    let mut best_shift = 0i64;
    let mut best_mag = f64::NEG_INFINITY;
    for k in 0..(n + m - 1) {
        let shift = k as i64 - (m as i64 - 1);
        let mut acc = 0.0;
        for (j, &s) in signal.iter().enumerate() {
            let i = j as i64 + shift;
            if i >= 0 && (i as usize) < n {
                acc += reference[i as usize] * s;
            }
        }
        if acc.abs() > best_mag {
            best_mag = acc.abs();
            best_shift = shift;
        }
    }

    // acc peaks at shift = -delay, so negate for "positive = delayed"
    -best_shift
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, n: usize, dt: f64, phase: f64) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 * dt + phase).sin())
            .collect()
    }

    #[test]
    fn stats_basic() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert!((mean(&v) - 2.5).abs() < 1e-12);
        assert!((peak_to_peak(&v) - 3.0).abs() < 1e-12);
        let expected_rms = ((1.0 + 4.0 + 9.0 + 16.0) / 4.0_f64).sqrt();
        assert!((rms(&v) - expected_rms).abs() < 1e-12);
    }

    #[test]
    fn stats_empty() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(peak_to_peak(&[]), 0.0);
    }

    #[test]
    fn dominant_frequency_finds_sine() {
        let dt = 1.0 / 10_000.0;
        let samples = sine(500.0, 2048, dt, 0.0);
        let freq = dominant_frequency(&samples, dt, Window::Hanning);
        // Resolution is ~4.9 Hz at this length
        assert!((freq - 500.0).abs() < 10.0, "got {freq}");
    }

    #[test]
    fn dominant_frequency_skips_dc() {
        let dt = 1e-4;
        // Large DC offset plus a small tone
        let samples: Vec<f64> = sine(100.0, 1024, dt, 0.0)
            .iter()
            .map(|v| 10.0 + 0.1 * v)
            .collect();
        let freq = dominant_frequency(&samples, dt, Window::Hanning);
        // Bin spacing is ~9.8 Hz here
        assert!((freq - 100.0).abs() < 15.0, "offset must not win, got {freq}");
    }

    #[test]
    fn pearson_identical_and_inverted() {
        let a = sine(50.0, 512, 1e-4, 0.0);
        let inverted: Vec<f64> = a.iter().map(|v| -v).collect();
        assert!((pearson_correlation(&a, &a) - 1.0).abs() < 1e-9);
        assert!((pearson_correlation(&a, &inverted) + 1.0).abs() < 1e-9);
        assert_eq!(pearson_correlation(&a, &vec![0.0; 512]), 0.0);
    }

    #[test]
    fn zero_lag_for_identical_signals() {
        let a = sine(200.0, 256, 1e-5, 0.0);
        assert_eq!(cross_correlation_lag(&a, &a), 0);
    }

    #[test]
    fn detects_shifted_signal() {
        let n = 256;
        // Gaussian pulse centered mid-record: unambiguous correlation peak
        let pulse: Vec<f64> = (0..n)
            .map(|i| {
                let x = (i as f64 - 128.0) / 8.0;
                (-x * x).exp()
            })
            .collect();
        // signal delayed by 5 samples
        let mut shifted = vec![0.0; 5];
        shifted.extend_from_slice(&pulse[..n - 5]);
        let lag = cross_correlation_lag(&pulse, &shifted);
        assert_eq!(lag, 5, "expected a 5-sample delay, got {lag}");
    }

    #[test]
    fn window_coefficients_endpoints() {
        let hann = Window::Hanning.coefficients(64);
        assert!(hann[0].abs() < 1e-12);
        assert!((hann[63]).abs() < 1e-12);
        let rect = Window::None.coefficients(8);
        assert!(rect.iter().all(|&c| c == 1.0));
        assert_eq!(Window::from_name("blackman"), Window::Blackman);
        assert_eq!(Window::from_name("none"), Window::None);
        assert_eq!(Window::from_name("bogus"), Window::None);
    }
}
