//! Zero-phase notch filtering and FIR decimation for LFP traces.

use crate::error::Error;
use std::f64::consts::PI;

/// Second-order IIR section, `a[0]` normalized to 1.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Biquad {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

/// Notch at `freq_hz` with quality factor `q` (bandwidth `freq_hz / q` at -3 dB).
pub fn iir_notch(freq_hz: f64, sample_rate_hz: f64, q: f64) -> Result<Biquad, Error> {
    let nyquist = sample_rate_hz / 2.0;
    if !(freq_hz > 0.0 && freq_hz < nyquist) {
        return Err(Error::Validation(format!(
            "notch frequency {} Hz must lie in (0, {}) Hz",
            freq_hz, nyquist
        )));
    }
    if q <= 0.0 {
        return Err(Error::Validation(format!("notch quality factor {} must be positive", q)));
    }

    let w0_norm = freq_hz / nyquist;
    let bandwidth = w0_norm / q * PI;
    let w0 = w0_norm * PI;
    let beta = (bandwidth / 2.0).tan();
    let gain = 1.0 / (1.0 + beta);
    let cos_w0 = w0.cos();

    Ok(Biquad {
        b: [gain, -2.0 * gain * cos_w0, gain],
        a: [1.0, -2.0 * gain * cos_w0, 2.0 * gain - 1.0],
    })
}

impl Biquad {
    /// Initial state for a unit step, so a constant input produces no transient.
    pub fn steady_state(&self) -> [f64; 2] {
        let [b0, b1, b2] = self.b;
        let [_, a1, a2] = self.a;
        let det = 1.0 + a1 + a2;
        let r0 = b1 - a1 * b0;
        let r1 = b2 - a2 * b0;
        let z0 = (r0 + r1) / det;
        let z1 = ((1.0 + a1) * r1 - a2 * r0) / det;
        [z0, z1]
    }

    /// Run the section over `input` from state `z` (transposed direct form II).
    pub fn filter(&self, input: &[f64], z: [f64; 2]) -> Vec<f64> {
        let [b0, b1, b2] = self.b;
        let [_, a1, a2] = self.a;
        let [mut z1, mut z2] = z;
        input
            .iter()
            .map(|&x| {
                let y = b0 * x + z1;
                z1 = b1 * x - a1 * y + z2;
                z2 = b2 * x - a2 * y;
                y
            })
            .collect()
    }

    /// Forward-backward filtering with odd-extension padding and steady-state initial
    /// conditions. Zero phase; magnitude response squared.
    pub fn filtfilt(&self, input: &[f64]) -> Vec<f64> {
        let n = input.len();
        if n < 2 {
            return input.to_vec();
        }
        let pad = (3 * self.a.len().max(self.b.len())).min(n - 1);
        let extended = odd_extend(input, pad);
        let zi = self.steady_state();

        let scaled = |x0: f64| [zi[0] * x0, zi[1] * x0];
        let mut forward = self.filter(&extended, scaled(extended[0]));
        forward.reverse();
        let mut backward = self.filter(&forward, scaled(forward[0]));
        backward.reverse();

        backward[pad..pad + n].to_vec()
    }
}

fn odd_extend(input: &[f64], pad: usize) -> Vec<f64> {
    let n = input.len();
    let first = input[0];
    let last = input[n - 1];
    let mut out = Vec::with_capacity(n + 2 * pad);
    out.extend((1..=pad).rev().map(|i| 2.0 * first - input[i]));
    out.extend_from_slice(input);
    out.extend((1..=pad).map(|i| 2.0 * last - input[n - 1 - i]));
    out
}

/// Windowed-sinc low-pass taps (Hamming window), normalized to unit gain at DC.
/// `cutoff` is relative to Nyquist.
pub fn firwin_lowpass(numtaps: usize, cutoff: f64) -> Vec<f64> {
    if numtaps == 0 {
        return Vec::new();
    }
    let alpha = (numtaps - 1) as f64 / 2.0;
    let mut taps: Vec<f64> = (0..numtaps)
        .map(|i| {
            let m = i as f64 - alpha;
            let window = if numtaps == 1 {
                1.0
            } else {
                0.54 - 0.46 * (2.0 * PI * i as f64 / (numtaps - 1) as f64).cos()
            };
            cutoff * sinc(cutoff * m) * window
        })
        .collect();
    let sum: f64 = taps.iter().sum();
    for tap in &mut taps {
        *tap /= sum;
    }
    taps
}

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// Integer-factor decimation through a zero-phase FIR anti-aliasing filter of
/// `20 * factor + 1` taps.
#[derive(Clone, Debug)]
pub struct Decimator {
    factor: usize,
    taps: Vec<f64>,
}

impl Decimator {
    pub fn new(factor: usize) -> Result<Self, Error> {
        if factor == 0 {
            return Err(Error::Validation("decimation factor must be at least 1".to_string()));
        }
        let taps = if factor == 1 {
            vec![1.0]
        } else {
            firwin_lowpass(20 * factor + 1, 1.0 / factor as f64)
        };
        Ok(Self { factor, taps })
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    pub fn taps(&self) -> &[f64] {
        &self.taps
    }

    pub fn output_len(&self, input_len: usize) -> usize {
        input_len.div_ceil(self.factor)
    }

    /// Filter and keep every `factor`-th sample, centred on the filter's group delay.
    /// Samples outside the input are treated as zero.
    pub fn apply(&self, input: &[f64]) -> Vec<f64> {
        if self.factor == 1 {
            return input.to_vec();
        }
        let n = input.len() as isize;
        let half = (self.taps.len() / 2) as isize;
        (0..self.output_len(input.len()))
            .map(|j| {
                let centre = (j * self.factor) as isize + half;
                self.taps
                    .iter()
                    .enumerate()
                    .filter_map(|(i, tap)| {
                        let idx = centre - i as isize;
                        (idx >= 0 && idx < n).then(|| tap * input[idx as usize])
                    })
                    .sum()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f64, fs: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / fs).sin())
            .collect()
    }

    fn rms(x: &[f64]) -> f64 {
        (x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64).sqrt()
    }

    #[test]
    fn test_notch_coefficients_have_unit_dc_gain() {
        let notch = iir_notch(60.0, 30_000.0, 30.0).unwrap();
        let b_sum: f64 = notch.b.iter().sum();
        let a_sum: f64 = notch.a.iter().sum();
        assert!((b_sum / a_sum - 1.0).abs() < 1e-12);
        assert_eq!(notch.b[0], notch.b[2]);
        assert!(iir_notch(0.0, 30_000.0, 30.0).is_err());
        assert!(iir_notch(15_000.0, 30_000.0, 30.0).is_err());
    }

    #[test]
    fn test_filtfilt_constant_input_is_unchanged() {
        let notch = iir_notch(60.0, 1_000.0, 30.0).unwrap();
        let out = notch.filtfilt(&vec![3.5; 500]);
        assert!(out.iter().all(|v| (v - 3.5).abs() < 1e-9));
    }

    #[test]
    fn test_filtfilt_removes_powerline_keeps_slow_signal() {
        let fs = 1_000.0;
        let n = 4_000;
        let slow = tone(5.0, fs, n);
        let hum = tone(60.0, fs, n);
        let mixed: Vec<f64> = slow.iter().zip(&hum).map(|(s, h)| s + h).collect();

        let notch = iir_notch(60.0, fs, 30.0).unwrap();
        let out = notch.filtfilt(&mixed);
        assert_eq!(out.len(), n);

        // Compare away from the edges.
        let mid = 1_000..3_000;
        let residual: Vec<f64> = out[mid.clone()]
            .iter()
            .zip(&slow[mid])
            .map(|(o, s)| o - s)
            .collect();
        assert!(rms(&residual) < 0.02, "residual rms {}", rms(&residual));
    }

    #[test]
    fn test_filtfilt_short_input() {
        let notch = iir_notch(60.0, 1_000.0, 30.0).unwrap();
        assert_eq!(notch.filtfilt(&[1.0]), vec![1.0]);
        assert_eq!(notch.filtfilt(&[1.0, 2.0, 3.0]).len(), 3);
    }

    #[test]
    fn test_firwin_is_symmetric_and_normalized() {
        let taps = firwin_lowpass(241, 1.0 / 12.0);
        assert_eq!(taps.len(), 241);
        assert!((taps.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        for i in 0..120 {
            assert!((taps[i] - taps[240 - i]).abs() < 1e-15);
        }
        assert!(taps[120] > taps[119]);
    }

    #[test]
    fn test_decimator_lengths() {
        let dec = Decimator::new(12).unwrap();
        assert_eq!(dec.taps().len(), 241);
        assert_eq!(dec.output_len(30_000), 2_500);
        assert_eq!(dec.output_len(30_001), 2_501);
        assert_eq!(dec.apply(&vec![0.0; 25]).len(), 3);
        assert!(Decimator::new(0).is_err());
        assert_eq!(Decimator::new(1).unwrap().apply(&[1.0, 2.0]), vec![1.0, 2.0]);
    }

    #[test]
    fn test_decimator_preserves_passband_and_is_aligned() {
        let fs = 10_000.0;
        let input = tone(20.0, fs, 10_000);
        let dec = Decimator::new(4).unwrap();
        let out = dec.apply(&input);
        assert_eq!(out.len(), 2_500);
        // Zero phase: out[j] tracks input[4j] away from the zero-padded edges.
        for j in 200..2_300 {
            assert!((out[j] - input[4 * j]).abs() < 1e-3, "sample {}", j);
        }
    }

    #[test]
    fn test_decimator_attenuates_above_new_nyquist() {
        let fs = 10_000.0;
        // New Nyquist is 1250 Hz.
        let input = tone(2_000.0, fs, 10_000);
        let out = Decimator::new(4).unwrap().apply(&input);
        assert!(rms(&out[200..2_300]) < 0.01);
    }
}
