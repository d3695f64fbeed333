//! Streaming IIR filters in second-order-section form.
//!
//! Coefficients are designed once at construction (Butterworth high/low-pass
//! via the bilinear transform, or a second-order notch) and never change.
//! Each filter keeps a direct-form II transposed state vector of two values
//! per section, carried across calls so that consecutive frames of one
//! transmission filter as one continuous signal.

use crate::error::{RelayError, Result};
use std::f64::consts::PI;

/// Response type of a [`StreamingFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Highpass,
    Lowpass,
    Notch,
}

/// One biquad: `b` numerator, `a` denominator with `a[0] == 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Section {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

impl Section {
    /// Complex response of this section at normalized angular frequency `w`.
    fn response(&self, w: f64) -> (f64, f64) {
        let eval = |c: &[f64; 3]| {
            let re = c[0] + c[1] * w.cos() + c[2] * (2.0 * w).cos();
            let im = -c[1] * w.sin() - c[2] * (2.0 * w).sin();
            (re, im)
        };
        let (nr, ni) = eval(&self.b);
        let (dr, di) = eval(&self.a);
        let den = dr * dr + di * di;
        ((nr * dr + ni * di) / den, (ni * dr - nr * di) / den)
    }
}

/// A cascade of biquad sections with persistent state.
#[derive(Debug, Clone)]
pub struct StreamingFilter {
    kind: FilterKind,
    sections: Vec<Section>,
    state: Vec<f64>,
}

impl StreamingFilter {
    /// Butterworth highpass of the given order.
    pub fn highpass(sample_rate: u32, order: usize, cutoff_hz: f64) -> Result<Self> {
        let sections = butterworth(FilterKind::Highpass, sample_rate, order, cutoff_hz)?;
        Ok(Self::from_sections(FilterKind::Highpass, sections))
    }

    /// Butterworth lowpass of the given order.
    pub fn lowpass(sample_rate: u32, order: usize, cutoff_hz: f64) -> Result<Self> {
        let sections = butterworth(FilterKind::Lowpass, sample_rate, order, cutoff_hz)?;
        Ok(Self::from_sections(FilterKind::Lowpass, sections))
    }

    /// Second-order notch at `center_hz` with quality factor `q`.
    pub fn notch(sample_rate: u32, center_hz: f64, q: f64) -> Result<Self> {
        check_frequency(sample_rate, center_hz)?;
        if !(q.is_finite() && q > 0.0) {
            return Err(RelayError::FilterDesign {
                message: format!("notch Q must be positive, got {}", q),
            });
        }

        let w0 = 2.0 * PI * center_hz / sample_rate as f64;
        let beta = (w0 / q / 2.0).tan();
        let gain = 1.0 / (1.0 + beta);
        let section = Section {
            b: [gain, -2.0 * gain * w0.cos(), gain],
            a: [1.0, -2.0 * gain * w0.cos(), 2.0 * gain - 1.0],
        };
        Ok(Self::from_sections(FilterKind::Notch, vec![section]))
    }

    fn from_sections(kind: FilterKind, sections: Vec<Section>) -> Self {
        let state = vec![0.0; sections.len() * 2];
        Self {
            kind,
            sections,
            state,
        }
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Current state vector, two values per section.
    pub fn state(&self) -> &[f64] {
        &self.state
    }

    /// Filters `samples` in place, advancing the internal state.
    pub fn filter_in_place(&mut self, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            let mut x = *sample as f64;
            for (section, z) in self.sections.iter().zip(self.state.chunks_exact_mut(2)) {
                let y = section.b[0] * x + z[0];
                z[0] = section.b[1] * x - section.a[1] * y + z[1];
                z[1] = section.b[2] * x - section.a[2] * y;
                x = y;
            }
            *sample = x as f32;
        }
    }

    /// Filters `samples` into a new buffer of the same length.
    pub fn filter(&mut self, samples: &[f32]) -> Vec<f32> {
        let mut out = samples.to_vec();
        self.filter_in_place(&mut out);
        out
    }

    /// Returns the state to its zero-input steady state.
    pub fn reset(&mut self) {
        self.state.iter_mut().for_each(|z| *z = 0.0);
    }

    /// Magnitude response at `freq_hz`.
    pub fn magnitude_at(&self, sample_rate: u32, freq_hz: f64) -> f64 {
        let w = 2.0 * PI * freq_hz / sample_rate as f64;
        let (re, im) = self
            .sections
            .iter()
            .map(|s| s.response(w))
            .fold((1.0, 0.0), |(ar, ai), (br, bi)| {
                (ar * br - ai * bi, ar * bi + ai * br)
            });
        (re * re + im * im).sqrt()
    }
}

fn check_frequency(sample_rate: u32, freq_hz: f64) -> Result<()> {
    if sample_rate == 0 {
        return Err(RelayError::FilterDesign {
            message: "sample rate must be positive".to_string(),
        });
    }
    let nyquist = sample_rate as f64 / 2.0;
    if !(freq_hz.is_finite() && freq_hz > 0.0 && freq_hz < nyquist) {
        return Err(RelayError::FilterDesign {
            message: format!(
                "frequency {} Hz must be between 0 and Nyquist {} Hz",
                freq_hz, nyquist
            ),
        });
    }
    Ok(())
}

/// Bilinear transform of an analog pole `re + j im`.
fn bilinear(re: f64, im: f64, fs2: f64) -> (f64, f64) {
    let den = (fs2 - re) * (fs2 - re) + im * im;
    ((fs2 * fs2 - re * re - im * im) / den, 2.0 * fs2 * im / den)
}

/// Designs a Butterworth high/low-pass as second-order sections.
///
/// Sections are normalized individually to unity gain at DC (lowpass) or
/// Nyquist (highpass) and ordered with the poles nearest the unit circle last.
fn butterworth(
    kind: FilterKind,
    sample_rate: u32,
    order: usize,
    cutoff_hz: f64,
) -> Result<Vec<Section>> {
    check_frequency(sample_rate, cutoff_hz)?;
    if order == 0 {
        return Err(RelayError::FilterDesign {
            message: "filter order must be at least 1".to_string(),
        });
    }

    let fs = sample_rate as f64;
    let fs2 = 2.0 * fs;
    let warped = fs2 * (PI * cutoff_hz / fs).tan();
    let n = order as f64;

    let mut sections: Vec<(f64, Section)> = Vec::with_capacity(order.div_ceil(2));

    for k in 0..order / 2 {
        // Upper-half-plane prototype pole; its conjugate shares the section.
        let theta = PI * (2.0 * k as f64 + n + 1.0) / (2.0 * n);
        let (pr, pi) = (theta.cos(), theta.sin());
        let (sr, si) = match kind {
            FilterKind::Lowpass => (warped * pr, warped * pi),
            // |p| == 1, so warped / p == warped * conj(p)
            _ => (warped * pr, -warped * pi),
        };
        let (zr, zi) = bilinear(sr, si, fs2);
        let a = [1.0, -2.0 * zr, zr * zr + zi * zi];
        let b = match kind {
            FilterKind::Lowpass => {
                let g = (a[0] + a[1] + a[2]) / 4.0;
                [g, 2.0 * g, g]
            }
            _ => {
                let g = (a[0] - a[1] + a[2]) / 4.0;
                [g, -2.0 * g, g]
            }
        };
        sections.push(((zr * zr + zi * zi).sqrt(), Section { b, a }));
    }

    if order % 2 == 1 {
        // Real prototype pole at s = -1 maps to -warped for both kinds.
        let (z, _) = bilinear(-warped, 0.0, fs2);
        let a = [1.0, -z, 0.0];
        let b = match kind {
            FilterKind::Lowpass => {
                let g = (1.0 - z) / 2.0;
                [g, g, 0.0]
            }
            _ => {
                let g = (1.0 + z) / 2.0;
                [g, -g, 0.0]
            }
        };
        sections.push((z.abs(), Section { b, a }));
    }

    sections.sort_by(|x, y| x.0.partial_cmp(&y.0).unwrap_or(std::cmp::Ordering::Equal));
    Ok(sections.into_iter().map(|(_, s)| s).collect())
}
