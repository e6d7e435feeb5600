#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]

use std::f64::consts::PI;
use std::fmt;

/// Which port arrangement a trace was taken through. The fitted model
/// differs between the two, so the fitting service needs to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineShape {
    Transmission,
    Reflection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitError(pub String);

impl fmt::Display for FitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fit failed [{}]", self.0)
    }
}

/// One fitted resonance: curve parameters and their covariance, in the
/// order the fitting service reports them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitOutcome {
    pub params: [f64; 4],
    pub covariance: [[f64; 4]; 4],
}

impl FitOutcome {
    /// One-sigma parameter uncertainties from the covariance diagonal.
    #[must_use]
    pub fn errors(&self) -> [f64; 4] {
        let mut out = [0.0; 4];
        for (i, err) in out.iter_mut().enumerate() {
            *err = self.covariance[i][i].sqrt();
        }
        out
    }

    /// The fitted resonant frequency.
    #[inline]
    #[must_use]
    pub fn center_freq(&self) -> f64 {
        self.params[0]
    }

    /// The fitted loaded quality factor.
    #[inline]
    #[must_use]
    pub fn quality_factor(&self) -> f64 {
        self.params[3]
    }
}

/// Interface to the curve-fitting service applied to resonance traces.
/// Whatever the backing implementation, `params[0]` is the center frequency
/// and `params[3]` the loaded Q for both line shapes.
pub trait SpectrumFitter {
    /// Fits a Lorentzian of the given shape to a power trace.
    ///
    /// # Errors
    /// Whatever the fitting service reports when it fails to converge.
    fn lorentzian_fit(
        &self,
        power: &[f64],
        freq: &[f64],
        shape: LineShape,
    ) -> Result<FitOutcome, FitError>;

    /// Evaluates the fitted power model at one frequency.
    fn model_power(&self, freq: f64, params: &[f64; 4], shape: LineShape) -> f64;

    /// Removes the feedline contribution from a reflection trace, returning
    /// the resonator's own reflection magnitude and phase.
    fn deconvolve_line(
        &self,
        freq: &[f64],
        magnitude: &[f64],
        phase: &[f64],
        quality_factor: f64,
    ) -> (Vec<f64>, Vec<f64>);

    /// Antenna coupling from the resonator reflection coefficient at
    /// resonance.
    fn coupling(&self, mag_at_f0: f64, phase_at_f0: f64) -> f64;
}

/// Power of each I/Q pair in an interleaved trace.
#[must_use]
pub fn iq_power(iq: &[f64]) -> Vec<f64> {
    iq.chunks_exact(2)
        .map(|pair| pair[0] * pair[0] + pair[1] * pair[1])
        .collect()
}

/// Magnitude of each I/Q pair in an interleaved trace.
#[must_use]
pub fn iq_magnitude(iq: &[f64]) -> Vec<f64> {
    iq.chunks_exact(2).map(|pair| pair[0].hypot(pair[1])).collect()
}

/// Phase of each I/Q pair, unwrapped so successive points never jump by
/// more than pi.
#[must_use]
pub fn iq_phase_unwrapped(iq: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(iq.len() / 2);
    let mut offset = 0.0;
    let mut prev = 0.0;
    for pair in iq.chunks_exact(2) {
        let raw = pair[1].atan2(pair[0]);
        if !out.is_empty() {
            let jump = raw - prev;
            if jump > PI {
                offset -= 2.0 * PI;
            } else if jump < -PI {
                offset += 2.0 * PI;
            }
        }
        prev = raw;
        out.push(raw + offset);
    }
    out
}

/// `count` evenly spaced values from `start` to `stop` inclusive.
#[must_use]
pub fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        n => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Linear interpolation of `y` at `x0`. `x` must be sorted ascending and the
/// two slices must share a nonzero length; out-of-range queries clamp to the
/// end values.
#[must_use]
pub fn interp_at(x: &[f64], y: &[f64], x0: f64) -> f64 {
    match x.iter().position(|&xi| xi >= x0) {
        None => y[y.len() - 1],
        Some(0) => y[0],
        Some(i) => {
            let frac = (x0 - x[i - 1]) / (x[i] - x[i - 1]);
            y[i - 1] + frac * (y[i] - y[i - 1])
        }
    }
}
