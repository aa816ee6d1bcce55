use crate::config::FilterConfig;
use crate::{ControlError, Result};
use nalgebra::Complex;
use std::f64::consts::PI;

/// One second-order section, `a0` normalized to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

impl Biquad {
    fn response(&self, z_inv: Complex<f64>) -> Complex<f64> {
        let z_inv2 = z_inv * z_inv;
        let num = Complex::new(self.b[0], 0.0) + z_inv * self.b[1] + z_inv2 * self.b[2];
        let den = Complex::new(self.a[0], 0.0) + z_inv * self.a[1] + z_inv2 * self.a[2];
        num / den
    }
}

/// Digital Butterworth low-pass as a cascade of second-order sections.
///
/// Designed once from the analog prototype by the bilinear transform with the
/// cutoff pre-warped, so the -3 dB point lands exactly on `cutoff_hz`. Each
/// section is scaled to unity DC gain.
#[derive(Debug, Clone, PartialEq)]
pub struct Butterworth {
    sections: Vec<Biquad>,
    sample_rate_hz: f64,
}

impl Butterworth {
    pub fn from_config(config: &FilterConfig) -> Result<Butterworth> {
        Self::lowpass(config.order, config.cutoff_hz, config.sample_rate_hz)
    }

    pub fn lowpass(order: usize, cutoff_hz: f64, sample_rate_hz: f64) -> Result<Butterworth> {
        if order == 0 {
            return Err(ControlError::Config("filter order must be at least 1".into()));
        }
        if !(sample_rate_hz.is_finite() && sample_rate_hz > 0.0) {
            return Err(ControlError::Config(format!(
                "invalid filter sample rate {}",
                sample_rate_hz
            )));
        }
        if !(cutoff_hz > 0.0 && cutoff_hz < sample_rate_hz / 2.0) {
            return Err(ControlError::Config(format!(
                "filter cutoff {} Hz outside (0, {}) Hz",
                cutoff_hz,
                sample_rate_hz / 2.0
            )));
        }

        let fs2 = 2.0 * sample_rate_hz;
        let wc = fs2 * (PI * cutoff_hz / sample_rate_hz).tan();
        let n = order as f64;
        let two_fs = Complex::new(fs2, 0.0);
        let bilinear = |s: Complex<f64>| (two_fs + s) / (two_fs - s);

        let mut sections = Vec::with_capacity(order.div_ceil(2));
        // Left-half-plane prototype poles; each upper pole pairs with its conjugate.
        for k in 0..order / 2 {
            let theta = PI * (2.0 * k as f64 + n + 1.0) / (2.0 * n);
            let z = bilinear(Complex::from_polar(wc, theta));
            let a = [1.0, -2.0 * z.re, z.norm_sqr()];
            let g = (a[0] + a[1] + a[2]) / 4.0;
            sections.push(Biquad {
                b: [g, 2.0 * g, g],
                a,
            });
        }
        if order % 2 == 1 {
            let z = bilinear(Complex::new(-wc, 0.0)).re;
            let g = (1.0 - z) / 2.0;
            sections.push(Biquad {
                b: [g, g, 0.0],
                a: [1.0, -z, 0.0],
            });
        }

        Ok(Butterworth {
            sections,
            sample_rate_hz,
        })
    }

    pub fn sections(&self) -> &[Biquad] {
        &self.sections
    }

    pub fn order(&self) -> usize {
        self.sections
            .iter()
            .map(|s| if s.a[2] == 0.0 { 1 } else { 2 })
            .sum()
    }

    /// Run the filter over `input` from a zero state and return the final
    /// output sample, or `None` for an empty input.
    pub fn last_output<I>(&self, input: I) -> Option<f64>
    where
        I: IntoIterator<Item = f64>,
    {
        let mut state = vec![[0.0f64; 2]; self.sections.len()];
        let mut last = None;
        for x in input {
            let mut v = x;
            for (sec, s) in self.sections.iter().zip(state.iter_mut()) {
                // Direct form II transposed.
                let y = sec.b[0] * v + s[0];
                s[0] = sec.b[1] * v - sec.a[1] * y + s[1];
                s[1] = sec.b[2] * v - sec.a[2] * y;
                v = y;
            }
            last = Some(v);
        }
        last
    }

    /// Magnitude response at `freq_hz`.
    pub fn gain_at(&self, freq_hz: f64) -> f64 {
        let omega = 2.0 * PI * freq_hz / self.sample_rate_hz;
        let z_inv = Complex::from_polar(1.0, -omega);
        self.sections
            .iter()
            .fold(Complex::new(1.0, 0.0), |acc, s| acc * s.response(z_inv))
            .norm()
    }
}
