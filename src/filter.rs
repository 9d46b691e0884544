//! FIR/IIR filter primitives and tap design.

use num::complex::Complex32;
use num::traits::Zero;

/// Direct-form FIR filter over real samples.
#[derive(Clone, Debug)]
pub struct FirFilter {
    taps: Vec<f32>,
    history: Vec<f32>,
    pos: usize,
}

impl FirFilter {
    pub fn new(taps: Vec<f32>) -> Self {
        let len = taps.len();
        assert!(len > 0);

        FirFilter {
            taps,
            history: vec![0.0; len],
            pos: 0,
        }
    }

    pub fn feed(&mut self, input: f32) -> f32 {
        self.history[self.pos] = input;

        let mut acc = 0.0;
        let mut idx = self.pos;

        for &tap in &self.taps {
            acc += tap * self.history[idx];
            idx = if idx == 0 { self.history.len() - 1 } else { idx - 1 };
        }

        self.pos = (self.pos + 1) % self.history.len();
        acc
    }

    pub fn reset(&mut self) {
        for h in &mut self.history {
            *h = 0.0;
        }
        self.pos = 0;
    }

    pub fn ntaps(&self) -> usize {
        self.taps.len()
    }
}

/// FIR filter over complex samples sharing one set of real taps.
#[derive(Clone, Debug)]
pub struct ComplexFirFilter {
    taps: Vec<f32>,
    history: Vec<Complex32>,
    pos: usize,
}

impl ComplexFirFilter {
    pub fn new(taps: Vec<f32>) -> Self {
        let len = taps.len();
        assert!(len > 0);

        ComplexFirFilter {
            taps,
            history: vec![Complex32::zero(); len],
            pos: 0,
        }
    }

    pub fn feed(&mut self, input: Complex32) -> Complex32 {
        self.history[self.pos] = input;

        let mut acc = Complex32::zero();
        let mut idx = self.pos;

        for &tap in &self.taps {
            acc += self.history[idx] * tap;
            idx = if idx == 0 { self.history.len() - 1 } else { idx - 1 };
        }

        self.pos = (self.pos + 1) % self.history.len();
        acc
    }

    pub fn reset(&mut self) {
        for h in &mut self.history {
            *h = Complex32::zero();
        }
        self.pos = 0;
    }
}

/// Windowed-sinc lowpass taps with a Hamming window, normalized to unit
/// DC gain.
pub fn lowpass_taps(sample_rate: u32, cutoff: f32, ntaps: usize) -> Vec<f32> {
    assert!(ntaps % 2 == 1, "lowpass taps must be symmetric around a center");

    let fc = cutoff / sample_rate as f32;
    let m = (ntaps - 1) as f32;
    let mut taps = Vec::with_capacity(ntaps);

    for i in 0..ntaps {
        let n = i as f32 - m / 2.0;

        let sinc = if n == 0.0 {
            2.0 * fc
        } else {
            (2.0 * std::f32::consts::PI * fc * n).sin() / (std::f32::consts::PI * n)
        };

        let window = 0.54 - 0.46 * (2.0 * std::f32::consts::PI * i as f32 / m).cos();

        taps.push(sinc * window);
    }

    let sum: f32 = taps.iter().sum();
    for t in &mut taps {
        *t /= sum;
    }

    taps
}

/// Root-raised-cosine taps spanning `span` symbols at `samples_per_symbol`
/// samples each, normalized to unit energy.
pub fn rrc_taps(samples_per_symbol: usize, span: usize, rolloff: f32) -> Vec<f32> {
    let ntaps = span * samples_per_symbol + 1;
    let center = (ntaps / 2) as isize;
    let mut taps = Vec::with_capacity(ntaps);

    let pi = std::f32::consts::PI;

    for i in 0..ntaps {
        // Time in symbol periods.
        let t = (i as isize - center) as f32 / samples_per_symbol as f32;

        let tap = if t == 0.0 {
            1.0 + rolloff * (4.0 / pi - 1.0)
        } else if (t.abs() - 1.0 / (4.0 * rolloff)).abs() < 1.0e-6 {
            (rolloff / 2.0f32.sqrt())
                * ((1.0 + 2.0 / pi) * (pi / (4.0 * rolloff)).sin()
                    + (1.0 - 2.0 / pi) * (pi / (4.0 * rolloff)).cos())
        } else {
            let num = (pi * t * (1.0 - rolloff)).sin()
                + 4.0 * rolloff * t * (pi * t * (1.0 + rolloff)).cos();
            let den = pi * t * (1.0 - (4.0 * rolloff * t).powi(2));
            num / den
        };

        taps.push(tap);
    }

    let energy: f32 = taps.iter().map(|t| t * t).sum();
    let norm = energy.sqrt();
    for t in &mut taps {
        *t /= norm;
    }

    taps
}

/// Exponentially-weighted moving average.
#[derive(Copy, Clone, Debug)]
pub struct Ewma {
    alpha: f32,
    value: f32,
}

impl Ewma {
    pub fn new(alpha: f32, initial: f32) -> Self {
        Ewma { alpha, value: initial }
    }

    pub fn feed(&mut self, input: f32) -> f32 {
        self.value = (1.0 - self.alpha) * self.value + self.alpha * input;
        self.value
    }

    pub fn get(&self) -> f32 {
        self.value
    }

    pub fn reset(&mut self, value: f32) {
        self.value = value;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_lowpass_symmetry() {
        let taps = lowpass_taps(48000, 6000.0, 51);
        assert_eq!(taps.len(), 51);

        // Linear phase requires symmetric taps.
        for i in 0..25 {
            assert_approx_eq!(taps[i], taps[50 - i], 1.0e-6);
        }

        // Unit DC gain.
        let sum: f32 = taps.iter().sum();
        assert_approx_eq!(sum, 1.0, 1.0e-5);
    }

    #[test]
    fn test_lowpass_dc_passthrough() {
        let mut f = FirFilter::new(lowpass_taps(48000, 6000.0, 51));

        let mut last = 0.0;
        for _ in 0..200 {
            last = f.feed(1.0);
        }

        assert_approx_eq!(last, 1.0, 1.0e-4);
    }

    #[test]
    fn test_lowpass_rejects_high_freq() {
        let mut f = FirFilter::new(lowpass_taps(48000, 1000.0, 51));

        // Alternating signal at Nyquist should be strongly attenuated
        // once the history is primed.
        let mut peak: f32 = 0.0;
        for i in 0..400 {
            let s = if i % 2 == 0 { 1.0 } else { -1.0 };
            let out = f.feed(s);
            if i > 100 {
                peak = peak.max(out.abs());
            }
        }

        assert!(peak < 0.01, "nyquist leakage {}", peak);
    }

    #[test]
    fn test_rrc_unit_energy() {
        let taps = rrc_taps(10, 8, 0.35);
        assert_eq!(taps.len(), 81);

        let energy: f32 = taps.iter().map(|t| t * t).sum();
        assert_approx_eq!(energy, 1.0, 1.0e-5);

        // Symmetric impulse response.
        for i in 0..40 {
            assert_approx_eq!(taps[i], taps[80 - i], 1.0e-5);
        }

        // Peak at center.
        let peak = taps.iter().cloned().fold(f32::MIN, f32::max);
        assert_approx_eq!(peak, taps[40], 1.0e-6);
    }

    #[test]
    fn test_complex_fir_impulse() {
        let mut f = ComplexFirFilter::new(vec![0.5, 0.25, 0.25]);

        let out = f.feed(Complex32::new(1.0, -1.0));
        assert_approx_eq!(out.re, 0.5);
        assert_approx_eq!(out.im, -0.5);

        let out = f.feed(Complex32::zero());
        assert_approx_eq!(out.re, 0.25);

        let out = f.feed(Complex32::zero());
        assert_approx_eq!(out.re, 0.25);

        let out = f.feed(Complex32::zero());
        assert_approx_eq!(out.re, 0.0);
    }

    #[test]
    fn test_ewma_converges() {
        let mut e = Ewma::new(0.1, 0.0);
        for _ in 0..200 {
            e.feed(3.0);
        }
        assert_approx_eq!(e.get(), 3.0, 1.0e-3);

        e.reset(0.0);
        assert_approx_eq!(e.get(), 0.0);
    }
}
