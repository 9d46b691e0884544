//! pi/4-DQPSK demodulation for TETRA.
//!
//! Per-sample pipeline: root-raised-cosine matched filter, Costas
//! carrier-recovery loop, Gardner symbol-timing loop, quadrant demap,
//! differential decode. The information rides on the phase difference
//! between consecutive symbols, so a static carrier offset cancels out.

use num::complex::Complex32;

use crate::filter::{ComplexFirFilter, Ewma, rrc_taps};

const RRC_ROLLOFF: f32 = 0.35;
const RRC_SPAN: usize = 8;
const LOOP_DAMPING: f32 = 0.707;
const CARRIER_BW: f32 = 0.01;
const TIMING_BW: f32 = 0.01;
const BATCH_SYMBOLS: usize = 100;

/// Differential quarter-turn to dibit value. Index is
/// `(sym - prev) mod 4`; the entry packs bit0 high, bit1 low.
const DIFF_TO_DIBIT: [u8; 4] = [0b00, 0b01, 0b11, 0b10];

#[derive(Clone, Debug)]
pub struct DqpskDemod {
    symbol_rate: u32,
    sample_rate: u32,
    samples_per_symbol: u32,

    matched: Option<ComplexFirFilter>,

    // Costas loop.
    carrier_phase: f32,
    carrier_freq: f32,
    carrier_alpha: f32,
    carrier_beta: f32,

    // Gardner loop strobing at half-symbol spacing.
    timing_phase: f32,
    timing_freq: f32,
    timing_alpha: f32,
    timing_beta: f32,
    strobes: [Complex32; 3],
    strobe_parity: bool,

    prev_quadrant: u8,
    alternate: bool,
    mag_avg: Ewma,
    evm: Ewma,

    batch: Vec<f32>,
}

impl DqpskDemod {
    pub fn new(symbol_rate: u32) -> Self {
        DqpskDemod {
            symbol_rate,
            sample_rate: 0,
            samples_per_symbol: 0,
            matched: None,
            carrier_phase: 0.0,
            carrier_freq: 0.0,
            carrier_alpha: 0.0,
            carrier_beta: 0.0,
            timing_phase: 0.0,
            timing_freq: 0.0,
            timing_alpha: 0.0,
            timing_beta: 0.0,
            strobes: [Complex32::new(0.0, 0.0); 3],
            strobe_parity: false,
            prev_quadrant: 0,
            alternate: false,
            mag_avg: Ewma::new(0.01, 1.0),
            evm: Ewma::new(0.1, 0.0),
            batch: Vec::with_capacity(BATCH_SYMBOLS),
        }
    }

    pub fn init(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
        self.samples_per_symbol = sample_rate / self.symbol_rate;

        self.matched = Some(ComplexFirFilter::new(rrc_taps(
            self.samples_per_symbol as usize,
            RRC_SPAN,
            RRC_ROLLOFF,
        )));

        let denom = 1.0 + 2.0 * LOOP_DAMPING * CARRIER_BW + CARRIER_BW * CARRIER_BW;
        self.carrier_alpha = 4.0 * LOOP_DAMPING * CARRIER_BW / denom;
        self.carrier_beta = 4.0 * CARRIER_BW * CARRIER_BW / denom;

        let denom = 1.0 + 2.0 * LOOP_DAMPING * TIMING_BW + TIMING_BW * TIMING_BW;
        self.timing_alpha = 4.0 * LOOP_DAMPING * TIMING_BW / denom;
        self.timing_beta = 4.0 * TIMING_BW * TIMING_BW / denom;

        debug!(
            "dqpsk init: sample_rate={} symbol_rate={} sps={}",
            sample_rate, self.symbol_rate, self.samples_per_symbol
        );

        self.reset();
    }

    pub fn reset(&mut self) {
        self.carrier_phase = 0.0;
        self.carrier_freq = 0.0;
        self.timing_phase = 0.0;
        // Two strobes per symbol.
        self.timing_freq = 2.0 / self.samples_per_symbol.max(1) as f32;
        self.strobes = [Complex32::new(0.0, 0.0); 3];
        self.strobe_parity = false;
        self.prev_quadrant = 0;
        self.alternate = false;
        self.mag_avg.reset(1.0);
        self.evm.reset(0.0);
        self.batch.clear();

        if let Some(f) = self.matched.as_mut() {
            f.reset();
        }
    }

    /// Residual error-vector magnitude, the exported quality metric.
    pub fn evm(&self) -> f32 {
        self.evm.get()
    }

    pub fn process(&mut self, samples: &[Complex32], sink: &mut dyn FnMut(&[f32])) {
        debug_assert!(self.samples_per_symbol > 0, "init before process");

        for &s in samples {
            let filtered = self.matched.as_mut().unwrap().feed(s);
            let corrected = self.carrier_track(filtered);
            self.timing_track(corrected, sink);
        }
    }

    /// Flush any partial batch to the sink.
    pub fn flush(&mut self, sink: &mut dyn FnMut(&[f32])) {
        if !self.batch.is_empty() {
            sink(&self.batch);
            self.batch.clear();
        }
    }

    fn carrier_track(&mut self, sample: Complex32) -> Complex32 {
        let nco = Complex32::new(self.carrier_phase.cos(), self.carrier_phase.sin());
        let rotated = sample * nco.conj();

        let error = phase_error(rotated);

        self.carrier_freq += self.carrier_beta * error;
        self.carrier_phase += self.carrier_freq + self.carrier_alpha * error;

        let two_pi = 2.0 * std::f32::consts::PI;
        while self.carrier_phase > two_pi {
            self.carrier_phase -= two_pi;
        }
        while self.carrier_phase < -two_pi {
            self.carrier_phase += two_pi;
        }

        rotated
    }

    fn timing_track(&mut self, sample: Complex32, sink: &mut dyn FnMut(&[f32])) {
        self.timing_phase += self.timing_freq;
        if self.timing_phase < 1.0 {
            return;
        }
        self.timing_phase -= 1.0;

        self.strobes.rotate_left(1);
        self.strobes[2] = sample;
        self.strobe_parity = !self.strobe_parity;

        if !self.strobe_parity {
            return;
        }

        // strobes = [previous symbol, half-symbol midpoint, this symbol]
        let error = gardner_error(self.strobes[0], self.strobes[1], self.strobes[2]);

        self.timing_freq += self.timing_beta * error;
        let nominal = 2.0 / self.samples_per_symbol as f32;
        self.timing_freq = self.timing_freq.max(0.9 * nominal).min(1.1 * nominal);
        self.timing_phase += self.timing_alpha * error;

        if let Some(quadrant) = self.demap(self.strobes[2]) {
            let diff = (quadrant + 4 - self.prev_quadrant) % 4;
            self.prev_quadrant = quadrant;
            self.alternate = !self.alternate;

            self.emit(DIFF_TO_DIBIT[diff as usize], sink);
        }
    }

    fn demap(&mut self, sample: Complex32) -> Option<u8> {
        let mag = sample.norm();
        if mag < 1.0e-6 {
            return None;
        }

        // Deviation from the average constellation radius, as a
        // fraction of that radius.
        let avg = self.mag_avg.feed(mag);
        self.evm.feed(((mag - avg) / avg.max(1.0e-6)).abs());

        let phase = sample.arg();
        let pi = std::f32::consts::PI;

        let quadrant = if phase >= -pi / 4.0 && phase < pi / 4.0 {
            0
        } else if phase >= pi / 4.0 && phase < 3.0 * pi / 4.0 {
            1
        } else if phase >= -3.0 * pi / 4.0 && phase < -pi / 4.0 {
            3
        } else {
            2
        };

        Some(quadrant)
    }

    fn emit(&mut self, dibit: u8, sink: &mut dyn FnMut(&[f32])) {
        self.batch.push(dibit as f32);
        if self.batch.len() >= BATCH_SYMBOLS {
            sink(&self.batch);
            self.batch.clear();
        }
    }
}

/// Four-quadrant phase error detector for QPSK.
///
/// `I*Q*(I^2 - Q^2)` is zero at every multiple of 45 degrees but only
/// the on-axis nulls are stable under the loop update, which keeps the
/// lock points centered in the demap quadrants. Normalizing by the
/// fourth power of the magnitude bounds the loop gain.
fn phase_error(sample: Complex32) -> f32 {
    let i = sample.re;
    let q = sample.im;

    let mag2 = i * i + q * q;
    if mag2 < 1.0e-9 {
        return 0.0;
    }

    i * q * (i * i - q * q) / (mag2 * mag2)
}

/// Gardner timing error: `re((late - early) * conj(prompt))` with the
/// prompt sample at the half-symbol midpoint.
fn gardner_error(early: Complex32, prompt: Complex32, late: Complex32) -> f32 {
    ((late - early) * prompt.conj()).re
}
