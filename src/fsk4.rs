//! 4-level FSK demodulation for C4FM (P25) and DMR.
//!
//! Per-sample pipeline: baseband lowpass, FM discriminator, symbol
//! shaping lowpass, integrate-and-dump at the symbol rate, 4-level
//! slice. The slicer tracks an EWMA of the observed value for each
//! decided class and places decision thresholds at the midpoints of
//! adjacent class means, so DMR's slightly different deviation settles
//! in without reconfiguration. A Mueller-and-Muller correction nudges
//! the symbol clock by the sign of `(s[k+1] - s[k-1]) * s[k]`.

use num::complex::Complex32;

use crate::filter::{Ewma, ComplexFirFilter, FirFilter, lowpass_taps};

/// EWMA adaptation rate for the per-class means.
const CLASS_ALPHA: f32 = 0.01;
/// Symbols emitted to the sink per batch.
const BATCH_SYMBOLS: usize = 100;

#[derive(Clone, Debug)]
pub struct Fsk4Demod {
    symbol_rate: u32,
    /// Nominal outermost deviation (Hz): 1800 for C4FM, 1944 for DMR.
    deviation: f32,
    sample_rate: u32,
    samples_per_symbol: u32,

    baseband: Option<ComplexFirFilter>,
    shaping: Option<FirFilter>,
    prev: Complex32,

    sample_counter: u32,
    accum: f32,
    accum_count: u32,

    // Mueller-and-Muller state over the last three dump values.
    history: [f32; 3],
    history_len: usize,
    timing_error: f32,
    mu: f32,

    class_means: [Ewma; 4],
    thresholds: [f32; 3],

    batch: Vec<f32>,
}

impl Fsk4Demod {
    pub fn new(symbol_rate: u32, deviation: f32) -> Self {
        let means = [
            Ewma::new(CLASS_ALPHA, -deviation),
            Ewma::new(CLASS_ALPHA, -deviation / 3.0),
            Ewma::new(CLASS_ALPHA, deviation / 3.0),
            Ewma::new(CLASS_ALPHA, deviation),
        ];

        let mut demod = Fsk4Demod {
            symbol_rate,
            deviation,
            sample_rate: 0,
            samples_per_symbol: 0,
            baseband: None,
            shaping: None,
            prev: Complex32::new(1.0, 0.0),
            sample_counter: 0,
            accum: 0.0,
            accum_count: 0,
            history: [0.0; 3],
            history_len: 0,
            timing_error: 0.0,
            mu: 0.0,
            class_means: means,
            thresholds: [0.0; 3],
            batch: Vec::with_capacity(BATCH_SYMBOLS),
        };
        demod.update_thresholds();
        demod
    }

    pub fn init(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
        self.samples_per_symbol = sample_rate / self.symbol_rate;

        self.baseband = Some(ComplexFirFilter::new(lowpass_taps(sample_rate, 6000.0, 51)));
        self.shaping = Some(FirFilter::new(lowpass_taps(
            sample_rate,
            self.symbol_rate as f32 * 0.6,
            31,
        )));

        debug!(
            "fsk4 init: sample_rate={} symbol_rate={} sps={}",
            sample_rate, self.symbol_rate, self.samples_per_symbol
        );

        self.reset();
    }

    pub fn reset(&mut self) {
        self.prev = Complex32::new(1.0, 0.0);
        self.sample_counter = 0;
        self.accum = 0.0;
        self.accum_count = 0;
        self.history = [0.0; 3];
        self.history_len = 0;
        self.timing_error = 0.0;
        self.mu = 0.0;
        self.batch.clear();

        for (i, mean) in self.class_means.iter_mut().enumerate() {
            let nominal = self.deviation * ((i as f32) * 2.0 / 3.0 - 1.0);
            mean.reset(nominal);
        }
        self.update_thresholds();

        if let Some(f) = self.baseband.as_mut() {
            f.reset();
        }
        if let Some(f) = self.shaping.as_mut() {
            f.reset();
        }
    }

    /// Separation of the outermost class means, normalized per level.
    /// This is the demodulator's exported quality metric.
    pub fn eye_opening(&self) -> f32 {
        (self.class_means[3].get() - self.class_means[0].get()) / 3.0
    }

    pub fn process(&mut self, samples: &[Complex32], sink: &mut dyn FnMut(&[f32])) {
        debug_assert!(self.samples_per_symbol > 0, "init before process");

        for &s in samples {
            let filtered = self.baseband.as_mut().unwrap().feed(s);

            // FM discriminator: instantaneous frequency from the phase
            // of the one-sample conjugate product.
            let freq = (filtered * self.prev.conj()).arg() * self.sample_rate as f32
                / (2.0 * std::f32::consts::PI);
            self.prev = filtered;

            let shaped = self.shaping.as_mut().unwrap().feed(freq);

            self.accum += shaped;
            self.accum_count += 1;
            self.sample_counter += 1;

            if self.sample_counter >= self.samples_per_symbol {
                self.sample_counter = 0;

                let value = self.accum / self.accum_count.max(1) as f32;
                self.accum = 0.0;
                self.accum_count = 0;

                self.decide(value, sink);
            }
        }
    }

    /// Flush any partial batch to the sink.
    pub fn flush(&mut self, sink: &mut dyn FnMut(&[f32])) {
        if !self.batch.is_empty() {
            sink(&self.batch);
            self.batch.clear();
        }
    }

    fn decide(&mut self, value: f32, sink: &mut dyn FnMut(&[f32])) {
        let symbol = self.slice(value);

        self.class_means[symbol as usize].feed(value);
        self.update_thresholds();
        self.timing_update(value);

        self.batch.push(symbol as f32);
        if self.batch.len() >= BATCH_SYMBOLS {
            sink(&self.batch);
            self.batch.clear();
        }
    }

    fn slice(&self, value: f32) -> u8 {
        if value < self.thresholds[0] {
            0
        } else if value < self.thresholds[1] {
            1
        } else if value < self.thresholds[2] {
            2
        } else {
            3
        }
    }

    fn update_thresholds(&mut self) {
        for i in 0..3 {
            self.thresholds[i] =
                (self.class_means[i].get() + self.class_means[i + 1].get()) / 2.0;
        }
    }

    fn timing_update(&mut self, value: f32) {
        self.history.rotate_left(1);
        self.history[2] = value;
        if self.history_len < 3 {
            self.history_len += 1;
            return;
        }

        let err = (self.history[2] - self.history[0]) * self.history[1];
        self.timing_error = 0.9 * self.timing_error + 0.1 * err;

        self.mu += self.timing_error * 0.01 / (self.deviation * self.deviation);
        if self.mu > 1.0 {
            self.mu -= 1.0;
            // Sample clock late: stretch this symbol period by one sample.
            self.sample_counter = self.sample_counter.saturating_sub(1);
        } else if self.mu < -1.0 {
            self.mu += 1.0;
            self.sample_counter += 1;
        }
    }
}
