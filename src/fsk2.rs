//! Binary FSK demodulation for the SmartNet control channel.
//!
//! Discriminator output lowpassed and thresholded at zero, one bit per
//! symbol.

use num::complex::Complex32;

use crate::filter::{ComplexFirFilter, FirFilter, lowpass_taps};

const BATCH_SYMBOLS: usize = 100;

#[derive(Clone, Debug)]
pub struct Fsk2Demod {
    symbol_rate: u32,
    sample_rate: u32,
    samples_per_symbol: u32,

    baseband: Option<ComplexFirFilter>,
    lpf: Option<FirFilter>,
    prev: Complex32,
    sample_counter: u32,
    accum: f32,
    accum_count: u32,

    batch: Vec<f32>,
}

impl Fsk2Demod {
    pub fn new(symbol_rate: u32) -> Self {
        Fsk2Demod {
            symbol_rate,
            sample_rate: 0,
            samples_per_symbol: 0,
            baseband: None,
            lpf: None,
            prev: Complex32::new(1.0, 0.0),
            sample_counter: 0,
            accum: 0.0,
            accum_count: 0,
            batch: Vec::with_capacity(BATCH_SYMBOLS),
        }
    }

    pub fn init(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
        self.samples_per_symbol = sample_rate / self.symbol_rate;

        self.baseband = Some(ComplexFirFilter::new(lowpass_taps(sample_rate, 6000.0, 51)));
        self.lpf = Some(FirFilter::new(lowpass_taps(
            sample_rate,
            self.symbol_rate as f32 * 1.2,
            51,
        )));

        debug!(
            "fsk2 init: sample_rate={} symbol_rate={} sps={}",
            sample_rate, self.symbol_rate, self.samples_per_symbol
        );

        self.reset();
    }

    pub fn reset(&mut self) {
        self.prev = Complex32::new(1.0, 0.0);
        self.sample_counter = 0;
        self.accum = 0.0;
        self.accum_count = 0;
        self.batch.clear();

        if let Some(f) = self.baseband.as_mut() {
            f.reset();
        }
        if let Some(f) = self.lpf.as_mut() {
            f.reset();
        }
    }

    pub fn process(&mut self, samples: &[Complex32], sink: &mut dyn FnMut(&[f32])) {
        debug_assert!(self.samples_per_symbol > 0, "init before process");

        for &s in samples {
            let filtered = self.baseband.as_mut().unwrap().feed(s);

            let freq = (filtered * self.prev.conj()).arg();
            self.prev = filtered;

            let shaped = self.lpf.as_mut().unwrap().feed(freq);

            self.accum += shaped;
            self.accum_count += 1;
            self.sample_counter += 1;

            if self.sample_counter >= self.samples_per_symbol {
                self.sample_counter = 0;

                let value = self.accum / self.accum_count.max(1) as f32;
                self.accum = 0.0;
                self.accum_count = 0;

                let bit = if value > 0.0 { 1.0 } else { 0.0 };
                self.batch.push(bit);
                if self.batch.len() >= BATCH_SYMBOLS {
                    sink(&self.batch);
                    self.batch.clear();
                }
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
}

#[cfg(test)]
mod test {
    use super::*;

    const TEST_RATE: u32 = 36_000;
    const SYMBOL_RATE: u32 = 3600;

    fn modulate(bits: &[u8], deviation: f32) -> Vec<Complex32> {
        let sps = (TEST_RATE / SYMBOL_RATE) as usize;
        let mut phase = 0.0f32;
        let mut out = Vec::with_capacity(bits.len() * sps);

        for &bit in bits {
            let freq = if bit != 0 { deviation } else { -deviation };
            let step = 2.0 * std::f32::consts::PI * freq / TEST_RATE as f32;

            for _ in 0..sps {
                phase += step;
                out.push(Complex32::new(phase.cos(), phase.sin()));
            }
        }

        out
    }

    fn pseudo_bits(len: usize, mut seed: u32) -> Vec<u8> {
        (0..len)
            .map(|_| {
                seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
                ((seed >> 16) & 1) as u8
            })
            .collect()
    }

    #[test]
    fn test_slicer_inverse() {
        let mut bits = vec![0, 1, 0, 1, 0, 1, 0, 1];
        let payload = pseudo_bits(200, 3);
        bits.extend_from_slice(&payload);

        let mut demod = Fsk2Demod::new(SYMBOL_RATE);
        demod.init(TEST_RATE);

        let samples = modulate(&bits, 600.0);

        let mut out: Vec<u8> = Vec::new();
        demod.process(&samples, &mut |batch| {
            out.extend(batch.iter().map(|&b| b as u8))
        });
        demod.flush(&mut |batch| out.extend(batch.iter().map(|&b| b as u8)));

        assert!(out.len() >= bits.len() - 4);
        assert_eq!(
            &out[out.len() - 150..],
            &payload[payload.len() - 150..],
            "BER != 0 after lock"
        );
    }
}
