//! Demodulator family and the sample-processing task.
//!
//! The task sits between the sample source and the receiver: it drains
//! I/Q buffers from the bounded source channel, runs the configured
//! demodulator, and forwards symbol batches downstream. Dispatch over
//! the family is a tagged union; construction is decided once by the
//! configured system type.

use std::sync::mpsc::{Receiver, Sender};

use num::complex::Complex32;

use crate::consts::{DMR_SYMBOL_RATE, P25_SYMBOL_RATE, SMARTNET_SYMBOL_RATE, TETRA_SYMBOL_RATE};
use crate::dqpsk::DqpskDemod;
use crate::fsk2::Fsk2Demod;
use crate::fsk4::Fsk4Demod;
use crate::recv::RecvEvent;
use crate::types::SystemType;
use crate::ui::UiEvent;

/// C4FM outermost deviation (Hz).
const P25_DEVIATION: f32 = 1800.0;
/// DMR outermost deviation (Hz).
const DMR_DEVIATION: f32 = 1944.0;

/// One demodulator variant per modulation family.
pub enum Demod {
    Fsk4(Fsk4Demod),
    Dqpsk(DqpskDemod),
    Fsk2(Fsk2Demod),
}

impl Demod {
    /// Construct the demodulator matching the configured system.
    pub fn for_system(system: SystemType) -> Demod {
        match system {
            SystemType::P25 | SystemType::P25Phase2 => {
                Demod::Fsk4(Fsk4Demod::new(P25_SYMBOL_RATE, P25_DEVIATION))
            }
            SystemType::Dmr => Demod::Fsk4(Fsk4Demod::new(DMR_SYMBOL_RATE, DMR_DEVIATION)),
            SystemType::Tetra => Demod::Dqpsk(DqpskDemod::new(TETRA_SYMBOL_RATE)),
            SystemType::Smartnet | SystemType::Smartzone => {
                Demod::Fsk2(Fsk2Demod::new(SMARTNET_SYMBOL_RATE))
            }
            // Validated away at config load.
            SystemType::Nxdn | SystemType::Edacs | SystemType::Ltr => {
                unreachable!("unsupported system type")
            }
        }
    }

    pub fn init(&mut self, sample_rate: u32) {
        match self {
            Demod::Fsk4(d) => d.init(sample_rate),
            Demod::Dqpsk(d) => d.init(sample_rate),
            Demod::Fsk2(d) => d.init(sample_rate),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Demod::Fsk4(d) => d.reset(),
            Demod::Dqpsk(d) => d.reset(),
            Demod::Fsk2(d) => d.reset(),
        }
    }

    pub fn process(&mut self, samples: &[Complex32], sink: &mut dyn FnMut(&[f32])) {
        match self {
            Demod::Fsk4(d) => d.process(samples, sink),
            Demod::Dqpsk(d) => d.process(samples, sink),
            Demod::Fsk2(d) => d.process(samples, sink),
        }
    }

    pub fn flush(&mut self, sink: &mut dyn FnMut(&[f32])) {
        match self {
            Demod::Fsk4(d) => d.flush(sink),
            Demod::Dqpsk(d) => d.flush(sink),
            Demod::Fsk2(d) => d.flush(sink),
        }
    }

    /// Link quality: eye opening for the FSK modes, residual EVM for
    /// DQPSK (lower is better there, so it is inverted for display).
    pub fn quality(&self) -> f32 {
        match self {
            Demod::Fsk4(d) => d.eye_opening(),
            Demod::Dqpsk(d) => 1.0 - d.evm(),
            Demod::Fsk2(_) => 0.0,
        }
    }
}

pub struct DemodTask {
    demod: Demod,
    samples: Receiver<Vec<Complex32>>,
    ui: Sender<UiEvent>,
    chan: Sender<RecvEvent>,
}

impl DemodTask {
    pub fn new(
        demod: Demod,
        samples: Receiver<Vec<Complex32>>,
        ui: Sender<UiEvent>,
        chan: Sender<RecvEvent>,
    ) -> Self {
        DemodTask {
            demod,
            samples,
            ui,
            chan,
        }
    }

    pub fn run(&mut self) {
        // Reduce the number of quality messages sent.
        let mut notify = 0usize;

        loop {
            let buf = match self.samples.recv() {
                Ok(buf) => buf,
                Err(_) => {
                    debug!("sample channel closed, demod task exiting");
                    return;
                }
            };

            let mut batch = Vec::new();
            self.demod.process(&buf, &mut |symbols| {
                batch.extend_from_slice(symbols);
            });
            self.demod.flush(&mut |symbols| {
                batch.extend_from_slice(symbols);
            });

            if !batch.is_empty() && self.chan.send(RecvEvent::Symbols(batch)).is_err() {
                debug!("receiver channel closed, demod task exiting");
                return;
            }

            notify += 1;
            if notify % 16 == 0 {
                let _ = self.ui.send(UiEvent::SetQuality(self.demod.quality()));
            }
        }
    }
}
