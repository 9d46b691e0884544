//! Protocol decoder family.
//!
//! Each variant consumes demodulated symbols and posts events through
//! the supplied sink; decoders never call back into upstream stages.
//! Construction is decided by the configured system type, with band
//! plan and identity parameters drawn from the `system` section.

use crate::config::SystemConfig;
use crate::dmr::DmrDecoder;
use crate::p25::P25Decoder;
use crate::smartnet::SmartnetDecoder;
use crate::tetra::TetraDecoder;
use crate::types::{DecoderEvent, Frequency, SystemType};

/// SmartNet 800 MHz band plan defaults.
const SMARTNET_BASE_FREQ: Frequency = 851_000_000;
const SMARTNET_SPACING: u32 = 25_000;
/// TETRA 380-400 MHz band base.
const TETRA_BAND_BASE: Frequency = 380_000_000;

/// Signal-quality and protocol counters surfaced on the status line.
/// These are not errors; processing always continues.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub sync_losses: u64,
    pub crc_errors: u64,
    pub color_code_mismatches: u64,
    pub unresolved_grants: u64,
    pub unknown_opcodes: u64,
    /// Bit-error estimate from the last convolutional decode.
    pub ber: f32,
}

pub enum Decoder {
    P25(P25Decoder),
    Smartnet(SmartnetDecoder),
    Dmr(DmrDecoder),
    Tetra(TetraDecoder),
}

impl Decoder {
    /// Build the decoder for the configured system.
    pub fn for_config(config: &SystemConfig) -> Decoder {
        match config.system_type {
            SystemType::P25 | SystemType::P25Phase2 => {
                Decoder::P25(P25Decoder::new(config.nac))
            }
            SystemType::Smartnet | SystemType::Smartzone => {
                Decoder::Smartnet(SmartnetDecoder::new(
                    config.base_frequency.unwrap_or(SMARTNET_BASE_FREQ),
                    config.channel_spacing.unwrap_or(SMARTNET_SPACING),
                ))
            }
            SystemType::Dmr => Decoder::Dmr(DmrDecoder::new(
                config.color_code,
                config.control_channels.first().copied(),
                config
                    .base_frequency
                    .map(|base| (base, config.channel_spacing.unwrap_or(12_500))),
            )),
            SystemType::Tetra => Decoder::Tetra(TetraDecoder::new(
                config.base_frequency.unwrap_or(TETRA_BAND_BASE),
                None,
            )),
            // Validated away at config load.
            SystemType::Nxdn | SystemType::Edacs | SystemType::Ltr => {
                unreachable!("unsupported system type")
            }
        }
    }

    /// Resetting clears sync state and any learned frequency tables.
    pub fn reset(&mut self) {
        match self {
            Decoder::P25(d) => d.reset(),
            Decoder::Smartnet(d) => d.reset(),
            Decoder::Dmr(d) => d.reset(),
            Decoder::Tetra(d) => d.reset(),
        }
    }

    pub fn process_symbols(&mut self, symbols: &[f32], events: &mut dyn FnMut(DecoderEvent)) {
        match self {
            Decoder::P25(d) => d.process_symbols(symbols, events),
            Decoder::Smartnet(d) => d.process_symbols(symbols, events),
            Decoder::Dmr(d) => d.process_symbols(symbols, events),
            Decoder::Tetra(d) => d.process_symbols(symbols, events),
        }
    }

    pub fn locked(&self) -> bool {
        match self {
            Decoder::P25(d) => d.locked(),
            Decoder::Smartnet(d) => d.locked(),
            Decoder::Dmr(d) => d.locked(),
            Decoder::Tetra(d) => d.locked(),
        }
    }

    pub fn stats(&self) -> DecoderStats {
        match self {
            Decoder::P25(d) => *d.stats(),
            Decoder::Smartnet(d) => *d.stats(),
            Decoder::Dmr(d) => *d.stats(),
            Decoder::Tetra(d) => *d.stats(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;

    fn system(json: &str) -> SystemConfig {
        Config::parse(json).unwrap().system
    }

    #[test]
    fn test_family_construction() {
        let c = system(r#"{"system": {"type": "p25", "nac": 659, "control_channels": [851012500]}}"#);
        assert!(matches!(Decoder::for_config(&c), Decoder::P25(_)));

        let c = system(r#"{"system": {"type": "smartnet", "control_channels": [851000000]}}"#);
        assert!(matches!(Decoder::for_config(&c), Decoder::Smartnet(_)));

        let c = system(r#"{"system": {"type": "dmr", "color_code": 3, "control_channels": [451800000]}}"#);
        assert!(matches!(Decoder::for_config(&c), Decoder::Dmr(_)));

        let c = system(r#"{"system": {"type": "tetra", "control_channels": [390000000]}}"#);
        assert!(matches!(Decoder::for_config(&c), Decoder::Tetra(_)));
    }

    #[test]
    fn test_dmr_rest_channel_is_first_control() {
        let c = system(r#"{"system": {"type": "dmr", "control_channels": [451800000]}}"#);
        let mut decoder = Decoder::for_config(&c);

        // A grant with no plan resolves against the rest channel.
        let frame = crate::dmr::test::build_frame(
            0,
            0x3,
            &crate::dmr::test::grant_csbk(0, 7, 1500, 0),
        );
        let mut grants = Vec::new();
        decoder.process_symbols(&crate::dmr::test::to_symbols(&frame), &mut |e| {
            if let DecoderEvent::Grant(g) = e {
                grants.push(g);
            }
        });

        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].frequency, 451_800_000);
    }
}
