//! SmartNet outbound signaling word decoding.
//!
//! The control channel is binary FSK at 3600 baud. Each 76-bit frame
//! carries sync(16) | address(10) | group(3) | command(11) | crc(16) |
//! status(20). A group call is a command whose top five bits are zero;
//! the low six bits select the channel against the configured band plan.

use crate::bits::{BitRing, bits_to_u32, hamming_distance};
use crate::coding::crc16_smartnet;
use crate::decoder::DecoderStats;
use crate::types::{CallGrant, DecoderEvent, Frequency, SystemDetail, SystemInfo, SystemType};

/// 16-bit OSW sync pattern.
pub const OSW_SYNC: u64 = 0x5555;
const SYNC_TOLERANCE: u32 = 2;
/// Full OSW frame length in bits.
const FRAME_BITS: usize = 76;

const ADDRESS_OFFSET: usize = 16;
const GROUP_OFFSET: usize = 26;
const COMMAND_OFFSET: usize = 29;
const CRC_OFFSET: usize = 40;

/// Consecutive bad frames before sync is declared lost.
const SYNC_ERROR_LIMIT: u32 = 5;

pub struct SmartnetDecoder {
    base_frequency: Frequency,
    channel_spacing: u32,

    bits: BitRing,
    locked: bool,
    sync_errors: u32,
    announced: bool,

    stats: DecoderStats,
}

impl SmartnetDecoder {
    pub fn new(base_frequency: Frequency, channel_spacing: u32) -> Self {
        SmartnetDecoder {
            base_frequency,
            channel_spacing,
            bits: BitRing::with_capacity(FRAME_BITS * 2 + 16),
            locked: false,
            sync_errors: 0,
            announced: false,
            stats: DecoderStats::default(),
        }
    }

    pub fn reset(&mut self) {
        self.bits.clear();
        self.locked = false;
        self.sync_errors = 0;
        self.announced = false;
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    pub fn process_symbols(&mut self, symbols: &[f32], events: &mut dyn FnMut(DecoderEvent)) {
        for &sym in symbols {
            self.bits.push(if sym > 0.5 { 1 } else { 0 });
            self.advance(events);
        }
    }

    fn advance(&mut self, events: &mut dyn FnMut(DecoderEvent)) {
        loop {
            if !self.locked {
                if self.bits.len() < 16 {
                    return;
                }

                if hamming_distance(self.bits.peek_u64(0, 16), OSW_SYNC, 16) <= SYNC_TOLERANCE {
                    self.locked = true;
                    self.sync_errors = 0;
                    info!("SmartNet sync acquired");

                    if !self.announced {
                        self.announced = true;
                        events(DecoderEvent::SystemInfo(SystemInfo {
                            system: SystemType::Smartnet,
                            system_id: 0,
                            detail: SystemDetail::Smartnet {
                                base_frequency: self.base_frequency,
                                channel_spacing: self.channel_spacing,
                            },
                        }));
                    }
                } else {
                    self.bits.consume(1);
                    continue;
                }
            }

            if self.bits.len() < FRAME_BITS {
                return;
            }

            if hamming_distance(self.bits.peek_u64(0, 16), OSW_SYNC, 16) > SYNC_TOLERANCE {
                self.sync_error();
                continue;
            }

            let frame = self.bits.peek_bits(0, FRAME_BITS);
            if !check_osw_crc(&frame) {
                self.stats.crc_errors += 1;
                self.sync_error();
                continue;
            }

            let address = bits_to_u32(&frame, ADDRESS_OFFSET, 10);
            let group = bits_to_u32(&frame, GROUP_OFFSET, 3) as u8;
            let command = bits_to_u32(&frame, COMMAND_OFFSET, 11) as u16;

            self.decode_osw(address, group, command, events);

            self.stats.frames_decoded += 1;
            self.sync_errors = 0;
            self.bits.consume(FRAME_BITS);
        }
    }

    fn sync_error(&mut self) {
        self.sync_errors += 1;
        if self.sync_errors > SYNC_ERROR_LIMIT {
            self.locked = false;
            self.stats.sync_losses += 1;
            warn!("SmartNet sync lost");
        }
        self.bits.consume(1);
    }

    fn decode_osw(
        &mut self,
        address: u32,
        group: u8,
        command: u16,
        events: &mut dyn FnMut(DecoderEvent),
    ) {
        debug!(
            "SmartNet OSW: address={} group={} command={:#05x}",
            address, group, command
        );

        let cmd_type = (command >> 6) & 0x1F;

        if cmd_type == 0 {
            // Group call: talkgroup is the address, the radio id is not
            // carried on this system.
            let channel = u64::from(command & 0x3F);
            let frequency = self.base_frequency + channel * u64::from(self.channel_spacing);

            info!(
                "SmartNet group call: tg={} channel={} freq={}",
                address, channel, frequency
            );
            events(DecoderEvent::Grant(CallGrant::group(address, 0, frequency)));
        }
    }
}

/// CRC field covers the 24 message bits between sync and CRC.
fn check_osw_crc(frame: &[u8]) -> bool {
    let received = bits_to_u32(frame, CRC_OFFSET, 16) as u16;
    crc16_smartnet(&frame[ADDRESS_OFFSET..CRC_OFFSET]) == received
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::bits::u32_to_bits;

    pub fn build_osw(address: u32, group: u8, command: u16) -> Vec<u8> {
        let mut frame = vec![0u8; FRAME_BITS];

        u32_to_bits(OSW_SYNC as u32, &mut frame, 0, 16);
        u32_to_bits(address, &mut frame, ADDRESS_OFFSET, 10);
        u32_to_bits(u32::from(group), &mut frame, GROUP_OFFSET, 3);
        u32_to_bits(u32::from(command), &mut frame, COMMAND_OFFSET, 11);

        let crc = crc16_smartnet(&frame[ADDRESS_OFFSET..CRC_OFFSET]);
        u32_to_bits(u32::from(crc), &mut frame, CRC_OFFSET, 16);

        frame
    }

    pub fn to_symbols(bits: &[u8]) -> Vec<f32> {
        bits.iter().map(|&b| f32::from(b)).collect()
    }

    fn collect_events(decoder: &mut SmartnetDecoder, symbols: &[f32]) -> Vec<DecoderEvent> {
        let mut events = Vec::new();
        decoder.process_symbols(symbols, &mut |e| events.push(e));
        events
    }

    #[test]
    fn test_group_call_grant() {
        let mut decoder = SmartnetDecoder::new(851_000_000, 25_000);

        let frame = build_osw(101, 0, 10);
        let events = collect_events(&mut decoder, &to_symbols(&frame));

        // First the band plan announcement, then the grant.
        assert_eq!(events.len(), 2);
        match &events[0] {
            DecoderEvent::SystemInfo(info) => {
                assert_eq!(info.system, SystemType::Smartnet);
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &events[1] {
            DecoderEvent::Grant(g) => {
                assert_eq!(g.talkgroup, 101);
                assert_eq!(g.radio_id, 0);
                assert_eq!(g.frequency, 851_250_000);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_non_group_command_ignored() {
        let mut decoder = SmartnetDecoder::new(851_000_000, 25_000);

        // Top five command bits nonzero: not a group call.
        let frame = build_osw(101, 0, 0x2F0);
        let events = collect_events(&mut decoder, &to_symbols(&frame));

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], DecoderEvent::SystemInfo(_)));
        assert_eq!(decoder.stats().frames_decoded, 1);
    }

    #[test]
    fn test_sync_tolerance() {
        for (errors, expect_lock) in [(2usize, true), (3, false)] {
            let mut decoder = SmartnetDecoder::new(851_000_000, 25_000);

            let mut frame = build_osw(101, 0, 10);
            for i in 0..errors {
                frame[i] ^= 1;
            }

            collect_events(&mut decoder, &to_symbols(&frame));
            assert_eq!(decoder.locked(), expect_lock, "{} errors", errors);
        }
    }

    #[test]
    fn test_crc_failure_counted() {
        let mut decoder = SmartnetDecoder::new(851_000_000, 25_000);

        let mut frame = build_osw(101, 0, 10);
        // Corrupt a message bit after sync so only the CRC trips.
        frame[20] ^= 1;

        let events = collect_events(&mut decoder, &to_symbols(&frame));
        assert!(!events.iter().any(|e| matches!(e, DecoderEvent::Grant(_))));
        assert!(decoder.stats().crc_errors >= 1);
        assert_eq!(decoder.stats().frames_decoded, 0);
    }

    #[test]
    fn test_frame_alignment() {
        let mut decoder = SmartnetDecoder::new(851_000_000, 25_000);

        let mut stream = Vec::new();
        for i in 0..100u16 {
            stream.extend(build_osw(u32::from(200 + i), 0, 0x2F0));
        }

        collect_events(&mut decoder, &to_symbols(&stream));
        assert_eq!(decoder.stats().frames_decoded, 100);
        assert_eq!(decoder.stats().sync_losses, 0);
    }
}
