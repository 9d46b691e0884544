//! TETRA physical layer and MAC decoding.
//!
//! Symbols arrive as pi/4-DQPSK dibits at 18k symbols/sec. Each 510-bit
//! slot opens with an 11-bit training sequence followed by a 480-bit
//! coded block and spare padding. The coded block is rectangularly
//! interleaved (30 rows), scrambled by a frame-seeded LFSR, and
//! protected by the rate 2/3 punctured 16-state convolutional code with
//! a CRC-16-CCITT trailer. Slots count modulo 4 into frames, frames
//! modulo 18 into multiframes.

use fnv::FnvHashMap;

use crate::bits::{BitRing, bits_to_u32, hamming_distance};
use crate::coding::{check_crc16, deinterleave_block, descramble, tetra_conv_decode};
use crate::decoder::DecoderStats;
use crate::types::{
    CallGrant, CallType, DecoderEvent, EncryptionType, Frequency, SystemDetail, SystemInfo,
    SystemType,
};

/// 11-bit training sequences: normal, extended, and synchronization.
pub const TRAINING_SEQUENCES: [u64; 3] = [0x0FD, 0x6E4, 0x3AA];
const SYNC_TOLERANCE: u32 = 3;

/// Slot geometry.
const SLOT_BITS: usize = 510;
const TRAINING_BITS: usize = 11;
const CODED_OFFSET: usize = TRAINING_BITS;
const CODED_BITS: usize = 480;
/// Decoded block: MAC payload plus CRC.
const DECODED_BITS: usize = 316;
/// MAC payload bits after the CRC is stripped.
const PAYLOAD_BITS: usize = 300;

/// Interleaver rows for the coded block.
const INTERLEAVE_ROWS: usize = 30;

const SLOTS_PER_FRAME: u32 = 4;
const FRAMES_PER_MULTIFRAME: u32 = 18;

/// Consecutive unverified slots before the receiver falls back to
/// searching.
const SLIP_LIMIT: u32 = 10;

/// MAC PDU types.
const MAC_BROADCAST: u8 = 0x01;
const MAC_D_SETUP: u8 = 0x02;
const MAC_D_RELEASE: u8 = 0x04;
const MAC_D_SDS: u8 = 0x05;

/// Sync acquisition state.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyncState {
    Unsynced,
    Searching,
    Locked,
    /// Lock retained while recent slots failed sync verification.
    Slipping,
}

pub struct TetraDecoder {
    band_base: Frequency,

    bits: BitRing,
    state: SyncState,
    slip_count: u32,

    slot: u32,
    frame: u32,
    multiframe: u32,

    expected_mcc: Option<u16>,
    calls: FnvHashMap<u32, u32>,
    stats: DecoderStats,
}

impl TetraDecoder {
    pub fn new(band_base: Frequency, expected_mcc: Option<u16>) -> Self {
        TetraDecoder {
            band_base,
            bits: BitRing::with_capacity(SLOT_BITS * 4),
            state: SyncState::Unsynced,
            slip_count: 0,
            slot: 0,
            frame: 0,
            multiframe: 0,
            expected_mcc,
            calls: FnvHashMap::default(),
            stats: DecoderStats::default(),
        }
    }

    pub fn reset(&mut self) {
        self.bits.clear();
        self.state = SyncState::Unsynced;
        self.slip_count = 0;
        self.slot = 0;
        self.frame = 0;
        self.multiframe = 0;
        self.calls.clear();
    }

    pub fn locked(&self) -> bool {
        matches!(self.state, SyncState::Locked | SyncState::Slipping)
    }

    pub fn sync_state(&self) -> SyncState {
        self.state
    }

    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    pub fn process_symbols(&mut self, symbols: &[f32], events: &mut dyn FnMut(DecoderEvent)) {
        for &sym in symbols {
            self.bits.push_dibit(sym as u8);
            self.advance(events);
        }
    }

    fn training_distance(&self) -> u32 {
        let window = self.bits.peek_u64(0, TRAINING_BITS);
        TRAINING_SEQUENCES
            .iter()
            .map(|&seq| hamming_distance(window, seq, TRAINING_BITS as u32))
            .min()
            .unwrap()
    }

    fn advance(&mut self, events: &mut dyn FnMut(DecoderEvent)) {
        loop {
            match self.state {
                SyncState::Unsynced => {
                    self.state = SyncState::Searching;
                }
                SyncState::Searching => {
                    if self.bits.len() < TRAINING_BITS {
                        return;
                    }

                    if self.training_distance() <= SYNC_TOLERANCE {
                        info!("TETRA sync acquired");
                        self.state = SyncState::Locked;
                        self.slip_count = 0;
                        self.slot = 0;
                        self.frame = 0;
                        self.multiframe = 0;
                    } else {
                        self.bits.consume(1);
                        continue;
                    }
                }
                SyncState::Locked | SyncState::Slipping => {
                    if self.bits.len() < SLOT_BITS {
                        return;
                    }

                    if self.training_distance() <= SYNC_TOLERANCE {
                        self.state = SyncState::Locked;
                        self.slip_count = 0;
                        self.process_slot(events);
                    } else {
                        self.slip_count += 1;
                        self.state = SyncState::Slipping;
                        debug!("TETRA slot failed sync verification ({})", self.slip_count);

                        if self.slip_count >= SLIP_LIMIT {
                            warn!("TETRA sync lost");
                            self.stats.sync_losses += 1;
                            self.state = SyncState::Searching;
                            self.bits.consume(1);
                            continue;
                        }
                    }

                    self.bits.consume(SLOT_BITS);
                    self.advance_counters();
                }
            }
        }
    }

    fn advance_counters(&mut self) {
        self.slot += 1;
        if self.slot >= SLOTS_PER_FRAME {
            self.slot = 0;
            self.frame += 1;
            if self.frame >= FRAMES_PER_MULTIFRAME {
                self.frame = 0;
                self.multiframe += 1;
            }
        }
    }

    fn process_slot(&mut self, events: &mut dyn FnMut(DecoderEvent)) {
        let coded = self.bits.peek_bits(CODED_OFFSET, CODED_BITS);

        let mut block = deinterleave_block(&coded, INTERLEAVE_ROWS);
        descramble(&mut block, self.frame);

        let (decoded, metric) = match tetra_conv_decode(&block, DECODED_BITS) {
            Some(r) => r,
            None => {
                self.stats.crc_errors += 1;
                return;
            }
        };

        self.stats.ber = metric as f32 / CODED_BITS as f32;

        if !check_crc16(&decoded, 0xFFFF) {
            debug!("TETRA burst CRC failure (slot {} frame {})", self.slot, self.frame);
            self.stats.crc_errors += 1;
            return;
        }

        self.stats.frames_decoded += 1;
        self.process_mac(&decoded[..PAYLOAD_BITS], events);
    }

    fn process_mac(&mut self, payload: &[u8], events: &mut dyn FnMut(DecoderEvent)) {
        let pdu_type = bits_to_u32(payload, 0, 8) as u8;

        match pdu_type {
            MAC_BROADCAST => self.mac_broadcast(payload, events),
            MAC_D_SETUP => self.mac_setup(payload, events),
            MAC_D_RELEASE => self.mac_release(payload, events),
            MAC_D_SDS => self.mac_sds(payload, events),
            other => {
                debug!("TETRA MAC PDU type {:#04x} ignored", other);
                self.stats.unknown_opcodes += 1;
            }
        }
    }

    /// Type(8) | Mcc(10) | Mnc(14) | ColorCode(6) | LocationArea(16) |
    /// padding to a byte boundary | NetworkName(16 bytes)
    fn mac_broadcast(&mut self, payload: &[u8], events: &mut dyn FnMut(DecoderEvent)) {
        let mcc = bits_to_u32(payload, 8, 10) as u16;
        let mnc = bits_to_u32(payload, 18, 14) as u16;
        let color_code = (bits_to_u32(payload, 32, 6) & 0x03) as u8;
        let location_area = bits_to_u32(payload, 38, 16) as u16;

        if let Some(expected) = self.expected_mcc {
            if mcc != expected {
                debug!("TETRA broadcast for foreign MCC {} ignored", mcc);
                return;
            }
        }

        let name = extract_text(payload, 56, 16);

        // Public-safety networks sit in this country-code range on the
        // 380-400 MHz band.
        let emergency_services = (200..=799).contains(&mcc);

        info!(
            "TETRA system: mcc={} mnc={} cc={} la={} emergency={}",
            mcc, mnc, color_code, location_area, emergency_services
        );

        events(DecoderEvent::SystemInfo(SystemInfo {
            system: SystemType::Tetra,
            system_id: (u32::from(mcc) << 16) | u32::from(mnc),
            detail: SystemDetail::Tetra {
                mcc,
                mnc,
                color_code,
                location_area,
                network_name: name,
                emergency_services,
            },
        }));
    }

    /// Type(8) | CallType(4) | Destination(24) | Source(24) |
    /// Channel(12) | Encryption(2+2) | CallId(24)
    fn mac_setup(&mut self, payload: &[u8], events: &mut dyn FnMut(DecoderEvent)) {
        let call_type_bits = bits_to_u32(payload, 8, 4) as u8;
        let dest = bits_to_u32(payload, 12, 24);
        let source = bits_to_u32(payload, 36, 24);
        let channel = bits_to_u32(payload, 60, 12);
        let encryption = decode_encryption(payload, 72);
        let call_id = bits_to_u32(payload, 76, 24);

        let call_type = match call_type_bits {
            0 => CallType::Group,
            1 => CallType::Private,
            4 => CallType::Emergency,
            _ => CallType::Group,
        };

        let frequency = self.band_base + u64::from(channel) * 25_000;

        let mut grant = CallGrant::group(dest, source, frequency);
        grant.call_type = call_type;
        grant.priority = if call_type == CallType::Emergency { 10 } else { 5 };
        grant.encrypted = encryption.is_encrypted();
        grant.encryption = encryption;

        self.calls.insert(call_id, dest);

        info!(
            "TETRA call setup: tg={} src={} freq={} enc={:?}",
            dest, source, frequency, encryption
        );
        events(DecoderEvent::Grant(grant));
    }

    /// Type(8) | CallId(24)
    fn mac_release(&mut self, payload: &[u8], events: &mut dyn FnMut(DecoderEvent)) {
        let call_id = bits_to_u32(payload, 8, 24);

        match self.calls.remove(&call_id) {
            Some(talkgroup) => {
                info!("TETRA call release: tg={}", talkgroup);
                events(DecoderEvent::CallEnd(talkgroup));
            }
            None => {
                debug!("TETRA release for unknown call {}", call_id);
            }
        }
    }

    /// Type(8) | SdsType(4) | padding | Text bytes from bit 16
    fn mac_sds(&mut self, payload: &[u8], events: &mut dyn FnMut(DecoderEvent)) {
        let text = extract_text(payload, 16, (PAYLOAD_BITS - 16) / 8);

        if let Some(text) = text {
            info!("TETRA SDS: {}", text);
            events(DecoderEvent::ShortData(text));
        }
    }
}

/// Encryption field: a 2-bit class, with two further bits separating
/// TEA3 from TEA4.
fn decode_encryption(payload: &[u8], offset: usize) -> EncryptionType {
    match bits_to_u32(payload, offset, 2) {
        0 => EncryptionType::None,
        1 => EncryptionType::Tea1,
        2 => EncryptionType::Tea2,
        _ => {
            if bits_to_u32(payload, offset + 2, 2) == 0 {
                EncryptionType::Tea3
            } else {
                EncryptionType::Tea4
            }
        }
    }
}

/// Printable characters from a run of bytes; `None` if empty.
fn extract_text(payload: &[u8], offset: usize, max_bytes: usize) -> Option<String> {
    let mut text = String::new();

    for i in 0..max_bytes {
        let start = offset + i * 8;
        if start + 8 > payload.len() {
            break;
        }
        let ch = bits_to_u32(payload, start, 8) as u8;
        if (32..127).contains(&ch) {
            text.push(ch as char);
        }
    }

    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}
