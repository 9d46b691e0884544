//! DMR Tier II/III framing and control signaling.
//!
//! Two-slot TDMA at 4800 symbols/sec. Each 264-bit frame is sync(48) |
//! slot type(20) | info(196). The slot type carries the color code and
//! data type under a (20,10) shortened-Golay code; the info body is
//! BPTC(196,96) protected. CSBKs drive Capacity Plus trunking; voice
//! link-control headers carry source/destination plus the talker-alias
//! byte stream, reassembled per destination.

use fnv::FnvHashMap;

use crate::bits::{BitRing, bits_to_u32, hamming_distance};
use crate::coding::{bptc_196_96_decode, slot_type_decode};
use crate::decoder::DecoderStats;
use crate::types::{CallGrant, DecoderEvent, Frequency, SystemDetail, SystemInfo, SystemType};

/// 48-bit sync patterns: base station, mobile, data, and voice.
pub const SYNC_PATTERNS: [u64; 4] = [
    0x755F_D7DF_75F7,
    0xDFF5_7D75_DF5D,
    0xD5D7_F77F_D757,
    0x7F7D_5DD5_7DFD,
];
const SYNC_TOLERANCE: u32 = 4;

/// Full DMR frame length in bits.
const FRAME_BITS: usize = 264;
const SLOT_TYPE_OFFSET: usize = 48;
const INFO_OFFSET: usize = 68;
const INFO_BITS: usize = 196;

/// Consecutive bad frames before sync is declared lost.
const SYNC_ERROR_LIMIT: u32 = 3;

/// Data types carried in the slot type field.
const DATA_TYPE_VOICE_LC: u8 = 0x0;
const DATA_TYPE_VOICE_TERM: u8 = 0x1;
const DATA_TYPE_CSBK: u8 = 0x3;
const DATA_TYPE_IDLE: u8 = 0x9;

/// CSBK opcodes.
const CSBK_CHANNEL_GRANT: u8 = 0x06;
const CSBK_TALKGROUP_ANNOUNCE: u8 = 0x08;
const CSBK_PREAMBLE: u8 = 0x3D;

/// Talker-alias fragments idle longer than this many 30 ms frames are
/// discarded to bound memory.
const ALIAS_TIMEOUT_FRAMES: u64 = 334;

#[derive(Clone, Debug)]
struct AliasFragments {
    text: String,
    last_frame: u64,
}

pub struct DmrDecoder {
    expected_color_code: Option<u8>,
    detected_color_code: u8,
    rest_channel: Option<Frequency>,
    channel_plan: Option<(Frequency, u32)>,

    bits: BitRing,
    locked: bool,
    sync_errors: u32,
    announced: bool,

    current_slot: u8,
    frame_counter: u64,
    /// Last voice destination seen per slot, for terminator handling.
    slot_dst: [Option<u32>; 2],
    alias: FnvHashMap<u32, AliasFragments>,

    stats: DecoderStats,
}

impl DmrDecoder {
    pub fn new(
        expected_color_code: Option<u8>,
        rest_channel: Option<Frequency>,
        channel_plan: Option<(Frequency, u32)>,
    ) -> Self {
        DmrDecoder {
            expected_color_code,
            detected_color_code: 0,
            rest_channel,
            channel_plan,
            bits: BitRing::with_capacity(FRAME_BITS * 4),
            locked: false,
            sync_errors: 0,
            announced: false,
            current_slot: 0,
            frame_counter: 0,
            slot_dst: [None, None],
            alias: FnvHashMap::default(),
            stats: DecoderStats::default(),
        }
    }

    pub fn reset(&mut self) {
        self.bits.clear();
        self.locked = false;
        self.sync_errors = 0;
        self.announced = false;
        self.current_slot = 0;
        self.frame_counter = 0;
        self.slot_dst = [None, None];
        self.alias.clear();
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    pub fn color_code(&self) -> u8 {
        self.detected_color_code
    }

    pub fn process_symbols(&mut self, symbols: &[f32], events: &mut dyn FnMut(DecoderEvent)) {
        for &sym in symbols {
            self.bits.push_dibit(sym as u8);
            self.advance(events);
        }
    }

    fn sync_matches(&self) -> bool {
        let window = self.bits.peek_u64(0, 48);
        SYNC_PATTERNS
            .iter()
            .any(|&p| hamming_distance(window, p, 48) <= SYNC_TOLERANCE)
    }

    fn advance(&mut self, events: &mut dyn FnMut(DecoderEvent)) {
        loop {
            if !self.locked {
                if self.bits.len() < 48 {
                    return;
                }

                if self.sync_matches() {
                    self.locked = true;
                    self.sync_errors = 0;
                    info!("DMR sync acquired");
                } else {
                    self.bits.consume(1);
                    continue;
                }
            }

            if self.bits.len() < FRAME_BITS {
                return;
            }

            if !self.sync_matches() {
                self.sync_errors += 1;
                if self.sync_errors > SYNC_ERROR_LIMIT {
                    self.locked = false;
                    self.stats.sync_losses += 1;
                    warn!("DMR sync lost");
                }
                self.bits.consume(1);
                continue;
            }

            self.process_frame(events);

            self.frame_counter += 1;
            self.expire_alias();

            // TDMA: slots alternate every frame.
            self.current_slot ^= 1;
            self.sync_errors = 0;
            self.bits.consume(FRAME_BITS);
        }
    }

    fn process_frame(&mut self, events: &mut dyn FnMut(DecoderEvent)) {
        let word = self.bits.peek_u64(SLOT_TYPE_OFFSET, 20) as u32;

        let slot_type = match slot_type_decode(word) {
            Some(st) => st,
            None => {
                debug!("DMR slot type unrecoverable");
                self.stats.crc_errors += 1;
                return;
            }
        };

        let color_code = ((slot_type >> 6) & 0xF) as u8;
        let data_type = ((slot_type >> 2) & 0xF) as u8;

        self.detected_color_code = color_code;

        if let Some(expected) = self.expected_color_code {
            if color_code != expected {
                debug!(
                    "DMR color code mismatch: expected {}, got {}",
                    expected, color_code
                );
                self.stats.color_code_mismatches += 1;
                return;
            }
        }

        if !self.announced {
            self.announced = true;
            events(DecoderEvent::SystemInfo(SystemInfo {
                system: SystemType::Dmr,
                system_id: u32::from(color_code),
                detail: SystemDetail::Dmr {
                    color_code,
                    rest_channel: self.rest_channel,
                },
            }));
        }

        let slot = self.current_slot;
        self.stats.frames_decoded += 1;

        match data_type {
            DATA_TYPE_CSBK => {
                let info = self.bits.peek_bits(INFO_OFFSET, INFO_BITS);
                self.process_csbk(&info, color_code, events);
            }
            DATA_TYPE_VOICE_LC => {
                let info = self.bits.peek_bits(INFO_OFFSET, INFO_BITS);
                self.process_voice_lc(&info, slot);
            }
            DATA_TYPE_VOICE_TERM => {
                if let Some(dst) = self.slot_dst[slot as usize].take() {
                    debug!("DMR voice terminator on slot {}: tg={}", slot, dst);
                    if let Some(frag) = self.alias.remove(&dst) {
                        if !frag.text.is_empty() {
                            events(DecoderEvent::TalkerAlias(dst, frag.text));
                        }
                    }
                    events(DecoderEvent::CallEnd(dst));
                }
            }
            DATA_TYPE_IDLE => {}
            other => {
                debug!("DMR data type {:#x} on slot {} ignored", other, slot);
            }
        }
    }

    fn process_csbk(
        &mut self,
        info: &[u8],
        color_code: u8,
        events: &mut dyn FnMut(DecoderEvent),
    ) {
        let csbk = match bptc_196_96_decode(info) {
            Some(bits) => bits,
            None => {
                debug!("DMR CSBK decode failed");
                self.stats.crc_errors += 1;
                return;
            }
        };

        let opcode = bits_to_u32(&csbk, 0, 6) as u8;

        match opcode {
            CSBK_CHANNEL_GRANT => {
                let logical_slot = bits_to_u32(&csbk, 8, 1) as u8;
                let source = bits_to_u32(&csbk, 16, 24);
                let dest = bits_to_u32(&csbk, 40, 24);
                let lcn = bits_to_u32(&csbk, 64, 8);

                let frequency = match self.grant_frequency(lcn) {
                    Some(f) => f,
                    None => {
                        debug!("DMR grant with no resolvable frequency: tg={}", dest);
                        self.stats.unresolved_grants += 1;
                        return;
                    }
                };

                let mut grant = CallGrant::group(dest, source, frequency);
                grant.color_code = Some(color_code);
                grant.slot = Some(logical_slot);

                info!(
                    "DMR channel grant: slot={} tg={} src={} cc={} freq={}",
                    logical_slot, dest, source, color_code, frequency
                );
                events(DecoderEvent::Grant(grant));
            }
            CSBK_TALKGROUP_ANNOUNCE => {
                let talkgroup = bits_to_u32(&csbk, 16, 24);
                debug!("DMR talkgroup announce: tg={}", talkgroup);
            }
            CSBK_PREAMBLE => {
                debug!("DMR preamble");
            }
            other => {
                debug!("DMR CSBK opcode {:#04x} ignored", other);
                self.stats.unknown_opcodes += 1;
            }
        }
    }

    /// Capacity Plus band plan when configured, otherwise the rest
    /// channel.
    fn grant_frequency(&self, lcn: u32) -> Option<Frequency> {
        self.channel_plan
            .map(|(base, spacing)| base + u64::from(lcn) * u64::from(spacing))
            .or(self.rest_channel)
    }

    fn process_voice_lc(&mut self, info: &[u8], slot: u8) {
        let lc = match bptc_196_96_decode(info) {
            Some(bits) => bits,
            None => {
                self.stats.crc_errors += 1;
                return;
            }
        };

        let source = bits_to_u32(&lc, 16, 24);
        let dest = bits_to_u32(&lc, 40, 24);

        debug!("DMR voice LC: slot={} tg={} src={}", slot, dest, source);
        self.slot_dst[slot as usize] = Some(dest);

        // Alias bytes ride in the tail of the LC, a few characters per
        // header; printable characters accumulate per destination.
        let mut text = String::new();
        for i in 0..4 {
            let ch = bits_to_u32(&lc, 64 + i * 8, 8) as u8;
            if (32..127).contains(&ch) {
                text.push(ch as char);
            }
        }

        if !text.is_empty() {
            let frame = self.frame_counter;
            let entry = self.alias.entry(dest).or_insert_with(|| AliasFragments {
                text: String::new(),
                last_frame: frame,
            });
            entry.text.push_str(&text);
            entry.last_frame = frame;
        }
    }

    fn expire_alias(&mut self) {
        let now = self.frame_counter;
        self.alias
            .retain(|_, frag| now.saturating_sub(frag.last_frame) <= ALIAS_TIMEOUT_FRAMES);
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::bits::u32_to_bits;
    use crate::coding::{bptc_196_96_encode, slot_type_encode};

    pub fn build_frame(color_code: u8, data_type: u8, info: &[u8]) -> Vec<u8> {
        assert_eq!(info.len(), INFO_BITS);

        let mut frame = vec![0u8; FRAME_BITS];

        for i in 0..48 {
            frame[i] = ((SYNC_PATTERNS[0] >> (47 - i)) & 1) as u8;
        }

        let slot_type =
            (u16::from(color_code & 0xF) << 6) | (u16::from(data_type & 0xF) << 2);
        let word = slot_type_encode(slot_type);
        for i in 0..20 {
            frame[SLOT_TYPE_OFFSET + i] = ((word >> (19 - i)) & 1) as u8;
        }

        frame[INFO_OFFSET..INFO_OFFSET + INFO_BITS].copy_from_slice(info);
        frame
    }

    pub fn grant_csbk(logical_slot: u8, source: u32, dest: u32, lcn: u32) -> Vec<u8> {
        let mut csbk = vec![0u8; 96];
        u32_to_bits(u32::from(CSBK_CHANNEL_GRANT), &mut csbk, 0, 6);
        u32_to_bits(u32::from(logical_slot), &mut csbk, 8, 1);
        u32_to_bits(source, &mut csbk, 16, 24);
        u32_to_bits(dest, &mut csbk, 40, 24);
        u32_to_bits(lcn, &mut csbk, 64, 8);
        bptc_196_96_encode(&csbk)
    }

    pub fn voice_lc(source: u32, dest: u32, alias: &str) -> Vec<u8> {
        let mut lc = vec![0u8; 96];
        u32_to_bits(source, &mut lc, 16, 24);
        u32_to_bits(dest, &mut lc, 40, 24);
        for (i, ch) in alias.bytes().take(4).enumerate() {
            u32_to_bits(u32::from(ch), &mut lc, 64 + i * 8, 8);
        }
        bptc_196_96_encode(&lc)
    }

    pub fn idle_info() -> Vec<u8> {
        bptc_196_96_encode(&vec![0u8; 96])
    }

    pub fn to_symbols(bits: &[u8]) -> Vec<f32> {
        bits.chunks(2)
            .map(|pair| f32::from(pair[0] * 2 + pair[1]))
            .collect()
    }

    fn collect_events(decoder: &mut DmrDecoder, symbols: &[f32]) -> Vec<DecoderEvent> {
        let mut events = Vec::new();
        decoder.process_symbols(symbols, &mut |e| events.push(e));
        events
    }

    fn grants(events: &[DecoderEvent]) -> Vec<&CallGrant> {
        events
            .iter()
            .filter_map(|e| match e {
                DecoderEvent::Grant(g) => Some(g),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_channel_grant_rest_channel() {
        let mut decoder = DmrDecoder::new(Some(3), Some(451_800_000), None);

        let frame = build_frame(3, DATA_TYPE_CSBK, &grant_csbk(1, 99, 2001, 0));
        let events = collect_events(&mut decoder, &to_symbols(&frame));

        let gs = grants(&events);
        assert_eq!(gs.len(), 1);
        assert_eq!(gs[0].talkgroup, 2001);
        assert_eq!(gs[0].radio_id, 99);
        assert_eq!(gs[0].frequency, 451_800_000);
        assert_eq!(gs[0].slot, Some(1));
        assert_eq!(gs[0].color_code, Some(3));
    }

    #[test]
    fn test_channel_grant_capacity_plus_plan() {
        let mut decoder = DmrDecoder::new(Some(3), None, Some((451_000_000, 12_500)));

        let frame = build_frame(3, DATA_TYPE_CSBK, &grant_csbk(0, 99, 2001, 4));
        let events = collect_events(&mut decoder, &to_symbols(&frame));

        let gs = grants(&events);
        assert_eq!(gs.len(), 1);
        assert_eq!(gs[0].frequency, 451_050_000);
    }

    #[test]
    fn test_channel_plan_preferred_over_rest_channel() {
        let mut decoder =
            DmrDecoder::new(Some(3), Some(451_800_000), Some((451_000_000, 12_500)));

        let frame = build_frame(3, DATA_TYPE_CSBK, &grant_csbk(0, 99, 2001, 4));
        let events = collect_events(&mut decoder, &to_symbols(&frame));

        let gs = grants(&events);
        assert_eq!(gs.len(), 1);
        assert_eq!(gs[0].frequency, 451_050_000);
    }

    #[test]
    fn test_grant_without_frequency_dropped() {
        let mut decoder = DmrDecoder::new(Some(3), None, None);

        let frame = build_frame(3, DATA_TYPE_CSBK, &grant_csbk(0, 99, 2001, 4));
        let events = collect_events(&mut decoder, &to_symbols(&frame));

        assert!(grants(&events).is_empty());
        assert_eq!(decoder.stats().unresolved_grants, 1);
    }

    #[test]
    fn test_color_code_mismatch() {
        let mut decoder = DmrDecoder::new(Some(3), Some(451_800_000), None);

        let frame = build_frame(2, DATA_TYPE_CSBK, &grant_csbk(0, 99, 2001, 0));
        let events = collect_events(&mut decoder, &to_symbols(&frame));

        assert!(grants(&events).is_empty());
        assert_eq!(decoder.stats().color_code_mismatches, 1);
    }

    #[test]
    fn test_sync_tolerance() {
        for (errors, expect_lock) in [(4usize, true), (5, false)] {
            let mut decoder = DmrDecoder::new(None, Some(451_800_000), None);

            let mut frame = build_frame(1, DATA_TYPE_IDLE, &idle_info());
            for i in 0..errors {
                frame[i] ^= 1;
            }

            collect_events(&mut decoder, &to_symbols(&frame));
            assert_eq!(decoder.locked(), expect_lock, "{} errors", errors);
        }
    }

    #[test]
    fn test_frame_alignment_and_slot_toggle() {
        let mut decoder = DmrDecoder::new(None, Some(451_800_000), None);

        let mut stream = Vec::new();
        for _ in 0..100 {
            stream.extend(build_frame(1, DATA_TYPE_IDLE, &idle_info()));
        }

        collect_events(&mut decoder, &to_symbols(&stream));
        assert_eq!(decoder.stats().frames_decoded, 100);
        assert_eq!(decoder.stats().sync_losses, 0);
        // After an even number of frames the slot pointer is back home.
        assert_eq!(decoder.current_slot, 0);
    }

    #[test]
    fn test_talker_alias_reassembly() {
        let mut decoder = DmrDecoder::new(None, Some(451_800_000), None);

        let mut stream = Vec::new();
        // Alias arrives four characters at a time on slot 0; an idle
        // frame keeps the TDMA toggle returning to the same slot.
        stream.extend(build_frame(1, DATA_TYPE_VOICE_LC, &voice_lc(7, 2001, "ENG ")));
        stream.extend(build_frame(1, DATA_TYPE_IDLE, &idle_info()));
        stream.extend(build_frame(1, DATA_TYPE_VOICE_LC, &voice_lc(7, 2001, "51")));
        stream.extend(build_frame(1, DATA_TYPE_IDLE, &idle_info()));
        stream.extend(build_frame(1, DATA_TYPE_VOICE_TERM, &idle_info()));

        let events = collect_events(&mut decoder, &to_symbols(&stream));

        let alias: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                DecoderEvent::TalkerAlias(tg, text) => Some((*tg, text.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(alias, vec![(2001, "ENG 51".to_owned())]);

        assert!(events
            .iter()
            .any(|e| matches!(e, DecoderEvent::CallEnd(2001))));
    }

    #[test]
    fn test_alias_fragments_expire() {
        let mut decoder = DmrDecoder::new(None, Some(451_800_000), None);

        let mut stream = Vec::new();
        stream.extend(build_frame(1, DATA_TYPE_VOICE_LC, &voice_lc(7, 2001, "STAL")));
        // Enough idle frames to outlive the alias timeout, odd so the
        // terminator lands back on slot 0.
        for _ in 0..(ALIAS_TIMEOUT_FRAMES + 3) {
            stream.extend(build_frame(1, DATA_TYPE_IDLE, &idle_info()));
        }
        stream.extend(build_frame(1, DATA_TYPE_VOICE_TERM, &idle_info()));

        let events = collect_events(&mut decoder, &to_symbols(&stream));
        // The call still ends, but the stale alias is gone.
        assert!(events
            .iter()
            .any(|e| matches!(e, DecoderEvent::CallEnd(2001))));
        assert!(!events
            .iter()
            .any(|e| matches!(e, DecoderEvent::TalkerAlias(..))));
    }
}
