//! P25 Phase 1 framing and trunking signaling.
//!
//! Symbols arrive as C4FM dibits. The framer hunts for the 48-bit frame
//! sync, recovers the NID, and hands 144-bit TSBKs to the opcode
//! dispatch. Frequencies are carried in 5 Hz units per the identifier
//! update band plan, so a grant resolves as
//! `(base_multiplier + channel_number * spacing) * 5` Hz.

use fnv::FnvHashMap;

use crate::bits::{BitRing, bits_to_u32, hamming_distance};
use crate::decoder::DecoderStats;
use crate::types::{CallGrant, DecoderEvent, SystemDetail, SystemInfo, SystemType};

/// 48-bit P25 frame sync pattern.
pub const FRAME_SYNC: u64 = 0x5575_F5FF_77FF;
/// Permitted sync bit errors.
const SYNC_TOLERANCE: u32 = 4;
/// Full P25 frame length in bits.
const FRAME_BITS: usize = 1728;
/// NID position and width.
const NID_OFFSET: usize = 48;
const NID_BITS: usize = 64;
/// TSBK payload position and width.
const TSBK_OFFSET: usize = 112;
const TSBK_BITS: usize = 144;

/// Consecutive bad frames before sync is declared lost.
const SYNC_ERROR_LIMIT: u32 = 3;

/// Data unit identifiers.
const DUID_TSBK: u8 = 0x7;

/// Trunking opcodes.
const OPCODE_GROUP_VOICE_GRANT: u8 = 0x00;
const OPCODE_GROUP_VOICE_UPDATE: u8 = 0x02;
const OPCODE_NETWORK_STATUS: u8 = 0x3A;
const OPCODE_IDENTIFIER_UPDATE: u8 = 0x3C;

/// One row of the frequency identifier table.
#[derive(Copy, Clone, Debug, PartialEq)]
struct ChannelParams {
    /// Base frequency in 5 Hz units.
    base: u64,
    /// Channel spacing in 5 Hz units.
    spacing: u32,
    /// Transmit offset, recorded but unused on receive.
    offset: u32,
}

impl ChannelParams {
    fn rx_freq(&self, channel: u16) -> u64 {
        (self.base + u64::from(channel) * u64::from(self.spacing)) * 5
    }
}

pub struct P25Decoder {
    expected_nac: u16,
    current_nac: u16,
    wacn: u32,
    sysid: u16,

    bits: BitRing,
    locked: bool,
    sync_errors: u32,

    channels: FnvHashMap<u8, ChannelParams>,
    stats: DecoderStats,
}

impl P25Decoder {
    pub fn new(expected_nac: u16) -> Self {
        P25Decoder {
            expected_nac,
            current_nac: 0,
            wacn: 0,
            sysid: 0,
            bits: BitRing::with_capacity(FRAME_BITS * 2 + 48),
            locked: false,
            sync_errors: 0,
            channels: FnvHashMap::default(),
            stats: DecoderStats::default(),
        }
    }

    /// Resetting the decoder clears the identifier table; frequency
    /// state never survives a retune.
    pub fn reset(&mut self) {
        self.bits.clear();
        self.locked = false;
        self.sync_errors = 0;
        self.channels.clear();
    }

    pub fn locked(&self) -> bool {
        self.locked
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

    fn advance(&mut self, events: &mut dyn FnMut(DecoderEvent)) {
        loop {
            if !self.locked {
                if self.bits.len() < 48 {
                    return;
                }

                if hamming_distance(self.bits.peek_u64(0, 48), FRAME_SYNC, 48)
                    <= SYNC_TOLERANCE
                {
                    self.locked = true;
                    self.sync_errors = 0;
                    info!("P25 frame sync acquired");
                } else {
                    self.bits.consume(1);
                    continue;
                }
            }

            if self.bits.len() < FRAME_BITS {
                return;
            }

            if hamming_distance(self.bits.peek_u64(0, 48), FRAME_SYNC, 48) > SYNC_TOLERANCE {
                self.sync_error();
                continue;
            }

            let nid = self.bits.peek_bits(NID_OFFSET, NID_BITS);
            if !self.handle_nid(&nid) {
                self.sync_error();
                continue;
            }

            let duid = bits_to_u32(&nid, 60, 4) as u8;
            if duid == DUID_TSBK {
                let tsbk = self.bits.peek_bits(TSBK_OFFSET, TSBK_BITS);
                self.handle_tsbk(&tsbk, events);
            }

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
            warn!("P25 sync lost");
        }
        self.bits.consume(1);
    }

    fn handle_nid(&mut self, nid: &[u8]) -> bool {
        self.current_nac = bits_to_u32(nid, 0, 12) as u16;

        if self.expected_nac != 0 && self.current_nac != self.expected_nac {
            debug!(
                "P25 NAC mismatch: expected {:#05x}, got {:#05x}",
                self.expected_nac, self.current_nac
            );
            return false;
        }

        true
    }

    fn handle_tsbk(&mut self, tsbk: &[u8], events: &mut dyn FnMut(DecoderEvent)) {
        let opcode = bits_to_u32(tsbk, 0, 6) as u8;

        match opcode {
            OPCODE_GROUP_VOICE_GRANT | OPCODE_GROUP_VOICE_UPDATE => {
                self.handle_grant(tsbk, events)
            }
            OPCODE_IDENTIFIER_UPDATE => self.handle_identifier_update(tsbk),
            OPCODE_NETWORK_STATUS => self.handle_network_status(tsbk, events),
            _ => {
                debug!("P25 TSBK opcode {:#04x} ignored", opcode);
                self.stats.unknown_opcodes += 1;
            }
        }
    }

    /// Opcode(6) | Options(8) | ChannelId(4) | ChannelNumber(12) |
    /// Talkgroup(16) | Source(24)
    fn handle_grant(&mut self, tsbk: &[u8], events: &mut dyn FnMut(DecoderEvent)) {
        let options = bits_to_u32(tsbk, 6, 8) as u8;
        let channel_id = bits_to_u32(tsbk, 14, 4) as u8;
        let channel = bits_to_u32(tsbk, 18, 12) as u16;
        let talkgroup = bits_to_u32(tsbk, 30, 16);
        let source = bits_to_u32(tsbk, 46, 24);

        let params = match self.channels.get(&channel_id) {
            Some(p) => p,
            None => {
                debug!(
                    "P25 grant for unknown identifier {}: tg={} dropped",
                    channel_id, talkgroup
                );
                self.stats.unresolved_grants += 1;
                return;
            }
        };

        let mut grant = CallGrant::group(talkgroup, source, params.rx_freq(channel));
        grant.encrypted = options & 0x40 != 0;

        info!(
            "P25 voice grant: tg={} src={} freq={} encrypted={}",
            grant.talkgroup, grant.radio_id, grant.frequency, grant.encrypted
        );
        events(DecoderEvent::Grant(grant));
    }

    /// Opcode(6) | Id(4) | BaseMultiplier(32) | Spacing(10) | Offset(10)
    fn handle_identifier_update(&mut self, tsbk: &[u8]) {
        let id = bits_to_u32(tsbk, 6, 4) as u8;
        let base = u64::from(bits_to_u32(tsbk, 10, 32));
        let spacing = bits_to_u32(tsbk, 42, 10);
        let offset = bits_to_u32(tsbk, 52, 10);

        debug!(
            "P25 identifier update: id={} base={} spacing={} offset={}",
            id, base, spacing, offset
        );

        self.channels.insert(id, ChannelParams { base, spacing, offset });
    }

    /// Opcode(6) | Wacn(20) | SysId(12)
    fn handle_network_status(&mut self, tsbk: &[u8], events: &mut dyn FnMut(DecoderEvent)) {
        self.wacn = bits_to_u32(tsbk, 6, 20);
        self.sysid = bits_to_u32(tsbk, 26, 12) as u16;

        info!(
            "P25 network status: nac={:#05x} wacn={:#07x} sysid={:#05x}",
            self.current_nac, self.wacn, self.sysid
        );

        events(DecoderEvent::SystemInfo(SystemInfo {
            system: SystemType::P25,
            system_id: self.wacn << 12 | u32::from(self.sysid),
            detail: SystemDetail::P25 {
                nac: self.current_nac,
                wacn: self.wacn,
                sysid: self.sysid,
            },
        }));
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::bits::u32_to_bits;

    /// Build one 1728-bit frame around a TSBK payload.
    pub fn build_frame(nac: u16, tsbk: &[u8]) -> Vec<u8> {
        assert_eq!(tsbk.len(), TSBK_BITS);

        let mut frame = vec![0u8; FRAME_BITS];

        for i in 0..48 {
            frame[i] = ((FRAME_SYNC >> (47 - i)) & 1) as u8;
        }

        u32_to_bits(u32::from(nac), &mut frame, NID_OFFSET, 12);
        u32_to_bits(u32::from(DUID_TSBK), &mut frame, NID_OFFSET + 60, 4);

        frame[TSBK_OFFSET..TSBK_OFFSET + TSBK_BITS].copy_from_slice(tsbk);
        frame
    }

    pub fn grant_tsbk(
        options: u8,
        channel_id: u8,
        channel: u16,
        talkgroup: u32,
        source: u32,
    ) -> Vec<u8> {
        let mut tsbk = vec![0u8; TSBK_BITS];
        u32_to_bits(u32::from(OPCODE_GROUP_VOICE_GRANT), &mut tsbk, 0, 6);
        u32_to_bits(u32::from(options), &mut tsbk, 6, 8);
        u32_to_bits(u32::from(channel_id), &mut tsbk, 14, 4);
        u32_to_bits(u32::from(channel), &mut tsbk, 18, 12);
        u32_to_bits(talkgroup, &mut tsbk, 30, 16);
        u32_to_bits(source, &mut tsbk, 46, 24);
        tsbk
    }

    pub fn identifier_tsbk(id: u8, base: u32, spacing: u32, offset: u32) -> Vec<u8> {
        let mut tsbk = vec![0u8; TSBK_BITS];
        u32_to_bits(u32::from(OPCODE_IDENTIFIER_UPDATE), &mut tsbk, 0, 6);
        u32_to_bits(u32::from(id), &mut tsbk, 6, 4);
        u32_to_bits(base, &mut tsbk, 10, 32);
        u32_to_bits(spacing, &mut tsbk, 42, 10);
        u32_to_bits(offset, &mut tsbk, 52, 10);
        tsbk
    }

    /// Frame bits as C4FM dibit symbols.
    pub fn to_symbols(bits: &[u8]) -> Vec<f32> {
        bits.chunks(2)
            .map(|pair| f32::from(pair[0] * 2 + pair[1]))
            .collect()
    }

    fn collect_events(decoder: &mut P25Decoder, symbols: &[f32]) -> Vec<DecoderEvent> {
        let mut events = Vec::new();
        decoder.process_symbols(symbols, &mut |e| events.push(e));
        events
    }

    #[test]
    fn test_identifier_then_grant() {
        let mut decoder = P25Decoder::new(0);

        // A grant before any identifier update resolves nothing.
        let orphan = build_frame(0x293, &grant_tsbk(0, 1, 5, 1234, 5678));
        let events = collect_events(&mut decoder, &to_symbols(&orphan));
        assert!(events.is_empty());
        assert_eq!(decoder.stats().unresolved_grants, 1);

        // Identifier update, then the identical grant resolves.
        let ident = build_frame(0x293, &identifier_tsbk(1, 170_000_000, 100, 0));
        assert!(collect_events(&mut decoder, &to_symbols(&ident)).is_empty());

        let grant = build_frame(0x293, &grant_tsbk(0, 1, 5, 1234, 5678));
        let events = collect_events(&mut decoder, &to_symbols(&grant));
        assert_eq!(events.len(), 1);

        match &events[0] {
            DecoderEvent::Grant(g) => {
                assert_eq!(g.frequency, 850_002_500);
                assert_eq!(g.talkgroup, 1234);
                assert_eq!(g.radio_id, 5678);
                assert!(!g.encrypted);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_encrypted_grant_flag() {
        let mut decoder = P25Decoder::new(0);

        let ident = build_frame(0x293, &identifier_tsbk(1, 170_000_000, 100, 0));
        collect_events(&mut decoder, &to_symbols(&ident));

        let grant = build_frame(0x293, &grant_tsbk(0x40, 1, 5, 1234, 5678));
        let events = collect_events(&mut decoder, &to_symbols(&grant));

        match &events[0] {
            DecoderEvent::Grant(g) => assert!(g.encrypted),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_sync_tolerance() {
        // Up to 4 errored sync bits still locks; 5 must not.
        for (errors, expect_lock) in [(4usize, true), (5, false)] {
            let mut decoder = P25Decoder::new(0);

            let mut frame = build_frame(0x293, &grant_tsbk(0, 1, 5, 1, 2));
            for i in 0..errors {
                frame[i] ^= 1;
            }

            collect_events(&mut decoder, &to_symbols(&frame));
            assert_eq!(decoder.locked(), expect_lock, "{} errors", errors);
        }
    }

    #[test]
    fn test_frame_alignment() {
        // 100 back-to-back frames decode with no sync slips.
        let mut decoder = P25Decoder::new(0);

        let mut stream = Vec::new();
        for _ in 0..100 {
            stream.extend(build_frame(0x293, &identifier_tsbk(2, 170_000_000, 100, 0)));
        }

        collect_events(&mut decoder, &to_symbols(&stream));
        assert_eq!(decoder.stats().frames_decoded, 100);
        assert_eq!(decoder.stats().sync_losses, 0);
    }

    #[test]
    fn test_nac_filter() {
        let mut decoder = P25Decoder::new(0x293);

        let ident = build_frame(0x111, &identifier_tsbk(1, 170_000_000, 100, 0));
        collect_events(&mut decoder, &to_symbols(&ident));
        assert_eq!(decoder.stats().frames_decoded, 0);

        let ident = build_frame(0x293, &identifier_tsbk(1, 170_000_000, 100, 0));
        collect_events(&mut decoder, &to_symbols(&ident));
        assert_eq!(decoder.stats().frames_decoded, 1);
    }

    #[test]
    fn test_network_status_broadcast() {
        let mut decoder = P25Decoder::new(0);

        let mut tsbk = vec![0u8; TSBK_BITS];
        u32_to_bits(u32::from(OPCODE_NETWORK_STATUS), &mut tsbk, 0, 6);
        u32_to_bits(0xBEE00, &mut tsbk, 6, 20);
        u32_to_bits(0x2F7, &mut tsbk, 26, 12);

        let frame = build_frame(0x293, &tsbk);
        let events = collect_events(&mut decoder, &to_symbols(&frame));

        match &events[0] {
            DecoderEvent::SystemInfo(info) => {
                assert_eq!(info.system, SystemType::P25);
                match info.detail {
                    SystemDetail::P25 { nac, wacn, sysid } => {
                        assert_eq!(nac, 0x293);
                        assert_eq!(wacn, 0xBEE00);
                        assert_eq!(sysid, 0x2F7);
                    }
                    ref other => panic!("unexpected detail {:?}", other),
                }
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_unknown_opcode_counted() {
        let mut decoder = P25Decoder::new(0);

        let mut tsbk = vec![0u8; TSBK_BITS];
        u32_to_bits(0x15, &mut tsbk, 0, 6);

        collect_events(&mut decoder, &to_symbols(&build_frame(0x293, &tsbk)));
        assert_eq!(decoder.stats().unknown_opcodes, 1);
    }

    #[test]
    fn test_reset_clears_identifier_table() {
        let mut decoder = P25Decoder::new(0);

        let ident = build_frame(0x293, &identifier_tsbk(1, 170_000_000, 100, 0));
        collect_events(&mut decoder, &to_symbols(&ident));
        decoder.reset();

        let grant = build_frame(0x293, &grant_tsbk(0, 1, 5, 1234, 5678));
        let events = collect_events(&mut decoder, &to_symbols(&grant));
        assert!(events.is_empty());
        assert_eq!(decoder.stats().unresolved_grants, 1);
    }
}
