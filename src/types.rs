//! Cross-protocol data model: grants, system information, audio frames.

use serde::{Deserialize, Serialize};

/// Frequency in Hz.
pub type Frequency = u64;
/// Addressed destination group for a call.
pub type TalkgroupId = u32;
/// Individual radio identity.
pub type RadioId = u32;
/// Call priority, higher is more important.
pub type Priority = u8;

/// Trunking family selected by configuration.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemType {
    P25,
    P25Phase2,
    Smartnet,
    Smartzone,
    Dmr,
    Nxdn,
    Tetra,
    Edacs,
    Ltr,
}

impl SystemType {
    /// Human-readable name for logs and the status line.
    pub fn name(self) -> &'static str {
        match self {
            SystemType::P25 => "P25 Phase 1",
            SystemType::P25Phase2 => "P25 Phase 2",
            SystemType::Smartnet => "Motorola SmartNet",
            SystemType::Smartzone => "Motorola SmartZone",
            SystemType::Dmr => "DMR",
            SystemType::Nxdn => "NXDN",
            SystemType::Tetra => "TETRA",
            SystemType::Edacs => "EDACS",
            SystemType::Ltr => "LTR",
        }
    }
}

/// Call classification carried on every grant.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CallType {
    Group,
    Private,
    Emergency,
    Encrypted,
}

/// Air-interface encryption indicated by the control channel.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EncryptionType {
    None,
    Tea1,
    Tea2,
    Tea3,
    Tea4,
    Unknown,
}

impl EncryptionType {
    pub fn is_encrypted(self) -> bool {
        !matches!(self, EncryptionType::None)
    }
}

/// A control-channel message assigning a talkgroup to a traffic frequency.
///
/// This is the canonical cross-protocol event; protocol decoders fill in
/// whatever their air interface provides and leave the rest at defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct CallGrant {
    pub talkgroup: TalkgroupId,
    pub radio_id: RadioId,
    pub frequency: Frequency,
    pub call_type: CallType,
    pub priority: Priority,
    /// Wall-clock milliseconds when the grant was decoded.
    pub timestamp: u64,
    pub encrypted: bool,
    /// Specific algorithm where the protocol signals one (TETRA).
    pub encryption: EncryptionType,
    /// DMR/TETRA color code, if carried.
    pub color_code: Option<u8>,
    /// TDMA slot for two-slot systems.
    pub slot: Option<u8>,
}

impl CallGrant {
    /// Group call with default priority; the common decoder output.
    pub fn group(talkgroup: TalkgroupId, radio_id: RadioId, frequency: Frequency) -> Self {
        CallGrant {
            talkgroup,
            radio_id,
            frequency,
            call_type: CallType::Group,
            priority: 5,
            timestamp: 0,
            encrypted: false,
            encryption: EncryptionType::None,
            color_code: None,
            slot: None,
        }
    }
}

/// Protocol-specific network identity, published when the control channel
/// broadcasts it.
#[derive(Clone, Debug, PartialEq)]
pub struct SystemInfo {
    pub system: SystemType,
    /// Canonical identifier; for TETRA this is `(mcc << 16) | mnc`.
    pub system_id: u32,
    pub detail: SystemDetail,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SystemDetail {
    P25 {
        nac: u16,
        wacn: u32,
        sysid: u16,
    },
    Tetra {
        mcc: u16,
        mnc: u16,
        color_code: u8,
        location_area: u16,
        network_name: Option<String>,
        emergency_services: bool,
    },
    Dmr {
        color_code: u8,
        rest_channel: Option<Frequency>,
    },
    Smartnet {
        base_frequency: Frequency,
        channel_spacing: u32,
    },
}

/// Decoded PCM destined for the playback queue.
#[derive(Clone, Debug)]
pub struct AudioFrame {
    /// 8 kHz mono signed 16-bit samples.
    pub samples: Vec<i16>,
    pub talkgroup: TalkgroupId,
    pub radio_id: RadioId,
    pub timestamp: u64,
    pub rssi: f32,
}

/// Everything a protocol decoder can report upward. Posted to the
/// controller's inbox; decoders never call back into upstream stages.
#[derive(Clone, Debug)]
pub enum DecoderEvent {
    Grant(CallGrant),
    SystemInfo(SystemInfo),
    /// Explicit protocol-level call termination.
    CallEnd(TalkgroupId),
    /// TETRA short data service payload.
    ShortData(String),
    /// Reassembled DMR talker alias for a destination talkgroup.
    TalkerAlias(TalkgroupId, String),
}
