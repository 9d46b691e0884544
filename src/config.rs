//! Configuration document loading and validation.
//!
//! The configuration is a JSON document with `sdr`, `system`, `audio`,
//! and `talkgroups` sections. Missing sections fall back to defaults;
//! a missing control-channel list is fatal.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::consts::{AUDIO_SAMPLE_RATE, SDR_SAMPLE_RATE};
use crate::error::{Error, Result};
use crate::types::{Frequency, Priority, SystemType, TalkgroupId};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub sdr: SdrConfig,
    pub system: SystemConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub talkgroups: TalkgroupConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SdrConfig {
    pub device_index: u32,
    pub sample_rate: u32,
    pub ppm_correction: i32,
    pub gain: Gain,
}

impl Default for SdrConfig {
    fn default() -> Self {
        SdrConfig {
            device_index: 0,
            sample_rate: SDR_SAMPLE_RATE,
            ppm_correction: 0,
            gain: Gain::Auto,
        }
    }
}

/// Tuner gain: hardware AGC (the literal string `"auto"`) or a fixed
/// value in dB.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Gain {
    Auto,
    Db(f64),
}

impl Default for Gain {
    fn default() -> Self {
        Gain::Auto
    }
}

impl Serialize for Gain {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match *self {
            Gain::Auto => s.serialize_str("auto"),
            Gain::Db(db) => s.serialize_f64(db),
        }
    }
}

impl<'de> Deserialize<'de> for Gain {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Gain, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Db(f64),
            Word(String),
        }

        match Raw::deserialize(d)? {
            Raw::Db(db) => Ok(Gain::Db(db)),
            Raw::Word(ref w) if w == "auto" => Ok(Gain::Auto),
            Raw::Word(w) => Err(serde::de::Error::custom(format!("invalid gain {:?}", w))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    #[serde(rename = "type")]
    pub system_type: SystemType,
    #[serde(default)]
    pub system_id: u32,
    #[serde(default)]
    pub nac: u16,
    #[serde(default)]
    pub wacn: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub control_channels: Vec<Frequency>,
    /// DMR expected color code.
    #[serde(default)]
    pub color_code: Option<u8>,
    /// SmartNet/DMR band plan base frequency (Hz).
    #[serde(default)]
    pub base_frequency: Option<Frequency>,
    /// SmartNet/DMR band plan channel spacing (Hz).
    #[serde(default)]
    pub channel_spacing: Option<u32>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            system_type: SystemType::P25,
            system_id: 0,
            nac: 0,
            wacn: 0,
            name: String::new(),
            control_channels: Vec::new(),
            color_code: None,
            base_frequency: None,
            channel_spacing: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AudioConfig {
    pub output_device: String,
    pub sample_rate: u32,
    pub codec: Codec,
    pub record_calls: bool,
    pub recording_path: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            output_device: "default".to_owned(),
            sample_rate: AUDIO_SAMPLE_RATE,
            codec: Codec::Imbe,
            record_calls: false,
            recording_path: "/tmp".to_owned(),
        }
    }
}

/// Voice codec back-end selection. Codecs themselves are external
/// collaborators behind the frame-in/PCM-out seam.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    Imbe,
    Ambe,
    Provoice,
    Dmr,
    Codec2,
    Fm,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TalkgroupConfig {
    /// Talkgroups admitted by the tracker. Empty means allow all.
    pub enabled: Vec<TalkgroupId>,
    pub priority: HashMap<TalkgroupId, Priority>,
    pub labels: HashMap<TalkgroupId, String>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("unable to read {}: {}", path.as_ref().display(), e))
        })?;
        Config::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config> {
        let config: Config =
            serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.system.control_channels.is_empty() {
            return Err(Error::Config("no control channels configured".into()));
        }

        match self.system.system_type {
            SystemType::Nxdn | SystemType::Edacs | SystemType::Ltr => Err(Error::Config(
                format!("unsupported system type: {}", self.system.system_type.name()),
            )),
            _ => Ok(()),
        }
    }
}
