/// Number of sample buffers in flight between reader and demodulator.
pub const BUF_COUNT: usize = 16;
/// Size of each complex sample buffer delivered by a source.
pub const BUF_SAMPLES: usize = 16384;

/// Default SDR sample rate (Hz).
pub const SDR_SAMPLE_RATE: u32 = 2_048_000;
/// Audio output sample rate (Hz), 16-bit signed mono.
pub const AUDIO_SAMPLE_RATE: u32 = 8_000;
/// Samples per 20 ms audio frame at 8 kHz.
pub const AUDIO_FRAME_SAMPLES: usize = 160;

/// P25 C4FM symbol rate (symbols/sec).
pub const P25_SYMBOL_RATE: u32 = 4800;
/// DMR symbol rate (symbols/sec).
pub const DMR_SYMBOL_RATE: u32 = 4800;
/// SmartNet control channel baud rate.
pub const SMARTNET_SYMBOL_RATE: u32 = 3600;
/// TETRA symbol rate (symbols/sec).
pub const TETRA_SYMBOL_RATE: u32 = 18_000;

/// Inactive call timeout (ms).
pub const CALL_TIMEOUT_MS: u64 = 5_000;
/// Inactive-call sweep interval (ms).
pub const CALL_SWEEP_MS: u64 = 1_000;
/// Status line interval (ms).
pub const STATUS_INTERVAL_MS: u64 = 10_000;

/// Playback queue high-water mark (frames); oldest dropped beyond this.
pub const PLAYBACK_HIGH_WATER: usize = 64;
