//! Fixed values shared across the call pipeline.
//!
//! All timing and sizing constants the bridge, synthesizer and call manager
//! depend on live here. Do not hardcode sample rates or timeouts elsewhere.

/// µ-law telephony audio is always 8 kHz mono.
pub const SAMPLE_RATE_HZ: u32 = 8000;

/// One media-stream frame: 160 bytes of µ-law = 20ms at 8kHz.
pub const FRAME_BYTES: usize = 160;

pub const FRAME_DURATION_MS: u64 = 20;

/// µ-law silence byte (all-ones sign+magnitude encodes zero amplitude).
pub const MULAW_SILENCE: u8 = 0xFF;

pub const DEFAULT_TONE_MS: u64 = 100;
pub const DEFAULT_GAP_MS: u64 = 80;
pub const DTMF_WAIT_SILENCE_MS: u64 = 500;

/// DTMF tone amplitude, scaled down from full-scale i16 so the two summed
/// sinusoids never clip.
pub const DTMF_AMPLITUDE: f32 = 0.65 * 16384.0;

pub const PREFLIGHT_TIMEOUT_MS: u64 = 4_000;
pub const PREFLIGHT_CACHE_SECONDS: u64 = 30;

pub const HANGUP_BARRIER_TIMEOUT_MS: u64 = 30_000;
pub const DTMF_BARRIER_TIMEOUT_MS: u64 = 5_000;

pub const MODEL_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const MODEL_SESSION_UPDATE_DELAY_MS: u64 = 250;
pub const MODEL_GREETING_DELAY_MS: u64 = 100;

pub const STALE_RECORD_MAX_AGE_SECONDS: i64 = 300;

pub const DEFAULT_SERVE_PORT: u16 = 3334;
pub const DEFAULT_SERVE_BIND: &str = "127.0.0.1";
pub const DEFAULT_WEBHOOK_PATH: &str = "/voice/webhook";
pub const DEFAULT_STREAM_PATH: &str = "/voice/stream";

pub const DEFAULT_MAX_CONCURRENT_CALLS: u32 = 1;
pub const DEFAULT_MAX_DURATION_SECONDS: u64 = 300;

pub const DEFAULT_SILENCE_DURATION_MS: u64 = 800;
pub const DEFAULT_VAD_THRESHOLD: f32 = 0.5;

pub const SELF_TEST_HEADER: &str = "x-supercall-self-test";
pub const TWILIO_SIGNATURE_HEADER: &str = "X-Twilio-Signature";

pub const BOOT_SECRET_BYTES: usize = 24;
