//! Defaults shared by configuration, DSP and process supervision.

/// Default channelizer output sample rate in Hz.
///
/// The channelizer emits 32-bit float PCM at 16kHz per channel.
pub const SAMPLE_RATE: u32 = 16000;

/// Default voice backend sample rate in Hz.
pub const BACKEND_SAMPLE_RATE: u32 = 48000;

/// Inactivity window in milliseconds after which a transmission is considered ended.
///
/// The channelizer stops sending datagrams when squelch closes, so a short
/// gap is enough to detect key-down.
pub const PTT_TIMEOUT_MS: u64 = 120;

/// Minimum archived session length in seconds.
///
/// Shorter bursts (squelch pops, kerchunks) are discarded instead of written.
pub const MINIMUM_RECORD_SECS: f64 = 0.3;

/// Default UDP listen address for channel streams.
pub const LISTEN_ADDRESS: &str = "127.0.0.1";

/// First UDP port handed out to channels without an explicit port.
pub const LISTEN_PORT_BASE: u16 = 6000;

/// Default root directory for archived transmissions.
pub const DATA_STORE_PATH: &str = "/opt/data/radio_channels";

/// Expected datagram size from the channelizer (2000 samples of f32).
pub const EXPECTED_DATAGRAM_BYTES: usize = 8000;

/// Default channelizer executable.
pub const CHANNELIZER_PROGRAM: &str = "/usr/local/bin/rtl_airband";

/// Seconds to wait for the channelizer to report readiness before warning.
pub const READY_TIMEOUT_SECS: f64 = 5.0;

/// Log lines that indicate the channelizer is streaming.
pub const READY_PATTERNS: &[&str] = &[r"^Allocating [0-9]+ zero-copy buffers$"];

/// Highpass cutoff in Hz, removes sub-audible tones and rumble.
pub const HIGHPASS_HZ: f64 = 275.0;

/// Highpass filter order.
pub const HIGHPASS_ORDER: usize = 40;

/// Lowpass cutoff in Hz, the top of the voice band.
pub const LOWPASS_HZ: f64 = 3500.0;

/// Lowpass filter order.
pub const LOWPASS_ORDER: usize = 40;

/// Notch bandwidth in Hz used to derive the CTCSS notch Q factor.
pub const CTCSS_NOTCH_BANDWIDTH_HZ: f64 = 20.0;

/// Samples per resampler chunk (10ms at 16kHz).
pub const RESAMPLER_CHUNK: usize = 160;

/// Disk stream archived when none are configured.
pub const DISK_STREAM: &str = "output";

/// How long readers may keep draining output after the process exits.
///
/// A background child can inherit the pipes and hold them open long after
/// the supervised process is gone.
pub const OUTPUT_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(500);
