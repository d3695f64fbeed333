use crate::defaults;
use crate::dsp::chain::TapPoint;
use crate::error::{RelayError, Result};
use crate::radio::Designator;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub listen_address: String,
    pub listen_port_base: u16,
    pub sample_rate: u32,
    pub ptt_timeout_ms: u64,
    pub data_store_path: PathBuf,
    pub disk_writer: DiskWriterConfig,
    pub filters: FilterConfig,
    pub backend: Option<BackendConfig>,
    pub channelizers: Vec<ChannelizerConfig>,
    pub channels: Vec<ChannelConfig>,
}

/// Session archive configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiskWriterConfig {
    pub enabled: bool,
    pub minimum_record_secs: f64,
    /// Tap points to archive: `output`, `raw`, `ctcss_removed`, `highpass`, `lowpass`.
    pub streams: Vec<String>,
}

/// Voice filter chain parameters, shared by all channels
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    pub highpass_hz: f64,
    pub highpass_order: usize,
    pub lowpass_hz: f64,
    pub lowpass_order: usize,
    pub ctcss_notch_bandwidth_hz: f64,
}

/// Downstream voice backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default = "default_backend_sample_rate")]
    pub sample_rate: u32,
    /// Also archive what the backend receives, as `*_backend.wav`.
    #[serde(default)]
    pub debug_capture: bool,
}

/// One channelizer process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelizerConfig {
    #[serde(default = "default_channelizer_program")]
    pub program: String,
    pub config_file: PathBuf,
    /// Replaces the default `-F -c <config_file>` argument list.
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default = "default_ready_patterns")]
    pub ready_patterns: Vec<String>,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: f64,
    #[serde(default)]
    pub name: Option<String>,
}

/// One radio channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    /// Frequency in MHz
    pub freq: f64,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    /// CTCSS tone in Hz
    #[serde(default)]
    pub ctcss: Option<f64>,
    #[serde(default)]
    pub designator: Option<String>,
    #[serde(default)]
    pub udp_port: Option<u16>,
    #[serde(default = "default_true")]
    pub forward: bool,
}

/// A channel with its id, port and designator settled.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedChannel {
    pub id: String,
    pub label: String,
    pub freq_mhz: f64,
    pub ctcss: Option<f64>,
    pub designator: Option<Designator>,
    pub udp_port: u16,
    pub forward: bool,
}

impl ResolvedChannel {
    /// Output gain for forwarded audio, derived from the designator.
    pub fn output_gain(&self) -> f32 {
        self.designator
            .as_ref()
            .map(Designator::output_gain)
            .unwrap_or(1.0)
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{:>9.4} MHz  {:<24} {:<14} udp/{}",
            self.freq_mhz, self.label, self.id, self.udp_port
        )
    }
}

fn default_true() -> bool {
    true
}

fn default_backend_sample_rate() -> u32 {
    defaults::BACKEND_SAMPLE_RATE
}

fn default_channelizer_program() -> String {
    defaults::CHANNELIZER_PROGRAM.to_string()
}

fn default_ready_patterns() -> Vec<String> {
    defaults::READY_PATTERNS
        .iter()
        .map(|p| p.to_string())
        .collect()
}

fn default_ready_timeout_secs() -> f64 {
    defaults::READY_TIMEOUT_SECS
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_address: defaults::LISTEN_ADDRESS.to_string(),
            listen_port_base: defaults::LISTEN_PORT_BASE,
            sample_rate: defaults::SAMPLE_RATE,
            ptt_timeout_ms: defaults::PTT_TIMEOUT_MS,
            data_store_path: PathBuf::from(defaults::DATA_STORE_PATH),
            disk_writer: DiskWriterConfig::default(),
            filters: FilterConfig::default(),
            backend: None,
            channelizers: Vec::new(),
            channels: Vec::new(),
        }
    }
}

impl Default for DiskWriterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            minimum_record_secs: defaults::MINIMUM_RECORD_SECS,
            streams: vec![defaults::DISK_STREAM.to_string()],
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            highpass_hz: defaults::HIGHPASS_HZ,
            highpass_order: defaults::HIGHPASS_ORDER,
            lowpass_hz: defaults::LOWPASS_HZ,
            lowpass_order: defaults::LOWPASS_ORDER,
            ctcss_notch_bandwidth_hz: defaults::CTCSS_NOTCH_BANDWIDTH_HZ,
        }
    }
}

impl ChannelizerConfig {
    pub fn new(config_file: impl Into<PathBuf>) -> Self {
        Self {
            program: default_channelizer_program(),
            config_file: config_file.into(),
            args: None,
            ready_patterns: default_ready_patterns(),
            ready_timeout_secs: default_ready_timeout_secs(),
            name: None,
        }
    }

    /// Display name, falling back to the program's file name.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        Path::new(&self.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone())
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        if self.ready_timeout_secs > 0.0 && self.ready_timeout_secs.is_finite() {
            Some(Duration::from_secs_f64(self.ready_timeout_secs))
        } else {
            None
        }
    }
}

impl ChannelConfig {
    pub fn new(freq: f64) -> Self {
        Self {
            freq,
            id: None,
            mode: None,
            label: None,
            ctcss: None,
            designator: None,
            udp_port: None,
            forward: true,
        }
    }

    /// Configured id, or `{mode}_{freq:.3}` with the decimal point removed.
    pub fn channel_id(&self) -> String {
        if let Some(id) = &self.id {
            return id.clone();
        }
        let mode = self.mode.as_deref().unwrap_or("ch");
        format!("{}_{:.3}", mode, self.freq).replace('.', "")
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    ///
    /// Missing optional fields use default values; missing required fields
    /// fail with the field name.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RelayError::ConfigFileNotFound {
                path: path.display().to_string(),
            });
        }
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - AIRBAND_RELAY_DATA_STORE → data_store_path
    /// - AIRBAND_RELAY_LISTEN_ADDRESS → listen_address
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var("AIRBAND_RELAY_DATA_STORE")
            && !path.is_empty()
        {
            self.data_store_path = PathBuf::from(path);
        }

        if let Ok(address) = std::env::var("AIRBAND_RELAY_LISTEN_ADDRESS")
            && !address.is_empty()
        {
            self.listen_address = address;
        }

        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/airband-relay/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("airband-relay")
            .join("config.toml")
    }

    pub fn ptt_timeout(&self) -> Duration {
        Duration::from_millis(self.ptt_timeout_ms)
    }

    /// Settles ids, ports and designators for every channel.
    ///
    /// Channels without a port take the next free one from
    /// `listen_port_base`, skipping ports claimed explicitly.
    pub fn resolve_channels(&self) -> Result<Vec<ResolvedChannel>> {
        let mut taken: HashSet<u16> = self.channels.iter().filter_map(|c| c.udp_port).collect();
        let mut next_port = self.listen_port_base;
        let mut resolved = Vec::with_capacity(self.channels.len());

        for (index, channel) in self.channels.iter().enumerate() {
            let udp_port = match channel.udp_port {
                Some(port) => port,
                None => {
                    while taken.contains(&next_port) {
                        next_port = next_port.checked_add(1).ok_or_else(|| invalid(
                            format!("channels[{}].udp_port", index),
                            "no free UDP port left above listen_port_base",
                        ))?;
                    }
                    taken.insert(next_port);
                    next_port
                }
            };

            let designator = channel
                .designator
                .as_deref()
                .map(Designator::decode)
                .transpose()?;

            let id = channel.channel_id();
            resolved.push(ResolvedChannel {
                label: channel.label.clone().unwrap_or_else(|| id.clone()),
                id,
                freq_mhz: channel.freq,
                ctcss: channel.ctcss,
                designator,
                udp_port,
                forward: channel.forward,
            });
        }

        Ok(resolved)
    }

    /// Checks values serde cannot: ranges, duplicates and names.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(invalid("sample_rate", "must be positive"));
        }
        let nyquist = self.sample_rate as f64 / 2.0;

        if let Some(backend) = &self.backend
            && backend.sample_rate == 0
        {
            return Err(invalid("backend.sample_rate", "must be positive"));
        }

        let min = self.disk_writer.minimum_record_secs;
        if !min.is_finite() || min < 0.0 {
            return Err(invalid(
                "disk_writer.minimum_record_secs",
                "must be zero or positive",
            ));
        }
        for stream in &self.disk_writer.streams {
            if TapPoint::parse(stream).is_none() {
                return Err(invalid(
                    "disk_writer.streams",
                    &format!("unknown stream '{}'", stream),
                ));
            }
        }

        let filters = &self.filters;
        for (key, hz) in [
            ("filters.highpass_hz", filters.highpass_hz),
            ("filters.lowpass_hz", filters.lowpass_hz),
        ] {
            if !(hz > 0.0 && hz < nyquist) {
                return Err(invalid(
                    key,
                    &format!("{} Hz must be between 0 and Nyquist ({} Hz)", hz, nyquist),
                ));
            }
        }
        if filters.highpass_order == 0 || filters.lowpass_order == 0 {
            return Err(invalid("filters", "filter orders must be at least 1"));
        }
        if filters.ctcss_notch_bandwidth_hz <= 0.0 {
            return Err(invalid("filters.ctcss_notch_bandwidth_hz", "must be positive"));
        }

        for (index, channelizer) in self.channelizers.iter().enumerate() {
            for pattern in &channelizer.ready_patterns {
                if let Err(e) = regex::Regex::new(pattern) {
                    return Err(invalid(
                        &format!("channelizers[{}].ready_patterns", index),
                        &e.to_string(),
                    ));
                }
            }
        }

        for (index, channel) in self.channels.iter().enumerate() {
            if !(channel.freq > 0.0) {
                return Err(invalid(&format!("channels[{}].freq", index), "must be positive"));
            }
            if let Some(tone) = channel.ctcss
                && !(tone > 0.0 && tone < nyquist)
            {
                return Err(invalid(
                    &format!("channels[{}].ctcss", index),
                    &format!("{} Hz must be between 0 and Nyquist ({} Hz)", tone, nyquist),
                ));
            }
        }

        let channels = self.resolve_channels()?;
        let mut ids = HashSet::new();
        let mut ports = HashSet::new();
        for channel in &channels {
            if !ids.insert(channel.id.as_str()) {
                return Err(invalid(
                    "channels",
                    &format!("duplicate channel id '{}'", channel.id),
                ));
            }
            // Port 0 lets the OS pick, so it never collides.
            if channel.udp_port != 0 && !ports.insert(channel.udp_port) {
                return Err(invalid(
                    "channels",
                    &format!("duplicate UDP port {}", channel.udp_port),
                ));
            }
        }

        Ok(())
    }
}

fn invalid(key: impl AsRef<str>, message: impl AsRef<str>) -> RelayError {
    RelayError::ConfigInvalidValue {
        key: key.as_ref().to_string(),
        message: message.as_ref().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_relay_env() {
        remove_env("AIRBAND_RELAY_DATA_STORE");
        remove_env("AIRBAND_RELAY_LISTEN_ADDRESS");
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = AppConfig::default();

        assert_eq!(config.listen_address, "127.0.0.1");
        assert_eq!(config.listen_port_base, 6000);
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.ptt_timeout(), Duration::from_millis(120));
        assert_eq!(config.data_store_path, PathBuf::from("/opt/data/radio_channels"));

        assert!(config.disk_writer.enabled);
        assert_eq!(config.disk_writer.minimum_record_secs, 0.3);
        assert_eq!(config.disk_writer.streams, vec!["output".to_string()]);

        assert_eq!(config.filters.highpass_hz, 275.0);
        assert_eq!(config.filters.lowpass_order, 40);
        assert!(config.backend.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let toml_content = r#"
            listen_port_base = 7000
            data_store_path = "/tmp/radio"

            [disk_writer]
            minimum_record_secs = 0.5
            streams = ["output", "raw"]

            [backend]
            remote_host = "voice.local"
            remote_port = 64738

            [[channelizers]]
            config_file = "/etc/rtl_airband.conf"

            [[channels]]
            freq = 154.43
            mode = "fm"
            label = "Fire Dispatch"
            ctcss = 100.0
            designator = "11K2F3E"

            [[channels]]
            freq = 155.1
            udp_port = 7100
            forward = false
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = AppConfig::load(temp_file.path()).unwrap();

        assert_eq!(config.listen_port_base, 7000);
        assert_eq!(config.data_store_path, PathBuf::from("/tmp/radio"));
        assert_eq!(config.disk_writer.minimum_record_secs, 0.5);
        assert_eq!(config.disk_writer.streams, vec!["output", "raw"]);

        let backend = config.backend.as_ref().unwrap();
        assert_eq!(backend.remote_host, "voice.local");
        assert_eq!(backend.sample_rate, 48000);

        let channelizer = &config.channelizers[0];
        assert_eq!(channelizer.program, "/usr/local/bin/rtl_airband");
        assert_eq!(channelizer.ready_timeout_secs, 5.0);
        assert_eq!(channelizer.display_name(), "rtl_airband");

        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].ctcss, Some(100.0));
        assert!(config.channels[0].forward);
        assert!(!config.channels[1].forward);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let result = AppConfig::load(Path::new("/nonexistent/airband-relay.toml"));
        assert!(matches!(result, Err(RelayError::ConfigFileNotFound { .. })));
    }

    #[test]
    fn test_missing_required_field_names_it() {
        let err = AppConfig::from_toml_str("[[channels]]\nlabel = \"Tower\"\n").unwrap_err();
        assert!(err.to_string().contains("freq"), "got: {}", err);

        let err = AppConfig::from_toml_str("[backend]\nremote_host = \"x\"\n").unwrap_err();
        assert!(err.to_string().contains("remote_port"), "got: {}", err);

        let err = AppConfig::from_toml_str("[[channelizers]]\nname = \"a\"\n").unwrap_err();
        assert!(err.to_string().contains("config_file"), "got: {}", err);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(AppConfig::from_toml_str("listen_port_base = \"many\"").is_err());
    }

    #[test]
    fn test_channel_id_generation() {
        let mut channel = ChannelConfig::new(154.43);
        channel.mode = Some("fm".to_string());
        assert_eq!(channel.channel_id(), "fm_154430");

        assert_eq!(ChannelConfig::new(121.5).channel_id(), "ch_121500");

        channel.id = Some("dispatch".to_string());
        assert_eq!(channel.channel_id(), "dispatch");
    }

    #[test]
    fn test_ports_assigned_around_explicit_ones() {
        let mut config = AppConfig::default();
        let mut fixed = ChannelConfig::new(155.0);
        fixed.udp_port = Some(6001);
        config.channels = vec![
            ChannelConfig::new(154.0),
            fixed,
            ChannelConfig::new(156.0),
            ChannelConfig::new(157.0),
        ];

        let ports: Vec<u16> = config
            .resolve_channels()
            .unwrap()
            .iter()
            .map(|c| c.udp_port)
            .collect();

        assert_eq!(ports, vec![6000, 6001, 6002, 6003]);
    }

    #[test]
    fn test_resolved_channel_gain_and_label() {
        let mut config = AppConfig::default();
        let mut channel = ChannelConfig::new(154.43);
        channel.designator = Some("16K0F3E".to_string());
        config.channels = vec![channel];

        let resolved = config.resolve_channels().unwrap();
        assert_eq!(resolved[0].label, "ch_154430");
        assert_eq!(resolved[0].output_gain(), 1.5);
        assert!(resolved[0].summary_line().contains("udp/6000"));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let mut config = AppConfig::default();
        config.channels = vec![ChannelConfig::new(154.43), ChannelConfig::new(154.43)];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate channel id"));
    }

    #[test]
    fn test_validate_rejects_duplicate_ports() {
        let mut config = AppConfig::default();
        let mut a = ChannelConfig::new(154.0);
        a.udp_port = Some(6500);
        let mut b = ChannelConfig::new(155.0);
        b.udp_port = Some(6500);
        config.channels = vec![a, b];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate UDP port 6500"));
    }

    #[test]
    fn test_validate_accepts_several_ephemeral_ports() {
        let mut config = AppConfig::default();
        let mut a = ChannelConfig::new(154.0);
        a.udp_port = Some(0);
        let mut b = ChannelConfig::new(155.0);
        b.udp_port = Some(0);
        config.channels = vec![a, b];
        assert!(config.validate().is_ok());
        let resolved = config.resolve_channels().unwrap();
        assert!(resolved.iter().all(|c| c.udp_port == 0));
    }

    #[test]
    fn test_validate_rejects_unknown_stream() {
        let mut config = AppConfig::default();
        config.disk_writer.streams = vec!["bandpass".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_cutoff_above_nyquist() {
        let mut config = AppConfig::default();
        config.filters.lowpass_hz = 8000.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("filters.lowpass_hz"));
    }

    #[test]
    fn test_validate_rejects_bad_designator_and_ctcss() {
        let mut config = AppConfig::default();
        let mut channel = ChannelConfig::new(154.0);
        channel.designator = Some("bogus".to_string());
        config.channels = vec![channel];
        assert!(matches!(
            config.validate(),
            Err(RelayError::Designator { .. })
        ));

        let mut channel = ChannelConfig::new(154.0);
        channel.ctcss = Some(9000.0);
        config.channels = vec![channel];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_negative_minimum() {
        let mut config = AppConfig::default();
        config.disk_writer.minimum_record_secs = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_ready_pattern() {
        let mut config = AppConfig::default();
        let mut channelizer = ChannelizerConfig::new("/tmp/a.conf");
        channelizer.ready_patterns = vec!["(unclosed".to_string()];
        config.channelizers = vec![channelizer];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override_data_store() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_relay_env();

        set_env("AIRBAND_RELAY_DATA_STORE", "/srv/radio");
        let config = AppConfig::default().with_env_overrides();
        assert_eq!(config.data_store_path, PathBuf::from("/srv/radio"));

        clear_relay_env();
    }

    #[test]
    fn test_env_override_ignores_empty_values() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_relay_env();

        set_env("AIRBAND_RELAY_LISTEN_ADDRESS", "");
        let config = AppConfig::default().with_env_overrides();
        assert_eq!(config.listen_address, "127.0.0.1");

        set_env("AIRBAND_RELAY_LISTEN_ADDRESS", "0.0.0.0");
        let config = AppConfig::default().with_env_overrides();
        assert_eq!(config.listen_address, "0.0.0.0");

        clear_relay_env();
    }

    #[test]
    fn test_default_path_ends_with_app_dir() {
        let path = AppConfig::default_path();
        assert!(path.ends_with("airband-relay/config.toml"));
    }

    #[test]
    fn test_ready_timeout_disabled_when_not_positive() {
        let mut channelizer = ChannelizerConfig::new("/tmp/a.conf");
        assert_eq!(channelizer.ready_timeout(), Some(Duration::from_secs(5)));
        channelizer.ready_timeout_secs = 0.0;
        assert_eq!(channelizer.ready_timeout(), None);
    }
}
