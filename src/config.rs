//! Configuration loading using Figment
//!
//! Configuration is merged from:
//! 1. `config/ccd_capture.toml` (or an explicit path)
//! 2. Environment variables prefixed with `CCD_CAPTURE_`, nested keys split on `__`
//!
//! Every section carries serde defaults, so a missing file still yields a usable config.
//!
//! # Example
//! ```no_run
//! use ccd_capture::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), figment::Error>(())
//! ```

use crate::color::debayer::BayerPattern;
use crate::color::lut::GainGrid;
use crate::session::mode::StreamingMode;
use crate::data::telemetry::LocalZone;
use chrono::FixedOffset;
use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/ccd_capture.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Session sequencing and timeouts
    #[serde(default)]
    pub session: SessionConfig,
    /// Shared frame buffer placement
    #[serde(default)]
    pub buffers: BufferConfig,
    /// Gain LUT cache and software color processing
    #[serde(default)]
    pub color: ColorConfig,
    /// GPS telemetry decoding
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Maximum rate at which live frames are handed to the display
    #[serde(default = "default_max_display_fps")]
    pub max_display_fps: f64,
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a reconfiguration waits for the worker to acknowledge a pause
    #[serde(default = "default_pause_ack_timeout")]
    pub pause_ack_timeout_ms: u64,
    /// How long the controller waits for any other awaited response
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// Directory holding the vendor SDK, forwarded with `init_resource`
    #[serde(default)]
    pub sdk_path: String,
    /// Readout mode name passed to `init_camera`
    #[serde(default = "default_readout_mode")]
    pub readout_mode: String,
    /// Mode entered right after a successful connect
    #[serde(default = "default_initial_mode")]
    pub initial_mode: StreamingMode,
    /// Capacity of the drop-oldest frame mailbox
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

/// Shared memory region configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Directory in which the two frame regions are created
    #[serde(default = "default_shm_dir")]
    pub shm_dir: PathBuf,
    /// Prefix for region names
    #[serde(default = "default_region_prefix")]
    pub region_prefix: String,
}

/// Color pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorConfig {
    /// Location of the persisted gain LUT cache
    #[serde(default = "default_lut_cache_path")]
    pub lut_cache_path: PathBuf,
    /// First gain on the LUT grid
    #[serde(default)]
    pub gain_start: f64,
    /// Last gain on the LUT grid
    #[serde(default = "default_gain_end")]
    pub gain_end: f64,
    /// Spacing of the LUT grid
    #[serde(default = "default_gain_step")]
    pub gain_step: f64,
    /// Software debayer applied to 2-D live frames from a color sensor
    #[serde(default)]
    pub bayer_pattern: BayerPattern,
}

/// Telemetry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Zone used to localize GPS timestamps: an IANA name such as `America/New_York`
    /// (daylight saving applied), or a fixed `+HH:MM` / `-HH:MM` offset
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
}

// Default value functions
fn default_name() -> String {
    "CCD Capture".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_display_fps() -> f64 {
    30.0
}

fn default_pause_ack_timeout() -> u64 {
    3000
}

fn default_response_timeout() -> u64 {
    10_000
}

fn default_readout_mode() -> String {
    "STANDARD MODE".to_string()
}

fn default_initial_mode() -> StreamingMode {
    StreamingMode::Idle
}

fn default_mailbox_capacity() -> usize {
    4
}

fn default_shm_dir() -> PathBuf {
    let shm = PathBuf::from("/dev/shm");
    if shm.is_dir() {
        shm
    } else {
        std::env::temp_dir()
    }
}

fn default_region_prefix() -> String {
    "ccd_capture".to_string()
}

fn default_lut_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ccd_capture")
        .join("gain_luts.bin")
}

fn default_gain_end() -> f64 {
    2.0
}

fn default_gain_step() -> f64 {
    0.01
}

fn default_time_zone() -> String {
    "America/New_York".to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            max_display_fps: default_max_display_fps(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pause_ack_timeout_ms: default_pause_ack_timeout(),
            response_timeout_ms: default_response_timeout(),
            sdk_path: String::new(),
            readout_mode: default_readout_mode(),
            initial_mode: default_initial_mode(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            shm_dir: default_shm_dir(),
            region_prefix: default_region_prefix(),
        }
    }
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            lut_cache_path: default_lut_cache_path(),
            gain_start: 0.0,
            gain_end: default_gain_end(),
            gain_step: default_gain_step(),
            bayer_pattern: BayerPattern::None,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            time_zone: default_time_zone(),
        }
    }
}

impl SessionConfig {
    /// Pause acknowledgment bound as a `Duration`
    pub fn pause_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_ack_timeout_ms)
    }

    /// Generic response bound as a `Duration`
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl ColorConfig {
    /// Gain grid the LUT cache covers.
    pub fn grid(&self) -> GainGrid {
        GainGrid {
            start: self.gain_start,
            end: self.gain_end,
            step: self.gain_step,
        }
    }
}

impl TelemetryConfig {
    /// Parse the configured zone.
    pub fn zone(&self) -> Result<LocalZone, String> {
        parse_time_zone(&self.time_zone)
    }
}

/// Parse a fixed offset (`+HH:MM`, `-HH:MM`, `Z`) or an IANA zone name.
pub fn parse_time_zone(raw: &str) -> Result<LocalZone, String> {
    let raw = raw.trim();
    if raw.starts_with(['+', '-'])
        || raw.eq_ignore_ascii_case("z")
        || raw.eq_ignore_ascii_case("utc")
    {
        return parse_utc_offset(raw).map(LocalZone::Fixed);
    }
    raw.parse::<Tz>().map(LocalZone::Named).map_err(|_| {
        format!("unknown time zone '{raw}': use +HH:MM or a name like America/New_York")
    })
}

/// Parse `+HH:MM`, `-HH:MM` or `Z` into a `FixedOffset`.
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset, String> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| "invalid offset".to_string());
    }
    let (sign, rest) = match raw.as_bytes().first() {
        Some(b'+') => (1, &raw[1..]),
        Some(b'-') => (-1, &raw[1..]),
        _ => return Err(format!("UTC offset '{raw}' must start with '+' or '-'")),
    };
    let (hours, minutes) = rest
        .split_once(':')
        .ok_or_else(|| format!("UTC offset '{raw}' must look like +HH:MM"))?;
    let hours: i32 = hours
        .parse()
        .map_err(|_| format!("Invalid hours in UTC offset '{raw}'"))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| format!("Invalid minutes in UTC offset '{raw}'"))?;
    if hours > 14 || minutes >= 60 {
        return Err(format!("UTC offset '{raw}' is out of range"));
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| format!("UTC offset '{raw}' is out of range"))
}

impl AppConfig {
    /// Load configuration from the default path and environment variables
    ///
    /// Environment variables override the file with prefix `CCD_CAPTURE_`.
    /// Example: `CCD_CAPTURE_SESSION__PAUSE_ACK_TIMEOUT_MS=5000`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CCD_CAPTURE_").split("__"))
            .extract()
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if !(self.application.max_display_fps > 0.0) {
            return Err(format!(
                "Invalid max_display_fps {}. Must be positive",
                self.application.max_display_fps
            ));
        }

        if self.session.pause_ack_timeout_ms == 0 || self.session.response_timeout_ms == 0 {
            return Err("Session timeouts must be greater than zero".to_string());
        }

        if self.session.mailbox_capacity == 0 {
            return Err("mailbox_capacity must be at least 1".to_string());
        }

        if self.buffers.region_prefix.trim().is_empty() {
            return Err("region_prefix must not be empty".to_string());
        }

        let color = &self.color;
        if !(color.gain_step > 0.0) {
            return Err(format!("Invalid gain_step {}. Must be positive", color.gain_step));
        }
        if color.gain_start < 0.0 || color.gain_start > color.gain_end {
            return Err(format!(
                "Invalid gain range {}..{}. Need 0 <= start <= end",
                color.gain_start, color.gain_end
            ));
        }

        self.telemetry.zone()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.session.pause_ack_timeout_ms, 3000);
        assert_eq!(config.color.gain_end, 2.0);
    }

    #[test]
    #[serial]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ccd_capture.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[session]
pause_ack_timeout_ms = 250
initial_mode = "Continuous"

[color]
bayer_pattern = "RGGB"
"#
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.session.pause_ack_timeout(), Duration::from_millis(250));
        assert_eq!(config.session.initial_mode, StreamingMode::Continuous);
        assert_eq!(config.color.bayer_pattern, BayerPattern::Rggb);
        // untouched sections keep defaults
        assert_eq!(config.telemetry.time_zone, "America/New_York");
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("CCD_CAPTURE_SESSION__RESPONSE_TIMEOUT_MS", "1234");
        let config = AppConfig::load_from(dir.path().join("absent.toml"));
        std::env::remove_var("CCD_CAPTURE_SESSION__RESPONSE_TIMEOUT_MS");
        assert_eq!(config.unwrap().session.response_timeout_ms, 1234);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.color.gain_step = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.color.gain_start = 3.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.telemetry.time_zone = "Eastern".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.buffers.region_prefix = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_utc_offsets() {
        assert_eq!(parse_utc_offset("-05:00").unwrap().local_minus_utc(), -5 * 3600);
        assert_eq!(parse_utc_offset("+05:30").unwrap().local_minus_utc(), 5 * 3600 + 1800);
        assert_eq!(parse_utc_offset("Z").unwrap().local_minus_utc(), 0);
        assert!(parse_utc_offset("05:00").is_err());
        assert!(parse_utc_offset("+25:00").is_err());
    }

    #[test]
    fn parses_named_and_fixed_zones() {
        assert_eq!(
            parse_time_zone("America/New_York").unwrap(),
            LocalZone::Named(chrono_tz::America::New_York)
        );
        assert!(matches!(parse_time_zone("-05:00"), Ok(LocalZone::Fixed(_))));
        assert!(matches!(parse_time_zone("utc"), Ok(LocalZone::Fixed(_))));
        assert!(parse_time_zone("Mars/Olympus_Mons").is_err());
    }

    #[test]
    fn renders_toml() {
        let rendered = AppConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[session]"));
        assert!(rendered.contains("pause_ack_timeout_ms = 3000"));
    }
}
