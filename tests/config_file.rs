//! The shipped configuration file and environment overrides.

use ccd_capture::color::BayerPattern;
use ccd_capture::config::{AppConfig, DEFAULT_CONFIG_PATH};
use ccd_capture::session::StreamingMode;
use serial_test::serial;
use std::path::PathBuf;

fn shipped_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH)
}

#[test]
#[serial]
fn shipped_config_matches_defaults() {
    let config = AppConfig::load_from(shipped_config()).unwrap();
    config.validate().unwrap();

    let defaults = AppConfig::default();
    assert_eq!(config.application, defaults.application);
    assert_eq!(config.session, defaults.session);
    assert_eq!(config.telemetry, defaults.telemetry);
    assert_eq!(config.color.bayer_pattern, BayerPattern::None);
    assert_eq!(config.color.grid(), defaults.color.grid());
}

#[test]
#[serial]
fn environment_overrides_shipped_config() {
    std::env::set_var("CCD_CAPTURE_SESSION__INITIAL_MODE", "Continuous");
    std::env::set_var("CCD_CAPTURE_COLOR__BAYER_PATTERN", "RGGB");
    let loaded = AppConfig::load_from(shipped_config());
    std::env::remove_var("CCD_CAPTURE_SESSION__INITIAL_MODE");
    std::env::remove_var("CCD_CAPTURE_COLOR__BAYER_PATTERN");

    let config = loaded.unwrap();
    assert_eq!(config.session.initial_mode, StreamingMode::Continuous);
    assert_eq!(config.color.bayer_pattern, BayerPattern::Rggb);
}

#[test]
#[serial]
fn invalid_override_fails_validation() {
    std::env::set_var("CCD_CAPTURE_TELEMETRY__TIME_ZONE", "UTC+5");
    let loaded = AppConfig::load_from(shipped_config());
    std::env::remove_var("CCD_CAPTURE_TELEMETRY__TIME_ZONE");

    let err = loaded.unwrap().validate().unwrap_err();
    assert!(err.contains("unknown time zone"), "{err}");
}
