//! Layered configuration: compiled-in defaults, optional TOML file, then
//! CLI flags (applied by `main.rs`), in increasing precedence order —
//! the same layering as `Config::from_file` + `clap::Parser`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_port() -> u16 {
    8765
}

fn default_max_active_sessions() -> usize {
    2
}

fn default_frame_queue_capacity() -> usize {
    60
}

fn default_gop_seconds() -> u64 {
    2
}

fn default_bitrate_min_bps() -> u32 {
    300_000
}

fn default_bitrate_max_bps() -> u32 {
    4_000_000
}

fn default_bitrate_inc_step_bps() -> u32 {
    250_000
}

fn default_bitrate_inc_interval_ms() -> u64 {
    2_000
}

fn default_bitrate_change_min_interval_ms() -> u64 {
    2_000
}

fn default_keyframe_request_min_interval_ms() -> u64 {
    400
}

fn default_stall_watchdog_threshold_ms() -> u64 {
    5_000
}

fn default_keyframe_drought_request_multiple() -> u64 {
    2
}

fn default_keyframe_drought_recovery_multiple() -> u64 {
    3
}

fn default_session_join_timeout_ms() -> u64 {
    5_000
}

fn default_force_close_grace_ms() -> u64 {
    200
}

fn default_resume_cache_capacity() -> usize {
    32
}

fn default_max_frame_payload_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_keepalive_interval_ms() -> u64 {
    15_000
}

fn default_keepalive_timeout_ms() -> u64 {
    45_000
}

fn default_encoder_state_path() -> String {
    "camstream-encoder-state.json".to_string()
}

/// Top-level server configuration, loaded from an optional TOML file and
/// overlaid with CLI flags.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    pub password: String,

    #[serde(default = "default_max_active_sessions")]
    pub max_active_sessions: usize,

    #[serde(default = "default_frame_queue_capacity")]
    pub frame_queue_capacity: usize,

    #[serde(default = "default_gop_seconds")]
    pub gop_seconds: u64,

    #[serde(default = "default_bitrate_min_bps")]
    pub bitrate_min_bps: u32,

    #[serde(default = "default_bitrate_max_bps")]
    pub bitrate_max_bps: u32,

    #[serde(default = "default_bitrate_inc_step_bps")]
    pub bitrate_inc_step_bps: u32,

    #[serde(default = "default_bitrate_inc_interval_ms")]
    pub bitrate_inc_interval_ms: u64,

    #[serde(default = "default_bitrate_change_min_interval_ms")]
    pub bitrate_change_min_interval_ms: u64,

    #[serde(default = "default_keyframe_request_min_interval_ms")]
    pub keyframe_request_min_interval_ms: u64,

    #[serde(default = "default_stall_watchdog_threshold_ms")]
    pub stall_watchdog_threshold_ms: u64,

    #[serde(default = "default_keyframe_drought_request_multiple")]
    pub keyframe_drought_request_multiple: u64,

    #[serde(default = "default_keyframe_drought_recovery_multiple")]
    pub keyframe_drought_recovery_multiple: u64,

    #[serde(default = "default_session_join_timeout_ms")]
    pub session_join_timeout_ms: u64,

    #[serde(default = "default_force_close_grace_ms")]
    pub force_close_grace_ms: u64,

    #[serde(default = "default_resume_cache_capacity")]
    pub resume_cache_capacity: usize,

    #[serde(default = "default_max_frame_payload_bytes")]
    pub max_frame_payload_bytes: usize,

    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Interval between keepalive PINGs sent to each viewer session.
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,

    /// A session is closed if no PONG is seen within this long.
    #[serde(default = "default_keepalive_timeout_ms")]
    pub keepalive_timeout_ms: u64,

    /// Where the "surface-input bad" marker is persisted across restarts,
    /// so a device that can't take surface input stays in buffer mode
    /// after a crash or restart instead of re-discovering the failure.
    #[serde(default = "default_encoder_state_path")]
    pub encoder_state_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            password: String::new(),
            max_active_sessions: default_max_active_sessions(),
            frame_queue_capacity: default_frame_queue_capacity(),
            gop_seconds: default_gop_seconds(),
            bitrate_min_bps: default_bitrate_min_bps(),
            bitrate_max_bps: default_bitrate_max_bps(),
            bitrate_inc_step_bps: default_bitrate_inc_step_bps(),
            bitrate_inc_interval_ms: default_bitrate_inc_interval_ms(),
            bitrate_change_min_interval_ms: default_bitrate_change_min_interval_ms(),
            keyframe_request_min_interval_ms: default_keyframe_request_min_interval_ms(),
            stall_watchdog_threshold_ms: default_stall_watchdog_threshold_ms(),
            keyframe_drought_request_multiple: default_keyframe_drought_request_multiple(),
            keyframe_drought_recovery_multiple: default_keyframe_drought_recovery_multiple(),
            session_join_timeout_ms: default_session_join_timeout_ms(),
            force_close_grace_ms: default_force_close_grace_ms(),
            resume_cache_capacity: default_resume_cache_capacity(),
            max_frame_payload_bytes: default_max_frame_payload_bytes(),
            log_filter: default_log_filter(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            keepalive_timeout_ms: default_keepalive_timeout_ms(),
            encoder_state_path: default_encoder_state_path(),
        }
    }
}

impl Config {
    /// Load a config from a TOML file, falling back to per-field defaults
    /// for anything the file omits.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let text = std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_ref.display().to_string(),
            source,
        })?;
        let cfg: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_ref.display().to_string(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.password.is_empty() {
            return Err(ConfigError::EmptyPassword);
        }
        Ok(())
    }

    pub fn gop(&self) -> Duration {
        Duration::from_secs(self.gop_seconds)
    }

    pub fn bitrate_inc_interval(&self) -> Duration {
        Duration::from_millis(self.bitrate_inc_interval_ms)
    }

    pub fn bitrate_change_min_interval(&self) -> Duration {
        Duration::from_millis(self.bitrate_change_min_interval_ms)
    }

    pub fn keyframe_request_min_interval(&self) -> Duration {
        Duration::from_millis(self.keyframe_request_min_interval_ms)
    }

    pub fn stall_watchdog_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_watchdog_threshold_ms)
    }

    pub fn session_join_timeout(&self) -> Duration {
        Duration::from_millis(self.session_join_timeout_ms)
    }

    pub fn force_close_grace(&self) -> Duration {
        Duration::from_millis(self.force_close_grace_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_requires_password() {
        let cfg = Config::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_default_config_field_values() {
        let cfg = Config {
            password: "secret".into(),
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.port, 8765);
        assert_eq!(cfg.max_active_sessions, 2);
        assert_eq!(cfg.frame_queue_capacity, 60);
        assert_eq!(cfg.bitrate_min_bps, 300_000);
        assert_eq!(cfg.resume_cache_capacity, 32);
    }

    #[test]
    fn test_from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camstream.toml");
        std::fs::write(&path, "password = \"hunter2\"\nport = 9999\n").unwrap();
        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.password, "hunter2");
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.max_active_sessions, 2);
    }

    #[test]
    fn test_from_file_missing_password_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camstream.toml");
        std::fs::write(&path, "port = 1234\n").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyPassword));
    }
}
