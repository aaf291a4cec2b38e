//! Feed settings, platform profiles and settings-file paths.
//!
//! Every tunable of the scheduler lives in [`FeedSettings`]. Defaults are the
//! desktop profile; [`Profile::Constrained`] trims concurrency and pacing for
//! low-memory devices. A JSON file (`feedplay.json`) may override any subset
//! of fields; missing fields keep the profile value.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use sysinfo::System;

/// Settings file name inside the config directory
pub const SETTINGS_FILE: &str = "feedplay.json";
/// Default log file name inside the data directory
pub const LOG_FILE: &str = "feedplay.log";

/// Device class the defaults are tuned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Desktop,
    /// Mobile / low-memory: one video, one preload, longer readiness wait
    Constrained,
}

impl Profile {
    /// Below either bound the device is treated as constrained
    const MIN_MEMORY_BYTES: u64 = 4 * 1024 * 1024 * 1024;
    const MIN_CPUS: usize = 3;

    /// Guess the profile from total memory and core count.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let total = sys.total_memory();
        let cpus = num_cpus::get();
        let profile = if total < Self::MIN_MEMORY_BYTES || cpus < Self::MIN_CPUS {
            Profile::Constrained
        } else {
            Profile::Desktop
        };
        info!(
            "Profile detect: total={} MB, cpus={} -> {:?}",
            total / 1024 / 1024,
            cpus,
            profile
        );
        profile
    }
}

/// Runtime-adjustable subset handed to `Feed::set_concurrency_policy`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyPolicy {
    pub max_concurrent_videos: usize,
    pub autoplay_threshold: f32,
    /// Unload distance in px
    pub unload_distance: f64,
}

/// All scheduler tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    // Playback
    pub max_concurrent_videos: usize,
    pub autoplay_threshold: f32,   // Visible fraction required to autoplay
    pub visibility_threshold: f32, // Ratio step that counts as a visibility change
    pub exclusive_audio: bool,
    pub hd_mode: bool, // Read once at startup

    // Preload
    pub max_simultaneous_preloads: usize,
    pub preload_band_px: f64,
    pub hd_preload_band_px: f64,
    pub cancel_distance_px: f64,
    pub pacing_normal_ms: u64,
    pub pacing_fast_ms: u64,
    pub fast_scroll_velocity: f64, // px/ms
    pub preload_poll_ms: u64,
    pub preload_timeout_ms: u64,

    // Unload / eviction
    pub unload_distance_px: f64,
    pub hd_unload_distance_px: f64,
    pub unload_interval_ms: u64,
    pub target_working_set: usize,
    pub soft_cap_factor: f64,

    // Retry
    pub play_max_attempts: u32,
    pub play_retry_initial_ms: u64,
    pub play_retry_max_ms: u64,
    pub resume_max_attempts: u32,
    pub resume_retry_step_ms: u64,
    pub load_max_retries: u32,
    pub load_retry_initial_ms: u64,
    pub load_retry_max_ms: u64,
    pub readiness_timeout_ms: u64,
    pub readiness_poll_ms: u64,
    pub health_check_interval_ms: u64,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            max_concurrent_videos: 2,
            autoplay_threshold: 0.5,
            visibility_threshold: 0.2,
            exclusive_audio: false,
            hd_mode: false,
            max_simultaneous_preloads: 2,
            preload_band_px: 1500.0,
            hd_preload_band_px: 800.0,
            cancel_distance_px: 2500.0,
            pacing_normal_ms: 150,
            pacing_fast_ms: 400,
            fast_scroll_velocity: 2.0,
            preload_poll_ms: 100,
            preload_timeout_ms: 15_000,
            unload_distance_px: 2000.0,
            hd_unload_distance_px: 1000.0,
            unload_interval_ms: 500,
            target_working_set: 40,
            soft_cap_factor: 1.5,
            play_max_attempts: 5,
            play_retry_initial_ms: 200,
            play_retry_max_ms: 1600,
            resume_max_attempts: 3,
            resume_retry_step_ms: 500,
            load_max_retries: 5,
            load_retry_initial_ms: 1000,
            load_retry_max_ms: 16_000,
            readiness_timeout_ms: 4000,
            readiness_poll_ms: 100,
            health_check_interval_ms: 3000,
        }
    }
}

impl FeedSettings {
    pub fn for_profile(profile: Profile) -> Self {
        match profile {
            Profile::Desktop => Self::default(),
            Profile::Constrained => Self {
                max_concurrent_videos: 1,
                max_simultaneous_preloads: 1,
                pacing_normal_ms: 80,
                pacing_fast_ms: 200,
                readiness_timeout_ms: 6000,
                ..Self::default()
            },
        }
    }

    pub fn policy(&self) -> ConcurrencyPolicy {
        ConcurrencyPolicy {
            max_concurrent_videos: self.max_concurrent_videos,
            autoplay_threshold: self.autoplay_threshold,
            unload_distance: self.unload_distance_px,
        }
    }

    /// Clamp values that would stall or break the scheduler.
    pub fn sanitized(mut self) -> Self {
        self.max_concurrent_videos = self.max_concurrent_videos.max(1);
        self.max_simultaneous_preloads = self.max_simultaneous_preloads.max(1);
        self.autoplay_threshold = self.autoplay_threshold.clamp(0.01, 1.0);
        self.visibility_threshold = self.visibility_threshold.clamp(0.01, 1.0);
        self.target_working_set = self.target_working_set.max(1);
        self.soft_cap_factor = self.soft_cap_factor.max(1.0);
        self.play_max_attempts = self.play_max_attempts.max(1);
        self.resume_max_attempts = self.resume_max_attempts.max(1);
        self.readiness_poll_ms = self.readiness_poll_ms.max(1);
        self.preload_poll_ms = self.preload_poll_ms.max(1);
        self.health_check_interval_ms = self.health_check_interval_ms.max(1);
        self
    }

    /// Load `path` over `base`. A missing file yields `base` unchanged.
    pub fn load_or(path: &Path, base: FeedSettings) -> Result<FeedSettings> {
        if !path.exists() {
            debug!("Settings: {} not found, using profile defaults", path.display());
            return Ok(base);
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings: {}", path.display()))?;
        let overrides: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("Invalid JSON in settings: {}", path.display()))?;

        let mut merged = serde_json::to_value(&base).context("Failed to serialize base settings")?;
        if let (Some(dst), Some(src)) = (merged.as_object_mut(), overrides.as_object()) {
            for (key, value) in src {
                dst.insert(key.clone(), value.clone());
            }
        } else {
            anyhow::bail!("Settings file must hold a JSON object: {}", path.display());
        }

        let settings: FeedSettings = serde_json::from_value(merged)
            .with_context(|| format!("Invalid settings values in {}", path.display()))?;
        info!("Settings: loaded {}", path.display());
        Ok(settings.sanitized())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write settings: {}", path.display()))?;
        Ok(())
    }
}

/// Configuration for overriding default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args -> ENV var (FEEDPLAY_CONFIG_DIR) -> None (platform defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var("FEEDPLAY_CONFIG_DIR").ok().map(PathBuf::from));
        Self { config_dir }
    }
}

/// Path to a configuration file.
///
/// Platform paths:
/// - Linux: ~/.config/feedplay/{name}
/// - macOS: ~/Library/Application Support/feedplay/{name}
/// - Windows: %APPDATA%\feedplay\{name}
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    config_dir(config).join(name)
}

/// Path to a data file (logs). Same override rules as [`config_file`].
pub fn data_file(name: &str, config: &PathConfig) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.join(name);
    }
    dirs_next::data_dir()
        .map(|d| d.join("feedplay"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(name)
}

/// Create the config and data directories if missing.
pub fn ensure_dirs(config: &PathConfig) -> Result<()> {
    for file in [config_file(SETTINGS_FILE, config), data_file(LOG_FILE, config)] {
        if let Some(dir) = file.parent() {
            if !dir.exists() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            }
        }
    }
    Ok(())
}

fn config_dir(config: &PathConfig) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }
    if let Some(dir) = dirs_next::config_dir() {
        return dir.join("feedplay");
    }
    PathBuf::from(".")
}
