//! Runtime configuration for the resident process and its host adapters.
//!
//! Loaded from `~/.hero-watch/config.toml` (or `HERO_WATCH_CONFIG`). A missing
//! file yields defaults; every section and field is optional.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, WatchError};

pub const CONFIG_ENV: &str = "HERO_WATCH_CONFIG";
pub const STATE_DIR_ENV: &str = "HERO_WATCH_STATE_DIR";
const STATE_DIR_NAME: &str = ".hero-watch";
const CONFIG_FILE_NAME: &str = "config.toml";
const STORE_FILE_NAME: &str = "prefs.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub endpoint: EndpointConfig,
    pub polling: PollingConfig,
    pub alerts: AlertConfig,
    pub resurrection: ResurrectionConfig,
    pub host: HostConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub poll_url: String,
    pub orders_url: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            poll_url: "https://mikmik.site/heroes/check_pending_orders.php".to_string(),
            orders_url: "https://mikmik.site/heroes/pending_orders.php".to_string(),
            connect_timeout_secs: 15,
            read_timeout_secs: 15,
        }
    }
}

impl EndpointConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { interval_secs: 15 }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingerMode {
    #[default]
    Normal,
    Vibrate,
    Silent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub rate_limit_secs: u64,
    pub effect_bound_secs: u64,
    pub notification_timeout_secs: u64,
    pub ringer: RingerMode,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            rate_limit_secs: 60,
            effect_bound_secs: 30,
            notification_timeout_secs: 60,
            ringer: RingerMode::Normal,
        }
    }
}

impl AlertConfig {
    pub fn rate_limit(&self) -> Duration {
        Duration::from_secs(self.rate_limit_secs)
    }

    pub fn effect_bound(&self) -> Duration {
        Duration::from_secs(self.effect_bound_secs.max(1))
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_secs(self.notification_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResurrectionConfig {
    pub staggered_delays_ms: Vec<u64>,
    pub short_alarm_secs: u64,
    pub immediate_alarm_secs: u64,
    pub primary_alarm_mins: u64,
    pub backup_alarm_mins: u64,
    pub watchdog_interval_mins: u64,
    /// Install platform timers (alarms, watchdog job). Off in sandboxes and tests.
    pub platform_timers: bool,
}

impl Default for ResurrectionConfig {
    fn default() -> Self {
        Self {
            staggered_delays_ms: vec![1_000, 3_000, 5_000, 10_000],
            short_alarm_secs: 2,
            immediate_alarm_secs: 30,
            primary_alarm_mins: 5,
            backup_alarm_mins: 10,
            watchdog_interval_mins: 15,
            platform_timers: true,
        }
    }
}

impl ResurrectionConfig {
    pub fn staggered_delays(&self) -> Vec<Duration> {
        self.staggered_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    pub fn short_alarm(&self) -> Duration {
        Duration::from_secs(self.short_alarm_secs)
    }

    pub fn immediate_alarm(&self) -> Duration {
        Duration::from_secs(self.immediate_alarm_secs)
    }

    pub fn primary_alarm(&self) -> Duration {
        Duration::from_secs(self.primary_alarm_mins * 60)
    }

    pub fn backup_alarm(&self) -> Duration {
        Duration::from_secs(self.backup_alarm_mins * 60)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_mins.max(15) * 60)
    }
}

/// Commands used by the host adapters. An empty command disables that adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub sound_command: Vec<String>,
    pub vibrate_command: Vec<String>,
    pub partial_wake_command: Vec<String>,
    pub screen_wake_command: Vec<String>,
    pub notify_command: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            sound_command: vec![
                "paplay".to_string(),
                "/usr/share/sounds/freedesktop/stereo/alarm-clock-elapsed.oga".to_string(),
            ],
            vibrate_command: Vec::new(),
            partial_wake_command: vec![
                "systemd-inhibit".to_string(),
                "--what=sleep".to_string(),
                "--who=hero-watch".to_string(),
                "--why=Checking for pending orders".to_string(),
                "sleep".to_string(),
                "infinity".to_string(),
            ],
            screen_wake_command: vec![
                "systemd-inhibit".to_string(),
                "--what=idle".to_string(),
                "--who=hero-watch".to_string(),
                "--why=New order alert".to_string(),
                "sleep".to_string(),
                "{secs}".to_string(),
            ],
            notify_command: "notify-send".to_string(),
        }
    }
}

/// Returns the state directory (`~/.hero-watch` unless overridden).
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(path) = env::var(STATE_DIR_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or(WatchError::HomeDirNotFound)?;
    Ok(home.join(STATE_DIR_NAME))
}

pub fn default_config_path() -> Result<PathBuf> {
    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(state_dir()?.join(CONFIG_FILE_NAME))
}

pub fn store_path(state_dir: &Path) -> PathBuf {
    state_dir.join(STORE_FILE_NAME)
}

pub fn load_config(path: Option<PathBuf>) -> Result<WatchConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(WatchConfig::default());
    }

    let content = fs_err::read_to_string(&config_path)
        .map_err(|err| WatchError::io("Failed to read config", err))?;
    toml::from_str::<WatchConfig>(&content).map_err(|err| WatchError::ConfigMalformed {
        path: config_path,
        details: err.to_string(),
    })
}
