use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_BOILER_NAME: &str = "caldaia";
pub const DEFAULT_MIN_TEMP: f64 = 10.0;
pub const DEFAULT_MAX_TEMP: f64 = 25.0;
pub const DEFAULT_AVERAGE_WINDOW_SECS: u64 = 600; // rolling temperature average
pub const DEFAULT_OVERHEATING_TICK_SECS: u64 = 10;
pub const DEFAULT_MAX_RESTARTS: u32 = 10;
pub const DEFAULT_RESTART_DELAY_SECS: u64 = 5;
pub const DEFAULT_SENSOR_POLL_SECS: u64 = 5;
/// Longest accepted temperature averaging window (one week).
pub const MAX_AVERAGE_WINDOW_SECS: u64 = 7 * 24 * 3600;

/// Top-level config (caldaia.toml + CALDAIA_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaldaiaConfig {
    #[serde(default)]
    pub boiler: BoilerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoilerConfig {
    /// Key of the aggregate and prefix of its time series.
    #[serde(default = "default_boiler_name")]
    pub name: String,
    /// Bounds written into the aggregate when it is first created.
    #[serde(default = "default_min_temp")]
    pub default_min_temp: f64,
    #[serde(default = "default_max_temp")]
    pub default_max_temp: f64,
}

impl Default for BoilerConfig {
    fn default() -> Self {
        Self {
            name: default_boiler_name(),
            default_min_temp: DEFAULT_MIN_TEMP,
            default_max_temp: DEFAULT_MAX_TEMP,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// The temperature sensor feeding the switch controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default = "default_sensor_name")]
    pub name: String,
    #[serde(default = "default_sensor_position")]
    pub position: String,
    /// How often readings written by the acquisition process are picked up.
    #[serde(default = "default_sensor_poll_secs")]
    pub poll_interval_secs: u64,
}

impl SensorConfig {
    /// Series key, e.g. `temperatura:centrale`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.name, self.position)
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            name: default_sensor_name(),
            position: default_sensor_position(),
            poll_interval_secs: DEFAULT_SENSOR_POLL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_average_window_secs")]
    pub average_window_secs: u64,
    #[serde(default = "default_overheating_tick_secs")]
    pub overheating_tick_secs: u64,
    /// Restarts allowed per supervised loop before the process gives up.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
}

impl ControlConfig {
    /// Averaging window, capped at [`MAX_AVERAGE_WINDOW_SECS`].
    pub fn average_window(&self) -> chrono::Duration {
        let secs = self.average_window_secs.min(MAX_AVERAGE_WINDOW_SECS);
        chrono::Duration::seconds(secs as i64)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            average_window_secs: DEFAULT_AVERAGE_WINDOW_SECS,
            overheating_tick_secs: DEFAULT_OVERHEATING_TICK_SECS,
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_delay_secs: DEFAULT_RESTART_DELAY_SECS,
        }
    }
}

fn default_boiler_name() -> String {
    DEFAULT_BOILER_NAME.to_string()
}
fn default_min_temp() -> f64 {
    DEFAULT_MIN_TEMP
}
fn default_max_temp() -> f64 {
    DEFAULT_MAX_TEMP
}
fn default_sensor_name() -> String {
    "temperatura".to_string()
}
fn default_sensor_position() -> String {
    "centrale".to_string()
}
fn default_sensor_poll_secs() -> u64 {
    DEFAULT_SENSOR_POLL_SECS
}
fn default_average_window_secs() -> u64 {
    DEFAULT_AVERAGE_WINDOW_SECS
}
fn default_overheating_tick_secs() -> u64 {
    DEFAULT_OVERHEATING_TICK_SECS
}
fn default_max_restarts() -> u32 {
    DEFAULT_MAX_RESTARTS
}
fn default_restart_delay_secs() -> u64 {
    DEFAULT_RESTART_DELAY_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.caldaia/caldaia.db", home)
}

impl CaldaiaConfig {
    /// Load config from a TOML file with CALDAIA_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CALDAIA_BOILER__DEFAULT_MAX_TEMP=24`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CaldaiaConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CALDAIA_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        if config.boiler.default_min_temp > config.boiler.default_max_temp {
            return Err(crate::error::CoreError::Config(format!(
                "boiler.default_min_temp ({}) is above boiler.default_max_temp ({})",
                config.boiler.default_min_temp, config.boiler.default_max_temp
            )));
        }

        if config.control.average_window_secs > MAX_AVERAGE_WINDOW_SECS {
            return Err(crate::error::CoreError::Config(format!(
                "control.average_window_secs ({}) is above {}",
                config.control.average_window_secs, MAX_AVERAGE_WINDOW_SECS
            )));
        }

        debug!(path = %path, boiler = %config.boiler.name, "config loaded");
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.caldaia/caldaia.toml", home)
}
