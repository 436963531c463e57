use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rule::Rule;

/// Logical state of the boiler relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    On,
    Off,
    Unknown,
}

impl State {
    pub fn is_on(self) -> bool {
        matches!(self, State::On)
    }

    /// Numeric encoding used by the switch time series.
    pub fn as_sample_value(self) -> f64 {
        match self {
            State::On => 0.0,
            State::Off => 1.0,
            State::Unknown => 2.0,
        }
    }

    pub fn from_sample_value(value: f64) -> Self {
        match value as i64 {
            0 => State::On,
            1 => State::Off,
            _ => State::Unknown,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::On => "ON",
            State::Off => "OFF",
            State::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ON" | "on" => Ok(State::On),
            "OFF" | "off" => Ok(State::Off),
            "UNKNOWN" | "unknown" => Ok(State::Unknown),
            other => Err(format!("unknown boiler state: {other}")),
        }
    }
}

/// The boiler aggregate: the single unit of storage and change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoilerInfo {
    pub state: State,
    pub min_temp: f64,
    pub max_temp: f64,
    #[serde(default)]
    pub is_overheating_protection_active: bool,
    /// Unique by id, serialised sorted by id.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl BoilerInfo {
    /// Fresh aggregate as created on first access.
    pub fn with_bounds(min_temp: f64, max_temp: f64) -> Self {
        Self {
            state: State::Unknown,
            min_temp,
            max_temp,
            is_overheating_protection_active: false,
            rules: Vec::new(),
        }
    }

    pub fn rule(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Rules keyed by id, the canonical form while mutating.
    pub fn rule_map(&self) -> BTreeMap<String, Rule> {
        self.rules
            .iter()
            .map(|r| (r.id.clone(), r.clone()))
            .collect()
    }

    pub fn set_rules(&mut self, rules: BTreeMap<String, Rule>) {
        self.rules = rules.into_values().collect();
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One point of the switch history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SwitchSample {
    pub time: DateTime<Utc>,
    pub state: State,
}

/// One point of the overheating-protection history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProtectionSample {
    pub time: DateTime<Utc>,
    pub is_active: bool,
}

/// A temperature reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}
