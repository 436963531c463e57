//! `caldaia-core`: data model and scheduling math for the boiler controller.
//!
//! Everything here is pure: the aggregate ([`BoilerInfo`]), its heating
//! [`Rule`]s with their window/recurrence arithmetic, the time-series sample
//! types, and the process configuration.

pub mod config;
pub mod error;
pub mod rule;
pub mod types;

pub use error::{CoreError, Result};
pub use rule::Rule;
pub use types::{BoilerInfo, Measure, ProtectionSample, State, SwitchSample};
