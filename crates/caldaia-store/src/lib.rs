//! Persistent boiler aggregate with change notification, its append-only
//! time series, and the temperature history feeding the controllers.

pub mod boiler;
pub mod db;
pub mod error;
pub mod listen;
mod series;
pub mod sensor;

pub use boiler::Boiler;
pub use error::{Result, StoreError};
pub use listen::FieldListener;
pub use sensor::{SensorHistory, TemperatureSource};
