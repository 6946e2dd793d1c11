//! External data sources (C1-C3): telemetry, price/forecast, weather.

pub mod forecast;
pub mod price;
pub mod telemetry;
pub mod weather;
