pub mod forecast;
pub mod plan;
pub mod telemetry;
pub mod types;
pub mod weather;

pub use forecast::*;
pub use plan::*;
pub use telemetry::*;
pub use types::*;
pub use weather::*;
