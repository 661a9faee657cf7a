pub mod clickhouse;
pub mod domain;
pub mod nats;
pub mod telemetry;

/// In-process bus and store used by tests across the workspace.
#[cfg(any(test, feature = "testing"))]
pub mod memory;

pub use clickhouse::*;
pub use nats::*;
pub use telemetry::*;
