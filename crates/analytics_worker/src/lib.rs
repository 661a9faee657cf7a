pub mod analytics_worker;
pub mod domain;

pub use analytics_worker::*;
pub use domain::*;
