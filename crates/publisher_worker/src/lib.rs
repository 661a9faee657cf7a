pub mod domain;
pub mod publisher_worker;

pub use domain::*;
pub use publisher_worker::*;
