pub mod domain;
pub mod subscriber_worker;

pub use domain::*;
pub use subscriber_worker::*;
