mod packet_generator;
mod packet_publish_service;

pub use packet_generator::*;
pub use packet_publish_service::*;
