mod channel_frame;
mod table_analytics_service;

pub use channel_frame::*;
pub use table_analytics_service::*;
