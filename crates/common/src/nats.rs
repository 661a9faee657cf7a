mod client;
mod message_bus;
mod trace_context;

pub use client::*;
pub use message_bus::*;
pub use trace_context::*;
