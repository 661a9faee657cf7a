mod dedup_coordinator;

pub use dedup_coordinator::*;
