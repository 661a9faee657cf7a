mod bus;
mod row_store;

pub use bus::*;
pub use row_store::*;
