mod bus;
mod clock;
mod job;
mod packet;
mod result;
mod run_mode;
mod store;
mod stored_row;
mod table_catalog;
mod validate;
mod wire_format;

pub use bus::*;
pub use clock::*;
pub use job::*;
pub use packet::*;
pub use result::*;
pub use run_mode::*;
pub use store::*;
pub use stored_row::*;
pub use table_catalog::*;
pub use validate::*;
pub use wire_format::*;
