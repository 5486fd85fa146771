//! Bulk all-to-all movement of staged records.

mod buffers;
mod coordinator;
mod sink;
pub mod width;

pub use coordinator::{Exchanger, Worker};
pub use width::ElementWidth;
