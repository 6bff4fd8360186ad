//! Room management module
//!
//! Rooms, their session stores, the transport boundary they emit through, and the
//! registry that runs each room as its own single-threaded task.

mod instance;
mod registry;
mod store;
mod transport;

pub use instance::*;
pub use registry::*;
pub use store::*;
pub use transport::*;
