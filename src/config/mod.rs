//! Configuration module
//!
//! Handles loading server and room configuration.

mod server;

pub use server::*;
