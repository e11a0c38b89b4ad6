#[macro_use]
extern crate tracing;

pub mod config;
pub mod connection;
pub mod server;
pub mod shutdown;
