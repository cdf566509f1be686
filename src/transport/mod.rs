pub mod config;
pub mod queue;
pub mod stream;
pub mod transport;
