pub mod endpoint;
pub mod message;
pub mod payload;
pub mod relay;
