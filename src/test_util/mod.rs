//! Test doubles for the relay and the media primitive. They are part of the regular build so
//!  that applications can test their own code against them.

pub mod media;
pub mod relay;
pub mod transport;
