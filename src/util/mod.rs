pub mod backoff;
pub mod buf;
pub mod cancel;
pub mod random;
