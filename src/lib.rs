pub mod messaging;
pub mod peer;
pub mod session;
pub mod test_util;
pub mod transport;
pub mod util;
