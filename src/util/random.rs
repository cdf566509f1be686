use std::ops::Range;
use rand::Rng;


/// Source of randomness for connection ids and retry jitter, injectable for tests
#[cfg_attr(test, mockall::automock)]
pub trait Random: Send + Sync + 'static {
    /// a value in `[reserved, u32::MAX]`, i.e. never one of the `reserved` lowest values
    fn next_conn_id(&self, reserved: u32) -> u32;
    fn gen_f64_range(&self, range: Range<f64>) -> f64;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn next_conn_id(&self, reserved: u32) -> u32 {
        rand::thread_rng().gen_range(reserved..=u32::MAX)
    }

    fn gen_f64_range(&self, range: Range<f64>) -> f64 {
        if range.is_empty() {
            return range.start;
        }
        rand::thread_rng().gen_range(range)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::discovery_only(1)]
    #[case::reserved_range(16)]
    #[case::almost_everything(u32::MAX - 3)]
    fn test_next_conn_id_outside_reserved(#[case] reserved: u32) {
        let random = RngRandom {};
        for _ in 0..1000 {
            assert!(random.next_conn_id(reserved) >= reserved);
        }
    }

    #[test]
    fn test_gen_f64_range_empty() {
        assert_eq!(RngRandom {}.gen_f64_range(0.5..0.5), 0.5);
    }
}
