use rand::Rng;
use std::ops::Range;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Source of randomness for backoff jitter, load spreading across connections and endpoint
///  selection. It is a trait so tests can pin the values.
#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn gen_f64_range(range: Range<f64>) -> f64;
    fn gen_usize_range(range: Range<usize>) -> usize;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn gen_f64_range(range: Range<f64>) -> f64 {
        rand::thread_rng().gen_range(range)
    }

    fn gen_usize_range(range: Range<usize>) -> usize {
        rand::thread_rng().gen_range(range)
    }
}

/// a uniformly distributed index for a collection of `len` elements, `None` if it is empty
pub fn random_index<R: Random>(len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    Some(R::gen_usize_range(0..len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_index() {
        let _lock = MOCK_RANDOM_MUTEX.lock();

        let ctx = MockRandom::gen_usize_range_context();
        ctx.expect()
            .withf(|range| *range == (0..4))
            .returning(|_| 3);

        assert_eq!(random_index::<MockRandom>(0), None);
        assert_eq!(random_index::<MockRandom>(4), Some(3));
    }

    #[test]
    fn test_random_index_in_range() {
        for len in 1..10 {
            for _ in 0..20 {
                assert!(random_index::<RngRandom>(len).unwrap() < len);
            }
        }
    }
}
