use std::cmp::min;
use std::marker::PhantomData;
use std::time::Duration;

use crate::util::random::{Random, RngRandom};

const MAX_BASE_DELAY_SECS: u64 = 60;

/// Delay between reconnect attempts of a service connection: `min(2^attempt, 60)` seconds plus up
///  to one second of random jitter, so that many connections losing the service at the same time
///  do not reconnect in lockstep.
pub struct ReconnectBackoff<R: Random = RngRandom> {
    attempt: u32,
    _random: PhantomData<fn() -> R>,
}

impl ReconnectBackoff {
    pub fn new() -> ReconnectBackoff {
        ReconnectBackoff::new_with_random()
    }
}

impl <R: Random> ReconnectBackoff<R> {
    pub fn new_with_random() -> ReconnectBackoff<R> {
        ReconnectBackoff {
            attempt: 0,
            _random: Default::default(),
        }
    }

    /// called after a successful handshake
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn base_delay(attempt: u32) -> Duration {
        // 2^6 is the first power of two above the ceiling, this also avoids overflow
        if attempt >= 6 {
            return Duration::from_secs(MAX_BASE_DELAY_SECS);
        }
        Duration::from_secs(min(1u64 << attempt, MAX_BASE_DELAY_SECS))
    }

    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let base = Self::base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = R::gen_f64_range(0.0..1.0);
        base + Duration::from_secs_f64(jitter)
    }
}
