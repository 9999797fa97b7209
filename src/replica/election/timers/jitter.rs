use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

/// Jitter is the randomness source behind election timeouts. All follower timers of one
/// replica share a single underlying RNG, so a run started from a fixed seed re-draws the
/// same timeout sequence and a flaky election interleaving can be replayed.
#[derive(Clone)]
pub(crate) struct Jitter {
    rng: Arc<Mutex<StdRng>>,
}

impl Jitter {
    pub(crate) fn seeded(seed: u64) -> Self {
        Self::wrap(StdRng::seed_from_u64(seed))
    }

    pub(crate) fn from_entropy() -> Self {
        Self::wrap(StdRng::from_entropy())
    }

    fn wrap(rng: StdRng) -> Self {
        Jitter {
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub(crate) fn pick(&self, range: RangeInclusive<Duration>) -> Duration {
        if range.start() == range.end() {
            // Degenerate range used by timer tests; don't burn an RNG draw on it.
            return *range.start();
        }

        self.rng.lock().expect("Jitter.pick() mutex guard poison").gen_range(range)
    }
}
