//! Simulation context implementing DuetContext for deterministic testing.

use async_trait::async_trait;
use duet_env::DuetContext;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 2024-01-01 00:00:00 UTC, what virtual time zero maps to.
const SIM_EPOCH_SECS: u64 = 1_704_067_200;

struct SimClock {
    now: Duration,
    rng: ChaCha8Rng,
    /// Every sleep requested through the context, in order
    sleeps: Vec<Duration>,
}

/// Virtual clock and seeded randomness for one simulated session.
///
/// Time only moves when something sleeps (reconnect backoff) or the
/// scenario advances it. Sleeping yields once so the other tasks on the
/// current-thread runtime observe the new time before the sleeper resumes.
pub struct SimContext {
    seed: u64,
    clock: Mutex<SimClock>,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            clock: Mutex::new(SimClock {
                now: Duration::ZERO,
                rng: ChaCha8Rng::seed_from_u64(seed),
                sleeps: Vec::new(),
            }),
        }
    }

    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    fn clock(&self) -> MutexGuard<'_, SimClock> {
        self.clock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves virtual time forward without recording a sleep.
    pub fn advance_time(&self, duration: Duration) {
        self.clock().now += duration;
    }

    /// Sleeps requested so far, oldest first.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.clock().sleeps.clone()
    }

    /// Runs `f` with the shared RNG.
    pub fn with_rng<R>(&self, f: impl FnOnce(&mut ChaCha8Rng) -> R) -> R {
        f(&mut self.clock().rng)
    }
}

#[async_trait]
impl DuetContext for SimContext {
    fn now(&self) -> Duration {
        self.clock().now
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(SIM_EPOCH_SECS) + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut clock = self.clock();
            clock.now += duration;
            clock.sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, _name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
