use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff for calls to the vision model.
///
/// The first attempt runs immediately; retry `n` (0-based) waits
/// `base_delay * 2^n` first. With the defaults that is up to six attempts
/// separated by 1, 2, 4, 8 and 16 seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// The retry budget ran out. Carries the error from the final attempt.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last: E,
}

/// Something that can wait. Injected so tests don't actually sleep.
#[async_trait::async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// Production sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait::async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Total number of attempts, counting the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }

    /// Run `op` until it succeeds or the budget is spent.
    ///
    /// `op` receives the 1-based attempt number. Every `Err` is treated as
    /// transient; callers that have terminal failures should return them
    /// inside `Ok` and decide afterwards.
    pub async fn run<T, E, F, Fut>(
        &self,
        sleeper: &dyn Sleeper,
        mut op: F,
    ) -> Result<T, Exhausted<E>>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retry = 0;
        loop {
            match op(retry + 1).await {
                Ok(value) => return Ok(value),
                Err(e) if retry < self.max_retries => {
                    let delay = self.delay_for(retry);
                    log::warn!(
                        "  Attempt {}/{} failed: {e}; retrying in {}s",
                        retry + 1,
                        self.max_attempts(),
                        delay.as_secs_f32()
                    );
                    sleeper.sleep(delay).await;
                    retry += 1;
                }
                Err(e) => {
                    return Err(Exhausted {
                        attempts: retry + 1,
                        last: e,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait::async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, delay: Duration) {
            self.delays.lock().unwrap().push(delay);
        }
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.max_attempts(), 6);
        let delays: Vec<u64> = (0..5).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn delay_saturates() {
        let policy = RetryPolicy::new(64, Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1).saturating_mul(u32::MAX));
    }

    #[tokio::test]
    async fn always_failing_makes_six_attempts() {
        let sleeper = RecordingSleeper::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = RetryPolicy::default()
            .run(&sleeper, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("service unavailable") }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 6);
        assert_eq!(err.last, "service unavailable");
        assert_eq!(calls.load(Ordering::SeqCst), 6);

        let delays: Vec<u64> = sleeper
            .delays
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[tokio::test]
    async fn success_after_two_failures() {
        let sleeper = RecordingSleeper::default();

        let result = RetryPolicy::default()
            .run(&sleeper, |attempt| async move {
                if attempt < 3 { Err("flaky") } else { Ok(attempt) }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(sleeper.delays.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn first_try_success_never_sleeps() {
        let sleeper = RecordingSleeper::default();
        let result = RetryPolicy::default()
            .run(&sleeper, |_| async { Ok::<_, &str>("done") })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_retries_gives_up_immediately() {
        let sleeper = RecordingSleeper::default();
        let result: Result<(), _> = RetryPolicy::new(0, Duration::from_secs(1))
            .run(&sleeper, |_| async { Err::<(), _>("down") })
            .await;
        assert_eq!(result.unwrap_err().attempts, 1);
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }
}
