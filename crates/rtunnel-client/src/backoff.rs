//! Retry scheduling with exponential backoff and a fast-retry window

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backoff policy
#[derive(Debug, Clone, Default)]
pub struct FastBackoffOptions {
    /// Delay after a successful attempt, and the first delay ever handed out
    pub duration: Duration,
    /// Growth factor applied on every consecutive failure
    pub factor: f64,
    /// Maximum extra fraction added on top of an exponential delay
    pub jitter: f64,
    /// Ceiling for exponential delays (zero = no ceiling)
    pub max_duration: Duration,
    /// Starting point for the first failure of a streak (zero = previous delay)
    pub init_duration_if_fail: Duration,

    /// Failures inside one window that get `fast_retry_delay` instead of growth
    pub fast_retry_count: u32,
    pub fast_retry_delay: Duration,
    pub fast_retry_jitter: f64,
    pub fast_retry_window: Duration,
}

/// Computes the next wait from the previous one
pub trait BackoffManager: Send {
    fn backoff(&mut self, previous: Duration, previous_failed: bool) -> Duration;
}

/// Exponential backoff that absorbs short bursts of failures with a fixed small delay
pub struct FastBackoff {
    options: FastBackoffOptions,
    last_called: Option<Instant>,
    consecutive_failures: u32,
    fast_retry_cutoff: Option<Instant>,
    fast_retries_in_window: u32,
}

impl FastBackoff {
    pub fn new(options: FastBackoffOptions) -> Self {
        Self {
            options,
            last_called: None,
            consecutive_failures: 0,
            fast_retry_cutoff: None,
            fast_retries_in_window: 0,
        }
    }

    /// Consecutive failures seen so far
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

impl BackoffManager for FastBackoff {
    fn backoff(&mut self, previous: Duration, previous_failed: bool) -> Duration {
        let now = Instant::now();
        if self.last_called.replace(now).is_none() {
            return self.options.duration;
        }

        if !previous_failed {
            self.consecutive_failures = 0;
            return self.options.duration;
        }
        self.consecutive_failures += 1;

        if self.options.fast_retry_count > 0 {
            let window_open = self.fast_retry_cutoff.is_some_and(|cutoff| now < cutoff);
            if !window_open {
                self.fast_retry_cutoff = Some(now + self.options.fast_retry_window);
                self.fast_retries_in_window = 0;
            }
            self.fast_retries_in_window += 1;
            if self.fast_retries_in_window <= self.options.fast_retry_count {
                return jitter(self.options.fast_retry_delay, self.options.fast_retry_jitter);
            }
        }

        let mut duration =
            if self.consecutive_failures == 1 && !self.options.init_duration_if_fail.is_zero() {
                self.options.init_duration_if_fail
            } else {
                previous
            };
        if duration.is_zero() {
            duration = Duration::from_secs(1);
        }
        if self.options.factor > 0.0 {
            duration = duration.mul_f64(self.options.factor);
        }
        duration = jitter(duration, self.options.jitter);
        if !self.options.max_duration.is_zero() && duration > self.options.max_duration {
            duration = self.options.max_duration;
        }
        duration
    }
}

/// Adds up to `max_factor * duration` of random delay
pub fn jitter(duration: Duration, max_factor: f64) -> Duration {
    if max_factor <= 0.0 {
        return duration;
    }
    duration + duration.mul_f64(rand::random::<f64>() * max_factor)
}

/// Run `f` until it reports done or `cancel` fires.
///
/// `f` returns `Ok(true)` when finished, `Ok(false)` to go again without
/// counting a failure, and `Err` for a failed attempt. With `sliding` the
/// wait is computed after the attempt completes, so slow attempts do not eat
/// into the delay.
pub async fn backoff_until<F, Fut, E>(
    mut f: F,
    manager: &mut dyn BackoffManager,
    sliding: bool,
    cancel: &CancellationToken,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: Display,
{
    let mut delay = manager.backoff(Duration::ZERO, false);
    let mut previous_failed = false;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        if !sliding {
            delay = manager.backoff(delay, previous_failed);
        }

        match f().await {
            Ok(true) => return,
            Ok(false) => previous_failed = false,
            Err(e) => {
                debug!(error = %e, "attempt failed");
                previous_failed = true;
            }
        }

        if sliding {
            delay = manager.backoff(delay, previous_failed);
        }

        debug!("next attempt in {:?}", delay);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn exponential(max: Duration) -> FastBackoffOptions {
        FastBackoffOptions {
            duration: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.0,
            max_duration: max,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_growth_capped() {
        let mut backoff = FastBackoff::new(exponential(Duration::from_secs(10)));

        let mut delay = backoff.backoff(Duration::ZERO, false);
        assert_eq!(delay, Duration::from_secs(1));

        let mut seen = Vec::new();
        for _ in 0..6 {
            delay = backoff.backoff(delay, true);
            seen.push(delay);
        }

        assert_eq!(
            seen,
            vec![2, 4, 8, 10, 10, 10]
                .into_iter()
                .map(Duration::from_secs)
                .collect::<Vec<_>>()
        );
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(backoff.consecutive_failures(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_delay() {
        let mut backoff = FastBackoff::new(exponential(Duration::from_secs(10)));
        let mut delay = backoff.backoff(Duration::ZERO, false);
        delay = backoff.backoff(delay, true);
        delay = backoff.backoff(delay, true);
        assert_eq!(delay, Duration::from_secs(4));

        delay = backoff.backoff(delay, false);
        assert_eq!(delay, Duration::from_secs(1));
        assert_eq!(backoff.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_duration_if_fail() {
        let mut backoff = FastBackoff::new(FastBackoffOptions {
            init_duration_if_fail: Duration::from_millis(500),
            ..exponential(Duration::from_secs(10))
        });
        let delay = backoff.backoff(Duration::ZERO, false);
        let delay = backoff.backoff(delay, true);
        assert_eq!(delay, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_retry_window() {
        let mut backoff = FastBackoff::new(FastBackoffOptions {
            fast_retry_count: 3,
            fast_retry_delay: Duration::from_millis(200),
            fast_retry_window: Duration::from_secs(60),
            ..exponential(Duration::from_secs(20))
        });

        let mut delay = backoff.backoff(Duration::ZERO, false);
        let mut seen = Vec::new();
        for _ in 0..5 {
            delay = backoff.backoff(delay, true);
            seen.push(delay);
        }
        assert_eq!(
            seen,
            vec![200, 200, 200, 400, 800]
                .into_iter()
                .map(Duration::from_millis)
                .collect::<Vec<_>>()
        );

        // Window elapsed: short delays are available again
        tokio::time::advance(Duration::from_secs(61)).await;
        delay = backoff.backoff(delay, true);
        assert_eq!(delay, Duration::from_millis(200));
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(1);
        assert_eq!(jitter(base, 0.0), base);
        for _ in 0..100 {
            let d = jitter(base, 0.5);
            assert!(d >= base && d <= Duration::from_millis(1500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_until_retries_until_done() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut backoff = FastBackoff::new(exponential(Duration::from_secs(10)));
        let cancel = CancellationToken::new();

        let calls_clone = calls.clone();
        backoff_until(
            move || {
                let calls = calls_clone.clone();
                async move {
                    let mut calls = calls.lock().unwrap();
                    calls.push(Instant::now());
                    if calls.len() < 5 {
                        Err("refused")
                    } else {
                        Ok(true)
                    }
                }
            },
            &mut backoff,
            true,
            &cancel,
        )
        .await;

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 5);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![2, 4, 8, 10]
                .into_iter()
                .map(Duration::from_secs)
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_until_stops_on_cancel() {
        let mut backoff = FastBackoff::new(exponential(Duration::from_secs(10)));
        let cancel = CancellationToken::new();
        let attempts = Arc::new(Mutex::new(0u32));

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            cancel_clone.cancel();
        });

        let start = Instant::now();
        let attempts_clone = attempts.clone();
        backoff_until(
            move || {
                let attempts = attempts_clone.clone();
                async move {
                    *attempts.lock().unwrap() += 1;
                    Err::<bool, _>("unreachable")
                }
            },
            &mut backoff,
            true,
            &cancel,
        )
        .await;

        // Attempts at t=0 and t=2s; the 4s wait is interrupted at t=5s
        assert_eq!(*attempts.lock().unwrap(), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }
}
