use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

#[derive(Clone, Debug, Default)]
pub struct Limits {
    pub per_second: Option<u32>,
    pub concurrency: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    limits: Limits,
    // token bucket modeled by the time of last refill and the current tokens
    tokens: Mutex<(f64, Instant)>,
    sem: Option<Arc<Semaphore>>,
}

/// Held for the duration of one rate-limited operation.
pub struct Permit {
    _concurrency: Option<OwnedSemaphorePermit>,
}

impl RateLimiter {
    pub fn new(limits: Limits) -> Self {
        let now = Instant::now();
        // Start with one token so the first operation is not delayed a full period
        let capacity = limits.per_second.map(|r| (r as f64).max(1.0)).unwrap_or(0.0);
        let sem = limits.concurrency.map(|c| Arc::new(Semaphore::new(c.max(1) as usize)));
        Self {
            inner: Arc::new(Inner {
                limits,
                tokens: Mutex::new((capacity.min(1.0), now)),
                sem,
            }),
        }
    }

    /// Wait for a concurrency slot and one rate token.
    pub async fn acquire(&self) -> Permit {
        // Concurrency first
        let permit = match &self.inner.sem {
            Some(sem) => sem.clone().acquire_owned().await.ok(),
            None => None,
        };

        if let Some(rate) = self.inner.limits.per_second {
            if rate > 0 {
                self.consume_token(rate as f64).await;
            }
        }
        Permit { _concurrency: permit }
    }

    async fn consume_token(&self, rate: f64) {
        // Basic token bucket: refill continuously, wait until a token accumulates
        loop {
            let mut guard = self.inner.tokens.lock().await;
            let (ref mut tokens, ref mut last) = *guard;
            let now = Instant::now();
            let elapsed = now.duration_since(*last).as_secs_f64();
            *tokens = (*tokens + elapsed * rate).min(rate.max(1.0));
            *last = now;
            if *tokens >= 1.0 {
                *tokens -= 1.0;
                break;
            }
            let secs = (1.0 - *tokens) / rate;
            drop(guard);
            tokio::time::sleep(Duration::from_secs_f64(secs.max(0.001))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn paces_operations_per_second() {
        let rl = RateLimiter::new(Limits { per_second: Some(20), concurrency: None });
        let start = Instant::now();
        for _ in 0..5 {
            let _p = rl.acquire().await;
        }
        // first token is immediate, the remaining four need ~200ms at 20/s
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn unlimited_does_not_wait() {
        let rl = RateLimiter::new(Limits::default());
        let start = Instant::now();
        for _ in 0..100 {
            let _p = rl.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
