use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Process-wide buckets, one per endpoint URL, shared by every chain that
/// talks to the same URL.
static RATE_LIMITERS: LazyLock<Mutex<HashMap<String, Arc<TokenBucket>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Canonical form of an endpoint URL, so `http://node/` and `http://node`
/// share one bucket.
pub fn normalize_url(url: &str) -> &str {
    url.trim().trim_end_matches('/')
}

/// Return the bucket for `url`, creating it with `requests_per_second` on
/// first use. Later calls keep the rate of the first registration.
pub fn limiter_for(url: &str, requests_per_second: u32) -> Arc<TokenBucket> {
    let url = normalize_url(url);
    let mut map = match RATE_LIMITERS.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let bucket = map
        .entry(url.to_string())
        .or_insert_with(|| Arc::new(TokenBucket::new(requests_per_second)))
        .clone();

    let requested = f64::from(requests_per_second.max(1));
    if bucket.rate != requested {
        tracing::warn!(
            url,
            active = bucket.rate,
            requested,
            "Endpoint already has a rate limit, keeping the first one"
        );
    }
    bucket
}

/// Snapshot of every registered bucket's counters, keyed by URL.
pub fn snapshot_all() -> Vec<(String, LimiterStats)> {
    let map = match RATE_LIMITERS.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let mut stats: Vec<_> = map
        .iter()
        .map(|(url, bucket)| (url.clone(), bucket.stats()))
        .collect();
    stats.sort_by(|a, b| a.0.cmp(&b.0));
    stats
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct LimiterStats {
    pub requests: u64,
    pub throttled: u64,
    pub wait_ms: u64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket refilled continuously from elapsed time. Capacity equals the
/// per-second rate, so a full bucket absorbs a one-second burst.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
    requests: AtomicU64,
    throttled: AtomicU64,
    wait_ms: AtomicU64,
}

impl TokenBucket {
    pub fn new(requests_per_second: u32) -> Self {
        let rate = f64::from(requests_per_second.max(1));
        Self {
            rate,
            capacity: rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: Instant::now(),
            }),
            requests: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            wait_ms: AtomicU64::new(0),
        }
    }

    /// Wait until `n` tokens are available and take them. Only the calling
    /// task sleeps; the mutex is never held across an await.
    pub async fn acquire(&self, n: u32) {
        let wanted = f64::from(n).min(self.capacity);
        let started = Instant::now();
        let mut waited = false;

        loop {
            let wait = {
                let mut state = match self.state.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= wanted {
                    state.tokens -= wanted;
                    None
                } else {
                    Some(Duration::from_secs_f64((wanted - state.tokens) / self.rate))
                }
            };

            match wait {
                None => break,
                Some(delay) => {
                    waited = true;
                    tokio::time::sleep(delay.max(Duration::from_millis(1))).await;
                }
            }
        }

        self.requests.fetch_add(1, Ordering::Relaxed);
        if waited {
            self.throttled.fetch_add(1, Ordering::Relaxed);
            self.wait_ms
                .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            requests: self.requests.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            wait_ms: self.wait_ms.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_shares_one_bucket() {
        let first = limiter_for("http://limiter-shared:8545/", 7);
        let second = limiter_for(" http://limiter-shared:8545", 50);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.rate, 7.0);

        let urls: Vec<String> = snapshot_all().into_iter().map(|(url, _)| url).collect();
        assert!(urls.contains(&"http://limiter-shared:8545".to_string()));
        assert!(!urls.contains(&"http://limiter-shared:8545/".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_within_capacity_is_free() {
        let bucket = TokenBucket::new(10);
        let start = Instant::now();
        for _ in 0..10 {
            bucket.acquire(1).await;
        }
        assert!(start.elapsed() < Duration::from_millis(5));
        assert_eq!(bucket.stats().throttled, 0);
        assert_eq!(bucket.stats().requests, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_acquires_wait_for_refill() {
        // 5 tokens up front, then 10 more at 5/s: about two seconds.
        let bucket = TokenBucket::new(5);
        let start = Instant::now();
        for _ in 0..15 {
            bucket.acquire(1).await;
        }
        let elapsed = start.elapsed().as_secs_f64();
        assert!((1.9..2.2).contains(&elapsed), "elapsed {elapsed}");

        let stats = bucket.stats();
        assert_eq!(stats.requests, 15);
        assert_eq!(stats.throttled, 10);
        assert!(stats.wait_ms >= 1900);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_bucket() {
        let bucket = Arc::new(TokenBucket::new(4));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move { bucket.acquire(1).await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // 4 immediate, 4 more need one second of refill.
        let elapsed = start.elapsed().as_secs_f64();
        assert!((0.9..1.3).contains(&elapsed), "elapsed {elapsed}");
        assert_eq!(bucket.stats().requests, 8);
    }

    #[test]
    fn test_registry_is_keyed_by_url() {
        let a = limiter_for("http://limiter-test-a", 3);
        let again = limiter_for("http://limiter-test-a", 99);
        let b = limiter_for("http://limiter-test-b", 3);
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(snapshot_all()
            .iter()
            .any(|(url, _)| url == "http://limiter-test-a"));
    }
}
