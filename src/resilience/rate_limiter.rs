//! プロバイダーごとのトークンバケット
//!
//! 補充はバックグラウンドタイマーを使わず、取得のたびに経過時間から
//! 遅延計算します。ロックは待機中に保持しません。

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RateLimitSettings;

/// 時間内に実行枠を確保できなかった
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("プロバイダー '{key}' の実行枠を {waited:?} 以内に確保できませんでした")]
pub struct AdmissionDenied {
    pub key: String,
    pub waited: Duration,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(capacity),
            last_refill: now,
        }
    }

    fn refill(&mut self, capacity: u32, refill_per_sec: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(f64::from(capacity));
        self.last_refill = now;
    }
}

/// プロバイダーごとのトークンバケット群
#[derive(Debug)]
pub struct RateLimiter {
    settings: RateLimitSettings,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// 設定のタイムアウトでトークンを取得
    ///
    /// トークンが期限までに補充されない場合もタイムアウトまで待機してから
    /// [`AdmissionDenied`] を返します。
    pub async fn acquire(&self, key: &str) -> Result<(), AdmissionDenied> {
        self.acquire_with_timeout(key, self.settings.acquire_timeout).await
    }

    /// トークンが得られるまで、最長 `timeout` だけ待機する
    ///
    /// 次のトークンが期限までに届かない場合は期限まで眠り、最後にもう一度
    /// 取得を試みてから [`AdmissionDenied`] を返します。`waited` は常に
    /// 実際に待った時間です。
    pub async fn acquire_with_timeout(&self, key: &str, timeout: Duration) -> Result<(), AdmissionDenied> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let wait = match self.take_or_wait(key) {
                None => return Ok(()),
                Some(wait) => wait,
            };

            let now = Instant::now();
            if now.checked_add(wait).is_none_or(|ready_at| ready_at > deadline) {
                tokio::time::sleep_until(deadline).await;
                if self.take_or_wait(key).is_none() {
                    return Ok(());
                }
                let waited = Instant::now().saturating_duration_since(started);
                warn!(
                    provider_id = key,
                    waited_ms = waited.as_millis() as u64,
                    "admission denied by rate limiter"
                );
                return Err(AdmissionDenied {
                    key: key.to_string(),
                    waited,
                });
            }

            debug!(provider_id = key, wait_ms = wait.as_millis() as u64, "waiting for rate limit token");
            tokio::time::sleep(wait).await;
        }
    }

    /// 待たずに取得を試みる
    pub fn try_acquire(&self, key: &str) -> bool {
        self.take_or_wait(key).is_none()
    }

    /// 現在の残りトークン数
    pub fn available(&self, key: &str) -> f64 {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(self.settings.capacity, now));
        bucket.refill(self.settings.capacity, self.settings.refill_per_sec, now);
        bucket.tokens
    }

    /// 取得できれば `None`、できなければ次のトークンまでの待ち時間
    fn take_or_wait(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(self.settings.capacity, now));
        bucket.refill(self.settings.capacity, self.settings.refill_per_sec, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            None
        } else {
            let missing = 1.0 - bucket.tokens;
            // 補充が極端に遅いと表現できない長さになる
            Some(Duration::try_from_secs_f64(missing / self.settings.refill_per_sec).unwrap_or(Duration::MAX))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(capacity: u32, refill_per_sec: f64, timeout_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitSettings {
            capacity,
            refill_per_sec,
            acquire_timeout: Duration::from_millis(timeout_ms),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_up_to_capacity() {
        let limiter = limiter(3, 1.0, 0);
        for _ in 0..3 {
            assert!(limiter.acquire("a").await.is_ok());
        }
        let err = limiter.acquire("a").await.unwrap_err();
        assert_eq!(err.key, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_buckets_are_per_provider() {
        let limiter = limiter(1, 1.0, 0);
        assert!(limiter.try_acquire("a"));
        assert!(!limiter.try_acquire("a"));
        assert!(limiter.try_acquire("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = limiter(1, 2.0, 1_000);
        assert!(limiter.try_acquire("a"));

        let started = Instant::now();
        assert!(limiter.acquire("a").await.is_ok());
        // 2 tokens/sec なので 500ms 待つ
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_refill_too_slow() {
        let limiter = limiter(1, 0.5, 1_000);
        assert!(limiter.try_acquire("a"));
        // 次のトークンまで2秒かかる
        let started = Instant::now();
        let err = limiter.acquire("a").await.unwrap_err();
        assert_eq!(err.waited, Duration::from_secs(1));
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_refill_rate_denies_instead_of_overflowing() {
        let limiter = limiter(1, 1e-30, 1_000);
        assert!(limiter.try_acquire("a"));
        assert!(!limiter.try_acquire("a"));

        let err = limiter.acquire("a").await.unwrap_err();
        assert_eq!(err.waited, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_exceeds_capacity() {
        let limiter = limiter(2, 10.0, 0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!((limiter.available("a") - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_grants_exactly_capacity_immediately() {
        let limiter = Arc::new(limiter(5, 0.001, 0));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.acquire("a").await.is_ok() }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
    }
}
