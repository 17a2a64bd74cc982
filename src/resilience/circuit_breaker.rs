//! プロバイダーごとのサーキットブレーカー
//!
//! # 状態遷移
//!
//! ```text
//! CLOSED --(窓内の失敗が閾値に達する)--> OPEN
//! OPEN   --(クールダウン経過後の最初の取得)--> HALF_OPEN
//! HALF_OPEN --(試行が成功)--> CLOSED
//! HALF_OPEN --(試行が失敗)--> OPEN
//! ```
//!
//! HALF_OPEN で許可される試行は常に1件だけです。試行の結果が
//! [`CallOutcome::Neutral`] の場合は枠を返却し、次の呼び出しに試行を譲ります。
//! 結果を記録しないまま [`PermitGuard`] が破棄された場合も Neutral として扱います。

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerSettings;

/// 回路の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// 回路が開いているため呼び出しを拒否した
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("プロバイダー '{key}' の回路が開いています（再試行まで {retry_after:?}）")]
pub struct CircuitOpen {
    pub key: String,
    pub retry_after: Duration,
}

/// 呼び出し結果の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    /// 回路の判断に使わない結果（キャンセル、空レスポンス等）
    Neutral,
}

/// [`CircuitBreaker::try_acquire`] が返す許可証
///
/// 結果は同じ許可証とともに [`CircuitBreaker::record`] へ渡します。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct CallPermit {
    trial: bool,
}

impl CallPermit {
    /// HALF_OPEN の試行として許可されたか
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// 記録されずに破棄されると Neutral を記録する許可証
///
/// 呼び出し側の future がタイムアウト等で途中で破棄されても、HALF_OPEN の
/// 試行枠が占有されたまま残らないようにします。
#[derive(Debug)]
#[must_use]
pub struct PermitGuard<'a> {
    breaker: &'a CircuitBreaker,
    key: &'a str,
    permit: Option<CallPermit>,
}

impl PermitGuard<'_> {
    pub fn is_trial(&self) -> bool {
        self.permit.is_some_and(|permit| permit.trial)
    }

    /// 結果を記録して許可証を消費する
    pub fn record(mut self, outcome: CallOutcome) {
        if let Some(permit) = self.permit.take() {
            self.breaker.record(self.key, permit, outcome);
        }
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            if permit.trial {
                debug!(provider_id = self.key, "trial permit dropped without outcome, releasing slot");
            }
            self.breaker.record(self.key, permit, CallOutcome::Neutral);
        }
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failures.clear();
        self.opened_at = None;
        self.trial_in_flight = false;
    }
}

/// プロバイダーIDごとに回路を持つサーキットブレーカー
///
/// # 例
///
/// ```rust
/// use std::time::Duration;
/// use turnflow::config::CircuitBreakerSettings;
/// use turnflow::resilience::{CallOutcome, CircuitBreaker, CircuitState};
///
/// let breaker = CircuitBreaker::new(CircuitBreakerSettings {
///     failure_threshold: 1,
///     window: Duration::from_secs(60),
///     cooldown: Duration::from_secs(30),
/// });
///
/// let permit = breaker.try_acquire("claude").unwrap();
/// breaker.record("claude", permit, CallOutcome::Failure);
/// assert_eq!(breaker.state("claude"), CircuitState::Open);
/// assert!(breaker.try_acquire("claude").is_err());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    settings: CircuitBreakerSettings,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreaker {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            settings,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// 呼び出しの許可を求める
    ///
    /// # 戻り値
    ///
    /// - `Ok(CallPermit)`: 呼び出してよい
    /// - `Err(CircuitOpen)`: 回路が開いている、または HALF_OPEN の試行が進行中
    pub fn try_acquire(&self, key: &str) -> Result<CallPermit, CircuitOpen> {
        let now = Instant::now();
        let mut circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        let circuit = circuits.entry(key.to_string()).or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed => Ok(CallPermit { trial: false }),
            CircuitState::Open => {
                let opened_at = circuit.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.settings.cooldown {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.trial_in_flight = true;
                    info!(provider_id = key, "circuit half-open, admitting trial call");
                    Ok(CallPermit { trial: true })
                } else {
                    Err(CircuitOpen {
                        key: key.to_string(),
                        retry_after: self.settings.cooldown - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if circuit.trial_in_flight {
                    Err(CircuitOpen {
                        key: key.to_string(),
                        retry_after: Duration::ZERO,
                    })
                } else {
                    circuit.trial_in_flight = true;
                    debug!(provider_id = key, "circuit half-open, admitting next trial call");
                    Ok(CallPermit { trial: true })
                }
            }
        }
    }

    /// [`try_acquire`](Self::try_acquire) と同じ判定で、破棄時に枠を返す許可証を得る
    ///
    /// # 引数
    ///
    /// * `key` - プロバイダーID。許可証と同じ期間だけ借用されます
    pub fn admit<'a>(&'a self, key: &'a str) -> Result<PermitGuard<'a>, CircuitOpen> {
        let permit = self.try_acquire(key)?;
        Ok(PermitGuard {
            breaker: self,
            key,
            permit: Some(permit),
        })
    }

    /// 呼び出し結果を記録する
    pub fn record(&self, key: &str, permit: CallPermit, outcome: CallOutcome) {
        let now = Instant::now();
        let mut circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        let circuit = circuits.entry(key.to_string()).or_insert_with(Circuit::new);

        if permit.trial {
            if circuit.state != CircuitState::HalfOpen {
                return;
            }
            match outcome {
                CallOutcome::Success => {
                    circuit.close();
                    info!(provider_id = key, "circuit closed after successful trial");
                }
                CallOutcome::Failure => {
                    circuit.open(now);
                    warn!(provider_id = key, "circuit re-opened after failed trial");
                }
                CallOutcome::Neutral => {
                    circuit.trial_in_flight = false;
                }
            }
            return;
        }

        // OPEN / HALF_OPEN 中に届いた通常呼び出しの結果は判断に使わない
        if circuit.state != CircuitState::Closed {
            return;
        }

        match outcome {
            CallOutcome::Success => circuit.failures.clear(),
            CallOutcome::Failure => {
                circuit.failures.push_back(now);
                circuit.prune(now, self.settings.window);
                if circuit.failures.len() >= self.settings.failure_threshold as usize {
                    circuit.open(now);
                    warn!(
                        provider_id = key,
                        failures = self.settings.failure_threshold,
                        window_secs = self.settings.window.as_secs(),
                        "circuit opened"
                    );
                }
            }
            CallOutcome::Neutral => {}
        }
    }

    /// 現在の状態（未知のキーは CLOSED）
    pub fn state(&self, key: &str) -> CircuitState {
        let circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        circuits
            .get(key)
            .map(|circuit| circuit.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// 回路を CLOSED に戻す
    pub fn reset(&self, key: &str) {
        let mut circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(circuit) = circuits.get_mut(key) {
            circuit.close();
            info!(provider_id = key, "circuit reset");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, window_secs: u64, cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerSettings {
            failure_threshold: threshold,
            window: Duration::from_secs(window_secs),
            cooldown: Duration::from_secs(cooldown_secs),
        })
    }

    fn fail(breaker: &CircuitBreaker, key: &str) {
        let permit = breaker.try_acquire(key).unwrap();
        breaker.record(key, permit, CallOutcome::Failure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = breaker(3, 60, 30);
        fail(&breaker, "a");
        fail(&breaker, "a");
        assert_eq!(breaker.state("a"), CircuitState::Closed);
        fail(&breaker, "a");
        assert_eq!(breaker.state("a"), CircuitState::Open);
        assert!(breaker.try_acquire("a").is_err());
        // 他のプロバイダーには影響しない
        assert!(breaker.try_acquire("b").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_are_forgotten() {
        let breaker = breaker(2, 10, 30);
        fail(&breaker, "a");
        tokio::time::advance(Duration::from_secs(11)).await;
        fail(&breaker, "a");
        assert_eq!(breaker.state("a"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(2, 60, 30);
        fail(&breaker, "a");
        let permit = breaker.try_acquire("a").unwrap();
        breaker.record("a", permit, CallOutcome::Success);
        fail(&breaker, "a");
        assert_eq!(breaker.state("a"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_neutral_outcome_is_ignored_when_closed() {
        let breaker = breaker(1, 60, 30);
        let permit = breaker.try_acquire("a").unwrap();
        breaker.record("a", permit, CallOutcome::Neutral);
        assert_eq!(breaker.state("a"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let breaker = breaker(1, 60, 30);
        fail(&breaker, "a");

        let err = breaker.try_acquire("a").unwrap_err();
        assert_eq!(err.retry_after, Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(30)).await;
        let trial = breaker.try_acquire("a").unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state("a"), CircuitState::HalfOpen);
        assert!(breaker.try_acquire("a").is_err());

        breaker.record("a", trial, CallOutcome::Success);
        assert_eq!(breaker.state("a"), CircuitState::Closed);
        assert!(breaker.try_acquire("a").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = breaker(1, 60, 30);
        fail(&breaker, "a");
        tokio::time::advance(Duration::from_secs(30)).await;

        let trial = breaker.try_acquire("a").unwrap();
        breaker.record("a", trial, CallOutcome::Failure);
        assert_eq!(breaker.state("a"), CircuitState::Open);

        // クールダウンは再び最初から
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.try_acquire("a").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_neutral_trial_releases_slot() {
        let breaker = breaker(1, 60, 30);
        fail(&breaker, "a");
        tokio::time::advance(Duration::from_secs(30)).await;

        let trial = breaker.try_acquire("a").unwrap();
        breaker.record("a", trial, CallOutcome::Neutral);
        assert_eq!(breaker.state("a"), CircuitState::HalfOpen);

        let next = breaker.try_acquire("a").unwrap();
        assert!(next.is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_guard_releases_slot() {
        let breaker = breaker(1, 60, 30);
        fail(&breaker, "a");
        tokio::time::advance(Duration::from_secs(30)).await;

        let trial = breaker.admit("a").unwrap();
        assert!(trial.is_trial());
        assert!(breaker.try_acquire("a").is_err());
        drop(trial);

        assert_eq!(breaker.state("a"), CircuitState::HalfOpen);
        let next = breaker.admit("a").unwrap();
        assert!(next.is_trial());
        next.record(CallOutcome::Success);
        assert_eq!(breaker.state("a"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_regular_guard_is_neutral() {
        let breaker = breaker(1, 60, 30);
        drop(breaker.admit("a").unwrap());
        assert_eq!(breaker.state("a"), CircuitState::Closed);
        assert!(!breaker.admit("a").unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_regular_result_does_not_close_half_open() {
        let breaker = breaker(1, 60, 30);
        let early = breaker.try_acquire("a").unwrap();
        fail(&breaker, "a");
        tokio::time::advance(Duration::from_secs(30)).await;
        let _trial = breaker.try_acquire("a").unwrap();

        breaker.record("a", early, CallOutcome::Success);
        assert_eq!(breaker.state("a"), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let breaker = breaker(1, 60, 30);
        fail(&breaker, "a");
        breaker.reset("a");
        assert_eq!(breaker.state("a"), CircuitState::Closed);
    }
}
