//! 耐障害性プリミティブ
//!
//! プロバイダーごとの流量制御と障害遮断を提供します。どちらもプロセス全体で
//! 共有され、並行する全ワークフローから同時に更新されます。
//!
//! - [`rate_limiter`][]: トークンバケットによるアドミッション制御
//! - [`circuit_breaker`][]: 失敗率に基づく状態機械（CLOSED / OPEN / HALF_OPEN）

pub mod rate_limiter;
pub mod circuit_breaker;

pub use rate_limiter::{AdmissionDenied, RateLimiter};
pub use circuit_breaker::{CallOutcome, CallPermit, CircuitBreaker, CircuitOpen, CircuitState, PermitGuard};
