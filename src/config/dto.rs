//! TOML デシリアライズ用の DTO (Data Transfer Object)
//!
//! # 責務
//!
//! このモジュールは、TOML ファイルからのデータ読み込み専用の構造体を提供します。
//! DTO はバリデーション前の「生データ」を表現し、ドメインモデルとは分離されています。
//!
//! ## 設計思想
//!
//! - **単一責務**: TOML のデシリアライズのみを担当
//! - **省略可能**: すべてのフィールドは `Option` で、省略時はデフォルト値で補完
//! - **カプセル化**: config モジュール内部のみで使用（外部非公開）

use serde::{Deserialize, Serialize};

/// 設定ファイル全体の DTO
#[derive(Debug, Default, Serialize, Deserialize)]
pub(super) struct SettingsDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) rate_limit: Option<RateLimitDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) circuit_breaker: Option<CircuitBreakerDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) orchestrator: Option<OrchestratorDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) streaming: Option<StreamingDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) persistence: Option<PersistenceDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) logging: Option<LoggingDto>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(super) providers: Vec<ProviderDto>,
}

/// `[rate_limit]` セクション
#[derive(Debug, Default, Serialize, Deserialize)]
pub(super) struct RateLimitDto {
    pub(super) capacity: Option<u32>,
    pub(super) refill_per_sec: Option<f64>,
    pub(super) acquire_timeout_ms: Option<u64>,
}

/// `[circuit_breaker]` セクション
#[derive(Debug, Default, Serialize, Deserialize)]
pub(super) struct CircuitBreakerDto {
    pub(super) failure_threshold: Option<u32>,
    pub(super) window_secs: Option<u64>,
    pub(super) cooldown_secs: Option<u64>,
}

/// `[orchestrator]` セクション
#[derive(Debug, Default, Serialize, Deserialize)]
pub(super) struct OrchestratorDto {
    pub(super) provider_timeout_secs: Option<u64>,
}

/// `[streaming]` セクション
#[derive(Debug, Default, Serialize, Deserialize)]
pub(super) struct StreamingDto {
    pub(super) flush_interval_ms: Option<u64>,
    pub(super) max_chunks_per_key: Option<usize>,
}

/// `[persistence]` セクション
#[derive(Debug, Default, Serialize, Deserialize)]
pub(super) struct PersistenceDto {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) store_path: Option<String>,
    pub(super) max_attempts: Option<u32>,
    pub(super) retry_delay_ms: Option<u64>,
}

/// `[logging]` セクション
#[derive(Debug, Default, Serialize, Deserialize)]
pub(super) struct LoggingDto {
    pub(super) level: Option<String>,
    pub(super) format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) directory: Option<String>,
}

/// `[[providers]]` 配列の要素
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct ProviderDto {
    pub(super) id: String,
    pub(super) kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) model: Option<String>,
}
