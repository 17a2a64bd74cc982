//! 設定の読み込みと検証
//!
//! # 責務
//!
//! - TOML 形式の設定ファイルを読み込み、検証済みの [`Settings`] に変換
//! - レートリミッター、サーキットブレーカー、タイムアウト、ストリーミング、
//!   永続化、ロギング、プロバイダー定義の各セクションを管理
//!
//! # 変換フロー
//!
//! ```text
//! TOML ファイル
//!   ↓ (デシリアライズ)
//! SettingsDto（全フィールド省略可）
//!   ↓ (TryFrom でバリデーション + デフォルト補完)
//! Settings (ドメインモデル)
//! ```
//!
//! # 設定例
//!
//! ```toml
//! [rate_limit]
//! capacity = 5
//! refill_per_sec = 1.0
//! acquire_timeout_ms = 10000
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! window_secs = 60
//! cooldown_secs = 30
//!
//! [[providers]]
//! id = "claude"
//! kind = "claude"
//!
//! [[providers]]
//! id = "codex"
//! kind = "codex"
//! model = "gpt-5"
//! ```

mod dto;
pub mod settings;

pub use settings::{
    CircuitBreakerSettings, LogFormat, LoggingSettings, OrchestratorSettings, PersistenceSettings,
    ProviderKind, ProviderSettings, RateLimitSettings, Settings, StreamingSettings,
};
