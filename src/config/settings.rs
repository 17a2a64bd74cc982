//! 検証済み設定（ドメインモデル）
//!
//! # 責務
//!
//! [`SettingsDto`](super::dto::SettingsDto) を検証し、デフォルト値を補完した
//! [`Settings`] を提供します。しきい値やクールダウンは定数ではなく
//! すべてここから供給されます。

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use super::dto::{
    CircuitBreakerDto, LoggingDto, OrchestratorDto, PersistenceDto, ProviderDto, RateLimitDto,
    SettingsDto, StreamingDto,
};

/// アプリケーション設定
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub rate_limit: RateLimitSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub orchestrator: OrchestratorSettings,
    pub streaming: StreamingSettings,
    pub persistence: PersistenceSettings,
    pub logging: LoggingSettings,
    pub providers: Vec<ProviderSettings>,
}

/// プロバイダーごとのトークンバケット設定
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitSettings {
    /// バケット容量（バースト許容量）
    pub capacity: u32,
    /// 1秒あたりの補充トークン数
    pub refill_per_sec: f64,
    /// トークン待ちの上限時間
    pub acquire_timeout: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_per_sec: 1.0,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// サーキットブレーカー設定
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerSettings {
    /// ウィンドウ内の連続失敗数がこれに達すると OPEN
    pub failure_threshold: u32,
    /// 失敗を数える時間ウィンドウ
    pub window: Duration,
    /// OPEN から HALF_OPEN へ移るまでの時間
    pub cooldown: Duration,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// プロバイダー呼び出し1回あたりのタイムアウト
    pub provider_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(120),
        }
    }
}

/// ストリーミングバッチャー設定
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingSettings {
    /// フラッシュ間隔（UIのリフレッシュ周期に合わせる）
    pub flush_interval: Duration,
    /// キーごとのチャンク数上限（超えると即時フラッシュ）
    pub max_chunks_per_key: usize,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(16),
            max_chunks_per_key: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceSettings {
    /// ファイルストアのパス（未指定ならメモリストア）
    pub store_path: Option<PathBuf>,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            store_path: None,
            max_attempts: 3,
            retry_delay: Duration::from_millis(1000),
        }
    }
}

/// ログ出力形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSettings {
    /// `trace` / `debug` / `info` / `warn` / `error` / `off`
    pub level: String,
    pub format: LogFormat,
    /// 指定時は日次ローテーションのファイルに出力
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            directory: None,
        }
    }
}

/// 組み込みアダプターの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Claude Code CLI
    Claude,
    /// Codex CLI
    Codex,
}

/// プロバイダー定義
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    pub id: String,
    pub kind: ProviderKind,
    /// CLIコマンド名の上書き
    pub command: Option<String>,
    pub model: Option<String>,
}

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

impl Settings {
    /// TOML ファイルから設定を読み込む
    ///
    /// # 処理フロー
    ///
    /// 1. ファイル読み込み
    /// 2. TOML デシリアライズ → `SettingsDto`
    /// 3. バリデーション & 変換 → [`Settings`]
    ///
    /// # 戻り値
    ///
    /// * `Ok(Settings)` - 読み込みに成功した場合
    /// * `Err(ConfigError)` - ファイルの読み込み、パース、検証のいずれかに失敗した場合
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// TOML 文字列から設定を読み込む
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let dto: SettingsDto = toml::from_str(toml)?;
        Settings::try_from(dto)
    }

    /// 設定を TOML 文字列に変換
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        let dto = SettingsDto::from(self.clone());
        Ok(toml::to_string(&dto)?)
    }

    /// IDでプロバイダー定義を探す
    pub fn provider(&self, id: &str) -> Option<&ProviderSettings> {
        self.providers.iter().find(|p| p.id == id)
    }
}

/// DTO からドメインモデルへの変換（読み込み方向）
///
/// バリデーションを実施し、不正なデータの場合は [`ConfigError::Validation`] を返します。
impl TryFrom<SettingsDto> for Settings {
    type Error = ConfigError;

    fn try_from(dto: SettingsDto) -> Result<Self, Self::Error> {
        let rate_limit = rate_limit_from(dto.rate_limit.unwrap_or_default())?;
        let circuit_breaker = circuit_breaker_from(dto.circuit_breaker.unwrap_or_default())?;

        let orchestrator = {
            let raw = dto.orchestrator.unwrap_or_default();
            let defaults = OrchestratorSettings::default();
            let provider_timeout = match raw.provider_timeout_secs {
                Some(0) => return Err(validation("orchestrator.provider_timeout_secs は 1 以上にしてください")),
                Some(secs) => Duration::from_secs(secs),
                None => defaults.provider_timeout,
            };
            OrchestratorSettings { provider_timeout }
        };

        let streaming = {
            let raw = dto.streaming.unwrap_or_default();
            let defaults = StreamingSettings::default();
            let flush_interval = match raw.flush_interval_ms {
                Some(0) => return Err(validation("streaming.flush_interval_ms は 1 以上にしてください")),
                Some(ms) => Duration::from_millis(ms),
                None => defaults.flush_interval,
            };
            let max_chunks_per_key = match raw.max_chunks_per_key {
                Some(0) => return Err(validation("streaming.max_chunks_per_key は 1 以上にしてください")),
                Some(n) => n,
                None => defaults.max_chunks_per_key,
            };
            StreamingSettings { flush_interval, max_chunks_per_key }
        };

        let persistence = persistence_from(dto.persistence.unwrap_or_default())?;
        let logging = logging_from(dto.logging.unwrap_or_default())?;

        let mut providers: Vec<ProviderSettings> = Vec::with_capacity(dto.providers.len());
        for raw in dto.providers {
            let provider = provider_from(raw)?;
            if providers.iter().any(|p| p.id == provider.id) {
                return Err(ConfigError::Validation(format!(
                    "プロバイダーID '{}' が重複しています",
                    provider.id
                )));
            }
            providers.push(provider);
        }

        Ok(Settings {
            rate_limit,
            circuit_breaker,
            orchestrator,
            streaming,
            persistence,
            logging,
            providers,
        })
    }
}

fn validation(message: &str) -> ConfigError {
    ConfigError::Validation(message.to_string())
}

fn rate_limit_from(raw: RateLimitDto) -> Result<RateLimitSettings, ConfigError> {
    let defaults = RateLimitSettings::default();
    let capacity = raw.capacity.unwrap_or(defaults.capacity);
    if capacity == 0 {
        return Err(validation("rate_limit.capacity は 1 以上にしてください"));
    }
    let refill_per_sec = raw.refill_per_sec.unwrap_or(defaults.refill_per_sec);
    if !refill_per_sec.is_finite() || refill_per_sec <= 0.0 {
        return Err(validation("rate_limit.refill_per_sec は正の数にしてください"));
    }
    let acquire_timeout = raw
        .acquire_timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(defaults.acquire_timeout);
    Ok(RateLimitSettings {
        capacity,
        refill_per_sec,
        acquire_timeout,
    })
}

fn circuit_breaker_from(raw: CircuitBreakerDto) -> Result<CircuitBreakerSettings, ConfigError> {
    let defaults = CircuitBreakerSettings::default();
    let failure_threshold = raw.failure_threshold.unwrap_or(defaults.failure_threshold);
    if failure_threshold == 0 {
        return Err(validation("circuit_breaker.failure_threshold は 1 以上にしてください"));
    }
    let window = match raw.window_secs {
        Some(0) => return Err(validation("circuit_breaker.window_secs は 1 以上にしてください")),
        Some(secs) => Duration::from_secs(secs),
        None => defaults.window,
    };
    let cooldown = raw.cooldown_secs.map(Duration::from_secs).unwrap_or(defaults.cooldown);
    Ok(CircuitBreakerSettings {
        failure_threshold,
        window,
        cooldown,
    })
}

fn persistence_from(raw: PersistenceDto) -> Result<PersistenceSettings, ConfigError> {
    let defaults = PersistenceSettings::default();
    let max_attempts = raw.max_attempts.unwrap_or(defaults.max_attempts);
    if max_attempts == 0 {
        return Err(validation("persistence.max_attempts は 1 以上にしてください"));
    }
    Ok(PersistenceSettings {
        store_path: raw.store_path.map(PathBuf::from),
        max_attempts,
        retry_delay: raw
            .retry_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_delay),
    })
}

fn logging_from(raw: LoggingDto) -> Result<LoggingSettings, ConfigError> {
    let defaults = LoggingSettings::default();
    let level = raw.level.unwrap_or(defaults.level).to_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        return Err(ConfigError::Validation(format!(
            "logging.level '{}' は不正です（{} のいずれか）",
            level,
            LOG_LEVELS.join(" / ")
        )));
    }
    let format = match raw.format.as_deref() {
        None | Some("pretty") => LogFormat::Pretty,
        Some("json") => LogFormat::Json,
        Some(other) => {
            return Err(ConfigError::Validation(format!(
                "logging.format '{}' は不正です（pretty / json）",
                other
            )));
        }
    };
    Ok(LoggingSettings {
        level,
        format,
        directory: raw.directory.map(PathBuf::from),
    })
}

fn provider_from(raw: ProviderDto) -> Result<ProviderSettings, ConfigError> {
    if raw.id.trim().is_empty() {
        return Err(validation("providers.id が空です"));
    }
    let kind = match raw.kind.as_str() {
        "claude" => ProviderKind::Claude,
        "codex" => ProviderKind::Codex,
        other => {
            return Err(ConfigError::Validation(format!(
                "プロバイダー '{}' の kind '{}' は不正です（claude / codex）",
                raw.id, other
            )));
        }
    };
    Ok(ProviderSettings {
        id: raw.id,
        kind,
        command: raw.command,
        model: raw.model,
    })
}

/// ドメインモデルから DTO への変換（書き込み方向）
///
/// バリデーション済みのドメインモデルから DTO を生成するため、
/// この変換は失敗しません（`From` トレイトを使用）。
impl From<Settings> for SettingsDto {
    fn from(settings: Settings) -> Self {
        SettingsDto {
            rate_limit: Some(RateLimitDto {
                capacity: Some(settings.rate_limit.capacity),
                refill_per_sec: Some(settings.rate_limit.refill_per_sec),
                acquire_timeout_ms: Some(settings.rate_limit.acquire_timeout.as_millis() as u64),
            }),
            circuit_breaker: Some(CircuitBreakerDto {
                failure_threshold: Some(settings.circuit_breaker.failure_threshold),
                window_secs: Some(settings.circuit_breaker.window.as_secs()),
                cooldown_secs: Some(settings.circuit_breaker.cooldown.as_secs()),
            }),
            orchestrator: Some(OrchestratorDto {
                provider_timeout_secs: Some(settings.orchestrator.provider_timeout.as_secs()),
            }),
            streaming: Some(StreamingDto {
                flush_interval_ms: Some(settings.streaming.flush_interval.as_millis() as u64),
                max_chunks_per_key: Some(settings.streaming.max_chunks_per_key),
            }),
            persistence: Some(PersistenceDto {
                store_path: settings
                    .persistence
                    .store_path
                    .map(|p| p.to_string_lossy().into_owned()),
                max_attempts: Some(settings.persistence.max_attempts),
                retry_delay_ms: Some(settings.persistence.retry_delay.as_millis() as u64),
            }),
            logging: Some(LoggingDto {
                level: Some(settings.logging.level),
                format: Some(
                    match settings.logging.format {
                        LogFormat::Pretty => "pretty",
                        LogFormat::Json => "json",
                    }
                    .to_string(),
                ),
                directory: settings
                    .logging
                    .directory
                    .map(|p| p.to_string_lossy().into_owned()),
            }),
            providers: settings
                .providers
                .into_iter()
                .map(|p| ProviderDto {
                    id: p.id,
                    kind: match p.kind {
                        ProviderKind::Claude => "claude",
                        ProviderKind::Codex => "codex",
                    }
                    .to_string(),
                    command: p.command,
                    model: p.model,
                })
                .collect(),
        }
    }
}
