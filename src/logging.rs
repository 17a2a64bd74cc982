//! ロギングの初期化
//!
//! `tracing-subscriber` の fmt サブスクライバーを設定に従って組み立てます。
//! 出力先ディレクトリが指定された場合は `tracing-appender` の日次ローテーション
//! ファイルへ非ブロッキングで書き込みます。返される [`WorkerGuard`] は
//! プロセス終了までドロップしないでください（未書き込みのログが失われます）。

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{LogFormat, LoggingSettings};
use crate::error::ConfigError;

/// ログファイル名のプレフィックス
const LOG_FILE_PREFIX: &str = "turnflow.log";

/// グローバルなサブスクライバーを設定する
///
/// # 戻り値
///
/// - `Ok(Some(guard))`: ファイル出力時。ガードを保持すること
/// - `Ok(None)`: 標準エラー出力時
/// - `Err(ConfigError)`: レベルが不正、または既に初期化済み
pub fn init(settings: &LoggingSettings) -> Result<Option<WorkerGuard>, ConfigError> {
    let level: LevelFilter = settings
        .level
        .parse()
        .map_err(|e| ConfigError::Validation(format!("logging.level: {}", e)))?;

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true);

    match (&settings.directory, settings.format) {
        (Some(directory), format) => {
            let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let builder = builder.with_ansi(false).with_writer(writer);
            let result = match format {
                LogFormat::Json => builder.json().try_init(),
                LogFormat::Pretty => builder.try_init(),
            };
            result.map_err(|e| ConfigError::LoggingInit(e.to_string()))?;
            Ok(Some(guard))
        }
        (None, format) => {
            let builder = builder.with_writer(std::io::stderr);
            let result = match format {
                LogFormat::Json => builder.json().try_init(),
                LogFormat::Pretty => builder.try_init(),
            };
            result.map_err(|e| ConfigError::LoggingInit(e.to_string()))?;
            Ok(None)
        }
    }
}
