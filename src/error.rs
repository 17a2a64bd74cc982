//! エラー型の定義
//!
//! このモジュールは、turnflow 全体で使用されるエラー型を定義します。
//!
//! プロバイダー単位の失敗（タイムアウト、レート制限、空レスポンス等）は
//! エラーではなくデータとして扱われます。詳細は
//! [`ProviderFailure`](crate::orchestrator::ProviderFailure) を参照してください。

use thiserror::Error;

/// 設定関連のエラー
#[derive(Debug, Error)]
pub enum ConfigError {
    /// ファイルの読み込みに失敗
    #[error("設定ファイルの読み込みに失敗しました: {0}")]
    FileRead(#[from] std::io::Error),

    /// TOML のデシリアライズに失敗
    #[error("TOML のデシリアライズに失敗しました: {0}")]
    TomlDeserialize(#[from] toml::de::Error),

    /// TOML のシリアライズに失敗
    #[error("TOML のシリアライズに失敗しました: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// バリデーションエラー
    #[error("設定のバリデーションに失敗しました: {0}")]
    Validation(String),

    /// ロガーの初期化に失敗
    #[error("ロガーの初期化に失敗しました: {0}")]
    LoggingInit(String),
}

/// プロバイダーアダプターのエラー
///
/// アダプターが返すトランスポートレベルのエラーです。
/// オーケストレーターはこれを [`FailureKind`](crate::orchestrator::FailureKind)
/// に分類し、ファンアウトの外へは伝播させません。
#[derive(Debug, Error)]
pub enum ProviderError {
    /// CLIツールが見つからない（コマンド名, パッケージ名）
    #[error("CLIツール '{0}' が見つかりません。`npm install -g {1}` でインストールしてください")]
    CliNotFound(String, String),

    /// プロセス起動・入出力エラー
    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    /// CLIが非0で終了した
    #[error("CLI実行エラー (exit code {code}): {stderr}")]
    CliExecution {
        /// 終了コード
        code: i32,
        /// 標準エラー出力
        stderr: String,
    },

    /// 上流のレート制限
    #[error("レート制限を超えました")]
    RateLimitExceeded,

    /// 不正なレスポンス
    #[error("不正なレスポンス: {0}")]
    InvalidResponse(String),

    /// 継続に必要なプロバイダーコンテキストが不正
    #[error("プロバイダーコンテキストが不正です: {0}")]
    InvalidContext(String),

    /// 呼び出しがキャンセルされた
    #[error("呼び出しがキャンセルされました")]
    Cancelled,
}

/// KVストアのエラー
#[derive(Debug, Error)]
pub enum StoreError {
    /// レコードのシリアライズ/デシリアライズに失敗
    #[error("レコードの変換に失敗しました: {0}")]
    Serialization(#[from] serde_json::Error),

    /// ファイルI/Oエラー
    #[error("ストアのI/Oに失敗しました: {0}")]
    Io(#[from] std::io::Error),

    /// レコードに主キーがない
    #[error("テーブル '{table}' のレコードに id がありません")]
    MissingKey {
        /// テーブル名
        table: &'static str,
    },
}

/// 永続化のエラー
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// ストアのエラー
    #[error("ストアエラー: {0}")]
    Store(#[from] StoreError),

    /// 参照先のレコードが存在しない
    #[error("{table} '{key}' が見つかりません")]
    MissingRecord {
        /// テーブル名
        table: &'static str,
        /// 主キー
        key: String,
    },

    /// 記録できない状態（例: 成功出力のない結果）
    #[error("永続化できない状態です: {0}")]
    InvalidState(String),
}

/// コンテキスト解決のエラー
#[derive(Debug, Error)]
pub enum ResolveError {
    /// 参照されたターンまたはセッションが存在しない
    #[error("コンテキストが見つかりません: {0}")]
    MissingContext(String),

    /// ストアのエラー
    #[error("ストアエラー: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_validation_message() {
        let err = ConfigError::Validation("capacity は 1 以上".to_string());
        assert_eq!(
            err.to_string(),
            "設定のバリデーションに失敗しました: capacity は 1 以上"
        );
    }

    #[test]
    fn test_persistence_error_from_store_error() {
        let err = PersistenceError::from(StoreError::MissingKey { table: "turns" });
        assert!(matches!(err, PersistenceError::Store(_)));
        assert_eq!(
            err.to_string(),
            "ストアエラー: テーブル 'turns' のレコードに id がありません"
        );
    }

    #[test]
    fn test_cli_not_found_message() {
        let err = ProviderError::CliNotFound("claude".to_string(), "@anthropic-ai/claude-code".to_string());
        assert!(err.to_string().contains("@anthropic-ai/claude-code"));
    }
}
