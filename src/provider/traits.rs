//! プロバイダーアダプターの共通インターフェース定義
//!
//! # 責務
//!
//! - AIプロバイダーのセッションと通信するアダプターの共通トレイト
//!   [`ProviderAdapter`] を定義
//! - プロバイダー非依存の結果型 [`AdapterResult`] を提供
//! - 構造化された失敗コード [`AdapterErrorCode`] とトークン使用量 [`TokenUsage`] を定義
//!
//! アダプターは部分出力をチャンクコールバックで逐次通知し、最終結果を返します。
//! 失敗の分類はエラーメッセージの文字列から推測せず、常に構造化された値で表します。

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

/// 部分出力を受け取るコールバック
///
/// 1プロバイダー内では送信順に呼ばれます。並行する複数のプロバイダーから
/// 同時に呼ばれることがあるため `Send + Sync` です。
pub type ChunkSink<'a> = dyn Fn(&str) + Send + Sync + 'a;

/// AIプロバイダーのアダプター
///
/// # 実装要件
///
/// - `Send + Sync`: 複数のワークフローから同時に使用される
/// - `cancel` がキャンセルされたら速やかに [`ProviderError::Cancelled`] を返す
/// - 結果テキストは全チャンクを連結したものと一致させる
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// プロバイダーID
    fn id(&self) -> &str;

    /// 新規の会話としてプロンプトを送る
    async fn send_prompt(
        &self,
        prompt: &str,
        on_chunk: &ChunkSink<'_>,
        cancel: CancellationToken,
    ) -> Result<AdapterResult, ProviderError>;

    /// 既存の会話（`provider_context`）の続きとしてプロンプトを送る
    async fn send_continuation(
        &self,
        prompt: &str,
        provider_context: &Value,
        on_chunk: &ChunkSink<'_>,
        cancel: CancellationToken,
    ) -> Result<AdapterResult, ProviderError>;

    /// プロバイダーが利用可能か
    async fn health_check(&self) -> bool;
}

/// アダプターの呼び出し結果
///
/// `ok == false` はトランスポートとしては完了したが、プロバイダーが
/// エラーを返したことを表します。その場合 `error_code` を設定します。
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterResult {
    pub ok: bool,
    pub text: String,
    pub error_code: Option<AdapterErrorCode>,
    pub meta: AdapterMeta,
    pub latency_ms: u64,
}

impl AdapterResult {
    /// 成功結果を作る
    pub fn success(text: impl Into<String>, meta: AdapterMeta, latency_ms: u64) -> Self {
        Self {
            ok: true,
            text: text.into(),
            error_code: None,
            meta,
            latency_ms,
        }
    }

    /// プロバイダーエラーの結果を作る
    pub fn failure(code: AdapterErrorCode, text: impl Into<String>, meta: AdapterMeta, latency_ms: u64) -> Self {
        Self {
            ok: false,
            text: text.into(),
            error_code: Some(code),
            meta,
            latency_ms,
        }
    }
}

/// アダプター結果のメタデータ
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterMeta {
    /// 次回の継続に使う不透明な状態（会話カーソル等）
    pub provider_context: Option<Value>,
    /// 使用されたモデル名
    pub model: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

/// プロバイダーが返した構造化エラーコード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorCode {
    /// 上流のレート制限
    RateLimited,
    /// ネットワーク障害
    Network,
    /// 認証切れ
    Authentication,
    /// その他のプロバイダーエラー
    Provider,
}

/// トークン使用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    /// 入力トークン数（プロンプト）
    pub input_tokens: u32,

    /// 出力トークン数（生成テキスト）
    pub output_tokens: u32,
}

impl TokenUsage {
    /// 総トークン数を計算
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}
