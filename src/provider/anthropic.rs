//! Anthropic Claude Code CLI アダプター
//!
//! # 責務
//!
//! - Claude Code CLI (`claude` コマンド) との通信を担当
//! - [`ProviderAdapter`] トレイトを実装し、統一インターフェースを提供
//! - `stream-json` 出力を1行ずつパースし、部分出力を逐次通知
//!
//! # CLIツール
//!
//! - **コマンド**: `claude -p <prompt> --output-format stream-json --verbose [--resume <session_id>]`
//! - **インストール**: `npm install -g @anthropic-ai/claude-code`
//! - **認証方法**:
//!   1. 環境変数 `ANTHROPIC_API_KEY` を設定
//!   2. `claude` を起動して `/login` コマンドを実行
//!
//! # 出力形式
//!
//! ```json
//! {"type":"system","subtype":"init","session_id":"abc"}
//! {"type":"assistant","session_id":"abc","message":{"model":"claude-sonnet-4-5","content":[{"type":"text","text":"Hello"}]}}
//! {"type":"result","subtype":"success","is_error":false,"result":"Hello","session_id":"abc","usage":{"input_tokens":10,"output_tokens":2}}
//! ```
//!
//! # プロバイダーコンテキスト
//!
//! `{"session_id": "<id>"}`。継続時は `--resume` に渡します。

use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use super::process::{run_streaming, version_check};
use super::traits::{AdapterErrorCode, AdapterMeta, AdapterResult, ChunkSink, ProviderAdapter, TokenUsage};

/// デフォルトのCLIコマンド名
const DEFAULT_COMMAND: &str = "claude";

/// NPMパッケージ名（エラーメッセージ用）
const NPM_PACKAGE: &str = "@anthropic-ai/claude-code";

/// Anthropic Claude Code CLI アダプター
pub struct ClaudeCliAdapter {
    id: String,
    /// 使用するCLIコマンド名（通常は "claude"）
    command: String,
    model: Option<String>,
}

impl ClaudeCliAdapter {
    /// 新しいアダプターを生成
    ///
    /// # 例
    ///
    /// ```rust
    /// use turnflow::provider::anthropic::ClaudeCliAdapter;
    /// use turnflow::provider::ProviderAdapter;
    ///
    /// let adapter = ClaudeCliAdapter::new("claude");
    /// assert_eq!(adapter.id(), "claude");
    /// ```
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: DEFAULT_COMMAND.to_string(),
            model: None,
        }
    }

    /// カスタムコマンド名を指定
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    fn build_command(&self, prompt: &str, resume: Option<&str>) -> Command {
        let mut command = Command::new(&self.command);
        command
            .arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");
        if let Some(model) = &self.model {
            command.arg("--model").arg(model);
        }
        if let Some(session_id) = resume {
            command.arg("--resume").arg(session_id);
        }
        command
    }

    /// CLIを実行してストリームを集約する
    async fn run(
        &self,
        prompt: &str,
        resume: Option<&str>,
        on_chunk: &ChunkSink<'_>,
        cancel: CancellationToken,
    ) -> Result<AdapterResult, ProviderError> {
        let started = Instant::now();
        let mut stream = ClaudeStream::default();

        let exit = run_streaming(
            self.build_command(prompt, resume),
            &self.command,
            NPM_PACKAGE,
            cancel,
            |line| stream.apply_line(line, on_chunk),
        )
        .await?;

        let latency_ms = started.elapsed().as_millis() as u64;

        // result イベントが来ていれば終了コードより優先する
        if stream.saw_result {
            return Ok(stream.into_result(latency_ms));
        }
        if !exit.success {
            return Err(ProviderError::CliExecution {
                code: exit.code,
                stderr: exit.stderr,
            });
        }
        Err(ProviderError::InvalidResponse(
            "result イベントがありません".to_string(),
        ))
    }
}

#[async_trait]
impl ProviderAdapter for ClaudeCliAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_prompt(
        &self,
        prompt: &str,
        on_chunk: &ChunkSink<'_>,
        cancel: CancellationToken,
    ) -> Result<AdapterResult, ProviderError> {
        self.run(prompt, None, on_chunk, cancel).await
    }

    async fn send_continuation(
        &self,
        prompt: &str,
        provider_context: &Value,
        on_chunk: &ChunkSink<'_>,
        cancel: CancellationToken,
    ) -> Result<AdapterResult, ProviderError> {
        let session_id = provider_context
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidContext("session_id がありません".to_string()))?;
        self.run(prompt, Some(session_id), on_chunk, cancel).await
    }

    async fn health_check(&self) -> bool {
        version_check(&self.command).await
    }
}

/// stream-json の1行（全イベントタイプの共通構造）
#[derive(Debug, Deserialize)]
struct ClaudeStreamEvent {
    #[serde(rename = "type")]
    event_type: String,

    #[serde(default)]
    session_id: Option<String>,

    #[serde(default)]
    message: Option<ClaudeMessage>,

    #[serde(default)]
    result: Option<String>,

    #[serde(default)]
    is_error: Option<bool>,

    #[serde(default)]
    usage: Option<ClaudeUsage>,
}

#[derive(Debug, Deserialize)]
struct ClaudeMessage {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ClaudeContent>,
}

#[derive(Debug, Deserialize)]
struct ClaudeContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClaudeUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

/// ストリームの集約状態
#[derive(Debug, Default)]
struct ClaudeStream {
    text: String,
    session_id: Option<String>,
    model: Option<String>,
    usage: Option<TokenUsage>,
    final_text: Option<String>,
    is_error: bool,
    saw_result: bool,
}

impl ClaudeStream {
    fn apply_line(&mut self, line: &str, on_chunk: &ChunkSink<'_>) -> Result<(), ProviderError> {
        let event: ClaudeStreamEvent = serde_json::from_str(line).map_err(|e| {
            ProviderError::InvalidResponse(format!("stream-json parse error: {}: {}", e, line))
        })?;

        if let Some(session_id) = event.session_id {
            self.session_id = Some(session_id);
        }

        match event.event_type.as_str() {
            "assistant" => {
                if let Some(message) = event.message {
                    if message.model.is_some() {
                        self.model = message.model;
                    }
                    for content in message.content {
                        if content.content_type == "text"
                            && let Some(text) = content.text
                        {
                            on_chunk(&text);
                            self.text.push_str(&text);
                        }
                    }
                }
            }
            "result" => {
                self.saw_result = true;
                self.is_error = event.is_error.unwrap_or(false);
                self.final_text = event.result;
                if let Some(usage) = event.usage {
                    self.usage = Some(TokenUsage {
                        input_tokens: usage.input_tokens.unwrap_or(0),
                        output_tokens: usage.output_tokens.unwrap_or(0),
                    });
                }
            }
            _ => {
                // system / user などは無視
            }
        }
        Ok(())
    }

    fn into_result(self, latency_ms: u64) -> AdapterResult {
        let meta = AdapterMeta {
            provider_context: self.session_id.map(|id| json!({ "session_id": id })),
            model: self.model,
            token_usage: self.usage,
        };
        // ストリームで受け取ったテキストを優先（チャンクの連結と一致させる）
        let text = if self.text.is_empty() {
            self.final_text.unwrap_or_default()
        } else {
            self.text
        };
        if self.is_error {
            AdapterResult::failure(AdapterErrorCode::Provider, text, meta, latency_ms)
        } else {
            AdapterResult::success(text, meta, latency_ms)
        }
    }
}
