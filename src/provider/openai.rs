//! OpenAI Codex CLI アダプター
//!
//! # 責務
//!
//! - Codex CLI (`codex exec`) との通信を担当
//! - [`ProviderAdapter`] トレイトを実装し、統一インターフェースを提供
//! - JSONL形式（複数行のJSONイベント）の出力をパースし、部分出力を逐次通知
//!
//! # CLIツール
//!
//! - **コマンド**: `codex exec --json [--model <model>] "prompt"`
//! - **継続**: `codex exec --json resume <thread_id> "prompt"`
//! - **インストール**: `npm install -g @openai/codex`
//! - **認証方法**:
//!   1. 環境変数 `OPENAI_API_KEY` を設定
//!   2. `codex login` コマンドを実行
//!
//! # 出力形式
//!
//! - `thread.started` - スレッド開始（`thread_id` を含む）
//! - `item.completed` - 出力アイテム完了（テキストを含む）
//! - `turn.completed` - 実行完了（トークン使用量を含む）
//! - `turn.failed` / `error` - 実行失敗
//!
//! ```json
//! {"type":"thread.started","thread_id":"t-1"}
//! {"type":"item.completed","item":{"type":"agent_message","text":"Hello, world!"}}
//! {"type":"turn.completed","usage":{"input_tokens":10,"output_tokens":5}}
//! ```

use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use super::process::{run_streaming, version_check};
use super::traits::{AdapterErrorCode, AdapterMeta, AdapterResult, ChunkSink, ProviderAdapter, TokenUsage};

/// Codex CLIのデフォルトコマンド名
const DEFAULT_COMMAND: &str = "codex";

/// Codex CLIのNPMパッケージ名（エラーメッセージ用）
const NPM_PACKAGE: &str = "@openai/codex";

/// OpenAI Codex CLI アダプター
pub struct CodexCliAdapter {
    id: String,
    command: String,
    model: Option<String>,
}

impl CodexCliAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: DEFAULT_COMMAND.to_string(),
            model: None,
        }
    }

    /// カスタムコマンドパスを指定（例: "/usr/local/bin/codex"）
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    fn build_command(&self, prompt: &str, thread_id: Option<&str>) -> Command {
        let mut command = Command::new(&self.command);
        command.arg("exec").arg("--json");
        if let Some(model) = &self.model {
            command.arg("--model").arg(model);
        }
        if let Some(thread_id) = thread_id {
            command.arg("resume").arg(thread_id);
        }
        command.arg(prompt);
        command
    }

    async fn run(
        &self,
        prompt: &str,
        thread_id: Option<&str>,
        on_chunk: &ChunkSink<'_>,
        cancel: CancellationToken,
    ) -> Result<AdapterResult, ProviderError> {
        let started = Instant::now();
        let mut stream = CodexStream::default();

        let exit = run_streaming(
            self.build_command(prompt, thread_id),
            &self.command,
            NPM_PACKAGE,
            cancel,
            |line| stream.apply_line(line, on_chunk),
        )
        .await?;

        let latency_ms = started.elapsed().as_millis() as u64;

        if stream.failed || stream.completed {
            return Ok(stream.into_result(latency_ms));
        }
        if !exit.success {
            return Err(ProviderError::CliExecution {
                code: exit.code,
                stderr: exit.stderr,
            });
        }
        // turn.completed が無くてもテキストがあれば成功扱い
        Ok(stream.into_result(latency_ms))
    }
}

#[async_trait]
impl ProviderAdapter for CodexCliAdapter {
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
        let thread_id = provider_context
            .get("thread_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidContext("thread_id がありません".to_string()))?;
        self.run(prompt, Some(thread_id), on_chunk, cancel).await
    }

    async fn health_check(&self) -> bool {
        version_check(&self.command).await
    }
}

// JSONL イベント型定義

/// JSONL イベント（全イベントタイプの共通構造）
#[derive(Debug, Deserialize)]
struct JsonLEvent {
    #[serde(rename = "type")]
    event_type: String,

    #[serde(default)]
    thread_id: Option<String>,

    #[serde(default)]
    model: Option<String>,

    #[serde(default)]
    item: Option<JsonLItem>,

    #[serde(default)]
    usage: Option<JsonLUsage>,
}

/// JSONL アイテム（item.completed イベント用）
#[derive(Debug, Deserialize)]
struct JsonLItem {
    #[serde(rename = "type")]
    item_type: String,

    #[serde(default)]
    text: Option<String>,
}

/// JSONL 使用量（turn.completed イベント用）
#[derive(Debug, Deserialize)]
struct JsonLUsage {
    #[serde(default)]
    input_tokens: Option<u32>,

    #[serde(default)]
    output_tokens: Option<u32>,
}

#[derive(Debug, Default)]
struct CodexStream {
    text: String,
    thread_id: Option<String>,
    model: Option<String>,
    usage: Option<TokenUsage>,
    completed: bool,
    failed: bool,
}

impl CodexStream {
    fn apply_line(&mut self, line: &str, on_chunk: &ChunkSink<'_>) -> Result<(), ProviderError> {
        let event: JsonLEvent = serde_json::from_str(line)
            .map_err(|e| ProviderError::InvalidResponse(format!("JSONL parse error: {}: {}", e, line)))?;

        match event.event_type.as_str() {
            "thread.started" => {
                if event.thread_id.is_some() {
                    self.thread_id = event.thread_id;
                }
            }
            "turn.started" => {
                if event.model.is_some() {
                    self.model = event.model;
                }
            }
            "item.completed" => {
                if let Some(item) = event.item
                    && matches!(item.item_type.as_str(), "agent_message" | "text")
                    && let Some(text) = item.text
                {
                    on_chunk(&text);
                    self.text.push_str(&text);
                }
            }
            "turn.completed" => {
                self.completed = true;
                if let Some(usage) = event.usage {
                    self.usage = Some(TokenUsage {
                        input_tokens: usage.input_tokens.unwrap_or(0),
                        output_tokens: usage.output_tokens.unwrap_or(0),
                    });
                }
            }
            "turn.failed" | "error" => {
                self.failed = true;
            }
            _ => {
                // 未知のイベントタイプは無視
            }
        }
        Ok(())
    }

    fn into_result(self, latency_ms: u64) -> AdapterResult {
        let meta = AdapterMeta {
            provider_context: self.thread_id.map(|id| json!({ "thread_id": id })),
            model: self.model,
            token_usage: self.usage,
        };
        if self.failed {
            AdapterResult::failure(AdapterErrorCode::Provider, self.text, meta, latency_ms)
        } else {
            AdapterResult::success(self.text, meta, latency_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn feed(lines: &str) -> (CodexStream, Vec<String>) {
        let chunks = Mutex::new(Vec::new());
        let sink = |chunk: &str| chunks.lock().unwrap().push(chunk.to_string());
        let mut stream = CodexStream::default();
        for line in lines.lines() {
            stream.apply_line(line, &sink).unwrap();
        }
        (stream, chunks.into_inner().unwrap())
    }

    #[test]
    fn test_new() {
        let adapter = CodexCliAdapter::new("codex");
        assert_eq!(adapter.id(), "codex");
        assert_eq!(adapter.command, "codex");
    }

    #[test]
    fn test_with_command() {
        let adapter = CodexCliAdapter::new("codex").with_command("/custom/path/codex");
        assert_eq!(adapter.command, "/custom/path/codex");
    }

    #[test]
    fn test_parse_jsonl_success() {
        let jsonl = r#"{"type":"thread.started","thread_id":"t-1"}
{"type":"turn.started","model":"gpt-5"}
{"type":"item.completed","item":{"type":"reasoning","text":"thinking"}}
{"type":"item.completed","item":{"type":"agent_message","text":"Part 1 "}}
{"type":"item.completed","item":{"type":"text","text":"Part 2"}}
{"type":"turn.completed","usage":{"input_tokens":10,"output_tokens":15}}"#;

        let (stream, chunks) = feed(jsonl);
        assert_eq!(chunks, vec!["Part 1 ", "Part 2"]);

        let result = stream.into_result(7);
        assert!(result.ok);
        assert_eq!(result.text, "Part 1 Part 2");
        assert_eq!(result.meta.provider_context, Some(json!({"thread_id": "t-1"})));
        assert_eq!(result.meta.model.as_deref(), Some("gpt-5"));
        assert_eq!(result.meta.token_usage.unwrap().total(), 25);
    }

    #[test]
    fn test_turn_failed_is_structured_failure() {
        let jsonl = r#"{"type":"thread.started","thread_id":"t-2"}
{"type":"turn.failed","error":{"message":"boom"}}"#;

        let (stream, _) = feed(jsonl);
        let result = stream.into_result(1);
        assert!(!result.ok);
        assert_eq!(result.error_code, Some(AdapterErrorCode::Provider));
        assert_eq!(result.meta.provider_context, Some(json!({"thread_id": "t-2"})));
    }

    #[test]
    fn test_parse_invalid_json() {
        let sink = |_: &str| {};
        let mut stream = CodexStream::default();
        let result = stream.apply_line("not valid json", &sink);
        assert!(matches!(result, Err(ProviderError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_continuation_requires_thread_id() {
        let adapter = CodexCliAdapter::new("codex");
        let sink = |_: &str| {};
        let err = adapter
            .send_continuation("hi", &json!({"session_id": "x"}), &sink, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidContext(_)));
    }
}
