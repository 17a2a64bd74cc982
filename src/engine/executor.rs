//! ワークフロー実行エンジン
//!
//! # 責務
//!
//! このモジュールは、1回のリクエストを実行する [`WorkflowEngine`] を提供します。
//! コンテキストを解決してステップ列にコンパイルし、各ステップを順に実行し、
//! 結果を配信してから永続化します。
//!
//! # 実行フロー
//!
//! 1. リクエストの検証・コンテキスト解決・コンパイル（ここで失敗したらネットワーク呼び出しなしで拒否）
//! 2. 各ステップを順次実行
//!    - プロンプトステップはオーケストレーターのファンアウト
//!    - マッピング・統合ステップは1プロバイダーへのガード付き呼び出し
//!    - 先行ステップが失敗した依存ステップはスキップ
//! 3. 集約イベント [`EngineEvent::WorkflowComplete`] を配信
//! 4. リトライ付きで永続化
//!
//! # 使用例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use turnflow::config::Settings;
//! use turnflow::engine::WorkflowEngine;
//! use turnflow::model::{InitializeRequest, WorkflowRequest};
//! use turnflow::persistence::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::default();
//!     let engine = WorkflowEngine::from_settings(&settings, Arc::new(MemoryStore::new()));
//!
//!     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     let printer = tokio::spawn(async move {
//!         while let Some(event) = rx.recv().await {
//!             println!("{:?}", event);
//!         }
//!     });
//!
//!     let request = WorkflowRequest::Initialize(InitializeRequest {
//!         user_message: "Rust のライフタイムを説明して".to_string(),
//!         provider_ids: vec!["claude".to_string(), "codex".to_string()],
//!         mapping_provider: None,
//!         synthesis_provider: Some("claude".to_string()),
//!     });
//!     let result = engine.execute(request, tx, CancellationToken::new()).await?;
//!     printer.await?;
//!
//!     println!("Status: {:?}", result.status);
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{PersistenceSettings, Settings, StreamingSettings};
use crate::error::PersistenceError;
use crate::model::{ProviderContexts, ResponseStatus, ResponseType, Session, WorkflowRequest};
use crate::orchestrator::{
    FailureKind, FanoutError, FanoutObserver, FanoutOptions, Orchestrator, ProviderFailure, ProviderOutcome,
    ProviderOutput,
};
use crate::persistence::{KvStore, PersistReceipt, PersistenceManager, TurnRepository};
use crate::streaming::DeltaBatcher;
use crate::workflow::{
    compile, compose_mapping_prompt, compose_synthesis_prompt, ContextResolver, ResolvedContext, Step, StepInput,
    StepOutputs, StepPayload,
};
use super::context::ExecutionContext;
use super::event::{EngineEvent, EventEmitter};
use super::result::{ExecutionError, ExecutionStatus, StepResult, StepStatus, WorkflowResult};

type ProviderResults = (BTreeMap<String, ProviderOutput>, BTreeMap<String, ProviderFailure>);

/// ファンアウトの進行をバッチャーへ流すオブザーバー
struct BatchingObserver {
    batcher: Arc<DeltaBatcher>,
}

impl FanoutObserver for BatchingObserver {
    fn on_partial(&self, provider_id: &str, chunk: &str) {
        self.batcher
            .push(provider_id, ResponseType::Batch, ResponseStatus::Streaming, chunk);
    }

    fn on_provider_complete(&self, provider_id: &str, outcome: &ProviderOutcome) {
        self.batcher
            .push(provider_id, ResponseType::Batch, terminal_status(outcome), "");
    }

    fn on_error(&self, error: &FanoutError) {
        warn!("prompt fanout failed: {}", error);
    }
}

fn terminal_status(outcome: &ProviderOutcome) -> ResponseStatus {
    match outcome {
        Ok(_) => ResponseStatus::Completed,
        Err(_) => ResponseStatus::Failed,
    }
}

/// 有効なテキストのない出力を EmptyResponse の失敗に振り替える
fn split_valid(outcomes: impl IntoIterator<Item = ProviderOutcome>) -> ProviderResults {
    let mut outputs = BTreeMap::new();
    let mut failures = BTreeMap::new();
    for outcome in outcomes {
        match outcome {
            Ok(output) if !output.text.trim().is_empty() => {
                outputs.insert(output.provider_id.clone(), output);
            }
            Ok(output) => {
                failures.insert(
                    output.provider_id.clone(),
                    ProviderFailure {
                        provider_id: output.provider_id,
                        kind: FailureKind::EmptyResponse,
                        message: "有効なテキストがありません".to_string(),
                        latency_ms: output.latency_ms,
                    },
                );
            }
            Err(failure) => {
                failures.insert(failure.provider_id.clone(), failure);
            }
        }
    }
    (outputs, failures)
}

fn step_input(input: &StepInput, context: &ExecutionContext) -> Option<StepOutputs> {
    match input {
        StepInput::FromStep(step_id) => context.outputs_of(step_id),
        StepInput::Frozen(outputs) => Some(outputs.clone()),
    }
}

fn aggregate_status(results: &[StepResult]) -> ExecutionStatus {
    let total = results.len();
    let completed = results
        .iter()
        .filter(|result| result.status == StepStatus::Success)
        .count();
    match results.first() {
        Some(primary) if primary.status == StepStatus::Success => {
            if completed == total {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::PartialSuccess { completed, total }
            }
        }
        _ => ExecutionStatus::Failed,
    }
}

/// ワークフロー実行エンジン
///
/// オーケストレーター・リゾルバー・永続化マネージャーは起動時に一度だけ構築し、
/// 明示的に渡します。
pub struct WorkflowEngine {
    orchestrator: Arc<Orchestrator>,
    resolver: ContextResolver,
    persistence: Arc<PersistenceManager>,
    streaming: StreamingSettings,
    persistence_settings: PersistenceSettings,
}

impl WorkflowEngine {
    /// 新しいエンジンを生成
    ///
    /// # 引数
    ///
    /// - `orchestrator`: プロバイダー呼び出しに使うオーケストレーター
    /// - `persistence`: 永続化マネージャー（リゾルバーも同じリポジトリを読む）
    /// - `streaming`: 部分出力のバッチ設定
    /// - `persistence_settings`: 永続化のリトライ設定
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        persistence: Arc<PersistenceManager>,
        streaming: StreamingSettings,
        persistence_settings: PersistenceSettings,
    ) -> Self {
        Self {
            resolver: ContextResolver::new(persistence.repository().clone()),
            orchestrator,
            persistence,
            streaming,
            persistence_settings,
        }
    }

    /// 設定から全コンポーネントを構築する
    pub fn from_settings(settings: &Settings, store: Arc<dyn KvStore>) -> Self {
        let persistence = PersistenceManager::new(TurnRepository::new(store));
        Self::new(
            Arc::new(Orchestrator::from_settings(settings)),
            Arc::new(persistence),
            settings.streaming.clone(),
            settings.persistence.clone(),
        )
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn persistence(&self) -> &Arc<PersistenceManager> {
        &self.persistence
    }

    /// リクエストを実行する
    ///
    /// # 引数
    ///
    /// - `request`: 実行するリクエスト
    /// - `events`: 進行イベントの送信先
    /// - `cancel`: この実行のキャンセルスコープ
    ///
    /// # 戻り値
    ///
    /// - `Ok(WorkflowResult)`: 全ステップが終了した（失敗したステップも含む）
    /// - `Err(ExecutionError)`: 実行前に拒否された（ネットワーク呼び出しなし）
    pub async fn execute(
        &self,
        request: WorkflowRequest,
        events: UnboundedSender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Result<WorkflowResult, ExecutionError> {
        request.validate().map_err(ExecutionError::InvalidRequest)?;
        let resolved = self.resolver.resolve(&request).await?;
        let steps = compile(&request, &resolved)?;

        let session_id = request
            .session_id()
            .map(str::to_string)
            .unwrap_or_else(Session::new_id);
        let emitter = EventEmitter::new(session_id.clone(), events);
        let started_at = Utc::now();
        let start = Instant::now();

        info!(
            session_id = %session_id,
            turn_type = %request.turn_type(),
            steps = steps.len(),
            "workflow started"
        );

        let batcher = {
            let emitter = emitter.clone();
            Arc::new(DeltaBatcher::new(self.streaming.clone(), move |updates| {
                emitter.partial_batch(updates)
            }))
        };
        let ticker_cancel = CancellationToken::new();
        let ticker = batcher.spawn_ticker(ticker_cancel.clone());

        let mut context = ExecutionContext::new(session_id.clone());
        for step in &steps {
            context.start_step(&step.step_id);
            let result = self.execute_step(step, &context, &batcher, &emitter, &cancel).await;
            // 完了イベントより前に、そのステップの部分出力を配信しきる
            batcher.flush();
            emitter.step_finished(&result);
            context.record_step_result(result);
        }

        ticker_cancel.cancel();
        if let Err(e) = ticker.await {
            warn!("batcher ticker stopped abnormally: {}", e);
        }

        let total_tokens_used = context.total_tokens();
        let results = context.into_results();
        let mut status = aggregate_status(&results);
        let mut error = match status {
            ExecutionStatus::Failed => Some(
                results
                    .first()
                    .and_then(|primary| primary.error.clone())
                    .unwrap_or_else(|| "ワークフローが失敗しました".to_string()),
            ),
            _ => None,
        };
        if cancel.is_cancelled() {
            status = ExecutionStatus::Failed;
            if error.is_none() {
                error = Some("ワークフローがキャンセルされました".to_string());
            }
        }

        emitter.workflow_complete(results.clone(), error.clone());

        let mut result = WorkflowResult {
            session_id,
            turn_type: request.turn_type(),
            status,
            steps: results,
            started_at,
            finished_at: Utc::now(),
            total_duration: start.elapsed(),
            total_tokens_used,
            error,
            persistence: None,
            persistence_error: None,
        };

        info!(
            session_id = %result.session_id,
            status = ?result.status,
            completed = result.completed_steps(),
            total = result.steps.len(),
            "workflow finished"
        );

        if result.status == ExecutionStatus::Failed {
            return Ok(result);
        }

        match self.persist_with_retry(&request, &resolved, &result).await {
            Ok(receipt) => {
                emitter.persisted(receipt.clone());
                result.persistence = Some(receipt);
            }
            Err((attempts, e)) => {
                error!(
                    session_id = %result.session_id,
                    attempts,
                    "persistence failed: {}", e
                );
                emitter.persistence_failed(attempts, e.to_string());
                result.persistence_error = Some(e.to_string());
            }
        }

        Ok(result)
    }

    /// 単一ステップを実行（プライベートメソッド）
    ///
    /// 先行ステップが成功していなければ実行せずスキップ結果を返します。
    async fn execute_step(
        &self,
        step: &Step,
        context: &ExecutionContext,
        batcher: &Arc<DeltaBatcher>,
        emitter: &EventEmitter,
        cancel: &CancellationToken,
    ) -> StepResult {
        let step_type = step.step_type();
        if let Some(upstream) = step.required_upstream()
            && !context.succeeded(upstream)
        {
            warn!(step_id = %step.step_id, upstream, "skipping step after upstream failure");
            return StepResult::skipped(
                &step.step_id,
                step_type,
                format!("先行ステップ '{}' が成功しなかったため実行しません", upstream),
            );
        }

        emitter.step_running(&step.step_id);
        let started = Instant::now();

        let (outputs, failures) = match &step.payload {
            StepPayload::Prompt {
                prompt,
                provider_ids,
                provider_contexts,
            } => {
                self.execute_prompt(prompt, provider_ids, provider_contexts, batcher, cancel)
                    .await
            }
            StepPayload::Mapping {
                provider_id,
                original_prompt,
                input,
                provider_context,
            } => {
                let outputs = step_input(input, context).unwrap_or_default();
                let prompt = compose_mapping_prompt(original_prompt, &outputs);
                self.execute_single(
                    provider_id,
                    ResponseType::Mapping,
                    &prompt,
                    provider_context.as_ref(),
                    batcher,
                    cancel,
                )
                .await
            }
            StepPayload::Synthesis {
                provider_id,
                original_prompt,
                input,
                mapping,
                provider_context,
            } => {
                let outputs = step_input(input, context).unwrap_or_default();
                // マッピングが失敗していても統合は実行する
                let analysis = mapping
                    .as_ref()
                    .and_then(|mapping| step_input(mapping, context))
                    .and_then(|outputs| outputs.into_values().next());
                let prompt = compose_synthesis_prompt(original_prompt, &outputs, analysis.as_deref());
                self.execute_single(
                    provider_id,
                    ResponseType::Synthesis,
                    &prompt,
                    provider_context.as_ref(),
                    batcher,
                    cancel,
                )
                .await
            }
        };

        let (status, error) = if outputs.is_empty() {
            let kinds: Vec<String> = failures
                .values()
                .map(|failure| format!("{}: {:?}", failure.provider_id, failure.kind))
                .collect();
            (
                StepStatus::Failed,
                Some(format!("有効な出力を返したプロバイダーがありません（{}）", kinds.join(", "))),
            )
        } else {
            (StepStatus::Success, None)
        };

        info!(
            step_id = %step.step_id,
            succeeded = outputs.len(),
            failed = failures.len(),
            "step finished"
        );

        StepResult {
            step_id: step.step_id.clone(),
            step_type,
            status,
            outputs,
            failures,
            duration: started.elapsed(),
            error,
        }
    }

    async fn execute_prompt(
        &self,
        prompt: &str,
        provider_ids: &[String],
        provider_contexts: &ProviderContexts,
        batcher: &Arc<DeltaBatcher>,
        cancel: &CancellationToken,
    ) -> ProviderResults {
        let observer = Arc::new(BatchingObserver {
            batcher: Arc::clone(batcher),
        });
        let options = FanoutOptions {
            provider_contexts: provider_contexts.clone(),
            cancel: cancel.clone(),
        };
        let outcome = self
            .orchestrator
            .execute_parallel_fanout(prompt, provider_ids, options, observer)
            .await;

        split_valid(
            outcome
                .results
                .into_values()
                .map(Ok)
                .chain(outcome.errors.into_values().map(Err)),
        )
    }

    async fn execute_single(
        &self,
        provider_id: &str,
        response_type: ResponseType,
        prompt: &str,
        provider_context: Option<&serde_json::Value>,
        batcher: &Arc<DeltaBatcher>,
        cancel: &CancellationToken,
    ) -> ProviderResults {
        let sink = |chunk: &str| batcher.push(provider_id, response_type, ResponseStatus::Streaming, chunk);
        let outcome = self
            .orchestrator
            .execute_single(provider_id, prompt, provider_context, &sink, cancel.clone())
            .await;
        batcher.push(provider_id, response_type, terminal_status(&outcome), "");
        split_valid([outcome])
    }

    /// リトライ機能付きで永続化（プライベートメソッド）
    ///
    /// 試行の間は `retry_delay` だけ待機します。
    ///
    /// # 戻り値
    ///
    /// - `Ok(PersistReceipt)`: 永続化成功（リトライ後の成功も含む）
    /// - `Err((試行回数, 最後のエラー))`: すべての試行が失敗した場合
    async fn persist_with_retry(
        &self,
        request: &WorkflowRequest,
        resolved: &ResolvedContext,
        result: &WorkflowResult,
    ) -> Result<PersistReceipt, (u32, PersistenceError)> {
        let max_attempts = self.persistence_settings.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.persistence.persist(request, resolved, result).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) if attempt < max_attempts => {
                    warn!(attempt, max_attempts, "persist failed, retrying: {}", e);
                    tokio::time::sleep(self.persistence_settings.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err((attempt, e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepType;

    fn output(provider_id: &str, text: &str) -> ProviderOutcome {
        Ok(ProviderOutput {
            provider_id: provider_id.to_string(),
            text: text.to_string(),
            provider_context: None,
            model: None,
            token_usage: None,
            latency_ms: 1,
        })
    }

    #[test]
    fn test_whitespace_output_counts_as_empty_response() {
        let (outputs, failures) = split_valid([output("a", "  \n"), output("b", "ok")]);
        assert_eq!(outputs.keys().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(failures["a"].kind, FailureKind::EmptyResponse);
    }

    #[test]
    fn test_aggregate_status() {
        let ok = |id: &str| StepResult {
            step_id: id.to_string(),
            step_type: StepType::Prompt,
            status: StepStatus::Success,
            outputs: BTreeMap::new(),
            failures: BTreeMap::new(),
            duration: std::time::Duration::ZERO,
            error: None,
        };
        let skipped = StepResult::skipped("synthesis-1", StepType::Synthesis, "x".to_string());

        assert_eq!(aggregate_status(&[ok("prompt-0")]), ExecutionStatus::Success);
        assert_eq!(
            aggregate_status(&[ok("prompt-0"), skipped.clone()]),
            ExecutionStatus::PartialSuccess { completed: 1, total: 2 }
        );
        let mut failed = ok("prompt-0");
        failed.status = StepStatus::Failed;
        assert_eq!(aggregate_status(&[failed, skipped]), ExecutionStatus::Failed);
        assert_eq!(aggregate_status(&[]), ExecutionStatus::Failed);
    }
}
