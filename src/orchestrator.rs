//! 耐障害性オーケストレーター
//!
//! # 責務
//!
//! - 1つのプロンプトを複数のプロバイダーへ並行に送る（ファンアウト）
//! - 各呼び出しを レートリミッター → サーキットブレーカー → タイムアウト → キャンセル
//!   の順に通す
//! - 部分出力と終了をオブザーバーへ通知し、成功と失敗を分けて集約する
//!
//! # 失敗の扱い
//!
//! プロバイダー単位の失敗は [`ProviderFailure`] としてデータで返し、
//! ファンアウトの外へエラーとして投げません。分類は [`FailureKind`] で
//! 構造的に表し、メッセージ文字列から推測しません。
//!
//! # 並行性
//!
//! プロバイダーごとに1タスクを起動し、メインループが [`JoinSet`] で合流します。
//! 終了通知はメインループからのみ行うため、1プロバイダーにつき最大1回です。

use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{OrchestratorSettings, Settings};
use crate::error::ProviderError;
use crate::model::ProviderContexts;
use crate::provider::{AdapterErrorCode, AdapterResult, ChunkSink, ProviderAdapter, ProviderRegistry, TokenUsage};
use crate::resilience::{CallOutcome, CircuitBreaker, CircuitState, RateLimiter};

/// プロバイダー呼び出しの失敗分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// レートリミッターが時間内に枠を出さなかった
    AdmissionDenied,
    /// 回路が開いていた（アダプターは呼ばれていない）
    CircuitOpen,
    Timeout,
    Network,
    /// 上流サービスのレート制限
    UpstreamRateLimit,
    /// その他のプロバイダーエラー
    Provider,
    /// 転送は成功したが有効なテキストがない
    EmptyResponse,
    Cancelled,
}

impl FailureKind {
    /// サーキットブレーカーに記録する結果
    fn circuit_outcome(self) -> CallOutcome {
        match self {
            FailureKind::Timeout
            | FailureKind::Network
            | FailureKind::UpstreamRateLimit
            | FailureKind::Provider => CallOutcome::Failure,
            FailureKind::AdmissionDenied
            | FailureKind::CircuitOpen
            | FailureKind::EmptyResponse
            | FailureKind::Cancelled => CallOutcome::Neutral,
        }
    }
}

/// 1プロバイダーの失敗
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderFailure {
    pub provider_id: String,
    pub kind: FailureKind,
    pub message: String,
    pub latency_ms: u64,
}

/// 1プロバイダーの成功出力
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderOutput {
    pub provider_id: String,
    pub text: String,
    /// 次の継続に使う状態
    pub provider_context: Option<Value>,
    pub model: Option<String>,
    pub token_usage: Option<TokenUsage>,
    pub latency_ms: u64,
}

/// 1プロバイダー呼び出しの終了状態
pub type ProviderOutcome = Result<ProviderOutput, ProviderFailure>;

/// ファンアウト全体の結果（成功と失敗に分割）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FanoutOutcome {
    pub results: BTreeMap<String, ProviderOutput>,
    pub errors: BTreeMap<String, ProviderFailure>,
}

impl FanoutOutcome {
    fn insert(&mut self, outcome: ProviderOutcome) {
        match outcome {
            Ok(output) => {
                self.results.insert(output.provider_id.clone(), output);
            }
            Err(failure) => {
                self.errors.insert(failure.provider_id.clone(), failure);
            }
        }
    }

    /// 成功したプロバイダーが1つもない
    pub fn is_total_failure(&self) -> bool {
        self.results.is_empty()
    }
}

/// オーケストレーションレベルの失敗
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FanoutError {
    #[error("プロバイダーが指定されていません")]
    NoProviders,

    #[error("全てのプロバイダー（{failed}件）が失敗しました")]
    AllProvidersFailed { failed: usize },
}

/// ファンアウトの進行を受け取るオブザーバー
///
/// `on_partial` は複数のプロバイダータスクから並行に呼ばれます。
/// それ以外はファンアウトを呼び出したタスクから順に呼ばれます。
pub trait FanoutObserver: Send + Sync {
    /// 部分出力（0回以上）
    fn on_partial(&self, _provider_id: &str, _chunk: &str) {}

    /// プロバイダーの終了（プロバイダーごとにちょうど1回）
    fn on_provider_complete(&self, _provider_id: &str, _outcome: &ProviderOutcome) {}

    /// 全プロバイダーの終了（ちょうど1回）
    fn on_all_complete(&self, _outcome: &FanoutOutcome) {}

    /// オーケストレーションレベルの失敗
    fn on_error(&self, _error: &FanoutError) {}
}

/// 何もしないオブザーバー
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl FanoutObserver for NoopObserver {}

/// ファンアウトのオプション
#[derive(Debug, Clone, Default)]
pub struct FanoutOptions {
    /// 継続呼び出しに使うプロバイダーごとの状態
    ///
    /// エントリのあるプロバイダーは `send_continuation`、ないものは `send_prompt` で呼ばれます。
    pub provider_contexts: ProviderContexts,
    /// ワークフロー単位のキャンセルスコープ
    pub cancel: CancellationToken,
}

/// ヘルスチェックの結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderHealth {
    pub provider_id: String,
    pub healthy: bool,
    pub circuit: CircuitState,
}

/// 1呼び出し分のガード付き実行パイプライン
#[derive(Clone)]
struct CallPipeline {
    rate_limiter: Arc<RateLimiter>,
    circuit_breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl CallPipeline {
    async fn call(
        &self,
        adapter: Option<Arc<dyn ProviderAdapter>>,
        provider_id: &str,
        prompt: &str,
        provider_context: Option<&Value>,
        on_chunk: &ChunkSink<'_>,
        cancel: CancellationToken,
    ) -> ProviderOutcome {
        let started = Instant::now();
        let failure = |kind: FailureKind, message: String| ProviderFailure {
            provider_id: provider_id.to_string(),
            kind,
            message,
            latency_ms: started.elapsed().as_millis() as u64,
        };

        let Some(adapter) = adapter else {
            return Err(failure(
                FailureKind::Provider,
                format!("プロバイダー '{}' は登録されていません", provider_id),
            ));
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(failure(FailureKind::Cancelled, ProviderError::Cancelled.to_string()));
            }
            admitted = self.rate_limiter.acquire(provider_id) => {
                if let Err(e) = admitted {
                    return Err(failure(FailureKind::AdmissionDenied, e.to_string()));
                }
            }
        }

        // 途中で破棄されても試行枠は PermitGuard の Drop で返却される
        let permit = match self.circuit_breaker.admit(provider_id) {
            Ok(permit) => permit,
            Err(e) => {
                debug!(provider_id, "call rejected by open circuit");
                return Err(failure(FailureKind::CircuitOpen, e.to_string()));
            }
        };

        // タイムアウト時にアダプターへ中断を伝えるための子トークン
        let call_cancel = cancel.child_token();
        let call = async {
            match provider_context {
                Some(context) => {
                    adapter
                        .send_continuation(prompt, context, on_chunk, call_cancel.clone())
                        .await
                }
                None => adapter.send_prompt(prompt, on_chunk, call_cancel.clone()).await,
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Err(failure(FailureKind::Cancelled, ProviderError::Cancelled.to_string()))
            }
            timed = tokio::time::timeout(self.timeout, AssertUnwindSafe(call).catch_unwind()) => {
                match timed {
                    Err(_) => {
                        call_cancel.cancel();
                        Err(failure(
                            FailureKind::Timeout,
                            format!("{}秒以内に応答がありませんでした", self.timeout.as_secs_f64()),
                        ))
                    }
                    Ok(Err(_)) => Err(failure(FailureKind::Provider, "アダプターがパニックしました".to_string())),
                    Ok(Ok(Err(e))) => Err(failure(classify_error(&e), e.to_string())),
                    Ok(Ok(Ok(result))) => classify_result(provider_id, result)
                        .map_err(|(kind, message)| failure(kind, message)),
                }
            }
        };

        let circuit_outcome = match &outcome {
            Ok(_) => CallOutcome::Success,
            Err(f) => f.kind.circuit_outcome(),
        };
        permit.record(circuit_outcome);

        match &outcome {
            Ok(output) => debug!(provider_id, latency_ms = output.latency_ms, "provider call succeeded"),
            Err(f) => warn!(provider_id, kind = ?f.kind, latency_ms = f.latency_ms, "provider call failed: {}", f.message),
        }
        outcome
    }
}

fn classify_error(error: &ProviderError) -> FailureKind {
    match error {
        ProviderError::Io(_) => FailureKind::Network,
        ProviderError::RateLimitExceeded => FailureKind::UpstreamRateLimit,
        ProviderError::Cancelled => FailureKind::Cancelled,
        ProviderError::CliNotFound(_, _)
        | ProviderError::CliExecution { .. }
        | ProviderError::InvalidResponse(_)
        | ProviderError::InvalidContext(_) => FailureKind::Provider,
    }
}

fn classify_result(provider_id: &str, result: AdapterResult) -> Result<ProviderOutput, (FailureKind, String)> {
    if !result.ok {
        let kind = match result.error_code {
            Some(AdapterErrorCode::RateLimited) => FailureKind::UpstreamRateLimit,
            Some(AdapterErrorCode::Network) => FailureKind::Network,
            Some(AdapterErrorCode::Authentication) | Some(AdapterErrorCode::Provider) | None => FailureKind::Provider,
        };
        let message = if result.text.trim().is_empty() {
            "プロバイダーがエラーを返しました".to_string()
        } else {
            result.text
        };
        return Err((kind, message));
    }
    if result.text.trim().is_empty() {
        return Err((FailureKind::EmptyResponse, "有効なテキストがありません".to_string()));
    }
    Ok(ProviderOutput {
        provider_id: provider_id.to_string(),
        text: result.text,
        provider_context: result.meta.provider_context,
        model: result.meta.model,
        token_usage: result.meta.token_usage,
        latency_ms: result.latency_ms,
    })
}

/// 耐障害性オーケストレーター
///
/// レートリミッターとサーキットブレーカーはプロセス全体で共有し、
/// 並行する全ワークフローから使われます。
pub struct Orchestrator {
    registry: ProviderRegistry,
    rate_limiter: Arc<RateLimiter>,
    circuit_breaker: Arc<CircuitBreaker>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        registry: ProviderRegistry,
        rate_limiter: Arc<RateLimiter>,
        circuit_breaker: Arc<CircuitBreaker>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            rate_limiter,
            circuit_breaker,
            settings,
        }
    }

    /// 設定からレジストリ・リミッター・ブレーカーを組み立てる
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            ProviderRegistry::from_settings(&settings.providers),
            Arc::new(RateLimiter::new(settings.rate_limit.clone())),
            Arc::new(CircuitBreaker::new(settings.circuit_breaker.clone())),
            settings.orchestrator.clone(),
        )
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    fn pipeline(&self) -> CallPipeline {
        CallPipeline {
            rate_limiter: Arc::clone(&self.rate_limiter),
            circuit_breaker: Arc::clone(&self.circuit_breaker),
            timeout: self.settings.provider_timeout,
        }
    }

    /// プロンプトを全プロバイダーへ並行に送る
    ///
    /// # 引数
    ///
    /// - `prompt`: 送信するプロンプト
    /// - `provider_ids`: 送信先（重複は1回にまとめる）
    /// - `options`: 継続コンテキストとキャンセルスコープ
    /// - `observer`: 進行の通知先
    ///
    /// # 戻り値
    ///
    /// 全プロバイダーが終了した時点の [`FanoutOutcome`]。失敗は `errors` に入り、
    /// このメソッド自体は失敗しません。
    pub async fn execute_parallel_fanout(
        &self,
        prompt: &str,
        provider_ids: &[String],
        options: FanoutOptions,
        observer: Arc<dyn FanoutObserver>,
    ) -> FanoutOutcome {
        let mut pending = BTreeSet::new();
        let mut tasks = JoinSet::new();

        for provider_id in provider_ids {
            if !pending.insert(provider_id.clone()) {
                continue;
            }
            let pipeline = self.pipeline();
            let adapter = self.registry.get(provider_id);
            let context = options.provider_contexts.get(provider_id).cloned();
            let prompt = prompt.to_string();
            let cancel = options.cancel.clone();
            let observer = Arc::clone(&observer);
            let provider_id = provider_id.clone();

            tasks.spawn(async move {
                let sink_id = provider_id.clone();
                let sink = move |chunk: &str| observer.on_partial(&sink_id, chunk);
                let outcome = pipeline
                    .call(adapter, &provider_id, &prompt, context.as_ref(), &sink, cancel)
                    .await;
                (provider_id, outcome)
            });
        }

        info!(providers = pending.len(), "fanout started");

        let mut outcome = FanoutOutcome::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((provider_id, result)) => {
                    pending.remove(&provider_id);
                    observer.on_provider_complete(&provider_id, &result);
                    outcome.insert(result);
                }
                Err(e) => warn!("provider task aborted: {}", e),
            }
        }

        // 結果を返さずに終わったタスクも失敗として確定させる
        for provider_id in pending {
            let result = Err(ProviderFailure {
                provider_id: provider_id.clone(),
                kind: FailureKind::Provider,
                message: "プロバイダータスクが異常終了しました".to_string(),
                latency_ms: 0,
            });
            observer.on_provider_complete(&provider_id, &result);
            outcome.insert(result);
        }

        info!(
            succeeded = outcome.results.len(),
            failed = outcome.errors.len(),
            "fanout completed"
        );

        observer.on_all_complete(&outcome);
        if outcome.errors.is_empty() && outcome.results.is_empty() {
            observer.on_error(&FanoutError::NoProviders);
        } else if outcome.is_total_failure() {
            observer.on_error(&FanoutError::AllProvidersFailed {
                failed: outcome.errors.len(),
            });
        }
        outcome
    }

    /// 1プロバイダーをファンアウトと同じガードを通して呼ぶ
    ///
    /// マッピング・統合ステップで使います。
    pub async fn execute_single(
        &self,
        provider_id: &str,
        prompt: &str,
        provider_context: Option<&Value>,
        on_chunk: &ChunkSink<'_>,
        cancel: CancellationToken,
    ) -> ProviderOutcome {
        self.pipeline()
            .call(
                self.registry.get(provider_id),
                provider_id,
                prompt,
                provider_context,
                on_chunk,
                cancel,
            )
            .await
    }

    /// 登録済み全プロバイダーのヘルスチェックと回路状態
    pub async fn health_report(&self) -> Vec<ProviderHealth> {
        let checks = self.registry.ids().into_iter().filter_map(|provider_id| {
            let adapter = self.registry.get(&provider_id)?;
            Some(async move {
                let healthy = adapter.health_check().await;
                (provider_id, healthy)
            })
        });

        futures::future::join_all(checks)
            .await
            .into_iter()
            .map(|(provider_id, healthy)| ProviderHealth {
                circuit: self.circuit_breaker.state(&provider_id),
                provider_id,
                healthy,
            })
            .collect()
    }
}
