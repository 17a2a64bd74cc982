//! 統合テスト用のモックアダプターとエンジン組み立て

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use turnflow::config::{
    CircuitBreakerSettings, OrchestratorSettings, PersistenceSettings, RateLimitSettings, Settings,
};
use turnflow::engine::{EngineEvent, ExecutionError, WorkflowEngine, WorkflowResult};
use turnflow::error::{ProviderError, StoreError};
use turnflow::model::{
    ExtendRequest, InitializeRequest, RecomputeRequest, StepType, WorkflowRequest,
};
use turnflow::orchestrator::Orchestrator;
use turnflow::persistence::{KvStore, MemoryStore, PersistenceManager, Table, TurnRepository};
use turnflow::provider::{AdapterMeta, AdapterResult, ChunkSink, ProviderAdapter, ProviderRegistry, TokenUsage};
use turnflow::resilience::{CircuitBreaker, RateLimiter};

/// モックの1回分の応答
#[derive(Debug, Clone)]
pub enum Behavior {
    /// テキストを1チャンクで返す
    Reply(String),
    /// チャンクを順に流してから連結を返す
    Stream(Vec<String>),
    /// 指定時間待ってから返す（キャンセルされたら Cancelled）
    Sleep(Duration, String),
    /// ネットワークエラー
    Fail,
    /// 空白だけのテキスト
    Empty,
}

/// 呼び出しを記録するモックアダプター
///
/// キューに積んだ応答を先頭から使い、尽きたら既定の応答を返します。
pub struct MockAdapter {
    id: String,
    default: Behavior,
    queue: Mutex<VecDeque<Behavior>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    contexts: Mutex<Vec<Option<Value>>>,
}

impl MockAdapter {
    pub fn new(id: &str, default: Behavior) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            default,
            queue: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
        })
    }

    /// `"{id} answer"` を返すアダプター
    pub fn replying(id: &str) -> Arc<Self> {
        Self::new(id, Behavior::Reply(format!("{} answer", id)))
    }

    pub fn then(&self, behavior: Behavior) -> &Self {
        self.queue.lock().unwrap().push_back(behavior);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// 各呼び出しで渡された継続コンテキスト（新規会話は None）
    pub fn contexts(&self) -> Vec<Option<Value>> {
        self.contexts.lock().unwrap().clone()
    }

    fn meta(&self, n: usize) -> AdapterMeta {
        AdapterMeta {
            provider_context: Some(json!({ "cursor": format!("{}-{}", self.id, n) })),
            model: Some("mock-1".to_string()),
            token_usage: Some(TokenUsage {
                input_tokens: 2,
                output_tokens: 3,
            }),
        }
    }

    async fn respond(
        &self,
        prompt: &str,
        context: Option<&Value>,
        on_chunk: &ChunkSink<'_>,
        cancel: CancellationToken,
    ) -> Result<AdapterResult, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.contexts.lock().unwrap().push(context.cloned());
        let behavior = self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        match behavior {
            Behavior::Reply(text) => {
                on_chunk(&text);
                Ok(AdapterResult::success(text, self.meta(n), 5))
            }
            Behavior::Stream(chunks) => {
                for chunk in &chunks {
                    on_chunk(chunk);
                    tokio::task::yield_now().await;
                }
                Ok(AdapterResult::success(chunks.concat(), self.meta(n), 5))
            }
            Behavior::Sleep(duration, text) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ProviderError::Cancelled),
                    _ = tokio::time::sleep(duration) => {
                        on_chunk(&text);
                        Ok(AdapterResult::success(text, self.meta(n), duration.as_millis() as u64))
                    }
                }
            }
            Behavior::Fail => Err(ProviderError::Io(std::io::Error::other("connection reset"))),
            Behavior::Empty => Ok(AdapterResult::success("  \n", self.meta(n), 1)),
        }
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_prompt(
        &self,
        prompt: &str,
        on_chunk: &ChunkSink<'_>,
        cancel: CancellationToken,
    ) -> Result<AdapterResult, ProviderError> {
        self.respond(prompt, None, on_chunk, cancel).await
    }

    async fn send_continuation(
        &self,
        prompt: &str,
        provider_context: &Value,
        on_chunk: &ChunkSink<'_>,
        cancel: CancellationToken,
    ) -> Result<AdapterResult, ProviderError> {
        self.respond(prompt, Some(provider_context), on_chunk, cancel).await
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// 書き込みを常に失敗させられるストア
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    fail_puts: AtomicBool,
    put_attempts: AtomicUsize,
}

impl FailingStore {
    pub fn failing() -> Arc<Self> {
        let store = Self::default();
        store.fail_puts.store(true, Ordering::SeqCst);
        Arc::new(store)
    }

    pub fn put_attempts(&self) -> usize {
        self.put_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KvStore for FailingStore {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(table, key).await
    }

    async fn put(&self, table: Table, record: Value) -> Result<(), StoreError> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.inner.put(table, record).await
    }

    async fn get_all(&self, table: Table) -> Result<Vec<Value>, StoreError> {
        self.inner.get_all(table).await
    }

    async fn get_by_index(&self, table: Table, index: &str, key: &str) -> Result<Vec<Value>, StoreError> {
        self.inner.get_by_index(table, index, key).await
    }

    async fn delete(&self, table: Table, key: &str) -> Result<(), StoreError> {
        self.inner.delete(table, key).await
    }
}

/// テスト用の設定（リミッターは十分大きく、リトライ間隔は短い）
pub fn test_settings() -> Settings {
    Settings {
        rate_limit: RateLimitSettings {
            capacity: 1000,
            refill_per_sec: 1000.0,
            acquire_timeout: Duration::from_secs(1),
        },
        circuit_breaker: CircuitBreakerSettings {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        },
        orchestrator: OrchestratorSettings {
            provider_timeout: Duration::from_secs(5),
        },
        persistence: PersistenceSettings {
            store_path: None,
            max_attempts: 3,
            retry_delay: Duration::from_millis(10),
        },
        ..Settings::default()
    }
}

pub fn orchestrator(adapters: &[Arc<MockAdapter>], settings: &Settings) -> Orchestrator {
    let mut registry = ProviderRegistry::new();
    for adapter in adapters {
        registry.register(adapter.clone());
    }
    Orchestrator::new(
        registry,
        Arc::new(RateLimiter::new(settings.rate_limit.clone())),
        Arc::new(CircuitBreaker::new(settings.circuit_breaker.clone())),
        settings.orchestrator.clone(),
    )
}

pub fn engine_with_store(adapters: &[Arc<MockAdapter>], settings: &Settings, store: Arc<dyn KvStore>) -> WorkflowEngine {
    WorkflowEngine::new(
        Arc::new(orchestrator(adapters, settings)),
        Arc::new(PersistenceManager::new(TurnRepository::new(store))),
        settings.streaming.clone(),
        settings.persistence.clone(),
    )
}

pub fn engine(adapters: &[Arc<MockAdapter>]) -> WorkflowEngine {
    engine_with_store(adapters, &test_settings(), Arc::new(MemoryStore::new()))
}

/// 実行して、それまでに配信されたイベントを集める
pub async fn run(
    engine: &WorkflowEngine,
    request: WorkflowRequest,
) -> (Result<WorkflowResult, ExecutionError>, Vec<EngineEvent>) {
    run_with_cancel(engine, request, CancellationToken::new()).await
}

pub async fn run_with_cancel(
    engine: &WorkflowEngine,
    request: WorkflowRequest,
    cancel: CancellationToken,
) -> (Result<WorkflowResult, ExecutionError>, Vec<EngineEvent>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let result = engine.execute(request, tx, cancel).await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    (result, events)
}

fn ids(providers: &[&str]) -> Vec<String> {
    providers.iter().map(|p| p.to_string()).collect()
}

pub fn initialize(message: &str, providers: &[&str]) -> WorkflowRequest {
    WorkflowRequest::Initialize(InitializeRequest {
        user_message: message.to_string(),
        provider_ids: ids(providers),
        mapping_provider: None,
        synthesis_provider: None,
    })
}

pub fn initialize_with(
    message: &str,
    providers: &[&str],
    mapping: Option<&str>,
    synthesis: Option<&str>,
) -> WorkflowRequest {
    WorkflowRequest::Initialize(InitializeRequest {
        user_message: message.to_string(),
        provider_ids: ids(providers),
        mapping_provider: mapping.map(str::to_string),
        synthesis_provider: synthesis.map(str::to_string),
    })
}

pub fn extend(session_id: &str, message: &str, providers: &[&str]) -> WorkflowRequest {
    WorkflowRequest::Extend(ExtendRequest {
        session_id: session_id.to_string(),
        user_message: message.to_string(),
        provider_ids: ids(providers),
        mapping_provider: None,
        synthesis_provider: None,
    })
}

pub fn recompute(session_id: &str, source_turn_id: &str, step_type: StepType, provider: &str) -> WorkflowRequest {
    WorkflowRequest::Recompute(RecomputeRequest {
        session_id: session_id.to_string(),
        source_turn_id: source_turn_id.to_string(),
        step_type,
        target_provider: provider.to_string(),
    })
}

/// WorkflowComplete イベントの数
pub fn completion_count(events: &[EngineEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, EngineEvent::WorkflowComplete { .. }))
        .count()
}
