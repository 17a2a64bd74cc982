//! 永続化マネージャー
//!
//! # 責務
//!
//! - Initialize / Extend / Recompute の結果を追記専用のターンログとして記録する
//! - セッションの `last_turn_id` とターン数を更新する（Recompute では動かさない）
//! - タイムライン・Recompute ブランチ・レスポンスの読み出し
//! - セッション単位のカスケード削除
//!
//! # 書き込み順序
//!
//! レスポンス → ターン → セッションの順に書きます。セッションのポインタは
//! 最後に更新されるため、途中で失敗しても存在しないターンを指すことはありません。
//! 失敗した呼び出しが書いたレコードは削除してからエラーを返します。
//!
//! # 並行性
//!
//! 同じセッションへの Extend / Recompute / 削除はセッションごとの非同期ロックで
//! 直列化します。シーケンス採番と `last_turn_id` の更新はこのロックの中で
//! 読み取り → 書き込みを行います。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::engine::result::{StepResult, StepStatus, WorkflowResult};
use crate::error::PersistenceError;
use crate::model::{
    merge_provider_contexts, AssistantTurn, ExtendRequest, InitializeRequest, ProviderContexts, ProviderResponse,
    ResponseStatus, ResponseType, Session, SessionMetadata, StepType, Turn, TurnType, WorkflowRequest,
    OFF_TIMELINE_SEQUENCE,
};
use crate::workflow::{ExtendContext, RecomputeContext, ResolvedContext};
use super::cache::SessionCache;
use super::repository::TurnRepository;
use super::store::Table;

/// セッションタイトルの最大文字数
const TITLE_MAX_CHARS: usize = 48;

/// 永続化の結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistReceipt {
    pub session_id: String,
    /// Recompute では作られない
    pub user_turn_id: Option<String>,
    pub ai_turn_id: Option<String>,
}

type SessionLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// セッションロックを保持している間のガード
///
/// 解放時に他に待っている呼び出しがなければ、ロック表からエントリを取り除きます。
struct SessionLockGuard<'a> {
    locks: &'a SessionLocks,
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.session_id);
        }
    }
}

/// 1ターン分のレスポンスレコードと種別ごとの件数
struct ResponseBatch {
    responses: Vec<ProviderResponse>,
    batch: u32,
    mapping: u32,
    synthesis: u32,
}

impl ResponseBatch {
    fn build<'a>(session_id: &str, turn_id: &str, steps: impl IntoIterator<Item = &'a StepResult>) -> Self {
        let mut batch = Self {
            responses: Vec::new(),
            batch: 0,
            mapping: 0,
            synthesis: 0,
        };
        for step in steps {
            if step.status == StepStatus::Skipped {
                continue;
            }
            let response_type = step.step_type.response_type();
            for output in step.outputs.values() {
                let meta = json!({
                    "latency_ms": output.latency_ms,
                    "model": output.model,
                    "token_usage": output.token_usage,
                });
                batch.push(session_id, turn_id, &output.provider_id, response_type, ResponseStatus::Completed, &output.text, meta);
            }
            for failure in step.failures.values() {
                let meta = json!({
                    "latency_ms": failure.latency_ms,
                    "failure_kind": failure.kind,
                    "error": failure.message,
                });
                batch.push(session_id, turn_id, &failure.provider_id, response_type, ResponseStatus::Failed, "", meta);
            }
        }
        batch
    }

    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        session_id: &str,
        turn_id: &str,
        provider_id: &str,
        response_type: ResponseType,
        status: ResponseStatus,
        text: &str,
        meta: serde_json::Value,
    ) {
        let now = Utc::now();
        self.responses.push(ProviderResponse {
            id: ProviderResponse::new_id(session_id, turn_id, provider_id, response_type, 0, now),
            session_id: session_id.to_string(),
            turn_id: turn_id.to_string(),
            provider_id: provider_id.to_string(),
            response_type,
            response_index: 0,
            text: text.to_string(),
            status,
            meta,
            created_at: now,
            updated_at: now,
        });
        match response_type {
            ResponseType::Batch => self.batch += 1,
            ResponseType::Mapping => self.mapping += 1,
            ResponseType::Synthesis => self.synthesis += 1,
        }
    }

    fn assistant_turn(
        &self,
        turn_type: TurnType,
        provider_contexts: ProviderContexts,
        source_turn_id: Option<String>,
    ) -> AssistantTurn {
        AssistantTurn {
            turn_type,
            provider_contexts,
            batch_response_count: self.batch,
            mapping_response_count: self.mapping,
            synthesis_response_count: self.synthesis,
            source_turn_id,
        }
    }
}

/// プロンプトステップの出力から新しいプロバイダーコンテキストを集める
fn fresh_contexts(result: &WorkflowResult) -> ProviderContexts {
    result
        .step_of_type(StepType::Prompt)
        .map(|step| {
            step.outputs
                .iter()
                .filter_map(|(provider_id, output)| {
                    output
                        .provider_context
                        .clone()
                        .map(|context| (provider_id.clone(), context))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// 指定種別のステップが成功していることを確認する
fn require_success(result: &WorkflowResult, step_type: StepType) -> Result<&StepResult, PersistenceError> {
    match result.step_of_type(step_type) {
        Some(step) if step.status == StepStatus::Success => Ok(step),
        Some(step) => Err(PersistenceError::InvalidState(format!(
            "ステップ '{}' が成功していません",
            step.step_id
        ))),
        None => Err(PersistenceError::InvalidState(format!(
            "{} ステップの結果がありません",
            step_type
        ))),
    }
}

/// 永続化マネージャー
pub struct PersistenceManager {
    repository: TurnRepository,
    cache: SessionCache,
    session_locks: SessionLocks,
}

impl PersistenceManager {
    pub fn new(repository: TurnRepository) -> Self {
        Self::with_cache(repository, SessionCache::new())
    }

    pub fn with_cache(repository: TurnRepository, cache: SessionCache) -> Self {
        Self {
            repository,
            cache,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn repository(&self) -> &TurnRepository {
        &self.repository
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    async fn lock_session(&self, session_id: &str) -> SessionLockGuard<'_> {
        let lock = {
            let mut locks = self.session_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(session_id.to_string()).or_default())
        };
        SessionLockGuard {
            locks: &self.session_locks,
            session_id: session_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// ワークフローの結果を記録する
    ///
    /// # 引数
    ///
    /// - `request`: 実行したリクエスト
    /// - `context`: リクエストの解決済みコンテキスト
    /// - `result`: エンジンの実行結果（Initialize では `session_id` が採番済み）
    ///
    /// # 戻り値
    ///
    /// 作成したセッション・ターンのID
    ///
    /// # エラー
    ///
    /// - [`PersistenceError::InvalidState`] - 記録すべき成功出力がない、またはリクエストとコンテキストが食い違う
    /// - [`PersistenceError::MissingRecord`] - 参照先のセッション・ターンが存在しない
    /// - [`PersistenceError::Store`] - ストアの読み書きに失敗
    pub async fn persist(
        &self,
        request: &WorkflowRequest,
        context: &ResolvedContext,
        result: &WorkflowResult,
    ) -> Result<PersistReceipt, PersistenceError> {
        let receipt = match (request, context) {
            (WorkflowRequest::Initialize(req), ResolvedContext::Initialize) => {
                self.persist_initialize(req, result).await?
            }
            (WorkflowRequest::Extend(req), ResolvedContext::Extend(ctx)) => {
                self.persist_extend(req, ctx, result).await?
            }
            (WorkflowRequest::Recompute(req), ResolvedContext::Recompute(ctx)) => {
                self.persist_recompute(&req.session_id, ctx, result).await?
            }
            _ => {
                return Err(PersistenceError::InvalidState(
                    "リクエストとコンテキストの種別が一致しません".to_string(),
                ));
            }
        };

        info!(
            session_id = %receipt.session_id,
            turn_type = %request.turn_type(),
            ai_turn_id = ?receipt.ai_turn_id,
            "turn persisted"
        );
        Ok(receipt)
    }

    async fn persist_initialize(
        &self,
        request: &InitializeRequest,
        result: &WorkflowResult,
    ) -> Result<PersistReceipt, PersistenceError> {
        require_success(result, StepType::Prompt)?;
        let session_id = result.session_id.clone();
        let _guard = self.lock_session(&session_id).await;

        if self.repository.get_session(&session_id).await?.is_some() {
            return Err(PersistenceError::InvalidState(format!(
                "セッション '{}' は既に存在します",
                session_id
            )));
        }

        let user = Turn::user(&session_id, 0, None, &request.user_message);
        let ai_id = Turn::new_id();
        let responses = ResponseBatch::build(&session_id, &ai_id, &result.steps);
        let mut ai = Turn::assistant(
            &session_id,
            1,
            Some(user.id.clone()),
            responses.assistant_turn(TurnType::Initialize, fresh_contexts(result), None),
        );
        ai.id = ai_id;

        let now = Utc::now();
        let session = Session {
            id: session_id.clone(),
            title: Session::title_from_message(&request.user_message, TITLE_MAX_CHARS),
            created_at: now,
            last_turn_id: Some(ai.id.clone()),
            last_activity: now,
            turn_count: 2,
        };
        self.commit(&responses, &[&user, &ai], &session).await?;
        self.cache.upsert(SessionMetadata::from(&session)).await;

        Ok(PersistReceipt {
            session_id,
            user_turn_id: Some(user.id),
            ai_turn_id: Some(ai.id),
        })
    }

    async fn persist_extend(
        &self,
        request: &ExtendRequest,
        context: &ExtendContext,
        result: &WorkflowResult,
    ) -> Result<PersistReceipt, PersistenceError> {
        require_success(result, StepType::Prompt)?;
        let session_id = request.session_id.as_str();
        let _guard = self.lock_session(session_id).await;

        let mut session = self.load_session(session_id).await?;
        let latest_id = session.last_turn_id.clone().ok_or_else(|| {
            PersistenceError::InvalidState(format!("セッション '{}' に last_turn_id がありません", session_id))
        })?;

        // 解決後に他の Extend が進めていた場合は現在の最新ターンから継承する
        let inherited = if latest_id == context.last_turn_id {
            self.load_turn(&latest_id).await?;
            context.inherited_provider_contexts.clone()
        } else {
            debug!(
                session_id,
                resolved = %context.last_turn_id,
                current = %latest_id,
                "last turn moved since resolution"
            );
            let latest = self.load_turn(&latest_id).await?;
            latest
                .as_assistant()
                .map(|assistant| assistant.provider_contexts.clone())
                .ok_or_else(|| {
                    PersistenceError::InvalidState(format!("ターン '{}' はアシスタントターンではありません", latest_id))
                })?
        };

        let sequence = i64::try_from(session.turn_count)
            .map_err(|_| PersistenceError::InvalidState("ターン数が上限を超えています".to_string()))?;
        let user = Turn::user(session_id, sequence, Some(latest_id), &request.user_message);
        let ai_id = Turn::new_id();
        let responses = ResponseBatch::build(session_id, &ai_id, &result.steps);
        let merged = merge_provider_contexts(&inherited, &fresh_contexts(result));
        let mut ai = Turn::assistant(
            session_id,
            sequence + 1,
            Some(user.id.clone()),
            responses.assistant_turn(TurnType::Extend, merged, None),
        );
        ai.id = ai_id;

        session.last_turn_id = Some(ai.id.clone());
        session.turn_count += 2;
        session.last_activity = Utc::now();
        self.commit(&responses, &[&user, &ai], &session).await?;
        self.cache.upsert(SessionMetadata::from(&session)).await;

        Ok(PersistReceipt {
            session_id: session.id,
            user_turn_id: Some(user.id),
            ai_turn_id: Some(ai.id),
        })
    }

    async fn persist_recompute(
        &self,
        session_id: &str,
        context: &RecomputeContext,
        result: &WorkflowResult,
    ) -> Result<PersistReceipt, PersistenceError> {
        let step = require_success(result, context.step_type)?;
        let _guard = self.lock_session(session_id).await;

        let mut session = self.load_session(session_id).await?;
        let source = self.load_turn(&context.source_turn_id).await?;

        let ai_id = Turn::new_id();
        let responses = ResponseBatch::build(session_id, &ai_id, [step]);
        let mut ai = Turn::assistant(
            session_id,
            OFF_TIMELINE_SEQUENCE,
            source.parent_turn_id.clone(),
            responses.assistant_turn(
                TurnType::Recompute,
                context.provider_contexts_at_source_turn.clone(),
                Some(source.id.clone()),
            ),
        );
        ai.id = ai_id;

        // ポインタとターン数は動かさない
        session.last_activity = Utc::now();
        self.commit(&responses, &[&ai], &session).await?;
        self.cache.upsert(SessionMetadata::from(&session)).await;

        Ok(PersistReceipt {
            session_id: session.id,
            user_turn_id: None,
            ai_turn_id: Some(ai.id),
        })
    }

    /// レスポンス → ターン → セッションの順に書き込む
    ///
    /// 途中で失敗した場合は、この呼び出しで書いたレコードを削除してから
    /// エラーを返します（リトライ時に重複ターンを残さない）。
    async fn commit(
        &self,
        responses: &ResponseBatch,
        turns: &[&Turn],
        session: &Session,
    ) -> Result<(), PersistenceError> {
        let mut written: Vec<(Table, String)> = Vec::new();
        match self.write_all(responses, turns, session, &mut written).await {
            Ok(()) => Ok(()),
            Err(e) => {
                for (table, key) in written.iter().rev() {
                    if let Err(rollback) = self.repository.delete(*table, key).await {
                        warn!(table = table.name(), key = %key, "rollback failed: {}", rollback);
                    }
                }
                Err(e)
            }
        }
    }

    async fn write_all(
        &self,
        responses: &ResponseBatch,
        turns: &[&Turn],
        session: &Session,
        written: &mut Vec<(Table, String)>,
    ) -> Result<(), PersistenceError> {
        for response in &responses.responses {
            self.repository.put_response(response).await?;
            written.push((Table::ProviderResponses, response.id.clone()));
        }
        for turn in turns {
            self.repository.put_turn(turn).await?;
            written.push((Table::Turns, turn.id.clone()));
        }
        // セッションは上書きなのでロールバック対象にしない
        self.repository.put_session(session).await?;
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Session, PersistenceError> {
        self.repository
            .get_session(session_id)
            .await?
            .ok_or_else(|| PersistenceError::MissingRecord {
                table: Table::Sessions.name(),
                key: session_id.to_string(),
            })
    }

    async fn load_turn(&self, turn_id: &str) -> Result<Turn, PersistenceError> {
        self.repository
            .get_turn(turn_id)
            .await?
            .ok_or_else(|| PersistenceError::MissingRecord {
                table: Table::Turns.name(),
                key: turn_id.to_string(),
            })
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>, PersistenceError> {
        Ok(self.repository.get_session(session_id).await?)
    }

    /// オンタイムラインのターン（シーケンス順）
    pub async fn timeline(&self, session_id: &str) -> Result<Vec<Turn>, PersistenceError> {
        let turns = self.repository.turns_for_session(session_id).await?;
        Ok(turns.into_iter().filter(Turn::is_on_timeline).collect())
    }

    /// 指定ターンから作られた Recompute ブランチ（作成順）
    pub async fn recompute_branches(&self, source_turn_id: &str) -> Result<Vec<Turn>, PersistenceError> {
        let source = self.load_turn(source_turn_id).await?;
        let turns = self.repository.turns_for_session(&source.session_id).await?;
        Ok(turns
            .into_iter()
            .filter(|turn| {
                turn.as_assistant()
                    .is_some_and(|assistant| assistant.source_turn_id.as_deref() == Some(source_turn_id))
            })
            .collect())
    }

    pub async fn responses_for_turn(&self, turn_id: &str) -> Result<Vec<ProviderResponse>, PersistenceError> {
        Ok(self.repository.responses_for_turn(turn_id).await?)
    }

    /// セッション一覧（最終アクティビティの新しい順）
    ///
    /// 初回はストアから読み込んでキャッシュをウォームします。
    pub async fn list_sessions(&self) -> Result<Vec<SessionMetadata>, PersistenceError> {
        if !self.cache.is_warm() {
            let sessions = self.repository.list_sessions().await?;
            debug!(count = sessions.len(), "warming session cache");
            self.cache.warm(sessions.iter().map(SessionMetadata::from)).await;
        }
        Ok(self.cache.list().await)
    }

    /// セッションと、それに属するターン・レスポンスを全て削除する
    pub async fn delete_session(&self, session_id: &str) -> Result<(), PersistenceError> {
        let _guard = self.lock_session(session_id).await;
        self.load_session(session_id).await?;

        let responses = self.repository.responses_for_session(session_id).await?;
        for response in &responses {
            self.repository.delete(Table::ProviderResponses, &response.id).await?;
        }
        let turns = self.repository.turns_for_session(session_id).await?;
        for turn in &turns {
            self.repository.delete(Table::Turns, &turn.id).await?;
        }
        self.repository.delete(Table::Sessions, session_id).await?;
        self.cache.remove(session_id).await;

        info!(
            session_id,
            turns = turns.len(),
            responses = responses.len(),
            "session deleted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::result::ExecutionStatus;
    use crate::model::RecomputeRequest;
    use crate::orchestrator::{FailureKind, ProviderFailure, ProviderOutput};
    use crate::persistence::MemoryStore;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn manager() -> PersistenceManager {
        PersistenceManager::new(TurnRepository::new(Arc::new(MemoryStore::new())))
    }

    fn output(provider_id: &str, text: &str, cursor: Option<&str>) -> ProviderOutput {
        ProviderOutput {
            provider_id: provider_id.to_string(),
            text: text.to_string(),
            provider_context: cursor.map(|c| json!({ "cursor": c })),
            model: None,
            token_usage: None,
            latency_ms: 10,
        }
    }

    fn step(step_id: &str, step_type: StepType, outputs: Vec<ProviderOutput>, failed: &[&str]) -> StepResult {
        let failures: BTreeMap<String, ProviderFailure> = failed
            .iter()
            .map(|provider_id| {
                (
                    provider_id.to_string(),
                    ProviderFailure {
                        provider_id: provider_id.to_string(),
                        kind: FailureKind::Timeout,
                        message: "timed out".to_string(),
                        latency_ms: 50,
                    },
                )
            })
            .collect();
        StepResult {
            step_id: step_id.to_string(),
            step_type,
            status: if outputs.is_empty() { StepStatus::Failed } else { StepStatus::Success },
            outputs: outputs.into_iter().map(|o| (o.provider_id.clone(), o)).collect(),
            failures,
            duration: Duration::from_millis(10),
            error: None,
        }
    }

    fn result(session_id: &str, turn_type: TurnType, steps: Vec<StepResult>) -> WorkflowResult {
        WorkflowResult {
            session_id: session_id.to_string(),
            turn_type,
            status: ExecutionStatus::Success,
            steps,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            total_duration: Duration::from_millis(10),
            total_tokens_used: 0,
            error: None,
            persistence: None,
            persistence_error: None,
        }
    }

    async fn initialize(manager: &PersistenceManager) -> PersistReceipt {
        let request = WorkflowRequest::Initialize(InitializeRequest {
            user_message: "最初の質問".to_string(),
            provider_ids: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            mapping_provider: None,
            synthesis_provider: None,
        });
        let result = result(
            &Session::new_id(),
            TurnType::Initialize,
            vec![step(
                "prompt-0",
                StepType::Prompt,
                vec![output("a", "alpha", Some("a1")), output("b", "beta", Some("b1"))],
                &["c"],
            )],
        );
        manager
            .persist(&request, &ResolvedContext::Initialize, &result)
            .await
            .unwrap()
    }

    async fn extend(manager: &PersistenceManager, session_id: &str, providers: &[(&str, &str)]) -> PersistReceipt {
        let session = manager.get_session(session_id).await.unwrap().unwrap();
        let last_turn_id = session.last_turn_id.unwrap();
        let inherited = manager
            .repository()
            .get_turn(&last_turn_id)
            .await
            .unwrap()
            .unwrap()
            .as_assistant()
            .unwrap()
            .provider_contexts
            .clone();
        let request = WorkflowRequest::Extend(ExtendRequest {
            session_id: session_id.to_string(),
            user_message: "続き".to_string(),
            provider_ids: providers.iter().map(|(p, _)| p.to_string()).collect(),
            mapping_provider: None,
            synthesis_provider: None,
        });
        let context = ResolvedContext::Extend(ExtendContext {
            last_turn_id,
            inherited_provider_contexts: inherited,
        });
        let outputs = providers
            .iter()
            .map(|(p, cursor)| output(p, "next", Some(cursor)))
            .collect();
        let result = result(session_id, TurnType::Extend, vec![step("prompt-0", StepType::Prompt, outputs, &[])]);
        manager.persist(&request, &context, &result).await.unwrap()
    }

    #[tokio::test]
    async fn test_initialize_creates_session_and_two_turns() {
        let manager = manager();
        let receipt = initialize(&manager).await;

        let session = manager.get_session(&receipt.session_id).await.unwrap().unwrap();
        assert_eq!(session.last_turn_id, receipt.ai_turn_id);
        assert_eq!(session.turn_count, 2);
        assert_eq!(session.title, "最初の質問");

        let timeline = manager.timeline(&receipt.session_id).await.unwrap();
        assert_eq!(timeline.iter().map(|t| t.sequence).collect::<Vec<_>>(), vec![0, 1]);
        let ai = timeline[1].as_assistant().unwrap();
        assert_eq!(ai.batch_response_count, 3);
        assert_eq!(ai.provider_contexts.len(), 2);

        let responses = manager.responses_for_turn(&timeline[1].id).await.unwrap();
        assert_eq!(responses.len(), 3);
        let failed = responses.iter().find(|r| r.provider_id == "c").unwrap();
        assert_eq!(failed.status, ResponseStatus::Failed);
        assert_eq!(failed.meta["failure_kind"], "timeout");
    }

    #[tokio::test]
    async fn test_extend_merges_sticky_contexts() {
        let manager = manager();
        let first = initialize(&manager).await;
        let second = extend(&manager, &first.session_id, &[("a", "a2")]).await;

        let session = manager.get_session(&first.session_id).await.unwrap().unwrap();
        assert_eq!(session.last_turn_id, second.ai_turn_id);
        assert_eq!(session.turn_count, 4);

        let ai = manager
            .repository()
            .get_turn(second.ai_turn_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ai.sequence, 3);
        let contexts = &ai.as_assistant().unwrap().provider_contexts;
        assert_eq!(contexts["a"], json!({ "cursor": "a2" }));
        assert_eq!(contexts["b"], json!({ "cursor": "b1" }));
    }

    #[tokio::test]
    async fn test_extend_against_moved_pointer_uses_current_latest() {
        let manager = manager();
        let first = initialize(&manager).await;
        let stale = ResolvedContext::Extend(ExtendContext {
            last_turn_id: first.ai_turn_id.clone().unwrap(),
            inherited_provider_contexts: ProviderContexts::new(),
        });
        let second = extend(&manager, &first.session_id, &[("b", "b2")]).await;

        let request = WorkflowRequest::Extend(ExtendRequest {
            session_id: first.session_id.clone(),
            user_message: "並行".to_string(),
            provider_ids: vec!["a".to_string()],
            mapping_provider: None,
            synthesis_provider: None,
        });
        let result = result(
            &first.session_id,
            TurnType::Extend,
            vec![step("prompt-0", StepType::Prompt, vec![output("a", "x", Some("a3"))], &[])],
        );
        let third = manager.persist(&request, &stale, &result).await.unwrap();

        let user = manager
            .repository()
            .get_turn(third.user_turn_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.parent_turn_id, second.ai_turn_id);
        assert_eq!(user.sequence, 4);

        let ai = manager
            .repository()
            .get_turn(third.ai_turn_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ai.as_assistant().unwrap().provider_contexts["b"], json!({ "cursor": "b2" }));
    }

    #[tokio::test]
    async fn test_recompute_is_off_timeline() {
        let manager = manager();
        let first = initialize(&manager).await;
        let source_id = first.ai_turn_id.clone().unwrap();
        let source = manager.repository().get_turn(&source_id).await.unwrap().unwrap();

        let request = WorkflowRequest::Recompute(RecomputeRequest {
            session_id: first.session_id.clone(),
            source_turn_id: source_id.clone(),
            step_type: StepType::Synthesis,
            target_provider: "b".to_string(),
        });
        let context = ResolvedContext::Recompute(RecomputeContext {
            source_turn_id: source_id.clone(),
            user_message: "最初の質問".to_string(),
            frozen_batch_outputs: BTreeMap::new(),
            frozen_mapping_outputs: BTreeMap::new(),
            provider_contexts_at_source_turn: source.as_assistant().unwrap().provider_contexts.clone(),
            step_type: StepType::Synthesis,
            target_provider: "b".to_string(),
        });
        let result = result(
            &first.session_id,
            TurnType::Recompute,
            vec![step("synthesis-0", StepType::Synthesis, vec![output("b", "統合", None)], &[])],
        );

        let receipt = manager.persist(&request, &context, &result).await.unwrap();
        assert!(receipt.user_turn_id.is_none());

        let session = manager.get_session(&first.session_id).await.unwrap().unwrap();
        assert_eq!(session.last_turn_id, first.ai_turn_id);
        assert_eq!(session.turn_count, 2);

        let branches = manager.recompute_branches(&source_id).await.unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].sequence, OFF_TIMELINE_SEQUENCE);
        assert_eq!(branches[0].parent_turn_id, source.parent_turn_id);
        assert_eq!(branches[0].as_assistant().unwrap().synthesis_response_count, 1);

        let responses = manager.responses_for_turn(&branches[0].id).await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].response_type, ResponseType::Synthesis);
        assert_eq!(manager.timeline(&first.session_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_prompt_is_not_persisted() {
        let manager = manager();
        let request = WorkflowRequest::Initialize(InitializeRequest {
            user_message: "q".to_string(),
            provider_ids: vec!["a".to_string()],
            mapping_provider: None,
            synthesis_provider: None,
        });
        let result = result(
            "sess-x",
            TurnType::Initialize,
            vec![step("prompt-0", StepType::Prompt, vec![], &["a"])],
        );
        let err = manager
            .persist(&request, &ResolvedContext::Initialize, &result)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::InvalidState(_)));
        assert!(manager.get_session("sess-x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_sessions_warms_from_store() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let writer = PersistenceManager::new(TurnRepository::new(store.clone()));
        let receipt = initialize(&writer).await;

        let reader = PersistenceManager::new(TurnRepository::new(store));
        assert!(!reader.cache().is_warm());
        let sessions = reader.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, receipt.session_id);
        assert!(reader.cache().is_warm());
    }

    fn held_locks(manager: &PersistenceManager) -> usize {
        manager.session_locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_session_locks_are_released_after_each_write() {
        let manager = manager();
        let first = initialize(&manager).await;
        assert_eq!(held_locks(&manager), 0);

        extend(&manager, &first.session_id, &[("a", "a2")]).await;
        assert_eq!(held_locks(&manager), 0);

        // 失敗した書き込みでも残らない
        let err = manager.delete_session("missing").await.unwrap_err();
        assert!(matches!(err, PersistenceError::MissingRecord { .. }));
        assert_eq!(held_locks(&manager), 0);
    }

    #[tokio::test]
    async fn test_waiting_writer_keeps_lock_entry() {
        let manager = manager();
        let first = initialize(&manager).await;

        let held = manager.lock_session(&first.session_id).await;
        let waiting = extend(&manager, &first.session_id, &[("a", "a2")]);
        tokio::pin!(waiting);
        for _ in 0..4 {
            assert!(futures::poll!(waiting.as_mut()).is_pending());
        }

        drop(held);
        assert_eq!(held_locks(&manager), 1);
        waiting.await;
        assert_eq!(held_locks(&manager), 0);
    }

    #[tokio::test]
    async fn test_delete_session_cascades() {
        let manager = manager();
        let first = initialize(&manager).await;
        extend(&manager, &first.session_id, &[("a", "a2")]).await;

        manager.delete_session(&first.session_id).await.unwrap();

        assert!(manager.get_session(&first.session_id).await.unwrap().is_none());
        assert!(manager.timeline(&first.session_id).await.unwrap().is_empty());
        let responses = manager
            .repository()
            .responses_for_session(&first.session_id)
            .await
            .unwrap();
        assert!(responses.is_empty());
        assert!(manager.list_sessions().await.unwrap().is_empty());

        let err = manager.delete_session(&first.session_id).await.unwrap_err();
        assert!(matches!(err, PersistenceError::MissingRecord { .. }));
    }
}
