//! コンテキストリゾルバー
//!
//! # 責務
//!
//! リクエストプリミティブと永続化済みのターン履歴から、コンパイルに必要な
//! [`ResolvedContext`] を求めます。読み取りのみで副作用はありません。
//!
//! - Initialize: 空のコンテキスト（読み取りなし）
//! - Extend: セッションの `last_turn_id` が指すターンのプロバイダーコンテキスト
//! - Recompute: 元ターンの凍結済みバッチ出力と、*そのターン時点*のコンテキスト
//!
//! 参照先が見つからない場合は [`ResolveError::MissingContext`] を返し、
//! 新しいセッションとして黙って続行することはありません。

use serde::Serialize;
use tracing::debug;

use crate::error::ResolveError;
use crate::model::response::latest_by_provider;
use crate::model::{
    ExtendRequest, ProviderContexts, RecomputeRequest, ResponseStatus, ResponseType, StepType, Turn, TurnType,
    WorkflowRequest,
};
use crate::persistence::TurnRepository;
use super::step::StepOutputs;

/// Extend のコンテキスト
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtendContext {
    pub last_turn_id: String,
    pub inherited_provider_contexts: ProviderContexts,
}

/// Recompute のコンテキスト
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecomputeContext {
    pub source_turn_id: String,
    /// 元ターンのユーザー発言
    pub user_message: String,
    /// 元ターンのバッチ出力（プロバイダーごとに最新の完了済み1件）
    pub frozen_batch_outputs: StepOutputs,
    /// 元ターンのマッピング出力（統合の再実行で使う）
    pub frozen_mapping_outputs: StepOutputs,
    pub provider_contexts_at_source_turn: ProviderContexts,
    pub step_type: StepType,
    pub target_provider: String,
}

/// 解決済みコンテキスト
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolvedContext {
    Initialize,
    Extend(ExtendContext),
    Recompute(RecomputeContext),
}

/// コンテキストリゾルバー
#[derive(Clone)]
pub struct ContextResolver {
    repository: TurnRepository,
}

impl ContextResolver {
    pub fn new(repository: TurnRepository) -> Self {
        Self { repository }
    }

    /// リクエストのコンテキストを解決する
    ///
    /// # エラー
    ///
    /// - [`ResolveError::MissingContext`] - 参照されたセッション・ターンが存在しない
    /// - [`ResolveError::Store`] - ストアの読み取りに失敗
    pub async fn resolve(&self, request: &WorkflowRequest) -> Result<ResolvedContext, ResolveError> {
        match request {
            WorkflowRequest::Initialize(_) => Ok(ResolvedContext::Initialize),
            WorkflowRequest::Extend(req) => self.resolve_extend(req).await.map(ResolvedContext::Extend),
            WorkflowRequest::Recompute(req) => self.resolve_recompute(req).await.map(ResolvedContext::Recompute),
        }
    }

    async fn resolve_extend(&self, request: &ExtendRequest) -> Result<ExtendContext, ResolveError> {
        let session = self
            .repository
            .get_session(&request.session_id)
            .await?
            .ok_or_else(|| ResolveError::MissingContext(format!("セッション '{}'", request.session_id)))?;

        let last_turn_id = session.last_turn_id.ok_or_else(|| {
            ResolveError::MissingContext(format!("セッション '{}' に last_turn_id がありません", session.id))
        })?;

        let turn = self.session_turn(&session.id, &last_turn_id).await?;
        let assistant = turn.as_assistant().ok_or_else(|| {
            ResolveError::MissingContext(format!("ターン '{}' はアシスタントターンではありません", turn.id))
        })?;

        debug!(
            session_id = %session.id,
            last_turn_id = %last_turn_id,
            providers = assistant.provider_contexts.len(),
            "extend context resolved"
        );

        Ok(ExtendContext {
            inherited_provider_contexts: assistant.provider_contexts.clone(),
            last_turn_id,
        })
    }

    async fn resolve_recompute(&self, request: &RecomputeRequest) -> Result<RecomputeContext, ResolveError> {
        let mut source = self.session_turn(&request.session_id, &request.source_turn_id).await?;

        // Recompute ブランチが指定された場合は、その元になったターンを使う
        if let Some(assistant) = source.as_assistant()
            && assistant.turn_type == TurnType::Recompute
            && let Some(origin) = assistant.source_turn_id.clone()
        {
            source = self.session_turn(&request.session_id, &origin).await?;
        }

        let assistant = source.as_assistant().ok_or_else(|| {
            ResolveError::MissingContext(format!("ターン '{}' はアシスタントターンではありません", source.id))
        })?;

        let user_message = match &source.parent_turn_id {
            Some(parent_id) => self
                .session_turn(&request.session_id, parent_id)
                .await?
                .user_text()
                .map(str::to_string),
            None => None,
        }
        .ok_or_else(|| ResolveError::MissingContext(format!("ターン '{}' のユーザー発言", source.id)))?;

        let responses = self.repository.responses_for_turn(&source.id).await?;
        let completed_texts = |response_type: ResponseType| -> StepOutputs {
            latest_by_provider(&responses, response_type)
                .into_iter()
                .filter(|(_, r)| r.status == ResponseStatus::Completed && !r.text.trim().is_empty())
                .map(|(provider_id, r)| (provider_id, r.text.clone()))
                .collect()
        };

        let frozen_batch_outputs = completed_texts(ResponseType::Batch);
        if frozen_batch_outputs.is_empty() {
            return Err(ResolveError::MissingContext(format!(
                "ターン '{}' に完了したバッチ出力がありません",
                source.id
            )));
        }

        debug!(
            session_id = %request.session_id,
            source_turn_id = %source.id,
            step_type = %request.step_type,
            target_provider = %request.target_provider,
            "recompute context resolved"
        );

        Ok(RecomputeContext {
            source_turn_id: source.id.clone(),
            user_message,
            frozen_batch_outputs,
            frozen_mapping_outputs: completed_texts(ResponseType::Mapping),
            provider_contexts_at_source_turn: assistant.provider_contexts.clone(),
            step_type: request.step_type,
            target_provider: request.target_provider.clone(),
        })
    }

    /// セッションに属するターンを読む
    async fn session_turn(&self, session_id: &str, turn_id: &str) -> Result<Turn, ResolveError> {
        match self.repository.get_turn(turn_id).await? {
            Some(turn) if turn.session_id == session_id => Ok(turn),
            Some(_) => Err(ResolveError::MissingContext(format!(
                "ターン '{}' はセッション '{}' に属していません",
                turn_id, session_id
            ))),
            None => Err(ResolveError::MissingContext(format!("ターン '{}'", turn_id))),
        }
    }
}
