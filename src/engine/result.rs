//! ワークフロー実行結果の型定義
//!
//! # 責務
//!
//! - ステップ実行結果 [`StepResult`] の型定義
//! - ワークフロー実行結果 [`WorkflowResult`] の型定義
//! - 実行ステータス [`ExecutionStatus`] と [`StepStatus`] の型定義
//! - 実行エラー [`ExecutionError`] の型定義
//!
//! # 使用例
//!
//! ```rust,no_run
//! use turnflow::engine::result::WorkflowResult;
//!
//! fn handle_result(result: WorkflowResult) {
//!     if result.is_success() {
//!         println!("セッション: {}", result.session_id);
//!         println!("完了ステップ数: {}/{}", result.completed_steps(), result.steps.len());
//!         println!("総トークン使用量: {}", result.total_tokens_used);
//!     } else {
//!         println!("ワークフロー失敗: {:?}", result.error);
//!     }
//!
//!     if let Some(error) = &result.persistence_error {
//!         println!("保存に失敗しました: {}", error);
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::error::{ResolveError, StoreError};
use crate::model::{StepType, TurnType};
use crate::orchestrator::{ProviderFailure, ProviderOutput};
use crate::persistence::PersistReceipt;
use crate::workflow::{CompileError, StepOutputs};

/// ワークフロー実行結果
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    /// 対象セッション（Initialize では実行前に採番済み）
    pub session_id: String,

    pub turn_type: TurnType,

    /// 実行ステータス
    pub status: ExecutionStatus,

    /// 各ステップの実行結果（コンパイル順）
    pub steps: Vec<StepResult>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// 総実行時間
    pub total_duration: Duration,

    /// 総トークン使用量
    pub total_tokens_used: u32,

    /// エラーメッセージ（失敗時のみ）
    pub error: Option<String>,

    /// 永続化の結果（保存できた場合）
    pub persistence: Option<PersistReceipt>,

    /// 永続化のエラー（リトライ後も失敗した場合）
    ///
    /// 既に配信済みの結果を失敗扱いにはしません。
    pub persistence_error: Option<String>,
}

impl WorkflowResult {
    /// 結果をJSON形式でシリアライズ
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// 成功したかどうか
    ///
    /// # 戻り値
    ///
    /// - `true`: ステータスが [`ExecutionStatus::Success`]
    /// - `false`: それ以外
    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecutionStatus::Success)
    }

    /// 完了したステップ数
    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Success)
            .count()
    }

    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|step| step.step_id == step_id)
    }

    /// 指定種別の最初のステップ
    pub fn step_of_type(&self, step_type: StepType) -> Option<&StepResult> {
        self.steps.iter().find(|step| step.step_type == step_type)
    }
}

/// ステップ実行結果
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step_id: String,

    pub step_type: StepType,

    /// 実行ステータス
    pub status: StepStatus,

    /// 成功したプロバイダーの出力
    pub outputs: BTreeMap<String, ProviderOutput>,

    /// 失敗したプロバイダー
    pub failures: BTreeMap<String, ProviderFailure>,

    /// 実行時間
    pub duration: Duration,

    /// エラーメッセージ（失敗・スキップ時のみ）
    pub error: Option<String>,
}

impl StepResult {
    /// 実行されなかったステップの結果
    pub fn skipped(step_id: &str, step_type: StepType, reason: String) -> Self {
        Self {
            step_id: step_id.to_string(),
            step_type,
            status: StepStatus::Skipped,
            outputs: BTreeMap::new(),
            failures: BTreeMap::new(),
            duration: Duration::ZERO,
            error: Some(reason),
        }
    }

    /// プロバイダーごとの出力テキスト
    pub fn texts(&self) -> StepOutputs {
        self.outputs
            .iter()
            .map(|(provider_id, output)| (provider_id.clone(), output.text.clone()))
            .collect()
    }

    pub fn tokens_used(&self) -> u32 {
        self.outputs
            .values()
            .filter_map(|output| output.token_usage)
            .map(|usage| usage.total())
            .sum()
    }
}

/// ワークフロー実行ステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionStatus {
    /// すべてのステップが成功
    Success,

    /// 一部のステップのみ成功
    PartialSuccess {
        /// 完了したステップ数
        completed: usize,
        /// 総ステップ数
        total: usize,
    },

    /// ワークフロー失敗
    Failed,
}

/// ステップ実行ステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepStatus {
    /// 1つ以上のプロバイダーが有効なテキストを返した
    Success,

    /// 有効なテキストが1つもない
    Failed,

    /// スキップ（依存する先行ステップの失敗により未実行）
    Skipped,
}

/// 実行エラー
///
/// ネットワーク呼び出しの前に検出され、副作用なしで拒否されるものだけを表します。
/// ステップやプロバイダーの失敗は [`WorkflowResult`] に含めて返します。
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// 不正なリクエスト（空のプロバイダーリスト等）
    #[error("不正なリクエスト: {0}")]
    InvalidRequest(String),

    /// 参照されたセッション・ターンが見つからない
    #[error("コンテキストが見つかりません: {0}")]
    MissingContext(String),

    /// ストアの読み取りに失敗
    #[error("ストアエラー: {0}")]
    Store(#[from] StoreError),
}

impl From<ResolveError> for ExecutionError {
    fn from(error: ResolveError) -> Self {
        match error {
            ResolveError::MissingContext(message) => ExecutionError::MissingContext(message),
            ResolveError::Store(e) => ExecutionError::Store(e),
        }
    }
}

impl From<CompileError> for ExecutionError {
    fn from(error: CompileError) -> Self {
        ExecutionError::InvalidRequest(error.to_string())
    }
}
