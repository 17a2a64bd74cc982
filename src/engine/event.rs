//! エンジンイベント
//!
//! ワークフロー実行中の進行状況を呼び出し側（CLI・UI）へ配信します。
//! イベントは実行ごとの非同期チャネルに送られ、受信側が閉じていても
//! 実行は止まりません。

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use crate::persistence::PersistReceipt;
use crate::streaming::PartialUpdate;
use super::result::{StepResult, StepStatus};

/// ステップ更新の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEventStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

/// エンジンが配信するイベント
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// ステップの開始・終了
    StepUpdate {
        session_id: String,
        step_id: String,
        status: StepEventStatus,
        result: Option<Box<StepResult>>,
        error: Option<String>,
    },

    /// まとめられた部分出力
    PartialBatch {
        session_id: String,
        updates: Vec<PartialUpdate>,
    },

    /// 全ステップの終了（実行ごとにちょうど1回）
    WorkflowComplete {
        session_id: String,
        results: Vec<StepResult>,
        error: Option<String>,
    },

    /// 永続化の完了
    Persisted { receipt: PersistReceipt },

    /// リトライ後も永続化に失敗した
    PersistenceFailed {
        session_id: String,
        attempts: u32,
        error: String,
    },
}

impl EngineEvent {
    pub fn session_id(&self) -> &str {
        match self {
            EngineEvent::StepUpdate { session_id, .. }
            | EngineEvent::PartialBatch { session_id, .. }
            | EngineEvent::WorkflowComplete { session_id, .. }
            | EngineEvent::PersistenceFailed { session_id, .. } => session_id,
            EngineEvent::Persisted { receipt } => &receipt.session_id,
        }
    }
}

/// 1実行分のイベント送信口
#[derive(Debug, Clone)]
pub struct EventEmitter {
    session_id: String,
    sender: UnboundedSender<EngineEvent>,
}

impl EventEmitter {
    pub fn new(session_id: impl Into<String>, sender: UnboundedSender<EngineEvent>) -> Self {
        Self {
            session_id: session_id.into(),
            sender,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn emit(&self, event: EngineEvent) {
        // 受信側が閉じていても実行は続ける
        if self.sender.send(event).is_err() {
            trace!(session_id = %self.session_id, "event receiver closed");
        }
    }

    pub fn step_running(&self, step_id: &str) {
        self.emit(EngineEvent::StepUpdate {
            session_id: self.session_id.clone(),
            step_id: step_id.to_string(),
            status: StepEventStatus::Running,
            result: None,
            error: None,
        });
    }

    /// ステップの終了（成功・失敗・スキップ）
    pub fn step_finished(&self, result: &StepResult) {
        let status = match result.status {
            StepStatus::Success => StepEventStatus::Completed,
            StepStatus::Failed => StepEventStatus::Failed,
            StepStatus::Skipped => StepEventStatus::Skipped,
        };
        let (payload, error) = match status {
            StepEventStatus::Completed => (Some(Box::new(result.clone())), None),
            _ => (None, result.error.clone()),
        };
        self.emit(EngineEvent::StepUpdate {
            session_id: self.session_id.clone(),
            step_id: result.step_id.clone(),
            status,
            result: payload,
            error,
        });
    }

    pub fn partial_batch(&self, updates: Vec<PartialUpdate>) {
        self.emit(EngineEvent::PartialBatch {
            session_id: self.session_id.clone(),
            updates,
        });
    }

    pub fn workflow_complete(&self, results: Vec<StepResult>, error: Option<String>) {
        self.emit(EngineEvent::WorkflowComplete {
            session_id: self.session_id.clone(),
            results,
            error,
        });
    }

    pub fn persisted(&self, receipt: PersistReceipt) {
        self.emit(EngineEvent::Persisted { receipt });
    }

    pub fn persistence_failed(&self, attempts: u32, error: String) {
        self.emit(EngineEvent::PersistenceFailed {
            session_id: self.session_id.clone(),
            attempts,
            error,
        });
    }
}
