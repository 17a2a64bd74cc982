//! ワークフロー実行エンジン
//!
//! # 責務
//!
//! - コンパイル済みのステップ列を順序立てて実行
//! - ステップ間のデータ受け渡しと、失敗した先行ステップに依存するステップのスキップ
//! - 進行状況のイベント配信（ステップ更新・部分出力・集約結果）
//! - 実行結果の永続化とリトライ
//!
//! # モジュール構成
//!
//! - [`executor`][]: ワークフロー実行エンジン本体
//! - [`context`][]: ステップ実行コンテキスト（ステップ間データ受け渡し）
//! - [`event`][]: 呼び出し側へ配信するイベント
//! - [`result`][]: 実行結果型（ステップ&ワークフロー結果）

pub mod result;
pub mod context;
pub mod event;
pub mod executor;

// 公開APIの再エクスポート
pub use result::{ExecutionError, ExecutionStatus, StepResult, StepStatus, WorkflowResult};
pub use context::ExecutionContext;
pub use event::{EngineEvent, EventEmitter, StepEventStatus};
pub use executor::WorkflowEngine;
