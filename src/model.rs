//! データモデル
//!
//! # 責務
//!
//! - ターン [`Turn`]、セッション [`Session`]、プロバイダーレスポンス
//!   [`ProviderResponse`] の型定義
//! - リクエストプリミティブ（Initialize / Extend / Recompute）の型定義
//!
//! # モジュール構成
//!
//! - [`turn`][]: 追記専用ターンログのレコード
//! - [`session`][]: セッションポインタとメタデータ
//! - [`response`][]: プロバイダーごとのレスポンスレコード
//! - [`request`][]: ワークフローのリクエスト型

pub mod turn;
pub mod session;
pub mod response;
pub mod request;

// 公開APIの再エクスポート
pub use turn::{
    merge_provider_contexts, AssistantTurn, ProviderContexts, Turn, TurnBody, TurnKind, TurnType,
    OFF_TIMELINE_SEQUENCE,
};
pub use session::{Session, SessionMetadata};
pub use response::{ProviderResponse, ResponseStatus, ResponseType};
pub use request::{ExtendRequest, InitializeRequest, RecomputeRequest, StepType, WorkflowRequest};
