//! ターン単位のマルチプロバイダー会話ワークフロー
//!
//! # 責務
//!
//! 1つのユーザー発言を複数のAIプロバイダーへ並行に送り、その結果を
//! 追記専用のターンログとして記録します。受け付けるリクエストは
//! Initialize（新規セッション）、Extend（会話の継続）、Recompute（過去ターンの
//! マッピング・統合の再実行）の3種類です。
//!
//! # モジュール構成
//!
//! - [`model`][]: ターン・セッション・レスポンスとリクエストの型
//! - [`resilience`][]: レートリミッターとサーキットブレーカー
//! - [`orchestrator`][]: 耐障害性のあるファンアウト
//! - [`workflow`][]: コンテキスト解決とステップへのコンパイル
//! - [`engine`][]: ステップの実行とイベント配信
//! - [`persistence`][]: KVストアとターンログ
//! - [`streaming`][]: 部分出力のバッチ配信
//! - [`provider`][]: プロバイダーアダプター（Claude / Codex CLI）
//! - [`config`][] / [`logging`][] / [`error`][]

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod persistence;
pub mod provider;
pub mod resilience;
pub mod streaming;
pub mod workflow;
