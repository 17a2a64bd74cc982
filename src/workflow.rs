//! ワークフローの解決とコンパイル
//!
//! # 責務
//!
//! - リクエストと永続化済みのターン履歴から、コンパイルに必要な型付きコンテキストを
//!   求める（[`ContextResolver`]）
//! - (リクエスト, コンテキスト) を順序付きの [`Step`] 列に変換する純粋関数 [`compile`]
//!
//! # モジュール構成
//!
//! - `step` - ステップの定義と、マッピング/統合プロンプトの組み立て
//! - `resolver` - コンテキストリゾルバー
//! - `compiler` - ワークフローコンパイラー

pub mod step;
pub mod resolver;
pub mod compiler;

// 公開APIの再エクスポート
pub use step::{compose_mapping_prompt, compose_synthesis_prompt, Step, StepInput, StepOutputs, StepPayload};
pub use resolver::{ContextResolver, ExtendContext, RecomputeContext, ResolvedContext};
pub use compiler::{compile, CompileError};
