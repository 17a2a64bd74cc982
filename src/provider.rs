//! プロバイダーアダプター層
//!
//! # 責務
//!
//! - AIプロバイダーのセッションを扱う能力 [`ProviderAdapter`] を定義
//! - 設定からアダプターを生成するファクトリー [`create_adapter`]
//! - プロバイダーIDからアダプターを引くレジストリ [`ProviderRegistry`]
//!
//! # モジュール構成
//!
//! - `traits` - 共通インターフェース（[`ProviderAdapter`]トレイト等）
//! - `anthropic` - Claude Code CLI アダプター
//! - `openai` - Codex CLI アダプター
//! - `process` - CLIプロセスの行ストリーミング（内部用）
//!
//! 認証やセッション取得はCLIツールに委譲し、コード内では扱いません。

pub mod traits;
pub mod anthropic;
pub mod openai;
mod process;

// 公開APIの再エクスポート
pub use traits::{AdapterErrorCode, AdapterMeta, AdapterResult, ChunkSink, ProviderAdapter, TokenUsage};

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ProviderKind, ProviderSettings};

/// 設定からアダプターを生成するファクトリー関数
///
/// # 例
///
/// ```rust
/// use turnflow::config::{ProviderKind, ProviderSettings};
/// use turnflow::provider::create_adapter;
///
/// let adapter = create_adapter(&ProviderSettings {
///     id: "codex".to_string(),
///     kind: ProviderKind::Codex,
///     command: None,
///     model: Some("gpt-5".to_string()),
/// });
/// assert_eq!(adapter.id(), "codex");
/// ```
pub fn create_adapter(settings: &ProviderSettings) -> Arc<dyn ProviderAdapter> {
    match settings.kind {
        ProviderKind::Claude => {
            let mut adapter = anthropic::ClaudeCliAdapter::new(&settings.id);
            if let Some(command) = &settings.command {
                adapter = adapter.with_command(command);
            }
            if let Some(model) = &settings.model {
                adapter = adapter.with_model(model);
            }
            Arc::new(adapter)
        }
        ProviderKind::Codex => {
            let mut adapter = openai::CodexCliAdapter::new(&settings.id);
            if let Some(command) = &settings.command {
                adapter = adapter.with_command(command);
            }
            if let Some(model) = &settings.model {
                adapter = adapter.with_model(model);
            }
            Arc::new(adapter)
        }
    }
}

/// プロバイダーIDでアダプターを引くレジストリ
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 設定の全プロバイダーからレジストリを作る
    pub fn from_settings(providers: &[ProviderSettings]) -> Self {
        let mut registry = Self::new();
        for settings in providers {
            registry.register(create_adapter(settings));
        }
        registry
    }

    /// アダプターを登録（同じIDは置き換え）
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider_id).cloned()
    }

    /// 登録済みのプロバイダーID（ソート済み）
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }
}
