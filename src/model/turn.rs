//! ターンログのレコード定義
//!
//! # 責務
//!
//! - 1回のやり取り（ユーザー発言またはアシスタント応答）を表す [`Turn`] の定義
//! - プロバイダーコンテキストのマージ規則（スティッキー継続）
//!
//! # タイムライン
//!
//! Initialize / Extend で作られるターンは `sequence >= 0` を持ち、セッションごとに
//! 単調増加します（オンタイムライン）。Recompute で作られるターンは
//! [`OFF_TIMELINE_SEQUENCE`] を持ち、セッションの `last_turn_id` を動かしません。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// オフタイムライン（Recompute ブランチ）を示すシーケンス値
pub const OFF_TIMELINE_SEQUENCE: i64 = -1;

/// プロバイダーID → 不透明な継続状態
pub type ProviderContexts = BTreeMap<String, Value>;

/// ターン（不変レコード）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub session_id: String,
    pub sequence: i64,
    pub parent_turn_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub body: TurnBody,
}

/// ターンの種類ごとの本体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnBody {
    /// ユーザー発言
    User {
        /// 発言テキスト
        text: String,
    },
    /// アシスタント応答
    Assistant(AssistantTurn),
}

/// アシスタントターンの付帯情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantTurn {
    pub turn_type: TurnType,

    /// このターン時点のプロバイダーコンテキストのスナップショット
    pub provider_contexts: ProviderContexts,

    pub batch_response_count: u32,
    pub mapping_response_count: u32,
    pub synthesis_response_count: u32,

    /// Recompute の元になったターン（Recompute のみ）
    pub source_turn_id: Option<String>,
}

/// ターン種別（ユーザー / アシスタント）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    User,
    Assistant,
}

/// アシスタントターンを生んだプリミティブ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnType {
    Initialize,
    Extend,
    Recompute,
}

impl std::fmt::Display for TurnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnType::Initialize => write!(f, "initialize"),
            TurnType::Extend => write!(f, "extend"),
            TurnType::Recompute => write!(f, "recompute"),
        }
    }
}

impl Turn {
    /// 新しいターンIDを採番
    pub fn new_id() -> String {
        format!("turn-{}", Uuid::new_v4())
    }

    /// ユーザーターンを生成
    pub fn user(
        session_id: impl Into<String>,
        sequence: i64,
        parent_turn_id: Option<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: Self::new_id(),
            session_id: session_id.into(),
            sequence,
            parent_turn_id,
            created_at: Utc::now(),
            body: TurnBody::User { text: text.into() },
        }
    }

    /// アシスタントターンを生成
    pub fn assistant(
        session_id: impl Into<String>,
        sequence: i64,
        parent_turn_id: Option<String>,
        assistant: AssistantTurn,
    ) -> Self {
        Self {
            id: Self::new_id(),
            session_id: session_id.into(),
            sequence,
            parent_turn_id,
            created_at: Utc::now(),
            body: TurnBody::Assistant(assistant),
        }
    }

    pub fn kind(&self) -> TurnKind {
        match self.body {
            TurnBody::User { .. } => TurnKind::User,
            TurnBody::Assistant(_) => TurnKind::Assistant,
        }
    }

    /// セッションのメインタイムライン上のターンかどうか
    pub fn is_on_timeline(&self) -> bool {
        self.sequence >= 0
    }

    pub fn as_assistant(&self) -> Option<&AssistantTurn> {
        match &self.body {
            TurnBody::Assistant(assistant) => Some(assistant),
            TurnBody::User { .. } => None,
        }
    }

    pub fn user_text(&self) -> Option<&str> {
        match &self.body {
            TurnBody::User { text } => Some(text),
            TurnBody::Assistant(_) => None,
        }
    }
}

/// プロバイダーコンテキストをマージする
///
/// 直前ターンのコンテキストと今回の新しいコンテキストの和集合を返します。
/// 同じプロバイダーは新しい値で上書きされ、今回呼ばれなかったプロバイダーは
/// 直前の値を保持します（スティッキー継続）。
///
/// # 例
///
/// ```rust
/// use turnflow::model::{merge_provider_contexts, ProviderContexts};
/// use serde_json::json;
///
/// let mut inherited = ProviderContexts::new();
/// inherited.insert("claude".to_string(), json!({"session": "a"}));
/// inherited.insert("codex".to_string(), json!({"thread": "t1"}));
///
/// let mut fresh = ProviderContexts::new();
/// fresh.insert("claude".to_string(), json!({"session": "b"}));
///
/// let merged = merge_provider_contexts(&inherited, &fresh);
/// assert_eq!(merged["claude"], json!({"session": "b"}));
/// assert_eq!(merged["codex"], json!({"thread": "t1"}));
/// ```
pub fn merge_provider_contexts(
    inherited: &ProviderContexts,
    fresh: &ProviderContexts,
) -> ProviderContexts {
    let mut merged = inherited.clone();
    for (provider_id, context) in fresh {
        merged.insert(provider_id.clone(), context.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assistant_body(turn_type: TurnType) -> AssistantTurn {
        AssistantTurn {
            turn_type,
            provider_contexts: ProviderContexts::new(),
            batch_response_count: 2,
            mapping_response_count: 0,
            synthesis_response_count: 1,
            source_turn_id: None,
        }
    }

    #[test]
    fn test_user_turn_accessors() {
        let turn = Turn::user("s1", 0, None, "hello");
        assert_eq!(turn.kind(), TurnKind::User);
        assert_eq!(turn.user_text(), Some("hello"));
        assert!(turn.as_assistant().is_none());
        assert!(turn.is_on_timeline());
        assert!(turn.id.starts_with("turn-"));
    }

    #[test]
    fn test_recompute_turn_is_off_timeline() {
        let turn = Turn::assistant("s1", OFF_TIMELINE_SEQUENCE, None, assistant_body(TurnType::Recompute));
        assert!(!turn.is_on_timeline());
        assert_eq!(turn.kind(), TurnKind::Assistant);
    }

    /// フラット化されたタグ付き本体がJSON上でトップレベルに出ることを確認
    #[test]
    fn test_turn_json_shape() {
        let turn = Turn::assistant("s1", 1, Some("u".to_string()), assistant_body(TurnType::Extend));
        let value = serde_json::to_value(&turn).unwrap();

        assert_eq!(value["kind"], json!("assistant"));
        assert_eq!(value["turn_type"], json!("extend"));
        assert_eq!(value["session_id"], json!("s1"));

        let restored: Turn = serde_json::from_value(value).unwrap();
        assert_eq!(restored, turn);
    }

    #[test]
    fn test_merge_overrides_and_keeps_absent_providers() {
        let mut inherited = ProviderContexts::new();
        inherited.insert("a".to_string(), json!(1));
        inherited.insert("b".to_string(), json!(2));

        let mut fresh = ProviderContexts::new();
        fresh.insert("b".to_string(), json!(20));
        fresh.insert("c".to_string(), json!(30));

        let merged = merge_provider_contexts(&inherited, &fresh);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged["a"], json!(1));
        assert_eq!(merged["b"], json!(20));
        assert_eq!(merged["c"], json!(30));
    }
}
