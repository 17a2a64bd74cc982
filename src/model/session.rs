//! セッションの定義
//!
//! セッションは軽量なポインタで、ターンやレスポンスの本文は持ちません。
//! 本文は常にターンログから読み出します。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// セッションレコード
///
/// # フィールド
///
/// - `last_turn_id`: 最新のオンタイムライン・アシスタントターン
/// - `turn_count`: オンタイムラインのターン数（次のシーケンス番号の算出に使用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_turn_id: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub turn_count: u64,
}

impl Session {
    /// 新しいセッションIDを採番
    pub fn new_id() -> String {
        format!("sess-{}", Uuid::new_v4())
    }

    /// 最初のユーザー発言からタイトルを作る（先頭 `max_chars` 文字）
    pub fn title_from_message(message: &str, max_chars: usize) -> String {
        let first_line = message.lines().next().unwrap_or_default().trim();
        let mut title: String = first_line.chars().take(max_chars).collect();
        if first_line.chars().count() > max_chars {
            title.push('…');
        }
        title
    }
}

/// セッションメタデータ（キャッシュ用の軽量表現）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    pub title: String,
    pub last_turn_id: Option<String>,
    pub last_activity: DateTime<Utc>,
}

impl From<&Session> for SessionMetadata {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            title: session.title.clone(),
            last_turn_id: session.last_turn_id.clone(),
            last_activity: session.last_activity,
        }
    }
}
