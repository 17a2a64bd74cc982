//! セッションメタデータキャッシュ
//!
//! `{id, title, last_turn_id, last_activity}` だけを保持する軽量キャッシュです。
//! ターンやレスポンスの本文は保持せず、常にターンログから読み出します。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use crate::model::SessionMetadata;

/// セッションメタデータのインメモリキャッシュ
#[derive(Debug, Clone, Default)]
pub struct SessionCache {
    entries: Arc<RwLock<HashMap<String, SessionMetadata>>>,
    warmed: Arc<AtomicBool>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionMetadata> {
        self.entries.read().await.get(session_id).cloned()
    }

    pub async fn upsert(&self, metadata: SessionMetadata) {
        self.entries.write().await.insert(metadata.id.clone(), metadata);
    }

    pub async fn remove(&self, session_id: &str) {
        self.entries.write().await.remove(session_id);
    }

    /// ストアから読み込んだ全件で置き換え、ウォーム済みにする
    ///
    /// ウォーム中に [`upsert`](Self::upsert) されたエントリの方が新しければそちらを残します。
    pub async fn warm(&self, sessions: impl IntoIterator<Item = SessionMetadata>) {
        let mut entries = self.entries.write().await;
        for metadata in sessions {
            match entries.get(&metadata.id) {
                Some(current) if current.last_activity >= metadata.last_activity => {}
                _ => {
                    entries.insert(metadata.id.clone(), metadata);
                }
            }
        }
        self.warmed.store(true, Ordering::Release);
    }

    pub fn is_warm(&self) -> bool {
        self.warmed.load(Ordering::Acquire)
    }

    /// 最終アクティビティの新しい順
    pub async fn list(&self) -> Vec<SessionMetadata> {
        let mut sessions: Vec<SessionMetadata> = self.entries.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
        self.warmed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn metadata(id: &str, minutes_ago: i64) -> SessionMetadata {
        SessionMetadata {
            id: id.to_string(),
            title: id.to_uppercase(),
            last_turn_id: None,
            last_activity: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    #[tokio::test]
    async fn test_list_is_most_recent_first() {
        let cache = SessionCache::new();
        cache.upsert(metadata("old", 10)).await;
        cache.upsert(metadata("new", 1)).await;
        let ids: Vec<String> = cache.list().await.into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[tokio::test]
    async fn test_warm_keeps_newer_entries() {
        let cache = SessionCache::new();
        let fresh = metadata("s1", 0);
        cache.upsert(fresh.clone()).await;
        assert!(!cache.is_warm());

        cache.warm(vec![metadata("s1", 30), metadata("s2", 5)]).await;
        assert!(cache.is_warm());
        assert_eq!(cache.get("s1").await, Some(fresh));
        assert!(cache.get("s2").await.is_some());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let cache = SessionCache::new();
        cache.warm(vec![metadata("a", 0), metadata("b", 0)]).await;
        cache.remove("a").await;
        assert!(cache.get("a").await.is_none());
        cache.clear().await;
        assert!(cache.list().await.is_empty());
        assert!(!cache.is_warm());
    }
}
