//! プロバイダーレスポンスレコード
//!
//! # 責務
//!
//! - 1プロバイダー × 1レスポンス種別の出力を表す [`ProviderResponse`] の定義
//! - ステータス遷移規則（pending → streaming → completed | failed）
//! - 衝突しにくいレスポンスIDの採番
//!
//! 同じ (turn, provider, type) に複数のレコードが存在しうるため、
//! コンテキスト導出には `updated_at` が最新のものを使います
//! （[`latest_by_provider`] を参照）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// レスポンス種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    /// プロンプトファンアウトの出力
    Batch,
    Mapping,
    Synthesis,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Batch => "batch",
            ResponseType::Mapping => "mapping",
            ResponseType::Synthesis => "synthesis",
        }
    }
}

impl std::fmt::Display for ResponseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// レスポンスのステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
}

impl ResponseStatus {
    /// 終端状態かどうか
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResponseStatus::Completed | ResponseStatus::Failed)
    }

    /// `self` から `next` へ遷移できるか
    ///
    /// 前進のみ許可します。pending から終端状態への直接遷移は可、
    /// 終端状態からの遷移は不可です。
    pub fn can_transition_to(&self, next: ResponseStatus) -> bool {
        match (self, next) {
            (ResponseStatus::Pending, ResponseStatus::Streaming) => true,
            (ResponseStatus::Pending | ResponseStatus::Streaming, n) => n.is_terminal(),
            _ => false,
        }
    }
}

/// プロバイダーレスポンス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub id: String,
    pub session_id: String,
    pub turn_id: String,
    pub provider_id: String,
    pub response_type: ResponseType,
    pub response_index: u32,
    pub text: String,
    pub status: ResponseStatus,
    /// 失敗分類やレイテンシなどの構造化メタデータ
    pub meta: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderResponse {
    /// レスポンスIDを採番
    ///
    /// session + turn + provider + type + index + タイムスタンプに
    /// ランダム成分を加え、同一ミリ秒のリトライや並行 Recompute でも衝突しません。
    pub fn new_id(
        session_id: &str,
        turn_id: &str,
        provider_id: &str,
        response_type: ResponseType,
        response_index: u32,
        at: DateTime<Utc>,
    ) -> String {
        let random = Uuid::new_v4().simple().to_string();
        format!(
            "resp-{}-{}-{}-{}-{}-{}-{}",
            session_id,
            turn_id,
            provider_id,
            response_type,
            response_index,
            at.timestamp_millis(),
            &random[..8]
        )
    }

    /// ステータスを遷移させる
    ///
    /// 遷移規則に反する場合は何もせず `false` を返します。
    pub fn transition(&mut self, next: ResponseStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }
}

/// 指定種別のレスポンスをプロバイダーごとに1件（`updated_at` 最新）に絞る
pub fn latest_by_provider(
    responses: &[ProviderResponse],
    response_type: ResponseType,
) -> BTreeMap<String, &ProviderResponse> {
    let mut latest: BTreeMap<String, &ProviderResponse> = BTreeMap::new();
    for response in responses.iter().filter(|r| r.response_type == response_type) {
        match latest.get(&response.provider_id) {
            Some(current) if current.updated_at >= response.updated_at => {}
            _ => {
                latest.insert(response.provider_id.clone(), response);
            }
        }
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn response(provider: &str, response_type: ResponseType, text: &str, at: DateTime<Utc>) -> ProviderResponse {
        ProviderResponse {
            id: ProviderResponse::new_id("s", "t", provider, response_type, 0, at),
            session_id: "s".to_string(),
            turn_id: "t".to_string(),
            provider_id: provider.to_string(),
            response_type,
            response_index: 0,
            text: text.to_string(),
            status: ResponseStatus::Completed,
            meta: json!({}),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_status_transitions() {
        use ResponseStatus::*;
        assert!(Pending.can_transition_to(Streaming));
        assert!(Pending.can_transition_to(Completed));
        assert!(Streaming.can_transition_to(Failed));
        assert!(!Streaming.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Streaming));
    }

    #[test]
    fn test_transition_rejects_rewrite_of_terminal_record() {
        let mut r = response("a", ResponseType::Batch, "x", Utc::now());
        assert!(!r.transition(ResponseStatus::Streaming));
        assert_eq!(r.status, ResponseStatus::Completed);
    }

    #[test]
    fn test_ids_do_not_collide_in_same_millisecond() {
        let at = Utc::now();
        let a = ProviderResponse::new_id("s", "t", "p", ResponseType::Synthesis, 0, at);
        let b = ProviderResponse::new_id("s", "t", "p", ResponseType::Synthesis, 0, at);
        assert_ne!(a, b);
        assert!(a.starts_with("resp-s-t-p-synthesis-0-"));
    }

    #[test]
    fn test_latest_by_provider_prefers_newest_update() {
        let now = Utc::now();
        let responses = vec![
            response("a", ResponseType::Batch, "old", now - Duration::seconds(10)),
            response("a", ResponseType::Batch, "new", now),
            response("b", ResponseType::Batch, "only", now),
            response("a", ResponseType::Mapping, "mapping", now + Duration::seconds(5)),
        ];

        let latest = latest_by_provider(&responses, ResponseType::Batch);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest["a"].text, "new");
        assert_eq!(latest["b"].text, "only");
    }
}
