//! 型付きターンログリポジトリ
//!
//! [`KvStore`] のJSONレコードと [`Session`] / [`Turn`] / [`ProviderResponse`]
//! の間の変換を担当します。

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::StoreError;
use crate::model::{ProviderResponse, Session, Turn};
use super::store::{KvStore, Table};

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    Ok(serde_json::from_value(value)?)
}

fn decode_all<T: DeserializeOwned>(values: Vec<Value>) -> Result<Vec<T>, StoreError> {
    values.into_iter().map(decode).collect()
}

fn encode<T: Serialize>(record: &T) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(record)?)
}

/// セッション・ターン・レスポンスの型付きアクセス
#[derive(Clone)]
pub struct TurnRepository {
    store: Arc<dyn KvStore>,
}

impl TurnRepository {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        self.store
            .get(Table::Sessions, session_id)
            .await?
            .map(decode)
            .transpose()
    }

    pub async fn put_session(&self, session: &Session) -> Result<(), StoreError> {
        self.store.put(Table::Sessions, encode(session)?).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        decode_all(self.store.get_all(Table::Sessions).await?)
    }

    pub async fn get_turn(&self, turn_id: &str) -> Result<Option<Turn>, StoreError> {
        self.store
            .get(Table::Turns, turn_id)
            .await?
            .map(decode)
            .transpose()
    }

    pub async fn put_turn(&self, turn: &Turn) -> Result<(), StoreError> {
        self.store.put(Table::Turns, encode(turn)?).await
    }

    /// セッションの全ターン（シーケンス順、オフタイムラインは先頭）
    pub async fn turns_for_session(&self, session_id: &str) -> Result<Vec<Turn>, StoreError> {
        let mut turns: Vec<Turn> =
            decode_all(self.store.get_by_index(Table::Turns, "session_id", session_id).await?)?;
        turns.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(turns)
    }

    pub async fn put_response(&self, response: &ProviderResponse) -> Result<(), StoreError> {
        self.store.put(Table::ProviderResponses, encode(response)?).await
    }

    /// ターンの全レスポンス（種別 → プロバイダー → インデックス順）
    pub async fn responses_for_turn(&self, turn_id: &str) -> Result<Vec<ProviderResponse>, StoreError> {
        let mut responses: Vec<ProviderResponse> = decode_all(
            self.store
                .get_by_index(Table::ProviderResponses, "turn_id", turn_id)
                .await?,
        )?;
        responses.sort_by(|a, b| {
            a.response_type
                .cmp(&b.response_type)
                .then_with(|| a.provider_id.cmp(&b.provider_id))
                .then(a.response_index.cmp(&b.response_index))
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(responses)
    }

    pub async fn responses_for_session(&self, session_id: &str) -> Result<Vec<ProviderResponse>, StoreError> {
        decode_all(
            self.store
                .get_by_index(Table::ProviderResponses, "session_id", session_id)
                .await?,
        )
    }

    pub async fn delete(&self, table: Table, key: &str) -> Result<(), StoreError> {
        self.store.delete(table, key).await
    }
}
