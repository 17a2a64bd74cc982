//! KVストアの抽象と実装
//!
//! # 責務
//!
//! - テーブル単位のCRUD + 二次インデックス検索を行う [`KvStore`] トレイトを定義
//! - プロセス内の [`MemoryStore`] と、JSONスナップショットに書き出す [`FileStore`] を提供
//!
//! レコードはJSONオブジェクトで、主キーは `"id"` フィールドです。
//! ターンとレスポンスは書き込み後に変更されないため、単一レコードの書き込みで十分です。

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;

/// テーブル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Sessions,
    Turns,
    ProviderResponses,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Sessions, Table::Turns, Table::ProviderResponses];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Sessions => "sessions",
            Table::Turns => "turns",
            Table::ProviderResponses => "provider_responses",
        }
    }

    fn from_name(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|table| table.name() == name)
    }
}

/// KVストア
///
/// # 実装要件
///
/// - `put` は `"id"` フィールドを主キーとして同じキーのレコードを置き換える
/// - `get_by_index` はフィールド値の完全一致で検索する
/// - `get_all` / `get_by_index` は主キー順に返す
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Value>, StoreError>;

    async fn put(&self, table: Table, record: Value) -> Result<(), StoreError>;

    async fn get_all(&self, table: Table) -> Result<Vec<Value>, StoreError>;

    /// `index` フィールドが `key` に一致するレコード
    async fn get_by_index(&self, table: Table, index: &str, key: &str) -> Result<Vec<Value>, StoreError>;

    /// 存在しないキーの削除は成功扱い
    async fn delete(&self, table: Table, key: &str) -> Result<(), StoreError>;
}

type Tables = HashMap<Table, BTreeMap<String, Value>>;

fn record_key(table: Table, record: &Value) -> Result<String, StoreError> {
    record
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(StoreError::MissingKey { table: table.name() })
}

fn matches_index(record: &Value, index: &str, key: &str) -> bool {
    record.get(index).and_then(Value::as_str) == Some(key)
}

/// プロセス内メモリのKVストア
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Value>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.get(&table).and_then(|rows| rows.get(key)).cloned())
    }

    async fn put(&self, table: Table, record: Value) -> Result<(), StoreError> {
        let key = record_key(table, &record)?;
        let mut tables = self.tables.write().await;
        tables.entry(table).or_default().insert(key, record);
        Ok(())
    }

    async fn get_all(&self, table: Table) -> Result<Vec<Value>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_by_index(&self, table: Table, index: &str, key: &str) -> Result<Vec<Value>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&table)
            .map(|rows| {
                rows.values()
                    .filter(|record| matches_index(record, index, key))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, table: Table, key: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(rows) = tables.get_mut(&table) {
            rows.remove(key);
        }
        Ok(())
    }
}

/// JSONファイルに永続化するKVストア
///
/// 全テーブルをメモリに保持し、変更のたびにスナップショット全体を
/// 一時ファイルへ書いてからリネームで置き換えます。
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    tables: RwLock<Tables>,
}

impl FileStore {
    /// ファイルを開く（存在しなければ空で開始）
    ///
    /// # 例
    ///
    /// ```rust,no_run
    /// use turnflow::persistence::FileStore;
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let store = FileStore::open("turnflow.json").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut tables = Tables::new();

        match tokio::fs::read_to_string(&path).await {
            Ok(content) if !content.trim().is_empty() => {
                let snapshot: BTreeMap<String, BTreeMap<String, Value>> = serde_json::from_str(&content)?;
                for (name, rows) in snapshot {
                    if let Some(table) = Table::from_name(&name) {
                        tables.insert(table, rows);
                    }
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        debug!(path = %path.display(), "file store opened");
        Ok(Self {
            path,
            tables: RwLock::new(tables),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, tables: &Tables) -> Result<(), StoreError> {
        let snapshot: BTreeMap<&str, &BTreeMap<String, Value>> =
            tables.iter().map(|(table, rows)| (table.name(), rows)).collect();
        let content = serde_json::to_string_pretty(&snapshot)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        tokio::fs::write(&tmp_path, content).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Value>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.get(&table).and_then(|rows| rows.get(key)).cloned())
    }

    async fn put(&self, table: Table, record: Value) -> Result<(), StoreError> {
        let key = record_key(table, &record)?;
        // 書き込みロックを保存完了まで保持し、スナップショットの順序を保つ
        let mut tables = self.tables.write().await;
        let previous = tables.entry(table).or_default().insert(key.clone(), record);
        if let Err(e) = self.save(&tables).await {
            let rows = tables.entry(table).or_default();
            match previous {
                Some(previous) => rows.insert(key, previous),
                None => rows.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn get_all(&self, table: Table) -> Result<Vec<Value>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_by_index(&self, table: Table, index: &str, key: &str) -> Result<Vec<Value>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&table)
            .map(|rows| {
                rows.values()
                    .filter(|record| matches_index(record, index, key))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, table: Table, key: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let removed = tables.get_mut(&table).and_then(|rows| rows.remove(key));
        if let Some(record) = removed
            && let Err(e) = self.save(&tables).await
        {
            tables.entry(table).or_default().insert(key.to_string(), record);
            return Err(e);
        }
        Ok(())
    }
}
