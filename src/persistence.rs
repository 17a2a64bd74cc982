//! ターン単位の永続化層
//!
//! # 責務
//!
//! - 外部のKVストアを抽象化する [`KvStore`] トレイトとその実装
//! - ストア上のJSONレコードを型付きで読み書きする [`TurnRepository`]
//! - セッションの軽量メタデータキャッシュ [`SessionCache`]
//! - Initialize / Extend / Recompute の結果を追記専用のターンログとして記録する
//!   [`PersistenceManager`]
//!
//! # モジュール構成
//!
//! - `store` - KVストア（[`MemoryStore`], [`FileStore`]）
//! - `repository` - 型付きリポジトリ
//! - `cache` - セッションメタデータキャッシュ
//! - `manager` - 永続化マネージャー

pub mod store;
pub mod repository;
pub mod cache;
pub mod manager;

// 公開APIの再エクスポート
pub use store::{FileStore, KvStore, MemoryStore, Table};
pub use repository::TurnRepository;
pub use cache::SessionCache;
pub use manager::{PersistReceipt, PersistenceManager};
