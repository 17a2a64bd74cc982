//! ストリーミング差分バッチャー
//!
//! # 責務
//!
//! 高頻度の部分出力（デルタ）を (プロバイダー, レスポンス種別) ごとに溜め、
//! 一定間隔でまとめて配信します。1キーのチャンク数が上限を超えたら
//! 次の間隔を待たずにそのキーを即時フラッシュし、暴走したストリームでも
//! メモリが際限なく増えないようにします。
//!
//! フラッシュはキーごとのデルタを連結した1件の [`PartialUpdate`] を作り、
//! そのキーのバッファを空にします。準備できた更新はタイムスタンプ順の
//! 1バッチとしてシンクに渡します。フラッシュ後や [`DeltaBatcher::clear`] 後に
//! 状態は残りません。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::StreamingSettings;
use crate::model::{ResponseStatus, ResponseType};

/// 1キー分の連結済み更新
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialUpdate {
    pub provider_id: String,
    pub response_type: ResponseType,
    pub text: String,
    pub status: ResponseStatus,
    /// そのキーに最後にデルタが届いた時刻
    pub timestamp: DateTime<Utc>,
}

/// 更新バッチの配信先
///
/// バッチャーの内部ロックを保持したまま呼ばれるため、
/// シンクからバッチャーを呼び返してはいけません。
pub type BatchSink = dyn Fn(Vec<PartialUpdate>) + Send + Sync;

type BufferKey = (String, ResponseType);

#[derive(Debug)]
struct KeyBuffer {
    chunks: Vec<String>,
    status: ResponseStatus,
    timestamp: DateTime<Utc>,
    seq: u64,
}

#[derive(Debug, Default)]
struct Buffers {
    keys: BTreeMap<BufferKey, KeyBuffer>,
    next_seq: u64,
}

fn into_update((provider_id, response_type): BufferKey, buffer: KeyBuffer) -> (u64, PartialUpdate) {
    (
        buffer.seq,
        PartialUpdate {
            provider_id,
            response_type,
            text: buffer.chunks.concat(),
            status: buffer.status,
            timestamp: buffer.timestamp,
        },
    )
}

/// 差分バッチャー
pub struct DeltaBatcher {
    settings: StreamingSettings,
    buffers: Mutex<Buffers>,
    sink: Box<BatchSink>,
}

impl DeltaBatcher {
    /// # 例
    ///
    /// ```rust
    /// use std::sync::{Arc, Mutex};
    /// use turnflow::config::StreamingSettings;
    /// use turnflow::model::{ResponseStatus, ResponseType};
    /// use turnflow::streaming::DeltaBatcher;
    ///
    /// let delivered = Arc::new(Mutex::new(Vec::new()));
    /// let sink = Arc::clone(&delivered);
    /// let batcher = DeltaBatcher::new(StreamingSettings::default(), move |batch| {
    ///     sink.lock().unwrap().extend(batch);
    /// });
    ///
    /// batcher.push("claude", ResponseType::Batch, ResponseStatus::Streaming, "Hel");
    /// batcher.push("claude", ResponseType::Batch, ResponseStatus::Streaming, "lo");
    /// batcher.flush();
    ///
    /// assert_eq!(delivered.lock().unwrap()[0].text, "Hello");
    /// ```
    pub fn new<F>(settings: StreamingSettings, sink: F) -> Self
    where
        F: Fn(Vec<PartialUpdate>) + Send + Sync + 'static,
    {
        Self {
            settings,
            buffers: Mutex::new(Buffers::default()),
            sink: Box::new(sink),
        }
    }

    /// デルタを追加する
    ///
    /// キーのチャンク数が `max_chunks_per_key` を超えたら、そのキーを即時フラッシュします。
    pub fn push(&self, provider_id: &str, response_type: ResponseType, status: ResponseStatus, delta: &str) {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = buffers.next_seq;
        buffers.next_seq += 1;

        let key = (provider_id.to_string(), response_type);
        let buffer = buffers.keys.entry(key.clone()).or_insert_with(|| KeyBuffer {
            chunks: Vec::new(),
            status,
            timestamp: Utc::now(),
            seq,
        });
        buffer.chunks.push(delta.to_string());
        buffer.status = status;
        buffer.timestamp = Utc::now();
        buffer.seq = seq;

        if buffer.chunks.len() > self.settings.max_chunks_per_key
            && let Some(buffer) = buffers.keys.remove(&key)
        {
            debug!(
                provider_id,
                response_type = %response_type,
                chunks = buffer.chunks.len(),
                "chunk cap exceeded, flushing key"
            );
            let (_, update) = into_update(key, buffer);
            (self.sink)(vec![update]);
        }
    }

    /// 全キーをフラッシュし、配信した更新数を返す
    pub fn flush(&self) -> usize {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if buffers.keys.is_empty() {
            return 0;
        }

        let mut updates: Vec<(u64, PartialUpdate)> = std::mem::take(&mut buffers.keys)
            .into_iter()
            .map(|(key, buffer)| into_update(key, buffer))
            .collect();
        updates.sort_by(|(a_seq, a), (b_seq, b)| a.timestamp.cmp(&b.timestamp).then(a_seq.cmp(b_seq)));

        let count = updates.len();
        (self.sink)(updates.into_iter().map(|(_, update)| update).collect());
        count
    }

    /// 配信せずに全バッファを破棄する
    pub fn clear(&self) {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers.keys.clear();
    }

    /// 未配信のキー数
    pub fn pending_keys(&self) -> usize {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys
            .len()
    }

    /// `flush_interval` ごとにフラッシュするタスクを起動する
    ///
    /// `cancel` がキャンセルされると最後に1回フラッシュして終了します。
    pub fn spawn_ticker(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let batcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(batcher.settings.flush_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 最初のティックは即時に完了するので読み捨てる
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        batcher.flush();
                        break;
                    }
                    _ = interval.tick() => {
                        batcher.flush();
                    }
                }
            }
        })
    }
}
