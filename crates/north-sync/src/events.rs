//! 事件系统模块 - 同步过程中的可观察事件
//!
//! 功能包括：
//! - 会话状态变更（connecting / live / degraded / closed）
//! - 记录更新写入
//! - 过期或串号更新被丢弃
//! - 轮询失败
//!
//! 事件仅用于观察与诊断，UI 数据始终以共享状态为准。

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::debug;

use crate::sync::{SessionState, UpdateOrigin};

/// 同步事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 会话状态变更
    SessionStateChanged {
        record_id: Option<String>,
        old_state: SessionState,
        new_state: SessionState,
        timestamp: u64,
    },
    /// 记录已写入共享状态
    RecordUpdated {
        record_id: String,
        origin: UpdateOrigin,
        timestamp: u64,
    },
    /// 更新被丢弃（会话已切换、来源不匹配或版本过旧）
    UpdateDiscarded {
        record_id: String,
        origin: UpdateOrigin,
        reason: String,
        timestamp: u64,
    },
    /// 轮询拉取失败（下一次 tick 自动重试）
    PollFailed {
        record_id: String,
        error: String,
        timestamp: u64,
    },
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::SessionStateChanged { .. } => "session_state_changed",
            SyncEvent::RecordUpdated { .. } => "record_updated",
            SyncEvent::UpdateDiscarded { .. } => "update_discarded",
            SyncEvent::PollFailed { .. } => "poll_failed",
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            SyncEvent::SessionStateChanged { timestamp, .. }
            | SyncEvent::RecordUpdated { timestamp, .. }
            | SyncEvent::UpdateDiscarded { timestamp, .. }
            | SyncEvent::PollFailed { timestamp, .. } => *timestamp,
        }
    }
}

/// 当前毫秒时间戳
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 最后事件时间
    pub last_event_time: Option<u64>,
}

/// 事件管理器
///
/// `emit` 是同步的，可以在持有同步器状态锁时调用。
#[derive(Debug)]
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    stats: Arc<RwLock<EventStats>>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn get_stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(256)
    }
}
