//! 同步模块 - 实时订阅与轮询兜底的统一调度
//!
//! 每个被监听的记录对应一个会话：
//!
//! ```text
//! idle ──watch──▶ connecting ──SUBSCRIBED──▶ live
//!                     │                        │
//!                     └──CHANNEL_ERROR/TIMED_OUT┴──▶ degraded (启动轮询)
//!
//! 任意状态 ──unwatch / 切换记录 / 释放──▶ closed
//! ```
//!
//! 推送和轮询产生的更新都被包装成 [`UpdateEvent`]，
//! 进入同一个队列，由同步器按顺序写入共享状态。

mod synchronizer;

pub use synchronizer::RecordSynchronizer;

use serde::{Deserialize, Serialize};

use crate::feed::ChangeEvent;
use crate::record::{patch_version, Record, RecordPatch};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// 没有会话
    Idle,
    /// 已发起订阅，等待第一个状态
    Connecting,
    /// 实时订阅可用
    Live,
    /// 实时订阅不可用，轮询兜底
    Degraded,
    /// 会话已结束
    Closed,
}

impl SessionState {
    /// 是否存在打开的会话
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Live | SessionState::Degraded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Live => "live",
            SessionState::Degraded => "degraded",
            SessionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 更新来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateOrigin {
    /// 实时推送
    Push,
    /// 轮询拉取
    Poll,
}

impl std::fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateOrigin::Push => write!(f, "push"),
            UpdateOrigin::Poll => write!(f, "poll"),
        }
    }
}

/// 一次待写入的记录更新
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
    pub record_id: String,
    pub origin: UpdateOrigin,
    /// 需要合并的字段
    pub patch: RecordPatch,
    /// `updated_at` 毫秒，缺失时为 None
    pub version: Option<i64>,
}

impl UpdateEvent {
    pub fn push(event: ChangeEvent) -> Self {
        let version = patch_version(&event.new);
        Self {
            record_id: event.record_id,
            origin: UpdateOrigin::Push,
            patch: event.new,
            version,
        }
    }

    pub fn poll(record: Record) -> Self {
        Self {
            version: record.version(),
            patch: record.to_patch(),
            record_id: record.id,
            origin: UpdateOrigin::Poll,
        }
    }
}

/// 同步统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// 已打开的会话数
    pub sessions_opened: u64,
    /// 降级到轮询的次数
    pub fallbacks: u64,
    /// 已写入的推送更新
    pub push_applied: u64,
    /// 已写入的轮询更新
    pub poll_applied: u64,
    /// 被丢弃的更新
    pub discarded: u64,
    /// 会话匹配但状态里没有该记录的更新
    pub unmatched: u64,
    /// 轮询失败次数
    pub poll_failures: u64,
}

impl SyncStats {
    pub fn applied(&self) -> u64 {
        self.push_applied + self.poll_applied
    }

    /// 单行摘要（用于日志）
    pub fn summary(&self) -> String {
        format!(
            "sessions={} fallbacks={} applied={} (push={}, poll={}) discarded={} unmatched={} poll_failures={}",
            self.sessions_opened,
            self.fallbacks,
            self.applied(),
            self.push_applied,
            self.poll_applied,
            self.discarded,
            self.unmatched,
            self.poll_failures
        )
    }
}
