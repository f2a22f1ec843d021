//! 变更订阅（Change Feed）
//!
//! 每个 `(table, record_id)` 建立一条实时订阅，通过回调报告：
//! - 离散的生命周期状态 [`FeedStatus`]
//! - 匹配过滤条件的变更事件 [`ChangeEvent`]
//!
//! `open` 立即返回 [`FeedHandle`]，连接错误只通过状态回调报告。
//! `close` 可重复调用，会退订尚未完成的 join，返回后不再触发任何回调。

pub mod protocol;
pub mod realtime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::gate::CallbackGate;
use crate::record::RecordPatch;

pub use realtime::RealtimeFeed;

/// 订阅状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedStatus {
    Connecting,
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl FeedStatus {
    /// 是否需要启用轮询兜底
    pub fn requires_fallback(&self) -> bool {
        matches!(self, FeedStatus::ChannelError | FeedStatus::TimedOut)
    }

    /// Supabase 侧的状态名
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedStatus::Connecting => "CONNECTING",
            FeedStatus::Subscribed => "SUBSCRIBED",
            FeedStatus::ChannelError => "CHANNEL_ERROR",
            FeedStatus::TimedOut => "TIMED_OUT",
            FeedStatus::Closed => "CLOSED",
        }
    }
}

impl std::fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

/// 订阅过滤条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub schema: String,
    pub table: String,
    pub record_id: String,
    pub kind: ChangeKind,
}

impl ChangeFilter {
    /// 只监听某条记录的 UPDATE
    pub fn updates_of<S, T, R>(schema: S, table: T, record_id: R) -> Self
    where
        S: Into<String>,
        T: Into<String>,
        R: Into<String>,
    {
        Self {
            schema: schema.into(),
            table: table.into(),
            record_id: record_id.into(),
            kind: ChangeKind::Update,
        }
    }

    /// 频道名，例如 `projects-<id>`
    pub fn channel_name(&self) -> String {
        format!("{}-{}", self.table, self.record_id)
    }

    /// PostgREST 风格的行过滤表达式
    pub fn row_filter(&self) -> String {
        format!("id=eq.{}", self.record_id)
    }
}

/// 变更事件（`new` 为变更后的行）
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub record_id: String,
    pub kind: ChangeKind,
    pub new: RecordPatch,
    pub commit_timestamp: Option<String>,
}

pub type EventCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(FeedStatus) + Send + Sync>;

/// 订阅回调的接收端
///
/// 与 [`FeedHandle`] 共享一个闸门，句柄关闭后拒绝一切回调。
#[derive(Clone)]
pub struct FeedSink {
    gate: Arc<CallbackGate>,
    on_event: EventCallback,
    on_status: StatusCallback,
}

impl FeedSink {
    pub fn new<E, S>(on_event: E, on_status: S) -> Self
    where
        E: Fn(ChangeEvent) + Send + Sync + 'static,
        S: Fn(FeedStatus) + Send + Sync + 'static,
    {
        Self {
            gate: Arc::new(CallbackGate::new()),
            on_event: Arc::new(on_event),
            on_status: Arc::new(on_status),
        }
    }

    /// 投递变更事件，已关闭时返回 false
    pub fn emit_event(&self, event: ChangeEvent) -> bool {
        self.gate.run(|| (self.on_event)(event))
    }

    /// 投递状态变化，已关闭时返回 false
    pub fn emit_status(&self, status: FeedStatus) -> bool {
        self.gate.run(|| (self.on_status)(status))
    }

    pub fn is_closed(&self) -> bool {
        self.gate.is_closed()
    }
}

impl std::fmt::Debug for FeedSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSink").field("closed", &self.is_closed()).finish()
    }
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// 订阅句柄（会话独占，释放即关闭）
pub struct FeedHandle {
    gate: Arc<CallbackGate>,
    release: Mutex<Option<ReleaseFn>>,
}

impl FeedHandle {
    /// 关闭时除了关闸门，还执行一次 `release`（例如退订频道）
    pub fn with_release<F>(sink: &FeedSink, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            gate: sink.gate.clone(),
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    /// 不持有任何资源的句柄（由外部驱动 sink）
    pub fn detached(sink: &FeedSink) -> Self {
        Self {
            gate: sink.gate.clone(),
            release: Mutex::new(None),
        }
    }

    /// 关闭订阅（幂等）
    pub fn close(&self) {
        self.gate.close();
        if let Some(release) = self.release.lock().take() {
            release();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.gate.is_closed()
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for FeedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedHandle").field("closed", &self.is_closed()).finish()
    }
}

/// 变更订阅客户端
pub trait ChangeFeed: Send + Sync {
    /// 建立订阅；必须立即返回，连接错误通过 `sink.emit_status` 报告
    fn open(&self, filter: ChangeFilter, sink: FeedSink) -> FeedHandle;
}
