//! 记录同步器
//!
//! 核心设计：
//! - 订阅回调和轮询回调只向队列投递 [`SyncInput`]，不直接写状态
//! - 单个 pump 任务按到达顺序处理输入，是共享状态的唯一写入路径
//! - 切换记录时在同一把锁内先关闭旧会话，再打开新会话
//! - 写入前校验 record_id，旧会话迟到的更新一律丢弃

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{NorthSyncError, Result};
use crate::events::{now_millis, EventManager, SyncEvent};
use crate::feed::{ChangeFeed, ChangeFilter, FeedHandle, FeedSink, FeedStatus};
use crate::poll::PollLoop;
use crate::record::Record;
use crate::source::RecordSource;
use crate::store::{StoreReader, StoreWriter};
use crate::sync::{SessionState, SyncStats, UpdateEvent, UpdateOrigin};

/// pump 任务的输入
enum SyncInput {
    /// 推送或轮询产生的更新
    Update(UpdateEvent),
    /// 订阅状态（按会话编号区分新旧会话）
    FeedStatus { session: u64, status: FeedStatus },
    /// 轮询拉取失败
    PollFailed { session: u64, error: String },
    /// 等待之前的输入全部处理完
    Flush { respond_to: oneshot::Sender<()> },
}

/// 丢弃更新的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiscardReason {
    NoSession,
    RecordMismatch,
    PollWhileLive,
    StaleVersion,
    NotLoaded,
}

impl DiscardReason {
    fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::NoSession => "no_active_session",
            DiscardReason::RecordMismatch => "record_mismatch",
            DiscardReason::PollWhileLive => "poll_while_not_degraded",
            DiscardReason::StaleVersion => "stale_version",
            DiscardReason::NotLoaded => "record_not_loaded",
        }
    }
}

/// 一次监听会话
struct Session {
    id: u64,
    record_id: String,
    feed: FeedHandle,
    poll: PollLoop,
    /// 最近一次写入的版本号
    last_version: Option<i64>,
}

impl Session {
    fn teardown(&self) {
        self.feed.close();
        self.poll.stop();
    }
}

struct Machine {
    state: SessionState,
    session: Option<Session>,
    next_session_id: u64,
    stats: SyncStats,
}

struct Inner {
    config: SyncConfig,
    feed: Arc<dyn ChangeFeed>,
    source: Arc<dyn RecordSource>,
    writer: StoreWriter,
    events: Arc<EventManager>,
    machine: Mutex<Machine>,
    inputs: mpsc::UnboundedSender<SyncInput>,
}

/// 记录同步器
///
/// 持有共享状态的写入端。释放时关闭当前会话。
pub struct RecordSynchronizer {
    inner: Arc<Inner>,
    pump: JoinHandle<()>,
}

impl RecordSynchronizer {
    /// 创建同步器（需要在 tokio 运行时内调用）
    pub fn new(
        config: SyncConfig,
        feed: Arc<dyn ChangeFeed>,
        source: Arc<dyn RecordSource>,
        writer: StoreWriter,
        events: Arc<EventManager>,
    ) -> Self {
        let (inputs, rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            config,
            feed,
            source,
            writer,
            events,
            machine: Mutex::new(Machine {
                state: SessionState::Idle,
                session: None,
                next_session_id: 1,
                stats: SyncStats::default(),
            }),
            inputs,
        });

        let pump = tokio::spawn(run_pump(inner.clone(), rx));
        info!("✅ 记录同步器已创建 (table={})", inner.config.table);

        Self { inner, pump }
    }

    /// 监听一条记录
    ///
    /// - 与当前会话相同的 ID：无操作
    /// - 其他情况先同步关闭当前会话
    /// - `None`、本地记录或未配置 Supabase 时不打开新会话
    ///
    /// 返回调用后是否存在打开的会话。
    pub fn watch(&self, record_id: Option<&str>) -> bool {
        self.inner.watch(record_id)
    }

    /// 停止监听（幂等）
    pub fn unwatch(&self) {
        self.inner.watch(None);
    }

    pub fn state(&self) -> SessionState {
        self.inner.machine.lock().state
    }

    /// 当前会话监听的记录
    pub fn active_record_id(&self) -> Option<String> {
        self.inner
            .machine
            .lock()
            .session
            .as_ref()
            .map(|s| s.record_id.clone())
    }

    pub fn stats(&self) -> SyncStats {
        self.inner.machine.lock().stats.clone()
    }

    /// 共享状态的只读句柄
    pub fn reader(&self) -> StoreReader {
        self.inner.writer.reader()
    }

    pub fn events(&self) -> Arc<EventManager> {
        self.inner.events.clone()
    }

    /// 等待已投递的输入处理完
    pub async fn flush(&self) {
        let (respond_to, done) = oneshot::channel();
        if self.inner.inputs.send(SyncInput::Flush { respond_to }).is_ok() {
            let _ = done.await;
        }
    }

    /// 加载记录详情到 `current`
    pub async fn load(&self, record_id: &str) -> Result<Option<Record>> {
        let writer = &self.inner.writer;
        writer.set_loading(true);
        writer.set_error(None);

        let result = self.inner.source.fetch_record(record_id).await;
        writer.set_loading(false);

        match result {
            Ok(Some(record)) => {
                debug!("📄 已加载记录: record_id={}", record_id);
                writer.set_current(Some(record.clone()));
                Ok(Some(record))
            }
            Ok(None) => {
                warn!("记录不存在: record_id={}", record_id);
                writer.set_current(None);
                writer.set_error(Some(format!("记录不存在: {}", record_id)));
                Ok(None)
            }
            Err(e) => {
                error!("❌ 加载记录失败: record_id={}, error={}", record_id, e);
                writer.set_error(Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// 重新加载某个用户的记录列表
    pub async fn refresh(&self, user_id: &str) -> Result<usize> {
        if user_id.is_empty() {
            return Err(NorthSyncError::InvalidArgument("user_id 不能为空".to_string()));
        }

        let writer = &self.inner.writer;
        writer.set_loading(true);
        writer.set_error(None);

        match self.inner.source.list_records(user_id).await {
            Ok(records) => {
                let count = records.len();
                writer.set_records(records);
                debug!("📋 记录列表已刷新: user_id={}, count={}", user_id, count);
                Ok(count)
            }
            Err(e) => {
                error!("❌ 加载记录列表失败: user_id={}, error={}", user_id, e);
                writer.set_loading(false);
                writer.set_error(Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// 新建记录后插入列表头部
    pub fn record_created(&self, record: Record) -> bool {
        self.inner.writer.add_record(record)
    }

    /// 删除记录后从状态中移除，正在监听时结束会话
    pub fn record_removed(&self, record_id: &str) -> bool {
        let watching = self
            .active_record_id()
            .map_or(false, |active| active == record_id);
        if watching {
            self.unwatch();
        }
        self.inner.writer.remove_record(record_id)
    }
}

impl Drop for RecordSynchronizer {
    fn drop(&mut self) {
        self.inner.watch(None);
        self.pump.abort();
        debug!("记录同步器已释放: {}", self.inner.machine.lock().stats.summary());
    }
}

impl std::fmt::Debug for RecordSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSynchronizer")
            .field("state", &self.state())
            .field("record_id", &self.active_record_id())
            .finish()
    }
}

impl Inner {
    fn watch(&self, record_id: Option<&str>) -> bool {
        let mut machine = self.machine.lock();

        if let (Some(requested), Some(session)) = (record_id, machine.session.as_ref()) {
            if session.record_id == requested {
                return true;
            }
        }

        if let Some(session) = machine.session.take() {
            session.teardown();
            info!(
                "⏹️ 会话已关闭: record_id={}, {}",
                session.record_id,
                machine.stats.summary()
            );
            self.transition(&mut machine, Some(session.record_id.clone()), SessionState::Closed);
        }

        let record_id = match record_id {
            Some(id) if !id.is_empty() => id,
            _ => return false,
        };
        if self.config.is_local_id(record_id) {
            debug!("本地记录不订阅: record_id={}", record_id);
            return false;
        }
        if !self.config.is_supabase_configured() {
            debug!("Supabase 未配置，跳过订阅: record_id={}", record_id);
            return false;
        }

        let session = self.open_session(&mut machine, record_id);
        machine.session = Some(session);
        machine.stats.sessions_opened += 1;
        self.transition(&mut machine, Some(record_id.to_string()), SessionState::Connecting);
        true
    }

    fn open_session(&self, machine: &mut Machine, record_id: &str) -> Session {
        let id = machine.next_session_id;
        machine.next_session_id += 1;

        let events_tx = self.inputs.clone();
        let status_tx = self.inputs.clone();
        let sink = FeedSink::new(
            move |event| {
                let _ = events_tx.send(SyncInput::Update(UpdateEvent::push(event)));
            },
            move |status| {
                let _ = status_tx.send(SyncInput::FeedStatus { session: id, status });
            },
        );

        let filter = ChangeFilter::updates_of(
            self.config.schema.clone(),
            self.config.table.clone(),
            record_id,
        );
        info!("📡 打开订阅: channel={}, session={}", filter.channel_name(), id);
        let feed = self.feed.open(filter, sink);

        let failure_tx = self.inputs.clone();
        let poll = PollLoop::new(self.source.clone()).with_failure_callback(move |e| {
            let _ = failure_tx.send(SyncInput::PollFailed {
                session: id,
                error: e.to_string(),
            });
        });

        Session {
            id,
            record_id: record_id.to_string(),
            feed,
            poll,
            last_version: None,
        }
    }

    fn transition(&self, machine: &mut Machine, record_id: Option<String>, new_state: SessionState) {
        let old_state = machine.state;
        if old_state == new_state {
            return;
        }
        machine.state = new_state;
        info!(
            "🔄 会话状态变更: {} -> {} (record_id={:?})",
            old_state, new_state, record_id
        );
        self.events.emit(SyncEvent::SessionStateChanged {
            record_id,
            old_state,
            new_state,
            timestamp: now_millis(),
        });
    }

    fn handle(&self, input: SyncInput) {
        match input {
            SyncInput::Update(update) => self.apply_update(update),
            SyncInput::FeedStatus { session, status } => self.handle_feed_status(session, status),
            SyncInput::PollFailed { session, error } => self.handle_poll_failure(session, error),
            SyncInput::Flush { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    fn handle_feed_status(&self, session_id: u64, status: FeedStatus) {
        let mut machine = self.machine.lock();
        let (record_id, poll_started) = match machine.session.as_ref() {
            Some(session) if session.id == session_id => {
                let record_id = session.record_id.clone();
                match (machine.state, status) {
                    (SessionState::Connecting, FeedStatus::Subscribed) => {
                        session.poll.stop();
                        (record_id, None)
                    }
                    (SessionState::Connecting | SessionState::Live, s)
                        if s.requires_fallback() || s == FeedStatus::Closed =>
                    {
                        warn!(
                            "⚠️ 实时订阅不可用，切换到轮询: record_id={}, status={}",
                            record_id, s
                        );
                        let tx = self.inputs.clone();
                        let started = session.poll.start(
                            &record_id,
                            self.config.poll_interval(),
                            move |record| {
                                let _ = tx.send(SyncInput::Update(UpdateEvent::poll(record)));
                            },
                        );
                        (record_id, Some(started))
                    }
                    (state, s) => {
                        debug!("忽略订阅状态: state={}, status={}, record_id={}", state, s, record_id);
                        return;
                    }
                }
            }
            _ => {
                debug!("忽略旧会话的订阅状态: session={}, status={}", session_id, status);
                return;
            }
        };

        match poll_started {
            None => self.transition(&mut machine, Some(record_id), SessionState::Live),
            Some(started) => {
                if started {
                    machine.stats.fallbacks += 1;
                }
                self.transition(&mut machine, Some(record_id), SessionState::Degraded);
            }
        }
    }

    fn handle_poll_failure(&self, session_id: u64, error: String) {
        let mut machine = self.machine.lock();
        let record_id = match machine.session.as_ref() {
            Some(session) if session.id == session_id => session.record_id.clone(),
            _ => return,
        };
        machine.stats.poll_failures += 1;
        self.events.emit(SyncEvent::PollFailed {
            record_id,
            error,
            timestamp: now_millis(),
        });
    }

    fn apply_update(&self, update: UpdateEvent) {
        let mut machine = self.machine.lock();
        let state = machine.state;

        let verdict = match machine.session.as_mut() {
            None => Err(DiscardReason::NoSession),
            Some(session) if session.record_id != update.record_id => Err(DiscardReason::RecordMismatch),
            Some(_) if update.origin == UpdateOrigin::Poll && state != SessionState::Degraded => {
                Err(DiscardReason::PollWhileLive)
            }
            // 状态里还没有这条记录，写入不会生效，也不推进版本
            Some(_) if !self.writer.contains(&update.record_id) => Err(DiscardReason::NotLoaded),
            Some(session) => match (update.version, session.last_version) {
                (Some(incoming), Some(applied))
                    if self.config.reject_stale_versions && incoming < applied =>
                {
                    Err(DiscardReason::StaleVersion)
                }
                (incoming, applied) => {
                    session.last_version = incoming.max(applied);
                    Ok(())
                }
            },
        };

        if let Err(reason) = verdict {
            debug!(
                "丢弃更新: record_id={}, origin={}, reason={}",
                update.record_id,
                update.origin,
                reason.as_str()
            );
            match reason {
                DiscardReason::NotLoaded => machine.stats.unmatched += 1,
                _ => machine.stats.discarded += 1,
            }
            self.events.emit(SyncEvent::UpdateDiscarded {
                record_id: update.record_id,
                origin: update.origin,
                reason: reason.as_str().to_string(),
                timestamp: now_millis(),
            });
            return;
        }

        match update.origin {
            UpdateOrigin::Push => machine.stats.push_applied += 1,
            UpdateOrigin::Poll => machine.stats.poll_applied += 1,
        }

        if self.writer.update_record(&update.record_id, &update.patch) {
            debug!("📝 记录已更新: record_id={}, origin={}", update.record_id, update.origin);
            self.events.emit(SyncEvent::RecordUpdated {
                record_id: update.record_id,
                origin: update.origin,
                timestamp: now_millis(),
            });
        }
    }
}

async fn run_pump(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<SyncInput>) {
    while let Some(input) = rx.recv().await {
        inner.handle(input);
    }
    debug!("同步输入队列已关闭");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::test_helpers::ManualFeed;
    use crate::source::test_helpers::MockSource;
    use crate::store::new_store;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Harness {
        sync: RecordSynchronizer,
        feed: Arc<ManualFeed>,
        source: Arc<MockSource>,
        reader: StoreReader,
    }

    fn config() -> SyncConfig {
        SyncConfig::builder()
            .supabase("https://demo.supabase.co", "anon")
            .poll_interval_ms(5000)
            .build()
    }

    fn harness_with(config: SyncConfig, seed: Vec<Record>) -> Harness {
        let feed = Arc::new(ManualFeed::new());
        let source = Arc::new(MockSource::new());
        let (reader, writer) = new_store();
        writer.set_records(seed);

        let sync = RecordSynchronizer::new(
            config,
            feed.clone(),
            source.clone(),
            writer,
            Arc::new(EventManager::default()),
        );
        Harness { sync, feed, source, reader }
    }

    fn harness(seed: &[&str]) -> Harness {
        let records = seed
            .iter()
            .map(|id| Record::new(*id).with_field("status", json!("pending")))
            .collect();
        harness_with(config(), records)
    }

    fn status_of(reader: &StoreReader, id: &str) -> Option<String> {
        reader.record(id).and_then(|r| r.status().map(str::to_string))
    }

    fn field_of(reader: &StoreReader, id: &str, key: &str) -> Option<Value> {
        reader.record(id).and_then(|r| r.fields.get(key).cloned())
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_feed_update_reaches_store() {
        let h = harness(&["rec-1"]);

        assert!(h.sync.watch(Some("rec-1")));
        assert_eq!(h.sync.state(), SessionState::Connecting);
        assert_eq!(h.feed.open_count(), 1);

        let session = h.feed.last();
        assert_eq!(session.filter.record_id, "rec-1");
        session.status(FeedStatus::Subscribed);
        session.update(json!({"status": "done"}));
        h.sync.flush().await;

        assert_eq!(h.sync.state(), SessionState::Live);
        assert_eq!(status_of(&h.reader, "rec-1").as_deref(), Some("done"));

        tokio::time::sleep(Duration::from_millis(20_000)).await;
        assert_eq!(h.source.fetch_count(), 0);
        assert_eq!(h.sync.stats().push_applied, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_degrades_to_deduplicated_polling() {
        let h = harness(&["rec-2"]);
        h.source.push_record(Record::new("rec-2").with_field("status", json!("running")));

        h.sync.watch(Some("rec-2"));
        h.feed.last().status(FeedStatus::TimedOut);
        h.sync.flush().await;
        assert_eq!(h.sync.state(), SessionState::Degraded);
        assert_eq!(h.source.fetch_count(), 0);

        let mut rx = h.reader.subscribe();
        rx.mark_unchanged();

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        h.sync.flush().await;
        assert_eq!(h.source.fetch_count(), 1);
        assert_eq!(status_of(&h.reader, "rec-2").as_deref(), Some("running"));
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();

        tokio::time::sleep(Duration::from_millis(5_000)).await;
        h.sync.flush().await;
        assert_eq!(h.source.fetch_count(), 2);
        assert!(!rx.has_changed().unwrap());

        let stats = h.sync.stats();
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.poll_applied, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_record_never_activates() {
        let h = harness(&["local-123"]);
        let before = h.reader.snapshot();

        assert!(!h.sync.watch(Some("local-123")));
        tokio::time::sleep(Duration::from_millis(20_000)).await;
        h.sync.flush().await;

        assert_eq!(h.sync.state(), SessionState::Idle);
        assert_eq!(h.feed.open_count(), 0);
        assert_eq!(h.source.fetch_count(), 0);
        assert_eq!(h.reader.snapshot(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_records_discards_late_events() {
        let h = harness(&["rec-3", "rec-4"]);

        h.sync.watch(Some("rec-3"));
        let old = h.feed.last();
        h.sync.watch(Some("rec-4"));
        let new = h.feed.last();

        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert_eq!(h.sync.active_record_id().as_deref(), Some("rec-4"));

        // 已关闭的订阅不再投递
        assert!(!old.status(FeedStatus::Subscribed));
        assert!(!old.update(json!({"status": "done"})));

        new.status(FeedStatus::Subscribed);
        new.update(json!({"status": "running"}));
        h.sync.flush().await;

        assert_eq!(status_of(&h.reader, "rec-3").as_deref(), Some("pending"));
        assert_eq!(status_of(&h.reader, "rec-4").as_deref(), Some("running"));
        assert_eq!(h.sync.state(), SessionState::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_update_for_previous_record_is_discarded() {
        let h = harness(&["rec-3", "rec-4"]);
        let mut events = h.sync.events().subscribe();

        h.sync.watch(Some("rec-3"));
        let old = h.feed.last();
        old.status(FeedStatus::Subscribed);
        // 投递后、处理前切换记录
        old.update(json!({"status": "done"}));
        h.sync.watch(Some("rec-4"));
        h.sync.flush().await;

        assert_eq!(status_of(&h.reader, "rec-3").as_deref(), Some("pending"));
        assert_eq!(h.sync.stats().discarded, 1);
        assert_eq!(h.sync.state(), SessionState::Connecting);

        let mut discarded = None;
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::UpdateDiscarded { record_id, reason, .. } = event {
                discarded = Some((record_id, reason));
            }
        }
        assert_eq!(
            discarded,
            Some(("rec-3".to_string(), "record_mismatch".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_follows_delivery_order_across_origins() {
        let h = harness(&["rec-5"]);
        h.source.push_record(
            Record::new("rec-5")
                .with_field("status", json!("running"))
                .with_field("progress", json!(50)),
        );

        h.sync.watch(Some("rec-5"));
        let session = h.feed.last();
        session.status(FeedStatus::Subscribed);
        session.update(json!({"status": "running", "progress": 10}));
        session.update(json!({"title": "巡检"}));
        session.update(json!({"title": "巡检"}));
        h.sync.flush().await;

        assert_eq!(field_of(&h.reader, "rec-5", "progress"), Some(json!(10)));

        // 连接中断后轮询接管，推送仍然可以写入
        session.status(FeedStatus::ChannelError);
        h.sync.flush().await;
        assert_eq!(h.sync.state(), SessionState::Degraded);

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        h.sync.flush().await;
        assert_eq!(field_of(&h.reader, "rec-5", "progress"), Some(json!(50)));

        session.update(json!({"progress": 80}));
        h.sync.flush().await;

        let record = h.reader.record("rec-5").unwrap();
        assert_eq!(record.status(), Some("running"));
        assert_eq!(record.fields["progress"], json!(80));
        assert_eq!(record.fields["title"], json!("巡检"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_errors_are_not_surfaced() {
        let h = harness(&["rec-6"]);
        h.source.push_error("rec-6", "gateway timeout");

        h.sync.watch(Some("rec-6"));
        h.feed.last().status(FeedStatus::ChannelError);
        tokio::time::sleep(Duration::from_millis(11_000)).await;
        h.sync.flush().await;

        assert_eq!(h.sync.state(), SessionState::Degraded);
        assert_eq!(h.reader.error(), None);
        assert_eq!(h.sync.stats().poll_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_snapshot_ignored_while_live() {
        let h = harness(&["rec-7"]);
        h.sync.watch(Some("rec-7"));
        let session = h.feed.last();
        session.status(FeedStatus::Subscribed);
        h.sync.flush().await;

        let late_poll = UpdateEvent::poll(Record::new("rec-7").with_field("status", json!("failed")));
        assert!(h.sync.inner.inputs.send(SyncInput::Update(late_poll)).is_ok());
        h.sync.flush().await;

        assert_eq!(status_of(&h.reader, "rec-7").as_deref(), Some("pending"));
        assert_eq!(h.sync.stats().discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_version_is_rejected() {
        let h = harness(&["rec-8"]);
        h.sync.watch(Some("rec-8"));
        let session = h.feed.last();
        session.status(FeedStatus::Subscribed);

        session.update(json!({"status": "completed", "updated_at": "2024-05-01T08:00:10Z"}));
        session.update(json!({"status": "running", "updated_at": "2024-05-01T08:00:05Z"}));
        session.update(json!({"note": "无版本号"}));
        h.sync.flush().await;

        let record = h.reader.record("rec-8").unwrap();
        assert_eq!(record.status(), Some("completed"));
        assert_eq!(record.fields["note"], json!("无版本号"));
        assert_eq!(h.sync.stats().discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_version_applies_when_guard_disabled() {
        let config = SyncConfig::builder()
            .supabase("https://demo.supabase.co", "anon")
            .reject_stale_versions(false)
            .build();
        let h = harness_with(config, vec![Record::new("rec-8")]);
        h.sync.watch(Some("rec-8"));
        let session = h.feed.last();

        session.update(json!({"status": "completed", "updated_at": "2024-05-01T08:00:10Z"}));
        session.update(json!({"status": "running", "updated_at": "2024-05-01T08:00:05Z"}));
        h.sync.flush().await;

        assert_eq!(status_of(&h.reader, "rec-8").as_deref(), Some("running"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrequested_close_degrades() {
        let h = harness(&["rec-9"]);
        h.sync.watch(Some("rec-9"));
        let session = h.feed.last();
        session.status(FeedStatus::Subscribed);
        session.status(FeedStatus::Closed);
        h.sync.flush().await;

        assert_eq!(h.sync.state(), SessionState::Degraded);
        assert_eq!(h.sync.stats().fallbacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwatch_is_idempotent_and_stops_polling() {
        let h = harness(&["rec-10"]);
        h.source.push_record(Record::new("rec-10").with_field("status", json!("running")));
        let mut events = h.sync.events().subscribe();

        h.sync.watch(Some("rec-10"));
        let session = h.feed.last();
        session.status(FeedStatus::TimedOut);
        h.sync.flush().await;

        h.sync.unwatch();
        h.sync.unwatch();
        assert_eq!(h.sync.state(), SessionState::Closed);
        assert!(session.is_closed());
        assert_eq!(h.sync.active_record_id(), None);

        tokio::time::sleep(Duration::from_millis(20_000)).await;
        assert_eq!(h.source.fetch_count(), 0);

        let mut transitions = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::SessionStateChanged { new_state, .. } = event {
                transitions.push(new_state);
            }
        }
        assert_eq!(
            transitions,
            vec![SessionState::Connecting, SessionState::Degraded, SessionState::Closed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_record_watch_is_noop() {
        let h = harness(&["rec-11"]);
        assert!(h.sync.watch(Some("rec-11")));
        assert!(h.sync.watch(Some("rec-11")));
        assert_eq!(h.feed.open_count(), 1);
        assert_eq!(h.sync.stats().sessions_opened, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfigured_watch_is_noop() {
        let h = harness_with(SyncConfig::default(), Vec::new());
        assert!(!h.sync.watch(Some("rec-12")));
        assert_eq!(h.feed.open_count(), 0);
        assert_eq!(h.sync.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_closes_session() {
        let h = harness(&["rec-13"]);
        h.sync.watch(Some("rec-13"));
        let session = h.feed.last();

        drop(h.sync);
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_and_refresh() {
        let h = harness(&[]);
        h.source.push_record(Record::new("rec-20").with_field("status", json!("completed")));
        h.source.set_list(
            "user-1",
            vec![Record::new("rec-21"), Record::new("rec-20")],
        );

        let loaded = tokio_test::assert_ok!(h.sync.load("rec-20").await);
        assert!(loaded.is_some());
        assert_eq!(h.reader.current().unwrap().status(), Some("completed"));
        assert!(!h.reader.is_loading());

        let missing = tokio_test::assert_ok!(h.sync.load("rec-404").await);
        assert!(missing.is_none());
        assert!(h.reader.current().is_none());
        assert!(h.reader.error().is_some());

        assert_eq!(tokio_test::assert_ok!(h.sync.refresh("user-1").await), 2);
        assert_eq!(h.reader.snapshot().records[0].id, "rec-21");
        assert!(h.reader.error().is_none());

        tokio_test::assert_err!(h.sync.refresh("").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_failure_sets_error() {
        let h = harness(&[]);
        h.source.push_error("rec-30", "connection refused");

        tokio_test::assert_err!(h.sync.load("rec-30").await);
        assert!(!h.reader.is_loading());
        assert!(h.reader.error().unwrap().contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_created_and_removed_records() {
        let h = harness(&["rec-40"]);
        assert!(h.sync.record_created(Record::new("rec-41")));
        assert_eq!(h.reader.snapshot().records.len(), 2);

        h.sync.watch(Some("rec-40"));
        assert!(h.sync.record_removed("rec-40"));
        assert_eq!(h.sync.state(), SessionState::Closed);
        assert!(h.feed.last().is_closed());
        assert_eq!(h.reader.snapshot().records.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_for_unloaded_record_is_unmatched() {
        let h = harness(&[]);
        let mut events = h.sync.events().subscribe();

        h.sync.watch(Some("rec-50"));
        let session = h.feed.last();
        session.status(FeedStatus::Subscribed);
        session.update(json!({"status": "completed", "updated_at": "2024-05-01T08:00:10Z"}));
        h.sync.flush().await;

        let stats = h.sync.stats();
        assert_eq!(stats.unmatched, 1);
        assert_eq!(stats.push_applied, 0);
        assert_eq!(stats.discarded, 0);
        assert!(h.reader.record("rec-50").is_none());

        let mut reasons = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::UpdateDiscarded { reason, .. } = event {
                reasons.push(reason);
            }
        }
        assert_eq!(reasons, vec!["record_not_loaded".to_string()]);

        // 未写入的更新不推进版本，记录加载后较旧的推送仍然生效
        assert!(h.sync.record_created(Record::new("rec-50")));
        session.update(json!({"status": "running", "updated_at": "2024-05-01T08:00:05Z"}));
        h.sync.flush().await;
        assert_eq!(status_of(&h.reader, "rec-50").as_deref(), Some("running"));
        assert_eq!(h.sync.stats().push_applied, 1);
    }

    mod properties {
        use super::*;
        use crate::record::RecordPatch;
        use proptest::prelude::*;

        const FIELDS: &[&str] = &["status", "progress", "title"];
        const RECORDS: &[&str] = &["rec-a", "rec-b", "rec-c"];

        fn paused_runtime() -> tokio::runtime::Runtime {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .unwrap()
        }

        /// (来源是否为轮询, patch, 是否重复投递)
        fn arb_delivery() -> impl Strategy<Value = (UpdateOrigin, RecordPatch, bool)> {
            (
                any::<bool>(),
                prop::collection::btree_map(prop::sample::select(FIELDS), 0u8..4, 1..=3),
                any::<bool>(),
            )
                .prop_map(|(from_poll, fields, duplicate)| {
                    let origin = if from_poll { UpdateOrigin::Poll } else { UpdateOrigin::Push };
                    let patch = fields
                        .into_iter()
                        .map(|(key, value)| (key.to_string(), json!(value)))
                        .collect();
                    (origin, patch, duplicate)
                })
        }

        #[derive(Debug, Clone)]
        enum Op {
            Watch(usize),
            Unwatch,
            Push(usize),
            Flush,
        }

        fn arb_op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0..RECORDS.len()).prop_map(Op::Watch),
                Just(Op::Unwatch),
                (0..RECORDS.len()).prop_map(Op::Push),
                Just(Op::Flush),
            ]
        }

        fn send(h: &Harness, update: UpdateEvent) {
            assert!(h.sync.inner.inputs.send(SyncInput::Update(update)).is_ok());
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// 降级后推送与轮询交错、重复投递，结果等于按到达顺序逐条合并
            #[test]
            fn store_matches_merge_fold(deliveries in prop::collection::vec(arb_delivery(), 1..24)) {
                let mut expected = Record::new("rec-1").with_field("status", json!("pending"));
                let mut delivered = 0u64;
                for (_, patch, duplicate) in &deliveries {
                    let times = if *duplicate { 2 } else { 1 };
                    for _ in 0..times {
                        expected.merge(patch);
                        delivered += 1;
                    }
                }

                let (stored, stats) = paused_runtime().block_on(async {
                    let h = harness(&["rec-1"]);
                    h.sync.watch(Some("rec-1"));
                    h.feed.last().status(FeedStatus::ChannelError);
                    h.sync.flush().await;
                    assert_eq!(h.sync.state(), SessionState::Degraded);

                    for (origin, patch, duplicate) in deliveries {
                        let update = UpdateEvent {
                            record_id: "rec-1".to_string(),
                            origin,
                            patch,
                            version: None,
                        };
                        if duplicate {
                            send(&h, update.clone());
                        }
                        send(&h, update);
                    }
                    h.sync.flush().await;
                    (h.reader.record("rec-1"), h.sync.stats())
                });

                prop_assert_eq!(stored, Some(expected));
                prop_assert_eq!(stats.applied(), delivered);
                prop_assert_eq!(stats.discarded, 0);
            }

            /// 任意的监听切换顺序下，只有处理时仍在监听的记录会被写入
            #[test]
            fn previous_record_updates_never_apply(ops in prop::collection::vec(arb_op(), 1..40)) {
                let mut active: Option<usize> = None;
                let mut pending: Vec<(usize, String)> = Vec::new();
                let mut expected: Vec<String> = vec!["pending".to_string(); RECORDS.len()];
                let (mut applied, mut discarded) = (0u64, 0u64);

                let mut drain = |active: Option<usize>, pending: &mut Vec<(usize, String)>| {
                    for (index, value) in pending.drain(..) {
                        if active == Some(index) {
                            expected[index] = value;
                            applied += 1;
                        } else {
                            discarded += 1;
                        }
                    }
                };

                let (stored, stats) = paused_runtime().block_on(async {
                    let h = harness(RECORDS);
                    for (step, op) in ops.iter().enumerate() {
                        match op {
                            Op::Watch(index) => {
                                h.sync.watch(Some(RECORDS[*index]));
                                active = Some(*index);
                            }
                            Op::Unwatch => {
                                h.sync.unwatch();
                                active = None;
                            }
                            Op::Push(index) => {
                                let value = format!("s{}", step);
                                let mut patch = RecordPatch::new();
                                patch.insert("status".to_string(), json!(value));
                                send(&h, UpdateEvent {
                                    record_id: RECORDS[*index].to_string(),
                                    origin: UpdateOrigin::Push,
                                    patch,
                                    version: None,
                                });
                                pending.push((*index, value));
                            }
                            Op::Flush => {
                                h.sync.flush().await;
                                drain(active, &mut pending);
                            }
                        }
                    }
                    h.sync.flush().await;
                    drain(active, &mut pending);

                    let stored: Vec<Option<String>> =
                        RECORDS.iter().map(|id| status_of(&h.reader, id)).collect();
                    (stored, h.sync.stats())
                });

                let expected: Vec<Option<String>> = expected.into_iter().map(Some).collect();
                prop_assert_eq!(stored, expected);
                prop_assert_eq!(stats.push_applied, applied);
                prop_assert_eq!(stats.discarded, discarded);
            }
        }
    }
}
