//! 轮询兜底
//!
//! 实时订阅不可用时按固定间隔拉取记录：
//! - 重复 `start` 是无操作，不会产生第二个定时器
//! - 单次拉取失败只记录日志，下一个 tick 继续
//! - 只有状态与本循环上次观察到的不同才回调（本地去重）
//! - `stop` 幂等，等待执行中的回调结束，返回后不再有任何回调

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::NorthSyncError;
use crate::gate::CallbackGate;
use crate::record::Record;
use crate::source::RecordSource;

pub type SnapshotCallback = Arc<dyn Fn(Record) + Send + Sync>;
pub type FailureCallback = Arc<dyn Fn(NorthSyncError) + Send + Sync>;

struct RunningLoop {
    record_id: String,
    gate: Arc<CallbackGate>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// 轮询循环（每个会话一个）
pub struct PollLoop {
    source: Arc<dyn RecordSource>,
    running: Mutex<Option<RunningLoop>>,
    ticks: Arc<AtomicU64>,
    on_failure: Option<FailureCallback>,
}

impl PollLoop {
    pub fn new(source: Arc<dyn RecordSource>) -> Self {
        Self {
            source,
            running: Mutex::new(None),
            ticks: Arc::new(AtomicU64::new(0)),
            on_failure: None,
        }
    }

    /// 拉取失败时的回调（仅用于上报，不影响循环）
    pub fn with_failure_callback<F>(mut self, on_failure: F) -> Self
    where
        F: Fn(NorthSyncError) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(on_failure));
        self
    }

    /// 启动轮询，已在运行时返回 false
    pub fn start<F>(&self, record_id: &str, interval: Duration, on_snapshot: F) -> bool
    where
        F: Fn(Record) + Send + Sync + 'static,
    {
        let mut running = self.running.lock();
        if let Some(current) = running.as_ref() {
            debug!(
                "轮询已在运行，忽略重复启动: running={}, requested={}",
                current.record_id, record_id
            );
            return false;
        }

        info!("🔄 启动轮询备份: record_id={}, interval={:?}", record_id, interval);

        let gate = Arc::new(CallbackGate::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            self.source.clone(),
            record_id.to_string(),
            interval,
            Callbacks {
                gate: gate.clone(),
                on_snapshot: Arc::new(on_snapshot),
                on_failure: self.on_failure.clone(),
            },
            self.ticks.clone(),
            cancel.clone(),
        ));

        *running = Some(RunningLoop {
            record_id: record_id.to_string(),
            gate,
            cancel,
            task,
        });
        true
    }

    /// 停止轮询（幂等）
    ///
    /// 正在执行的回调会先跑完，返回后不再有回调。
    /// 不能在本循环的回调里调用。
    pub fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.gate.close();
            running.cancel.cancel();
            running.task.abort();
            info!("⏹️ 停止轮询: record_id={}", running.record_id);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// 累计 tick 次数（每次 tick 对应一次拉取）
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 一个循环的回调，都经过同一个闸门
struct Callbacks {
    gate: Arc<CallbackGate>,
    on_snapshot: SnapshotCallback,
    on_failure: Option<FailureCallback>,
}

async fn run_loop(
    source: Arc<dyn RecordSource>,
    record_id: String,
    period: Duration,
    callbacks: Callbacks,
    ticks: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    // 与 setInterval 一致：第一次拉取在一个周期之后
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // 外层 None 表示还没有观察过，没有 status 字段的记录也要投递一次
    let mut last_status: Option<Option<String>> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        ticks.fetch_add(1, Ordering::SeqCst);

        let fetched = tokio::select! {
            _ = cancel.cancelled() => break,
            result = source.fetch_record(&record_id) => result,
        };

        match fetched {
            Ok(Some(record)) => {
                let status = record.status().map(str::to_string);
                if last_status.as_ref() == Some(&status) {
                    continue;
                }
                debug!("🔄 轮询发现状态变化: record_id={}, status={:?}", record_id, status);
                last_status = Some(status);
                if !callbacks.gate.run(|| (callbacks.on_snapshot)(record)) {
                    break;
                }
            }
            Ok(None) => {
                debug!("轮询未找到记录: record_id={}", record_id);
            }
            Err(e) => {
                warn!("轮询失败: record_id={}, error={}", record_id, e);
                if let Some(callback) = &callbacks.on_failure {
                    if !callbacks.gate.run(|| callback(e)) {
                        break;
                    }
                }
            }
        }
    }
}
