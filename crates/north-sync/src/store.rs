//! 共享可观察状态
//!
//! 读写能力分离：
//! - [`StoreReader`] 只读，可随意克隆分发给 UI 层
//! - [`StoreWriter`] 唯一写入口，不可克隆，构造同步器时移交给它
//!
//! 底层是 `tokio::sync::watch`，每次实际变化都会通知观察者，
//! 合并出相同值的写入不会产生通知。

use tokio::sync::watch;

use crate::record::{Record, RecordPatch};

/// 应用状态快照
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppState {
    /// 记录列表（新的在前）
    pub records: Vec<Record>,
    /// 当前详情记录
    pub current: Option<Record>,
    pub is_loading: bool,
    pub error: Option<String>,
}

/// 创建一对读写句柄
pub fn new_store() -> (StoreReader, StoreWriter) {
    let (tx, rx) = watch::channel(AppState::default());
    (StoreReader { rx }, StoreWriter { tx })
}

/// 只读句柄
#[derive(Debug, Clone)]
pub struct StoreReader {
    rx: watch::Receiver<AppState>,
}

impl StoreReader {
    /// 当前状态快照
    pub fn snapshot(&self) -> AppState {
        self.rx.borrow().clone()
    }

    pub fn current(&self) -> Option<Record> {
        self.rx.borrow().current.clone()
    }

    /// 按 ID 查找（先查当前记录，再查列表）
    pub fn record(&self, record_id: &str) -> Option<Record> {
        let state = self.rx.borrow();
        state
            .current
            .as_ref()
            .filter(|r| r.id == record_id)
            .or_else(|| state.records.iter().find(|r| r.id == record_id))
            .cloned()
    }

    pub fn is_loading(&self) -> bool {
        self.rx.borrow().is_loading
    }

    pub fn error(&self) -> Option<String> {
        self.rx.borrow().error.clone()
    }

    /// 新的观察者（独立的已读标记）
    pub fn subscribe(&self) -> watch::Receiver<AppState> {
        self.rx.clone()
    }

    /// 等待下一次变化
    ///
    /// 写入端被释放后返回 false
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// 写句柄（同步器独占）
#[derive(Debug)]
pub struct StoreWriter {
    tx: watch::Sender<AppState>,
}

impl StoreWriter {
    pub fn reader(&self) -> StoreReader {
        StoreReader {
            rx: self.tx.subscribe(),
        }
    }

    pub fn set_records(&self, records: Vec<Record>) {
        self.tx.send_modify(|state| {
            state.records = records;
            state.is_loading = false;
        });
    }

    /// 添加记录，ID 已存在时忽略
    pub fn add_record(&self, record: Record) -> bool {
        self.tx.send_if_modified(|state| {
            if state.records.iter().any(|r| r.id == record.id) {
                return false;
            }
            state.records.insert(0, record);
            true
        })
    }

    /// 列表或当前记录里是否有这条记录
    pub fn contains(&self, record_id: &str) -> bool {
        let state = self.tx.borrow();
        state.current.as_ref().map_or(false, |r| r.id == record_id)
            || state.records.iter().any(|r| r.id == record_id)
    }

    /// 把 patch 合并到列表项和当前记录（ID 匹配时）
    ///
    /// 返回是否有可见变化
    pub fn update_record(&self, record_id: &str, patch: &RecordPatch) -> bool {
        self.tx.send_if_modified(|state| {
            let mut changed = false;
            for record in state.records.iter_mut().filter(|r| r.id == record_id) {
                changed |= record.merge(patch);
            }
            if let Some(current) = state.current.as_mut().filter(|r| r.id == record_id) {
                changed |= current.merge(patch);
            }
            changed
        })
    }

    pub fn remove_record(&self, record_id: &str) -> bool {
        self.tx.send_if_modified(|state| {
            let before = state.records.len();
            state.records.retain(|r| r.id != record_id);
            let mut changed = state.records.len() != before;
            if state.current.as_ref().map_or(false, |r| r.id == record_id) {
                state.current = None;
                changed = true;
            }
            changed
        })
    }

    pub fn set_current(&self, record: Option<Record>) {
        self.tx.send_if_modified(|state| {
            if state.current == record {
                return false;
            }
            state.current = record;
            true
        });
    }

    pub fn set_loading(&self, loading: bool) {
        self.tx.send_if_modified(|state| {
            let changed = state.is_loading != loading;
            state.is_loading = loading;
            changed
        });
    }

    pub fn set_error(&self, error: Option<String>) {
        self.tx.send_if_modified(|state| {
            let changed = state.error != error;
            state.error = error;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, status: &str) -> Record {
        Record::new(id).with_field("status", json!(status))
    }

    fn patch(value: serde_json::Value) -> RecordPatch {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_update_merges_into_list_and_current() {
        let (reader, writer) = new_store();
        writer.set_records(vec![record("a", "pending"), record("b", "pending")]);
        writer.set_current(Some(record("a", "pending")));

        assert!(writer.update_record("a", &patch(json!({"status": "running", "progress": 40}))));

        let state = reader.snapshot();
        assert_eq!(state.records[0].status(), Some("running"));
        assert_eq!(state.records[1].status(), Some("pending"));
        assert_eq!(reader.current().unwrap().fields["progress"], json!(40));
        assert_eq!(reader.record("b").unwrap().status(), Some("pending"));
    }

    #[test]
    fn test_identical_update_does_not_notify() {
        let (reader, writer) = new_store();
        writer.set_current(Some(record("a", "running")));

        let mut rx = reader.subscribe();
        rx.mark_unchanged();

        assert!(!writer.update_record("a", &patch(json!({"status": "running"}))));
        assert!(!rx.has_changed().unwrap());

        assert!(writer.update_record("a", &patch(json!({"status": "completed"}))));
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_add_and_remove() {
        let (reader, writer) = new_store();
        assert!(writer.add_record(record("a", "pending")));
        assert!(!writer.add_record(record("a", "running")));
        assert!(writer.add_record(record("b", "pending")));
        assert_eq!(reader.snapshot().records[0].id, "b");
        assert!(writer.contains("a"));
        assert!(!writer.contains("c"));

        writer.set_current(Some(record("a", "pending")));
        assert!(writer.remove_record("a"));
        assert!(reader.current().is_none());
        assert_eq!(reader.snapshot().records.len(), 1);
        assert!(!writer.remove_record("missing"));
    }

    #[test]
    fn test_loading_and_error_flags() {
        let (reader, writer) = new_store();
        writer.set_loading(true);
        assert!(reader.is_loading());
        writer.set_records(Vec::new());
        assert!(!reader.is_loading());

        writer.set_error(Some("加载失败".to_string()));
        assert_eq!(reader.error().as_deref(), Some("加载失败"));
    }

    #[tokio::test]
    async fn test_changed_ends_when_writer_dropped() {
        let (mut reader, writer) = new_store();
        writer.set_loading(true);
        assert!(reader.changed().await);
        drop(writer);
        assert!(!reader.changed().await);
    }
}
