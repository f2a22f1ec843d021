//! 记录数据源
//!
//! 轮询和数据加载只依赖这个 trait，生产环境由 [`crate::rest_client::SupabaseClient`] 实现。

use async_trait::async_trait;

use crate::error::Result;
use crate::record::Record;

/// 记录数据源
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// 获取单条记录，不存在时返回 `Ok(None)`
    async fn fetch_record(&self, record_id: &str) -> Result<Option<Record>>;

    /// 获取某个用户的记录列表（新的在前）
    async fn list_records(&self, owner_id: &str) -> Result<Vec<Record>>;
}
