//! 被跟踪的记录
//!
//! 记录以不透明的字符串 ID 标识，`status` 字段是被监听的变化单元，
//! 其他字段原样保存在 JSON map 中，更新时按字段合并。

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{NorthSyncError, Result};

/// 部分字段更新（push 的 `new` 负载或 poll 快照）
pub type RecordPatch = Map<String, Value>;

/// 是否为本地记录（未持久化，永不订阅）
pub fn is_local_id(record_id: &str, prefix: &str) -> bool {
    !prefix.is_empty() && record_id.starts_with(prefix)
}

/// 被跟踪的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// 附加字段（构建用）
    pub fn with_field<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// 从 JSON 对象解析，`id` 可以是字符串或数字
    pub fn from_json(value: Value) -> Result<Self> {
        let mut fields = match value {
            Value::Object(map) => map,
            other => {
                return Err(NorthSyncError::InvalidArgument(format!(
                    "记录必须是 JSON 对象: {}",
                    other
                )))
            }
        };

        let id = match fields.remove("id") {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(NorthSyncError::InvalidArgument("记录缺少 id 字段".to_string())),
        };

        Ok(Self { id, fields })
    }

    pub fn status(&self) -> Option<&str> {
        self.fields.get("status").and_then(Value::as_str)
    }

    /// 版本号：updated_at 的毫秒时间戳（缺失或无法解析时为 None）
    pub fn version(&self) -> Option<i64> {
        patch_version(&self.fields)
    }

    /// 把 patch 合并到当前记录，返回是否有字段发生变化
    ///
    /// patch 中的 `id` 字段会被忽略，记录身份不可被更新改写。
    pub fn merge(&mut self, patch: &RecordPatch) -> bool {
        let mut changed = false;
        for (key, value) in patch {
            if key == "id" {
                continue;
            }
            if self.fields.get(key) != Some(value) {
                self.fields.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }

    /// 整条记录作为 patch
    pub fn to_patch(&self) -> RecordPatch {
        self.fields.clone()
    }
}

/// 从 patch 中读取版本号
pub fn patch_version(patch: &RecordPatch) -> Option<i64> {
    patch
        .get("updated_at")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.timestamp_millis())
}

/// 项目状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Pending => "pending",
            ProjectStatus::Running => "running",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
        }
    }

    /// 是否为终态（Agent 不会再写入）
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectStatus::Completed | ProjectStatus::Failed)
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 项目（projects 表的类型化视图）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: ProjectStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl Project {
    pub fn into_record(self) -> Result<Record> {
        Record::from_json(serde_json::to_value(self)?)
    }
}

impl TryFrom<Record> for Project {
    type Error = NorthSyncError;

    fn try_from(record: Record) -> Result<Self> {
        Ok(serde_json::from_value(serde_json::to_value(record)?)?)
    }
}

/// 创建项目参数
#[derive(Debug, Clone, Serialize)]
pub struct CreateProjectParams {
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
}

/// 更新项目参数（None 表示不修改）
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateProjectParams {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<ProjectStatus>,
}
