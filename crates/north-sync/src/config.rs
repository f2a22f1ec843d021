//! SDK 配置
//!
//! Supabase 连接参数、轮询间隔、本地记录前缀等。
//! 连接在进程内只构造一次，不随订阅会话重建。

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{NorthSyncError, Result};
use crate::logging::LogLevel;

/// 默认轮询间隔（毫秒）
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

/// 默认本地记录前缀（未持久化的记录，永不订阅）
pub const DEFAULT_LOCAL_ID_PREFIX: &str = "local-";

/// Realtime 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// 每秒事件上限（透传给服务端）
    pub events_per_second: u32,
    /// 连接超时（毫秒）
    pub timeout_ms: u64,
    /// 心跳间隔（毫秒）
    pub heartbeat_interval_ms: u64,
    /// 订阅确认超时（毫秒），超时即报告 timed_out
    pub subscribe_timeout_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            events_per_second: 10,
            timeout_ms: 60_000,
            heartbeat_interval_ms: 25_000,
            subscribe_timeout_ms: 10_000,
        }
    }
}

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
        }
    }
}

/// 同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Supabase 项目地址，例如 https://xyz.supabase.co
    pub supabase_url: Option<String>,
    /// Supabase anon key
    pub anon_key: Option<String>,
    /// 数据库 schema
    pub schema: String,
    /// 被监听的表名
    pub table: String,
    /// 轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 本地记录 ID 前缀
    pub local_id_prefix: String,
    /// 是否丢弃版本更旧的更新（依据 updated_at）
    pub reject_stale_versions: bool,
    /// Realtime 配置
    pub realtime: RealtimeConfig,
    /// HTTP 配置
    pub http: HttpClientConfig,
    /// 日志等级（None 表示按环境推断）
    pub log_level: Option<LogLevel>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            supabase_url: None,
            anon_key: None,
            schema: "public".to_string(),
            table: "projects".to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            local_id_prefix: DEFAULT_LOCAL_ID_PREFIX.to_string(),
            reject_stale_versions: true,
            realtime: RealtimeConfig::default(),
            http: HttpClientConfig::default(),
            log_level: None,
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// 从进程环境变量加载配置
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut config = SyncConfig::default();
        config.supabase_url = non_empty("SUPABASE_URL").or_else(|| non_empty("NEXT_PUBLIC_SUPABASE_URL"));
        config.anon_key = non_empty("SUPABASE_ANON_KEY").or_else(|| non_empty("NEXT_PUBLIC_SUPABASE_ANON_KEY"));

        if let Some(schema) = non_empty("NORTH_SYNC_SCHEMA") {
            config.schema = schema;
        }
        if let Some(table) = non_empty("NORTH_SYNC_TABLE") {
            config.table = table;
        }
        if let Some(prefix) = non_empty("NORTH_SYNC_LOCAL_PREFIX") {
            config.local_id_prefix = prefix;
        }
        if let Some(raw) = non_empty("NORTH_SYNC_POLL_INTERVAL_MS") {
            config.poll_interval_ms = raw.trim().parse().map_err(|_| {
                NorthSyncError::Config(format!("NORTH_SYNC_POLL_INTERVAL_MS 不是有效数字: {}", raw))
            })?;
        }
        config.log_level = Some(LogLevel::resolve(&lookup));

        config.validate()?;
        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(NorthSyncError::Config("poll_interval_ms 必须大于 0".to_string()));
        }
        if self.table.trim().is_empty() {
            return Err(NorthSyncError::Config("table 不能为空".to_string()));
        }
        Ok(())
    }

    /// Supabase 是否已配置
    pub fn is_supabase_configured(&self) -> bool {
        self.supabase_url.is_some() && self.anon_key.is_some()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// 是否为本地记录（永不订阅）
    pub fn is_local_id(&self, record_id: &str) -> bool {
        crate::record::is_local_id(record_id, &self.local_id_prefix)
    }

    /// 取出 URL 和 key，未配置时返回错误
    pub(crate) fn credentials(&self) -> Result<(&str, &str)> {
        match (self.supabase_url.as_deref(), self.anon_key.as_deref()) {
            (Some(url), Some(key)) => Ok((url.trim_end_matches('/'), key)),
            _ => Err(NorthSyncError::NotConfigured(
                "请设置 SUPABASE_URL 和 SUPABASE_ANON_KEY".to_string(),
            )),
        }
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn supabase<U: Into<String>, K: Into<String>>(mut self, url: U, anon_key: K) -> Self {
        self.config.supabase_url = Some(url.into());
        self.config.anon_key = Some(anon_key.into());
        self
    }

    pub fn schema<S: Into<String>>(mut self, schema: S) -> Self {
        self.config.schema = schema.into();
        self
    }

    pub fn table<S: Into<String>>(mut self, table: S) -> Self {
        self.config.table = table.into();
        self
    }

    pub fn poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.config.poll_interval_ms = interval_ms;
        self
    }

    pub fn local_id_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.local_id_prefix = prefix.into();
        self
    }

    pub fn reject_stale_versions(mut self, enabled: bool) -> Self {
        self.config.reject_stale_versions = enabled;
        self
    }

    pub fn realtime(mut self, realtime: RealtimeConfig) -> Self {
        self.config.realtime = realtime;
        self
    }

    pub fn http(mut self, http: HttpClientConfig) -> Self {
        self.config.http = http;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = Some(level);
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}
