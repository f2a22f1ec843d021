//! 日志工具
//!
//! 通过 `LOG_LEVEL` 环境变量控制输出等级，
//! 开发环境默认 debug，生产环境（`APP_ENV`/`NODE_ENV` = production）默认 warn。

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::NorthSyncError;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// 日志等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// 转换为 tracing 的等级
    pub fn as_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }

    /// 按环境变量解析日志等级
    pub fn from_env() -> Self {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// 解析规则：显式的 LOG_LEVEL 优先，否则看是否为生产环境
    pub(crate) fn resolve<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("LOG_LEVEL").and_then(|v| v.parse().ok()) {
            return level;
        }

        let production = ["APP_ENV", "NODE_ENV"]
            .iter()
            .filter_map(|key| lookup(key))
            .any(|v| v.eq_ignore_ascii_case("production"));

        if production {
            LogLevel::Warn
        } else {
            LogLevel::Debug
        }
    }
}

impl FromStr for LogLevel {
    type Err = NorthSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(NorthSyncError::Config(format!("unknown log level: {}", other))),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// 初始化全局日志订阅器
///
/// 返回 false 表示已经初始化过（或宿主程序已安装了自己的订阅器）
pub fn init_logging(level: LogLevel) -> bool {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return false;
    }

    tracing_subscriber::fmt()
        .with_max_level(level.as_tracing_level())
        .with_target(true)
        .try_init()
        .is_ok()
}
