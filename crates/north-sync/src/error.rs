use thiserror::Error;

/// SDK 错误类型
///
/// feed/轮询路径上的错误不会返回给调用方，只会记录日志并发布事件；
/// 这里的变体主要服务于 REST 调用、配置加载和 Realtime 握手。
#[derive(Debug, Error)]
pub enum NorthSyncError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Supabase not configured: {0}")]
    NotConfigured(String),
    #[error("HTTP error: {0}")]
    Http(String),
    /// PostgREST 返回的业务错误（code 例如 PGRST116）
    #[error("API error [{code}]: {message}")]
    Api { code: String, message: String },
    #[error("JSON error: {0}")]
    Json(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Closed: {0}")]
    Closed(String),
}

impl From<serde_json::Error> for NorthSyncError {
    fn from(error: serde_json::Error) -> Self {
        NorthSyncError::Json(error.to_string())
    }
}

impl From<reqwest::Error> for NorthSyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            NorthSyncError::Timeout(error.to_string())
        } else {
            NorthSyncError::Http(error.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for NorthSyncError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        NorthSyncError::Transport(error.to_string())
    }
}

impl From<url::ParseError> for NorthSyncError {
    fn from(error: url::ParseError) -> Self {
        NorthSyncError::Config(format!("invalid url: {}", error))
    }
}

impl NorthSyncError {
    /// 获取 PostgREST 错误码（如果这是一个 API 错误）
    pub fn api_code(&self) -> Option<&str> {
        match self {
            NorthSyncError::Api { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// 是否为可在下一次轮询中自动恢复的临时错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NorthSyncError::Http(_)
                | NorthSyncError::Transport(_)
                | NorthSyncError::Timeout(_)
                | NorthSyncError::Json(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, NorthSyncError>;
