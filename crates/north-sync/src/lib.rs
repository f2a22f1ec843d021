//! North Sync - 记录状态实时同步
//!
//! 在前端（或小程序宿主）里保持某条记录的状态与后端一致：
//! - 📡 Supabase Realtime 订阅，推送即时写入
//! - 🔄 订阅失败或超时时自动降级为定时轮询
//! - 🧠 推送与轮询进入同一个队列，按记录 ID 校验后写入
//! - 👀 共享状态读写分离，UI 只拿只读句柄
//! - ⚙️ 事件广播：会话状态、写入、丢弃、轮询失败
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use north_sync::{
//!     new_store, EventManager, RealtimeFeed, RecordSynchronizer, SupabaseClient, SyncConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder()
//!         .supabase("https://xyz.supabase.co", "anon-key")
//!         .table("projects")
//!         .build();
//!
//!     let (mut reader, writer) = new_store();
//!     let sync = RecordSynchronizer::new(
//!         config.clone(),
//!         Arc::new(RealtimeFeed::new(&config)?),
//!         Arc::new(SupabaseClient::new(&config)?),
//!         writer,
//!         Arc::new(EventManager::default()),
//!     );
//!
//!     sync.load("project-1").await?;
//!     sync.watch(Some("project-1"));
//!
//!     while reader.changed().await {
//!         println!("当前记录: {:?}", reader.current());
//!     }
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod config;
pub mod error;
pub mod events;
pub mod feed;
mod gate;
pub mod logging;
pub mod poll;
pub mod record;
pub mod rest_client;
pub mod source;
pub mod store;
pub mod sync;

// 重新导出核心类型，方便使用
pub use config::{HttpClientConfig, RealtimeConfig, SyncConfig, SyncConfigBuilder};
pub use error::{NorthSyncError, Result};
pub use events::{EventManager, EventStats, SyncEvent};
pub use feed::{ChangeEvent, ChangeFeed, ChangeFilter, ChangeKind, FeedHandle, FeedSink, FeedStatus, RealtimeFeed};
pub use logging::{init_logging, LogLevel};
pub use poll::PollLoop;
pub use record::{
    is_local_id, CreateProjectParams, Project, ProjectStatus, Record, RecordPatch, UpdateProjectParams,
};
pub use rest_client::SupabaseClient;
pub use source::RecordSource;
pub use store::{new_store, AppState, StoreReader, StoreWriter};
pub use sync::{RecordSynchronizer, SessionState, SyncStats, UpdateEvent, UpdateOrigin};
