//! 监听一条记录的状态变化
//!
//! ```text
//! SUPABASE_URL=https://xyz.supabase.co SUPABASE_ANON_KEY=... \
//!     cargo run -p north-sync --example watch_record -- <record-id>
//! ```

use std::sync::Arc;

use north_sync::{
    init_logging, new_store, EventManager, LogLevel, RealtimeFeed, RecordSynchronizer, SupabaseClient,
    SyncConfig, SyncEvent,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = SyncConfig::from_env()?;
    init_logging(config.log_level.unwrap_or_else(LogLevel::from_env));

    let record_id = std::env::args()
        .nth(1)
        .ok_or("usage: watch_record <record-id>")?;

    let events = Arc::new(EventManager::default());
    let (mut reader, writer) = new_store();
    let sync = RecordSynchronizer::new(
        config.clone(),
        Arc::new(RealtimeFeed::new(&config)?),
        Arc::new(SupabaseClient::new(&config)?),
        writer,
        events.clone(),
    );

    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            if let SyncEvent::SessionStateChanged { old_state, new_state, .. } = event {
                println!("会话状态: {} -> {}", old_state, new_state);
            }
        }
    });

    if sync.load(&record_id).await?.is_none() {
        println!("记录不存在: {}", record_id);
        return Ok(());
    }
    sync.watch(Some(&record_id));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = reader.changed() => {
                if !changed {
                    break;
                }
                if let Some(record) = reader.current() {
                    println!("{} status={:?}", record.id, record.status());
                }
            }
        }
    }

    sync.unwatch();
    println!("{}", sync.stats().summary());
    Ok(())
}
