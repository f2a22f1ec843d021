//! Supabase Realtime 订阅实现
//!
//! 一个 [`RealtimeFeed`] 只维护一条 websocket 连接，所有订阅会话复用它：
//! - `open` 向连接任务发送 join，`FeedHandle::close` 发送 leave
//! - 入站帧按 topic 分发给对应会话
//! - 心跳由连接统一发送，无应答时所有会话报告 `CHANNEL_ERROR`
//! - 从 `open` 起计算订阅确认超时，超时报告 `TIMED_OUT`
//!
//! 连接断开后不自动重连，已有会话由同步器切换到轮询；
//! 下一次 `open` 会建立新连接。

use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{RealtimeConfig, SyncConfig};
use crate::error::Result;
use crate::feed::protocol::{self, Inbound, PhoenixMessage};
use crate::feed::{ChangeFeed, ChangeFilter, FeedHandle, FeedSink, FeedStatus};

/// 发给连接任务的命令
enum SocketCommand {
    Join {
        id: u64,
        filter: ChangeFilter,
        sink: FeedSink,
        deadline: Instant,
    },
    Leave {
        id: u64,
    },
}

/// Supabase Realtime 订阅客户端
#[derive(Debug)]
pub struct RealtimeFeed {
    url: Url,
    access_token: String,
    config: RealtimeConfig,
    socket: Mutex<Option<mpsc::UnboundedSender<SocketCommand>>>,
    next_channel: AtomicU64,
}

impl RealtimeFeed {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let (base_url, anon_key) = config.credentials()?;
        let url = protocol::websocket_url(base_url, anon_key, config.realtime.events_per_second)?;

        info!("✅ Realtime 客户端已创建 ({}{})", url.host_str().unwrap_or(""), url.path());

        Ok(Self {
            url,
            access_token: anon_key.to_string(),
            config: config.realtime.clone(),
            socket: Mutex::new(None),
            next_channel: AtomicU64::new(1),
        })
    }

    /// 当前连接的命令通道，连接已结束时建立新连接
    fn socket(&self) -> mpsc::UnboundedSender<SocketCommand> {
        let mut socket = self.socket.lock();
        if let Some(commands) = socket.as_ref().filter(|tx| !tx.is_closed()) {
            return commands.clone();
        }

        debug!("建立 Realtime 连接: {}", self.url.path());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(
            self.url.clone(),
            self.access_token.clone(),
            self.config.clone(),
            rx,
        ));
        *socket = Some(tx.clone());
        tx
    }
}

impl ChangeFeed for RealtimeFeed {
    fn open(&self, filter: ChangeFilter, sink: FeedSink) -> FeedHandle {
        sink.emit_status(FeedStatus::Connecting);

        let id = self.next_channel.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_millis(self.config.subscribe_timeout_ms);
        let mut command = SocketCommand::Join {
            id,
            filter,
            sink: sink.clone(),
            deadline,
        };

        // 连接任务恰好在退出时会拒绝命令，换一条新连接再试一次
        for _ in 0..2 {
            let commands = self.socket();
            match commands.send(command) {
                Ok(()) => {
                    return FeedHandle::with_release(&sink, move || {
                        let _ = commands.send(SocketCommand::Leave { id });
                    });
                }
                Err(mpsc::error::SendError(rejected)) => command = rejected,
            }
        }

        error!("❌ Realtime 连接不可用: channel={}", id);
        sink.emit_status(FeedStatus::ChannelError);
        FeedHandle::detached(&sink)
    }
}

/// 单调递增的消息 ref
struct RefCounter(u64);

impl RefCounter {
    fn next(&mut self) -> String {
        self.0 += 1;
        self.0.to_string()
    }
}

/// 一个已 join（或等待 join 应答）的会话
struct Channel {
    topic: String,
    filter: ChangeFilter,
    sink: FeedSink,
    join_ref: String,
    subscribed: bool,
    deadline: Instant,
}

/// 连接上的会话表和写半边
struct Connection<W> {
    write: W,
    access_token: String,
    refs: RefCounter,
    channels: HashMap<u64, Channel>,
}

impl<W> Connection<W>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    async fn send(&mut self, frame: PhoenixMessage) -> Result<()> {
        let text = frame.to_text()?;
        self.write.send(Message::Text(text)).await?;
        Ok(())
    }

    /// 同一 topic 已有会话时复用它的 join
    async fn join(&mut self, id: u64, filter: ChangeFilter, sink: FeedSink, deadline: Instant) -> Result<()> {
        let topic = protocol::topic_for(&filter);
        let shared = self
            .channels
            .values()
            .find(|c| c.topic == topic)
            .map(|c| (c.join_ref.clone(), c.subscribed));

        let (join_ref, subscribed, needs_join) = match shared {
            Some((join_ref, subscribed)) => (join_ref, subscribed, false),
            None => (self.refs.next(), false, true),
        };

        if subscribed {
            sink.emit_status(FeedStatus::Subscribed);
        }
        let frame = protocol::join_message(&filter, &self.access_token, &join_ref);
        self.channels.insert(
            id,
            Channel {
                topic: topic.clone(),
                filter,
                sink,
                join_ref,
                subscribed,
                deadline,
            },
        );

        if needs_join {
            debug!("📡 Realtime join: topic={}, channel={}", topic, id);
            self.send(frame).await?;
        }
        Ok(())
    }

    /// 移除会话，topic 上没有其他会话时发送 leave
    async fn leave(&mut self, id: u64) -> Result<()> {
        let channel = match self.channels.remove(&id) {
            Some(channel) => channel,
            None => return Ok(()),
        };
        if self.channels.values().any(|c| c.topic == channel.topic) {
            return Ok(());
        }
        debug!("Realtime leave: topic={}, channel={}", channel.topic, id);
        let msg_ref = self.refs.next();
        self.send(protocol::leave_message(&channel.topic, &msg_ref)).await
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.channels
            .values()
            .filter(|c| !c.subscribed)
            .map(|c| c.deadline)
            .min()
    }

    /// 订阅确认超时的会话报告 TIMED_OUT 并退订
    async fn expire(&mut self, now: Instant) -> Result<()> {
        let expired: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| !c.subscribed && c.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(channel) = self.channels.get(&id) {
                warn!("⏱️ Realtime 订阅确认超时: topic={}", channel.topic);
                channel.sink.emit_status(FeedStatus::TimedOut);
            }
            self.leave(id).await?;
        }
        Ok(())
    }

    /// 把频道帧分发给该 topic 上的会话
    async fn route(&mut self, message: PhoenixMessage) -> Result<()> {
        let ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.topic == message.topic)
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            let channel = match self.channels.get_mut(&id) {
                Some(channel) => channel,
                None => continue,
            };

            let inbound = match protocol::classify(message.clone(), &channel.topic, &channel.join_ref) {
                Ok(inbound) => inbound,
                Err(e) => {
                    warn!("无法解析 Realtime 帧: topic={}, error={}", channel.topic, e);
                    continue;
                }
            };

            match inbound {
                Inbound::JoinReply { ok: true, .. } => {
                    if !channel.subscribed {
                        channel.subscribed = true;
                        info!("✅ Realtime 订阅成功: topic={}", channel.topic);
                        channel.sink.emit_status(FeedStatus::Subscribed);
                    }
                }
                Inbound::JoinReply { ok: false, reason } => {
                    error!("❌ Realtime 订阅被拒绝: topic={}, reason={:?}", channel.topic, reason);
                    channel.sink.emit_status(FeedStatus::ChannelError);
                    self.channels.remove(&id);
                }
                Inbound::System { ok: true, message } => {
                    debug!("Realtime 系统消息: topic={}, message={:?}", channel.topic, message);
                }
                Inbound::System { ok: false, message } => {
                    error!("❌ Realtime 扩展错误: topic={}, message={:?}", channel.topic, message);
                    channel.sink.emit_status(FeedStatus::ChannelError);
                    self.leave(id).await?;
                }
                Inbound::Change(event) => {
                    if event.record_id == channel.filter.record_id && event.kind == channel.filter.kind {
                        debug!("📥 Realtime 更新: topic={}", channel.topic);
                        channel.sink.emit_event(event);
                    }
                }
                Inbound::ChannelError(reason) => {
                    error!("❌ Realtime 频道错误: topic={}, payload={}", channel.topic, reason);
                    channel.sink.emit_status(FeedStatus::ChannelError);
                    self.channels.remove(&id);
                }
                Inbound::ChannelClosed => {
                    info!("Realtime 频道已关闭: topic={}", channel.topic);
                    channel.sink.emit_status(FeedStatus::Closed);
                    self.channels.remove(&id);
                }
                Inbound::HeartbeatReply { .. } | Inbound::Ignored => {}
            }
        }
        Ok(())
    }
}

/// 运行一条共享连接，直到出错或 [`RealtimeFeed`] 与所有句柄都被释放
async fn run_socket(
    url: Url,
    access_token: String,
    config: RealtimeConfig,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
) {
    // 连接耗时计入订阅确认超时
    let connect_limit = Duration::from_millis(config.timeout_ms.min(config.subscribe_timeout_ms));
    let stream = match timeout(connect_limit, connect_async(url.as_str())).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            error!("❌ Realtime 连接失败: {}", e);
            fail_all(&mut commands, HashMap::new(), FeedStatus::ChannelError).await;
            return;
        }
        Err(_) => {
            error!("❌ Realtime 连接超时");
            fail_all(&mut commands, HashMap::new(), FeedStatus::TimedOut).await;
            return;
        }
    };
    info!("✅ Realtime 已连接");

    let (write, mut read) = stream.split();
    let mut connection = Connection {
        write,
        access_token,
        refs: RefCounter(0),
        channels: HashMap::new(),
    };

    let heartbeat_period = Duration::from_millis(config.heartbeat_interval_ms);
    let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
    let mut pending_heartbeat: Option<String> = None;

    let failure = loop {
        let next_deadline = connection.next_deadline();

        tokio::select! {
            command = commands.recv() => {
                let sent = match command {
                    Some(SocketCommand::Join { id, filter, sink, deadline }) => {
                        connection.join(id, filter, sink, deadline).await
                    }
                    Some(SocketCommand::Leave { id }) => connection.leave(id).await,
                    None => {
                        debug!("Realtime 客户端已释放，关闭连接");
                        let _ = connection.write.close().await;
                        return;
                    }
                };
                if let Err(e) = sent {
                    error!("❌ Realtime 发送失败: {}", e);
                    break FeedStatus::ChannelError;
                }
            }
            _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                if let Err(e) = connection.expire(Instant::now()).await {
                    error!("❌ Realtime 发送失败: {}", e);
                    break FeedStatus::ChannelError;
                }
            }
            _ = heartbeat.tick() => {
                if pending_heartbeat.is_some() {
                    warn!("💔 Realtime 心跳无应答");
                    break FeedStatus::ChannelError;
                }
                let msg_ref = connection.refs.next();
                if connection.send(protocol::heartbeat_message(&msg_ref)).await.is_err() {
                    warn!("💔 Realtime 心跳发送失败");
                    break FeedStatus::ChannelError;
                }
                pending_heartbeat = Some(msg_ref);
            }
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(reason))) => {
                        warn!("Realtime 连接被关闭: reason={:?}", reason);
                        break FeedStatus::ChannelError;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!("❌ Realtime 读取失败: {}", e);
                        break FeedStatus::ChannelError;
                    }
                    None => {
                        warn!("Realtime 连接已断开");
                        break FeedStatus::ChannelError;
                    }
                };

                let message = match PhoenixMessage::from_text(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("无法解析 Realtime 帧: {}", e);
                        continue;
                    }
                };

                if message.topic == protocol::PHOENIX_TOPIC {
                    if let Ok(Inbound::HeartbeatReply { msg_ref }) = protocol::classify(message, "", "") {
                        if pending_heartbeat.as_deref() == Some(msg_ref.as_str()) {
                            pending_heartbeat = None;
                        }
                    }
                    continue;
                }

                if let Err(e) = connection.route(message).await {
                    error!("❌ Realtime 发送失败: {}", e);
                    break FeedStatus::ChannelError;
                }
            }
        }
    };

    fail_all(&mut commands, connection.channels, failure).await;
}

/// 连接结束：拒绝新命令，并向所有会话（包括还在队列里的 join）报告终止状态
async fn fail_all(
    commands: &mut mpsc::UnboundedReceiver<SocketCommand>,
    channels: HashMap<u64, Channel>,
    status: FeedStatus,
) {
    commands.close();

    let mut sinks: Vec<FeedSink> = channels.into_values().map(|c| c.sink).collect();
    while let Some(command) = commands.recv().await {
        if let SocketCommand::Join { sink, .. } = command {
            sinks.push(sink);
        }
    }

    warn!("Realtime 连接结束，{} 个会话报告 {}", sinks.len(), status);
    for sink in sinks {
        sink.emit_status(status);
    }
}
