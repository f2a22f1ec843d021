//! Realtime 协议帧（Phoenix channel JSON v1）
//!
//! 只覆盖单条记录订阅需要的子集：join / leave / heartbeat 出站帧，
//! 以及 reply / system / postgres_changes / error / close 入站帧。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use crate::error::{NorthSyncError, Result};
use crate::feed::{ChangeEvent, ChangeFilter, ChangeKind};
use crate::record::Record;

pub const PHOENIX_TOPIC: &str = "phoenix";
pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_SYSTEM: &str = "system";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";

/// Phoenix 消息帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// 入站帧分类
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// join 的应答
    JoinReply { ok: bool, reason: Option<String> },
    /// 心跳应答
    HeartbeatReply { msg_ref: String },
    /// 服务端系统消息（postgres_changes 扩展就绪或失败）
    System { ok: bool, message: Option<String> },
    /// 行变更
    Change(ChangeEvent),
    /// 频道出错
    ChannelError(String),
    /// 频道被服务端关闭
    ChannelClosed,
    /// 与本订阅无关
    Ignored,
}

/// 频道 topic
pub fn topic_for(filter: &ChangeFilter) -> String {
    format!("realtime:{}", filter.channel_name())
}

/// 由项目地址推导 websocket 地址
pub fn websocket_url(base_url: &str, api_key: &str, events_per_second: u32) -> Result<Url> {
    let mut url = Url::parse(base_url)?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(NorthSyncError::Config(format!("不支持的协议: {}", other)));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| NorthSyncError::Config(format!("无法切换协议: {}", base_url)))?;
    url.set_path("/realtime/v1/websocket");
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", api_key)
        .append_pair("eventsPerSecond", &events_per_second.to_string())
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

/// join 帧：只订阅单行的 postgres_changes
pub fn join_message(filter: &ChangeFilter, access_token: &str, msg_ref: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: topic_for(filter),
        event: EVENT_JOIN.to_string(),
        payload: json!({
            "config": {
                "broadcast": { "ack": false, "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": filter.kind.as_str(),
                    "schema": filter.schema,
                    "table": filter.table,
                    "filter": filter.row_filter(),
                }],
            },
            "access_token": access_token,
        }),
        msg_ref: Some(msg_ref.to_string()),
        join_ref: Some(msg_ref.to_string()),
    }
}

pub fn heartbeat_message(msg_ref: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: PHOENIX_TOPIC.to_string(),
        event: EVENT_HEARTBEAT.to_string(),
        payload: json!({}),
        msg_ref: Some(msg_ref.to_string()),
        join_ref: None,
    }
}

/// leave 帧：退订一个频道
pub fn leave_message(topic: &str, msg_ref: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: topic.to_string(),
        event: EVENT_LEAVE.to_string(),
        payload: json!({}),
        msg_ref: Some(msg_ref.to_string()),
        join_ref: None,
    }
}

/// 对入站帧分类
///
/// `topic` 为本订阅的频道，`join_ref` 为 join 帧的 ref。
pub fn classify(message: PhoenixMessage, topic: &str, join_ref: &str) -> Result<Inbound> {
    if message.topic == PHOENIX_TOPIC {
        return Ok(match (message.event.as_str(), message.msg_ref) {
            (EVENT_REPLY, Some(msg_ref)) => Inbound::HeartbeatReply { msg_ref },
            _ => Inbound::Ignored,
        });
    }
    if message.topic != topic {
        return Ok(Inbound::Ignored);
    }

    match message.event.as_str() {
        EVENT_REPLY => {
            if message.msg_ref.as_deref() != Some(join_ref) {
                return Ok(Inbound::Ignored);
            }
            let ok = message.payload.get("status").and_then(Value::as_str) == Some("ok");
            let reason = if ok {
                None
            } else {
                Some(
                    message
                        .payload
                        .pointer("/response/reason")
                        .and_then(Value::as_str)
                        .unwrap_or("join rejected")
                        .to_string(),
                )
            };
            Ok(Inbound::JoinReply { ok, reason })
        }
        EVENT_SYSTEM => {
            let ok = message.payload.get("status").and_then(Value::as_str) == Some("ok");
            let text = message
                .payload
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok(Inbound::System { ok, message: text })
        }
        EVENT_POSTGRES_CHANGES => parse_change(&message.payload).map(Inbound::Change),
        EVENT_ERROR => Ok(Inbound::ChannelError(message.payload.to_string())),
        EVENT_CLOSE => Ok(Inbound::ChannelClosed),
        _ => Ok(Inbound::Ignored),
    }
}

fn parse_change(payload: &Value) -> Result<ChangeEvent> {
    let data = payload
        .get("data")
        .ok_or_else(|| NorthSyncError::Protocol("postgres_changes 缺少 data".to_string()))?;

    let kind = match data.get("type").and_then(Value::as_str) {
        Some("INSERT") => ChangeKind::Insert,
        Some("UPDATE") => ChangeKind::Update,
        Some("DELETE") => ChangeKind::Delete,
        other => {
            return Err(NorthSyncError::Protocol(format!("未知变更类型: {:?}", other)));
        }
    };

    // DELETE 只有 old_record
    let row = match kind {
        ChangeKind::Delete => data.get("old_record"),
        _ => data.get("record"),
    }
    .cloned()
    .ok_or_else(|| NorthSyncError::Protocol("postgres_changes 缺少 record".to_string()))?;

    let record = Record::from_json(row)?;
    let commit_timestamp = data
        .get("commit_timestamp")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut new = record.fields;
    new.insert("id".to_string(), Value::String(record.id.clone()));

    Ok(ChangeEvent {
        record_id: record.id,
        kind,
        new,
        commit_timestamp,
    })
}
