//! PostgREST 客户端 - Supabase 表的 CRUD
//!
//! 客户端在进程内只构造一次（一个 reqwest 连接池），
//! 同时作为轮询和数据加载的 [`RecordSource`]。

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::SyncConfig;
use crate::error::{NorthSyncError, Result};
use crate::record::{CreateProjectParams, Project, ProjectStatus, Record, UpdateProjectParams};
use crate::source::RecordSource;

/// 单行查询无结果时 PostgREST 返回的错误码
pub const NOT_FOUND_CODE: &str = "PGRST116";

const OBJECT_MEDIA_TYPE: &str = "application/vnd.pgrst.object+json";

/// PostgREST 错误体
#[derive(Debug, Deserialize)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Supabase 表客户端
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    client: Client,
    rest_url: String,
    anon_key: String,
    schema: String,
    table: String,
}

impl SupabaseClient {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let (base_url, anon_key) = config.credentials()?;

        let mut builder = Client::builder();
        if let Some(timeout) = config.http.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = config.http.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        let client = builder
            .build()
            .map_err(|e| NorthSyncError::Http(format!("创建 HTTP 客户端失败: {}", e)))?;

        let rest_url = format!("{}/rest/v1", base_url);
        info!("✅ Supabase REST 客户端已创建 ({}/{})", rest_url, config.table);

        Ok(Self {
            client,
            rest_url,
            anon_key: anon_key.to_string(),
            schema: config.schema.clone(),
            table: config.table.clone(),
        })
    }

    fn table_url(&self) -> String {
        format!("{}/{}", self.rest_url, self.table)
    }

    /// 附加鉴权与 schema 头
    fn authorized(&self, request: RequestBuilder, write: bool) -> RequestBuilder {
        let profile_header = if write { "Content-Profile" } else { "Accept-Profile" };
        request
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.anon_key))
            .header(profile_header, &self.schema)
    }

    /// 获取单条记录
    pub async fn fetch_record(&self, record_id: &str) -> Result<Option<Record>> {
        debug!("🔎 获取记录: table={}, id={}", self.table, record_id);

        let request = self
            .client
            .get(self.table_url())
            .query(&[("id", format!("eq.{}", record_id)), ("select", "*".to_string())])
            .header("Accept", OBJECT_MEDIA_TYPE);

        let response = self.authorized(request, false).send().await?;
        match read_json(response).await {
            Ok(value) => Ok(Some(Record::from_json(value)?)),
            Err(e) if e.api_code() == Some(NOT_FOUND_CODE) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 查询某个用户的记录列表（按创建时间倒序）
    pub async fn list_records(&self, user_id: &str) -> Result<Vec<Record>> {
        let request = self.client.get(self.table_url()).query(&[
            ("user_id", format!("eq.{}", user_id)),
            ("select", "*".to_string()),
            ("order", "created_at.desc".to_string()),
        ]);

        let response = self.authorized(request, false).send().await?;
        let rows = match read_json(response).await? {
            Value::Array(rows) => rows,
            other => {
                return Err(NorthSyncError::Protocol(format!("列表响应不是数组: {}", other)));
            }
        };

        rows.into_iter().map(Record::from_json).collect()
    }

    /// 查询项目列表
    pub async fn list_projects(&self, user_id: &str) -> Result<Vec<Project>> {
        self.list_records(user_id)
            .await?
            .into_iter()
            .map(Project::try_from)
            .collect()
    }

    /// 创建项目（初始状态 pending）
    pub async fn create_project(&self, params: &CreateProjectParams) -> Result<Project> {
        let body = json!({
            "user_id": params.user_id,
            "title": params.title,
            "description": params.description.clone().unwrap_or_default(),
            "status": ProjectStatus::Pending,
        });

        let request = self
            .client
            .post(self.table_url())
            .header("Prefer", "return=representation")
            .header("Accept", OBJECT_MEDIA_TYPE)
            .json(&body);

        let response = self.authorized(request, true).send().await?;
        let project: Project = serde_json::from_value(read_json(response).await?)?;
        info!("✅ 项目已创建: id={}", project.id);
        Ok(project)
    }

    /// 更新项目，自动写入 updated_at
    pub async fn update_project(&self, project_id: &str, params: &UpdateProjectParams) -> Result<Project> {
        let body = update_body(params, &chrono::Utc::now().to_rfc3339());

        let request = self
            .client
            .patch(self.table_url())
            .query(&[("id", format!("eq.{}", project_id))])
            .header("Prefer", "return=representation")
            .header("Accept", OBJECT_MEDIA_TYPE)
            .json(&body);

        let response = self.authorized(request, true).send().await?;
        Ok(serde_json::from_value(read_json(response).await?)?)
    }

    /// 删除项目
    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        let request = self
            .client
            .delete(self.table_url())
            .query(&[("id", format!("eq.{}", project_id))]);

        let response = self.authorized(request, true).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(api_error(status, &text));
        }
        info!("🗑️ 项目已删除: id={}", project_id);
        Ok(())
    }
}

#[async_trait]
impl RecordSource for SupabaseClient {
    async fn fetch_record(&self, record_id: &str) -> Result<Option<Record>> {
        SupabaseClient::fetch_record(self, record_id).await
    }

    async fn list_records(&self, owner_id: &str) -> Result<Vec<Record>> {
        SupabaseClient::list_records(self, owner_id).await
    }
}

/// 读取 JSON 响应，非 2xx 转换为错误
async fn read_json(response: Response) -> Result<Value> {
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        let err = api_error(status, &text);
        if err.api_code() != Some(NOT_FOUND_CODE) {
            error!("❌ PostgREST 请求失败，HTTP 状态码: {}, 错误: {}", status, text);
        }
        return Err(err);
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

/// 把错误响应解析为 API 错误
fn api_error(status: StatusCode, body: &str) -> NorthSyncError {
    match serde_json::from_str::<PostgrestError>(body) {
        Ok(PostgrestError { code: Some(code), message }) => NorthSyncError::Api {
            code,
            message: message.unwrap_or_else(|| status.to_string()),
        },
        _ => NorthSyncError::Http(format!("HTTP 状态码: {} ({})", status, body)),
    }
}

/// 构造更新请求体，只包含需要修改的字段
fn update_body(params: &UpdateProjectParams, updated_at: &str) -> Value {
    let mut body = Map::new();
    body.insert("updated_at".to_string(), Value::String(updated_at.to_string()));

    if let Some(title) = &params.title {
        body.insert("title".to_string(), Value::String(title.clone()));
    }
    if let Some(description) = &params.description {
        body.insert("description".to_string(), Value::String(description.clone()));
    }
    if let Some(status) = params.status {
        body.insert("status".to_string(), Value::String(status.as_str().to_string()));
    }

    Value::Object(body)
}
