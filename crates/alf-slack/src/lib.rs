//! Slack adapter.
//!
//! Implements the `alf-core` chat ports over the Slack Web API, one client per
//! team bound to that team's bot token.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use alf_core::{
    domain::{ChannelId, Tenant},
    errors::Error,
    ports::{ChatClient, ChatClientFactory},
    Result,
};

const PAGE_LIMIT: u32 = 200;
const MAX_PAGES: usize = 50;

/// Builds per-team [`SlackClient`]s sharing one HTTP connection pool.
#[derive(Clone, Debug)]
pub struct SlackClients {
    http: reqwest::Client,
    api_base: String,
}

impl SlackClients {
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("alf/0.1")
            .build()
            .map_err(|e| Error::External(format!("slack http client build failed: {e}")))?;
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }
}

impl ChatClientFactory for SlackClients {
    fn client_for(&self, tenant: &Tenant) -> Arc<dyn ChatClient> {
        Arc::new(SlackClient {
            http: self.http.clone(),
            api_base: self.api_base.clone(),
            token: tenant.bot_token.clone(),
        })
    }
}

#[derive(Clone)]
pub struct SlackClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

impl SlackClient {
    fn url(&self, method: &str) -> String {
        format!("{}/{method}", self.api_base)
    }

    async fn call(&self, req: reqwest::RequestBuilder, method: &str) -> Result<Value> {
        let resp = req
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::External(format!("slack {method} request error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::External(format!(
                "slack {method} failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let v: Value = resp
            .json()
            .await
            .map_err(|e| Error::External(format!("slack {method} json error: {e}")))?;
        check_ok(method, v)
    }
}

/// Slack reports API errors as `200 {"ok": false, "error": ".."}`.
fn check_ok(method: &str, v: Value) -> Result<Value> {
    let env: Envelope = serde_json::from_value(v.clone())?;
    if env.ok {
        return Ok(v);
    }
    Err(Error::External(format!(
        "slack {method} error: {}",
        env.error.unwrap_or_else(|| "unknown".to_string())
    )))
}

fn find_channel(page: &Value, name: &str) -> Option<ChannelId> {
    page.get("channels")?
        .as_array()?
        .iter()
        .find(|c| {
            c.get("name")
                .and_then(Value::as_str)
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        })
        .and_then(|c| c.get("id").and_then(Value::as_str))
        .map(ChannelId::new)
}

fn next_cursor(page: &Value) -> Option<String> {
    page.get("response_metadata")
        .and_then(|m| m.get("next_cursor"))
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl ChatClient for SlackClient {
    async fn post_message(&self, channel: &ChannelId, text: &str) -> Result<()> {
        let req = self
            .http
            .post(self.url("chat.postMessage"))
            .json(&json!({ "channel": channel, "text": text }));
        self.call(req, "chat.postMessage").await?;
        Ok(())
    }

    async fn resolve_channel(&self, name: &str) -> Result<Option<ChannelId>> {
        let name = name.trim_start_matches('#');
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut query = vec![
                ("types", "public_channel,private_channel".to_string()),
                ("exclude_archived", "true".to_string()),
                ("limit", PAGE_LIMIT.to_string()),
            ];
            if let Some(c) = &cursor {
                query.push(("cursor", c.clone()));
            }

            let req = self.http.get(self.url("conversations.list")).query(&query);
            let page = self.call(req, "conversations.list").await?;
            if let Some(id) = find_channel(&page, name) {
                return Ok(Some(id));
            }

            cursor = next_cursor(&page);
            if cursor.is_none() {
                break;
            }
        }

        debug!(name, "channel not found");
        Ok(None)
    }
}
