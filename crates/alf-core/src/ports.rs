//! Hexagonal ports for everything the core talks to.
//!
//! The repository, the work queue and the chat platform are external
//! collaborators; adapter crates (and `memory` for tests / local runs)
//! implement these traits.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::debug;

use crate::{
    domain::{
        ChannelId, Subscription, TeamId, Tenant, TenantConfiguration, TenantId, TenantStatistics,
        User, UserId, WorkItem, WorkReply,
    },
    Result,
};

/// Team / configuration / user persistence.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn list_tenants(&self) -> Result<Vec<Tenant>>;
    async fn tenant_by_external_id(&self, team: &TeamId) -> Result<Tenant>;
    async fn configuration_for(&self, tenant: &TenantId) -> Result<TenantConfiguration>;
    async fn save_configuration(&self, configuration: &TenantConfiguration) -> Result<()>;
    async fn record_heartbeat(&self) -> Result<()>;

    /// Add `stats.messages` to the stored total for the tenant.
    async fn persist_statistics(&self, stats: &TenantStatistics) -> Result<()>;

    async fn user_by_id(&self, user: &UserId) -> Result<Option<User>>;
}

/// Work, configuration-change and reply queues.
///
/// Pops wait at most `timeout`: `Ok(None)` means nothing arrived in time,
/// `Err` means the source terminated and the caller should stop polling.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn push_work(&self, item: &WorkItem) -> Result<()>;
    async fn push_config_change(&self, team: &TeamId) -> Result<()>;
    async fn pop_config_change(&self, timeout: Duration) -> Result<Option<TeamId>>;
    async fn pop_reply(&self, host: &str, timeout: Duration) -> Result<Option<WorkReply>>;
}

/// Per-tenant chat platform handle, bound to the tenant's bot token.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn post_message(&self, channel: &ChannelId, text: &str) -> Result<()>;

    /// Look up a channel id by its display name (without the leading `#`).
    async fn resolve_channel(&self, name: &str) -> Result<Option<ChannelId>>;
}

pub trait ChatClientFactory: Send + Sync {
    fn client_for(&self, tenant: &Tenant) -> Arc<dyn ChatClient>;
}

/// A synchronous enrichment lookup invoked from a direct message
/// (`vt <hash>`, `xfe <ip>`).
#[async_trait]
pub trait LookupTool: Send + Sync {
    /// Lower-case command word, without the trailing space.
    fn prefix(&self) -> &str;

    async fn lookup(&self, tenant: &Tenant, query: &str) -> Result<String>;
}

/// Receives enrichment replies addressed to this process.
#[async_trait]
pub trait ReplyHandler: Send + Sync {
    async fn handle_reply(&self, reply: WorkReply, subscription: Arc<Subscription>) -> Result<()>;
}

/// Posts the reply text back into the channel the work originated from.
/// Clean results are posted only where verbose mode is on.
#[derive(Clone, Copy, Debug, Default)]
pub struct PostReply;

#[async_trait]
impl ReplyHandler for PostReply {
    async fn handle_reply(&self, reply: WorkReply, subscription: Arc<Subscription>) -> Result<()> {
        if reply.text.trim().is_empty() {
            return Ok(());
        }
        let channel = &reply.context.channel;
        if reply.clean && !subscription.configuration.is_verbose(channel) {
            debug!(%channel, "clean result in quiet channel, not posting");
            return Ok(());
        }
        subscription
            .client
            .post_message(&reply.context.channel, &reply.text)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DispatchContext;
    use crate::memory::MemoryChatClients;
    use chrono::Utc;

    fn subscription(chat: &MemoryChatClients) -> Arc<Subscription> {
        let tenant = Tenant {
            id: TenantId::new("1"),
            external_id: TeamId::new("T1"),
            name: "team 1".to_string(),
            bot_token: "xoxb-1".to_string(),
            bot_user_id: UserId::new("UBOT"),
            vt_key: None,
            xfe_key: None,
            xfe_pass: None,
        };
        let mut configuration = TenantConfiguration::new(tenant.id.clone());
        configuration.join(ChannelId::new("CLOUD"));
        configuration.set_verbose(&ChannelId::new("CLOUD"), Some(true));
        configuration.join(ChannelId::new("CQUIET"));
        Arc::new(Subscription {
            client: chat.client_for(&tenant),
            tenant,
            configuration,
            loaded_at: Utc::now(),
        })
    }

    fn reply(channel: &str, text: &str, clean: bool) -> WorkReply {
        WorkReply {
            context: DispatchContext {
                team: TeamId::new("T1"),
                user: UserId::new("U1"),
                original_user: UserId::new("U1"),
                channel: ChannelId::new(channel),
                kind: "message".to_string(),
            },
            text: text.to_string(),
            clean,
        }
    }

    #[tokio::test]
    async fn clean_results_only_reach_verbose_channels() {
        let chat = MemoryChatClients::default();
        let sub = subscription(&chat);

        PostReply
            .handle_reply(reply("CQUIET", "8.8.8.8 is clean", true), sub.clone())
            .await
            .unwrap();
        PostReply
            .handle_reply(reply("CLOUD", "8.8.8.8 is clean", true), sub.clone())
            .await
            .unwrap();

        let posts = chat.posts().await;
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].channel, ChannelId::new("CLOUD"));
    }

    #[tokio::test]
    async fn findings_are_posted_everywhere() {
        let chat = MemoryChatClients::default();
        let sub = subscription(&chat);

        PostReply
            .handle_reply(reply("CQUIET", "1.2.3.4 is a known C2", false), sub.clone())
            .await
            .unwrap();
        PostReply
            .handle_reply(reply("CQUIET", "  ", false), sub)
            .await
            .unwrap();

        let posts = chat.posts().await;
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].text, "1.2.3.4 is a known C2");
    }

    #[test]
    fn replies_without_verdict_are_findings() {
        let reply: WorkReply = serde_json::from_value(serde_json::json!({
            "context": {
                "team": "T1",
                "user": "U1",
                "original_user": "U1",
                "channel": "C1",
                "type": "message"
            },
            "text": "done"
        }))
        .unwrap();
        assert!(!reply.clean);
    }
}
