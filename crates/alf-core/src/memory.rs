//! In-process adapters for the ports.
//!
//! Used by the local runner (`alf` without Slack credentials) and by tests.
//! Failure switches let tests exercise the error paths of the bot.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    path::Path,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::info;

use crate::{
    domain::{
        ChannelId, TeamId, Tenant, TenantConfiguration, TenantId, TenantStatistics, User, UserId,
        WorkItem, WorkReply,
    },
    ports::{ChatClient, ChatClientFactory, Repository, WorkQueue},
    Error, Result,
};

// ============== Repository ==============

/// Seed file layout for [`MemoryRepository::load_seed`].
#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub tenants: Vec<Tenant>,
    #[serde(default)]
    pub configurations: Vec<TenantConfiguration>,
    #[serde(default)]
    pub users: Vec<User>,
}

#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<RepoState>,
}

#[derive(Default)]
struct RepoState {
    tenants: BTreeMap<TeamId, Tenant>,
    configurations: HashMap<TenantId, TenantConfiguration>,
    users: HashMap<UserId, User>,
    statistics: HashMap<TenantId, u64>,
    heartbeats: u64,
    tenant_fetches: usize,
    broken_configurations: HashSet<TenantId>,
    fail_statistics: bool,
    fail_heartbeat: bool,
}

impl MemoryRepository {
    pub fn from_seed(seed: Seed) -> Self {
        let state = RepoState {
            tenants: seed
                .tenants
                .into_iter()
                .map(|t| (t.external_id.clone(), t))
                .collect(),
            configurations: seed
                .configurations
                .into_iter()
                .map(|c| (c.tenant.clone(), c))
                .collect(),
            users: seed.users.into_iter().map(|u| (u.id.clone(), u)).collect(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn load_seed(path: &Path) -> Result<Self> {
        let txt = tokio::fs::read_to_string(path).await?;
        let seed: Seed = serde_json::from_str(&txt)?;
        Ok(Self::from_seed(seed))
    }

    pub async fn add_tenant(&self, tenant: Tenant) {
        let mut st = self.state.lock().await;
        st.tenants.insert(tenant.external_id.clone(), tenant);
    }

    pub async fn add_user(&self, user: User) {
        self.state.lock().await.users.insert(user.id.clone(), user);
    }

    pub async fn set_configuration(&self, configuration: TenantConfiguration) {
        let mut st = self.state.lock().await;
        st.configurations
            .insert(configuration.tenant.clone(), configuration);
    }

    pub async fn configuration(&self, tenant: &TenantId) -> Option<TenantConfiguration> {
        self.state.lock().await.configurations.get(tenant).cloned()
    }

    pub async fn fail_configuration_for(&self, tenant: TenantId) {
        self.state.lock().await.broken_configurations.insert(tenant);
    }

    pub async fn set_fail_statistics(&self, fail: bool) {
        self.state.lock().await.fail_statistics = fail;
    }

    pub async fn set_fail_heartbeat(&self, fail: bool) {
        self.state.lock().await.fail_heartbeat = fail;
    }

    /// Total messages persisted for a tenant so far.
    pub async fn stored_messages(&self, tenant: &TenantId) -> u64 {
        let st = self.state.lock().await;
        st.statistics.get(tenant).copied().unwrap_or(0)
    }

    pub async fn heartbeats(&self) -> u64 {
        self.state.lock().await.heartbeats
    }

    pub async fn tenant_fetches(&self) -> usize {
        self.state.lock().await.tenant_fetches
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        Ok(self.state.lock().await.tenants.values().cloned().collect())
    }

    async fn tenant_by_external_id(&self, team: &TeamId) -> Result<Tenant> {
        let mut st = self.state.lock().await;
        st.tenant_fetches += 1;
        st.tenants.get(team).cloned().ok_or_else(|| Error::NotFound {
            what: "team",
            id: team.to_string(),
        })
    }

    async fn configuration_for(&self, tenant: &TenantId) -> Result<TenantConfiguration> {
        let st = self.state.lock().await;
        if st.broken_configurations.contains(tenant) {
            return Err(Error::External(format!(
                "configuration for tenant {tenant} is unreadable"
            )));
        }
        Ok(st
            .configurations
            .get(tenant)
            .cloned()
            .unwrap_or_else(|| TenantConfiguration::new(tenant.clone())))
    }

    async fn save_configuration(&self, configuration: &TenantConfiguration) -> Result<()> {
        self.set_configuration(configuration.clone()).await;
        Ok(())
    }

    async fn record_heartbeat(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.fail_heartbeat {
            return Err(Error::External("heartbeat store unavailable".to_string()));
        }
        st.heartbeats += 1;
        Ok(())
    }

    async fn persist_statistics(&self, stats: &TenantStatistics) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.fail_statistics {
            return Err(Error::External("statistics store unavailable".to_string()));
        }
        *st.statistics.entry(stats.tenant.clone()).or_insert(0) += stats.messages;
        Ok(())
    }

    async fn user_by_id(&self, user: &UserId) -> Result<Option<User>> {
        Ok(self.state.lock().await.users.get(user).cloned())
    }
}

// ============== Queue ==============

/// Queue with bounded-wait pops. `close()` makes every pop fail with
/// [`Error::QueueClosed`] once its queue is drained.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Default)]
struct QueueState {
    work: VecDeque<WorkItem>,
    changes: VecDeque<TeamId>,
    replies: HashMap<String, VecDeque<WorkReply>>,
    closed: bool,
    fail_pushes: bool,
}

impl MemoryQueue {
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn set_fail_pushes(&self, fail: bool) {
        self.state.lock().await.fail_pushes = fail;
    }

    /// Deliver a reply to the process registered as `host`.
    pub async fn push_reply(&self, host: &str, reply: WorkReply) {
        let mut st = self.state.lock().await;
        st.replies.entry(host.to_string()).or_default().push_back(reply);
        drop(st);
        self.notify.notify_waiters();
    }

    /// Drain queued work items (what the enrichment workers would consume).
    pub async fn take_work(&self) -> Vec<WorkItem> {
        self.state.lock().await.work.drain(..).collect()
    }

    pub async fn pending_changes(&self) -> usize {
        self.state.lock().await.changes.len()
    }

    async fn pop_with<T, F>(&self, timeout: Duration, mut take: F) -> Result<Option<T>>
    where
        T: Send,
        F: FnMut(&mut QueueState) -> Option<T> + Send,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between check and wait is not missed.
            notified.as_mut().enable();

            {
                let mut st = self.state.lock().await;
                if let Some(v) = take(&mut *st) {
                    return Ok(Some(v));
                }
                if st.closed {
                    return Err(Error::QueueClosed);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn push_work(&self, item: &WorkItem) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.closed {
            return Err(Error::QueueClosed);
        }
        if st.fail_pushes {
            return Err(Error::External("work queue unavailable".to_string()));
        }
        st.work.push_back(item.clone());
        Ok(())
    }

    async fn push_config_change(&self, team: &TeamId) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.closed {
            return Err(Error::QueueClosed);
        }
        st.changes.push_back(team.clone());
        drop(st);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop_config_change(&self, timeout: Duration) -> Result<Option<TeamId>> {
        self.pop_with(timeout, |st| st.changes.pop_front()).await
    }

    async fn pop_reply(&self, host: &str, timeout: Duration) -> Result<Option<WorkReply>> {
        self.pop_with(timeout, |st| {
            st.replies.get_mut(host).and_then(|q| q.pop_front())
        })
        .await
    }
}

// ============== Chat ==============

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostedMessage {
    pub bot_token: String,
    pub channel: ChannelId,
    pub text: String,
}

/// Chat clients that record (and log) every post instead of calling a platform.
#[derive(Clone, Default)]
pub struct MemoryChatClients {
    posts: Arc<Mutex<Vec<PostedMessage>>>,
    directory: Arc<Mutex<HashMap<String, ChannelId>>>,
    fail_lookups: Arc<Mutex<bool>>,
}

impl MemoryChatClients {
    /// Make `#name` resolvable to `id`.
    pub async fn add_channel(&self, name: &str, id: ChannelId) {
        self.directory.lock().await.insert(name.to_lowercase(), id);
    }

    pub async fn posts(&self) -> Vec<PostedMessage> {
        self.posts.lock().await.clone()
    }

    pub async fn set_fail_lookups(&self, fail: bool) {
        *self.fail_lookups.lock().await = fail;
    }
}

impl ChatClientFactory for MemoryChatClients {
    fn client_for(&self, tenant: &Tenant) -> Arc<dyn ChatClient> {
        Arc::new(MemoryChatClient {
            bot_token: tenant.bot_token.clone(),
            shared: self.clone(),
        })
    }
}

struct MemoryChatClient {
    bot_token: String,
    shared: MemoryChatClients,
}

#[async_trait]
impl ChatClient for MemoryChatClient {
    async fn post_message(&self, channel: &ChannelId, text: &str) -> Result<()> {
        info!(%channel, "post: {text}");
        self.shared.posts.lock().await.push(PostedMessage {
            bot_token: self.bot_token.clone(),
            channel: channel.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn resolve_channel(&self, name: &str) -> Result<Option<ChannelId>> {
        if *self.shared.fail_lookups.lock().await {
            return Err(Error::External("channel directory unavailable".to_string()));
        }
        let dir = self.shared.directory.lock().await;
        Ok(dir.get(&name.to_lowercase()).cloned())
    }
}
