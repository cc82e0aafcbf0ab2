use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    domain::{Subscription, TeamId, Tenant},
    ports::{ChatClientFactory, Repository},
    Result,
};

/// Lazily populated per-team state, keyed by the platform team id.
///
/// The lock only guards the map. Repository fetches happen outside of it, so
/// concurrent misses for one team may both fetch; the last insert wins.
pub struct SubscriptionCache {
    repo: Arc<dyn Repository>,
    clients: Arc<dyn ChatClientFactory>,
    entries: RwLock<HashMap<TeamId, Arc<Subscription>>>,
}

impl SubscriptionCache {
    pub fn new(repo: Arc<dyn Repository>, clients: Arc<dyn ChatClientFactory>) -> Self {
        Self {
            repo,
            clients,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cached entry, or fetch + install on miss.
    pub async fn get(&self, team: &TeamId) -> Result<Arc<Subscription>> {
        if let Some(sub) = self.cached(team).await {
            return Ok(sub);
        }

        debug!(%team, "subscription miss, loading from repository");
        let tenant = self.repo.tenant_by_external_id(team).await?;
        let sub = self.build(tenant).await?;
        self.install(team.clone(), sub.clone()).await;
        Ok(sub)
    }

    pub async fn cached(&self, team: &TeamId) -> Option<Arc<Subscription>> {
        self.entries.read().await.get(team).cloned()
    }

    /// Drop the entry; the next `get` reloads from the repository.
    pub async fn invalidate(&self, team: &TeamId) -> bool {
        let removed = self.entries.write().await.remove(team).is_some();
        debug!(%team, removed, "subscription invalidated");
        removed
    }

    /// Populate the cache for every known tenant. A tenant whose configuration
    /// fails to load is skipped. Returns the number of entries installed.
    pub async fn load_all(&self) -> Result<usize> {
        let tenants = self.repo.list_tenants().await?;
        let total = tenants.len();
        let mut loaded = 0usize;

        for tenant in tenants {
            let team = tenant.external_id.clone();
            match self.build(tenant).await {
                Ok(sub) => {
                    self.install(team, sub).await;
                    loaded += 1;
                }
                Err(e) => {
                    warn!(%team, error = %e, "failed to load team configuration, skipping");
                }
            }
        }

        info!(loaded, total, "subscriptions loaded");
        Ok(loaded)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn build(&self, tenant: Tenant) -> Result<Arc<Subscription>> {
        let configuration = self.repo.configuration_for(&tenant.id).await?;
        let client = self.clients.client_for(&tenant);
        Ok(Arc::new(Subscription {
            tenant,
            configuration,
            client,
            loaded_at: Utc::now(),
        }))
    }

    async fn install(&self, team: TeamId, sub: Arc<Subscription>) {
        self.entries.write().await.insert(team, sub);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TenantConfiguration, TenantId, UserId};
    use crate::memory::{MemoryChatClients, MemoryRepository};

    fn tenant(n: u32) -> Tenant {
        Tenant {
            id: TenantId::new(format!("{n}")),
            external_id: TeamId::new(format!("T{n}")),
            name: format!("team {n}"),
            bot_token: format!("xoxb-{n}"),
            bot_user_id: UserId::new(format!("UBOT{n}")),
            vt_key: None,
            xfe_key: None,
            xfe_pass: None,
        }
    }

    fn cache(repo: &Arc<MemoryRepository>) -> SubscriptionCache {
        SubscriptionCache::new(repo.clone(), Arc::new(MemoryChatClients::default()))
    }

    #[tokio::test]
    async fn miss_fetches_once_then_hits() {
        let repo = Arc::new(MemoryRepository::default());
        repo.add_tenant(tenant(1)).await;
        let cache = cache(&repo);

        let a = cache.get(&TeamId::new("T1")).await.unwrap();
        let b = cache.get(&TeamId::new("T1")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(repo.tenant_fetches().await, 1);
        assert_eq!(a.tenant.external_id, TeamId::new("T1"));
    }

    #[tokio::test]
    async fn unknown_team_is_an_error_and_not_cached() {
        let repo = Arc::new(MemoryRepository::default());
        let cache = cache(&repo);
        assert!(cache.get(&TeamId::new("T9")).await.is_err());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_fetch() {
        let repo = Arc::new(MemoryRepository::default());
        repo.add_tenant(tenant(1)).await;
        let cache = cache(&repo);
        let team = TeamId::new("T1");

        let before = cache.get(&team).await.unwrap();
        assert!(before.configuration.channels.is_empty());

        let mut cfg = TenantConfiguration::new(TenantId::new("1"));
        cfg.join("C1".into());
        repo.set_configuration(cfg).await;

        assert!(cache.invalidate(&team).await);
        let after = cache.get(&team).await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.configuration.channels.len(), 1);
        assert_eq!(repo.tenant_fetches().await, 2);
    }

    #[tokio::test]
    async fn load_all_skips_broken_tenants() {
        let repo = Arc::new(MemoryRepository::default());
        repo.add_tenant(tenant(1)).await;
        repo.add_tenant(tenant(2)).await;
        repo.fail_configuration_for(TenantId::new("2")).await;
        let cache = cache(&repo);

        assert_eq!(cache.load_all().await.unwrap(), 1);
        assert!(cache.cached(&TeamId::new("T1")).await.is_some());
        assert!(cache.cached(&TeamId::new("T2")).await.is_none());
    }
}
