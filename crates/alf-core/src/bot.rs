//! The coordinating object: owns the subscription cache and statistics,
//! routes inbound events and runs the maintenance loops.

use std::sync::Arc;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    classify::{Classifier, Decision},
    commands::{self, CommandContext},
    config::Config,
    domain::{DispatchContext, RawEvent, Subscription, TeamId, WorkItem, WorkPayload, WorkReply},
    ports::{ChatClientFactory, LookupTool, PostReply, ReplyHandler, Repository, WorkQueue},
    stats::{FlushReport, StatsAggregator},
    subscriptions::SubscriptionCache,
    Result,
};

pub struct BotBuilder {
    cfg: Arc<Config>,
    repo: Arc<dyn Repository>,
    queue: Arc<dyn WorkQueue>,
    clients: Arc<dyn ChatClientFactory>,
    replies: Arc<dyn ReplyHandler>,
    tools: Vec<Arc<dyn LookupTool>>,
}

impl BotBuilder {
    pub fn lookup_tool(mut self, tool: Arc<dyn LookupTool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn reply_handler(mut self, replies: Arc<dyn ReplyHandler>) -> Self {
        self.replies = replies;
        self
    }

    pub fn build(self) -> Bot {
        let classifier = Classifier::new(self.tools.iter().map(|t| t.prefix().to_string()));
        Bot {
            inner: Arc::new(BotInner {
                subscriptions: SubscriptionCache::new(self.repo.clone(), self.clients),
                stats: StatsAggregator::new(),
                classifier,
                cfg: self.cfg,
                repo: self.repo,
                queue: self.queue,
                replies: self.replies,
                tools: self.tools,
                cancel: CancellationToken::new(),
            }),
        }
    }
}

#[derive(Clone)]
pub struct Bot {
    inner: Arc<BotInner>,
}

struct BotInner {
    cfg: Arc<Config>,
    repo: Arc<dyn Repository>,
    queue: Arc<dyn WorkQueue>,
    subscriptions: SubscriptionCache,
    stats: StatsAggregator,
    classifier: Classifier,
    replies: Arc<dyn ReplyHandler>,
    tools: Vec<Arc<dyn LookupTool>>,
    cancel: CancellationToken,
}

impl Bot {
    pub fn builder(
        cfg: Arc<Config>,
        repo: Arc<dyn Repository>,
        queue: Arc<dyn WorkQueue>,
        clients: Arc<dyn ChatClientFactory>,
    ) -> BotBuilder {
        BotBuilder {
            cfg,
            repo,
            queue,
            clients,
            replies: Arc::new(PostReply),
            tools: Vec::new(),
        }
    }

    pub fn subscriptions(&self) -> &SubscriptionCache {
        &self.inner.subscriptions
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.inner.stats
    }

    pub fn host_id(&self) -> &str {
        &self.inner.cfg.host_id
    }

    /// Route one inbound event. Never fails: every problem is logged and the
    /// event dropped.
    pub async fn handle_message(&self, event: RawEvent) {
        let Some(team) = event.team_id.clone() else {
            warn!(event = %event.raw, "got event without team id, dropping");
            return;
        };

        let sub = match self.inner.subscriptions.get(&team).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(%team, error = %e, "unable to load team subscription, dropping event");
                return;
            }
        };

        match self.inner.classifier.classify(&event, &sub) {
            Decision::Ignore => {}
            Decision::Trigger => self.dispatch(&team, &sub, &event).await,
            Decision::InternalCommand(command) => {
                let ctx = CommandContext {
                    repo: self.inner.repo.as_ref(),
                    queue: self.inner.queue.as_ref(),
                    subscription: &sub,
                    tools: &self.inner.tools,
                    user: &event.event.user,
                    channel: &event.event.channel,
                };
                if let Err(e) = commands::run(&ctx, &command, &event.event.text).await {
                    warn!(%team, ?command, error = %e, "unable to post command reply");
                }
            }
            Decision::Ordinary => self.inner.stats.increment(&sub.tenant.id).await,
        }
    }

    /// Push a work item for the event. At most once: a failed push is logged
    /// and the event dropped.
    async fn dispatch(&self, team: &TeamId, sub: &Subscription, event: &RawEvent) {
        let body = &event.event;
        let item = WorkItem {
            credentials: sub.tenant.credentials(),
            reply_destination: self.inner.cfg.host_id.clone(),
            context: DispatchContext {
                team: team.clone(),
                user: body.user.clone(),
                original_user: body.user.clone(),
                channel: body.channel.clone(),
                kind: body.kind.clone(),
            },
            payload: WorkPayload::from_event(event),
        };

        debug!(%team, channel = %body.channel, "pushing work item");
        if let Err(e) = self.inner.queue.push_work(&item).await {
            warn!(%team, context = ?item.context, error = %e, "unable to push work item");
        }
    }

    /// Heartbeat once, load every subscription, then run the maintenance
    /// loops until [`Bot::stop`] is called.
    pub async fn start(&self) -> Result<()> {
        self.inner.repo.record_heartbeat().await?;
        self.inner.subscriptions.load_all().await?;

        let changes = tokio::spawn(self.clone().watch_config_changes());
        let replies = tokio::spawn(self.clone().watch_replies());
        info!(host = %self.inner.cfg.host_id, "bot started");

        self.heartbeat_loop().await;

        for (name, handle) in [("config changes", changes), ("replies", replies)] {
            if let Err(e) = handle.await {
                error!(listener = name, error = %e, "listener task failed");
            }
        }
        info!("bot stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// One maintenance tick: heartbeat (non-fatal) and statistics flush.
    pub async fn tick(&self) -> FlushReport {
        if let Err(e) = self.inner.repo.record_heartbeat().await {
            error!(error = %e, "unable to update heartbeat");
        }
        self.inner.stats.flush(self.inner.repo.as_ref()).await
    }

    async fn heartbeat_loop(&self) {
        let period = self.inner.cfg.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        // Counts gathered since the last tick.
        let report = self.inner.stats.flush(self.inner.repo.as_ref()).await;
        debug!(?report, "final statistics flush");
    }

    async fn watch_config_changes(self) {
        let timeout = self.inner.cfg.queue_poll_timeout;
        loop {
            let popped = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                popped = self.inner.queue.pop_config_change(timeout) => popped,
            };
            match popped {
                Ok(Some(team)) if !team.is_empty() => {
                    debug!(%team, "configuration change received");
                    self.inner.subscriptions.invalidate(&team).await;
                }
                Ok(_) => {}
                Err(e) => {
                    info!(error = %e, "quitting monitoring of configuration changes");
                    break;
                }
            }
        }
    }

    async fn watch_replies(self) {
        let timeout = self.inner.cfg.queue_poll_timeout;
        loop {
            let popped = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                popped = self.inner.queue.pop_reply(&self.inner.cfg.host_id, timeout) => popped,
            };
            match popped {
                Ok(Some(reply)) => self.route_reply(reply).await,
                Ok(None) => {}
                Err(e) => {
                    info!(error = %e, "quitting monitoring of replies");
                    break;
                }
            }
        }
    }

    async fn route_reply(&self, reply: WorkReply) {
        let team = reply.context.team.clone();
        let sub = match self.inner.subscriptions.get(&team).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(%team, error = %e, "unable to load team for reply, dropping");
                return;
            }
        };
        if let Err(e) = self.inner.replies.handle_reply(reply, sub).await {
            warn!(%team, error = %e, "unable to handle reply");
        }
    }
}
