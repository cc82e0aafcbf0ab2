//! Local runner.
//!
//! Reads Slack event callbacks as newline-delimited JSON on stdin, routes them
//! through the bot and writes queued work items to stdout (one JSON object per
//! line) for the enrichment workers.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

use alf_core::{
    bot::Bot,
    config::Config,
    domain::RawEvent,
    memory::{MemoryChatClients, MemoryQueue, MemoryRepository},
    ports::ChatClientFactory,
};
use alf_slack::SlackClients;

const WORK_DRAIN_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    alf_core::logging::init("alf")?;

    let cfg = Arc::new(Config::load()?);
    let repo = Arc::new(
        MemoryRepository::load_seed(&cfg.tenants_file)
            .await
            .with_context(|| format!("load tenants from {}", cfg.tenants_file.display()))?,
    );
    let queue = Arc::new(MemoryQueue::default());
    let clients: Arc<dyn ChatClientFactory> = if cfg.dry_run {
        info!("dry run: chat messages are logged, not sent");
        Arc::new(MemoryChatClients::default())
    } else {
        Arc::new(SlackClients::new(
            cfg.slack_api_base.clone(),
            cfg.slack_http_timeout,
        )?)
    };

    let bot = Bot::builder(cfg.clone(), repo, queue.clone(), clients).build();
    let runner = Runner::new(bot.clone());

    let mut running = tokio::spawn({
        let bot = bot.clone();
        async move { bot.start().await }
    });
    let drain_stop = CancellationToken::new();
    let drain = tokio::spawn(drain_work(
        queue.clone(),
        tokio::io::stdout(),
        drain_stop.clone(),
    ));

    let mut ingress = Ok(());
    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, stopping");
            None
        }
        res = read_events(&runner) => {
            ingress = res;
            info!("stdin closed, stopping");
            None
        }
        res = &mut running => Some(res),
    };

    runner.wind_down().await;
    let outcome = match finished {
        Some(res) => res,
        None => running.await,
    };
    queue.close().await;
    drain_stop.cancel();
    drain.await.context("work drain task panicked")??;

    outcome.context("bot task panicked")??;
    ingress
}

/// Hands events to the bot and keeps track of the tasks handling them.
struct Runner {
    bot: Bot,
    events: TaskTracker,
}

impl Runner {
    fn new(bot: Bot) -> Self {
        Self {
            bot,
            events: TaskTracker::new(),
        }
    }

    fn ingest(&self, event: RawEvent) {
        let bot = self.bot.clone();
        self.events.spawn(async move { bot.handle_message(event).await });
    }

    /// Wait for every ingested event to be handled, then stop the bot.
    async fn wind_down(&self) {
        self.events.close();
        self.events.wait().await;
        self.bot.stop();
    }
}

async fn read_events(runner: &Runner) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str::<serde_json::Value>(&line)
            .map_err(alf_core::Error::from)
            .and_then(RawEvent::from_json);
        match event {
            Ok(event) => runner.ingest(event),
            Err(e) => warn!(error = %e, "skipping unreadable event"),
        }
    }
    Ok(())
}

/// Periodically write queued work to `out`. On `stop` the remaining work
/// is written before returning.
async fn drain_work<W>(
    queue: Arc<MemoryQueue>,
    mut out: W,
    stop: CancellationToken,
) -> anyhow::Result<W>
where
    W: AsyncWrite + Unpin,
{
    let mut tick = tokio::time::interval(WORK_DRAIN_INTERVAL);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tick.tick() => {
                if let Err(e) = write_work(&queue, &mut out).await {
                    warn!(error = %e, "unable to write work items");
                }
            }
        }
    }
    write_work(&queue, &mut out).await?;
    Ok(out)
}

async fn write_work<W>(queue: &MemoryQueue, out: &mut W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let items = queue.take_work().await;
    if items.is_empty() {
        return Ok(());
    }
    for item in items {
        let mut line = serde_json::to_vec(&item)?;
        line.push(b'\n');
        out.write_all(&line).await?;
    }
    out.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alf_core::domain::{TeamId, Tenant, TenantId, UserId, WorkItem};
    use serde_json::json;

    async fn setup() -> (Bot, Arc<MemoryQueue>) {
        let repo = Arc::new(MemoryRepository::default());
        repo.add_tenant(Tenant {
            id: TenantId::new("1"),
            external_id: TeamId::new("T1"),
            name: "acme".to_string(),
            bot_token: "xoxb-1".to_string(),
            bot_user_id: UserId::new("UBOT"),
            vt_key: None,
            xfe_key: None,
            xfe_pass: None,
        })
        .await;
        let queue = Arc::new(MemoryQueue::default());
        let bot = Bot::builder(
            Arc::new(Config::default()),
            repo,
            queue.clone(),
            Arc::new(MemoryChatClients::default()),
        )
        .build();
        (bot, queue)
    }

    fn file_share(n: usize) -> RawEvent {
        RawEvent::from_json(json!({
            "team_id": "T1",
            "event": {
                "type": "message",
                "subtype": "file_share",
                "user": "U1",
                "channel": format!("C{n}"),
                "text": "",
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn wind_down_waits_for_ingested_events() {
        let (bot, queue) = setup().await;
        let runner = Runner::new(bot.clone());
        for n in 0..20 {
            runner.ingest(file_share(n));
        }

        runner.wind_down().await;
        assert!(bot.is_stopped());
        queue.close().await;
        assert_eq!(queue.take_work().await.len(), 20);
    }

    #[tokio::test]
    async fn drain_writes_remaining_work_on_stop() {
        let (bot, queue) = setup().await;
        let stop = CancellationToken::new();
        stop.cancel();
        for n in 0..3 {
            bot.handle_message(file_share(n)).await;
        }

        let out = drain_work(queue.clone(), Vec::new(), stop).await.unwrap();
        let items: Vec<WorkItem> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[2].payload.event["channel"], "C2");
        assert!(queue.take_work().await.is_empty());
    }
}
