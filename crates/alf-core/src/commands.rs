//! Direct-message commands: join, verbose, config, help and tool lookups.
//!
//! Handlers read and write the configuration through the repository and
//! announce the change on the queue; the cached subscription is left alone
//! and gets invalidated by the change listener.

use std::{collections::HashSet, sync::Arc};

use tracing::{info, warn};

use crate::{
    classify::Command,
    domain::{ChannelId, Subscription, TenantConfiguration, UserId},
    ports::{LookupTool, Repository, WorkQueue},
    Result,
};

/// Everything a command handler may touch.
pub struct CommandContext<'a> {
    pub repo: &'a dyn Repository,
    pub queue: &'a dyn WorkQueue,
    pub subscription: &'a Subscription,
    pub tools: &'a [Arc<dyn LookupTool>],
    pub user: &'a UserId,
    pub channel: &'a ChannelId,
}

/// Run a command and post the answer into the originating DM. Handler
/// failures are answered there too; only a failed post is returned.
pub async fn run(ctx: &CommandContext<'_>, command: &Command, text: &str) -> Result<()> {
    let reply = match command {
        Command::Join => join(ctx, text).await,
        Command::Verbose => verbose(ctx, text).await,
        Command::ShowConfig => show_config(ctx).await,
        Command::Help => Ok(help_text(ctx.tools)),
        Command::Lookup { tool } => Ok(lookup(ctx, tool, text).await),
    };
    let reply = reply.unwrap_or_else(|e| {
        warn!(team = %ctx.subscription.tenant.external_id, ?command, error = %e, "command failed");
        format!("Sorry, that did not work: {e}")
    });
    ctx.subscription.client.post_message(ctx.channel, &reply).await
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ChannelRef {
    Id(ChannelId),
    Name(String),
}

/// Everything after the command word.
fn arguments(text: &str) -> &str {
    text.trim()
        .split_once(char::is_whitespace)
        .map(|(_, rest)| rest.trim())
        .unwrap_or("")
}

/// Parse `<#C123|name>`, `<#C123>`, `#name` and bare names, separated by
/// commas and/or whitespace.
fn parse_channel_refs(args: &str) -> Vec<ChannelRef> {
    args.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter_map(|token| {
            if let Some(inner) = token.strip_prefix("<#").and_then(|t| t.strip_suffix('>')) {
                let id = inner.split('|').next().unwrap_or("").trim();
                return (!id.is_empty()).then(|| ChannelRef::Id(ChannelId::new(id)));
            }
            let name = token.trim_start_matches('#');
            (!name.is_empty()).then(|| ChannelRef::Name(name.to_lowercase()))
        })
        .collect()
}

/// Resolve names through the platform. Returns (ids, unknown names); ids
/// are unique, in first-mention order.
async fn resolve(
    ctx: &CommandContext<'_>,
    refs: Vec<ChannelRef>,
) -> Result<(Vec<ChannelId>, Vec<String>)> {
    let mut ids = Vec::new();
    let mut unknown = Vec::new();
    for r in refs {
        match r {
            ChannelRef::Id(id) => ids.push(id),
            ChannelRef::Name(name) => {
                match ctx.subscription.client.resolve_channel(&name).await? {
                    Some(id) => ids.push(id),
                    None => unknown.push(name),
                }
            }
        }
    }
    let mut seen = HashSet::new();
    ids.retain(|id| seen.insert(id.clone()));
    Ok((ids, unknown))
}

async fn persist(ctx: &CommandContext<'_>, configuration: &TenantConfiguration) -> Result<()> {
    ctx.repo.save_configuration(configuration).await?;
    let team = &ctx.subscription.tenant.external_id;
    if let Err(e) = ctx.queue.push_config_change(team).await {
        warn!(%team, error = %e, "unable to announce configuration change");
    }
    Ok(())
}

fn mention(channel: &ChannelId) -> String {
    format!("<#{channel}>")
}

fn mentions(channels: &[ChannelId]) -> String {
    channels.iter().map(mention).collect::<Vec<_>>().join(", ")
}

fn unknown_line(unknown: &[String]) -> Option<String> {
    if unknown.is_empty() {
        return None;
    }
    let names = unknown
        .iter()
        .map(|n| format!("#{n}"))
        .collect::<Vec<_>>()
        .join(", ");
    Some(format!("I could not find {names}."))
}

async fn join(ctx: &CommandContext<'_>, text: &str) -> Result<String> {
    let refs = parse_channel_refs(arguments(text));
    if refs.is_empty() {
        return Ok("Usage: `join #channel [#channel ...]`".to_string());
    }

    let (ids, unknown) = resolve(ctx, refs).await?;
    let tenant = &ctx.subscription.tenant;
    let mut configuration = ctx.repo.configuration_for(&tenant.id).await?;
    let mut added = Vec::new();
    let mut already = Vec::new();
    for id in ids {
        if configuration.join(id.clone()) {
            added.push(id);
        } else {
            already.push(id);
        }
    }

    if !added.is_empty() {
        persist(ctx, &configuration).await?;
        info!(team = %tenant.external_id, user = %ctx.user, added = added.len(), "channels joined");
    }

    let mut lines = Vec::new();
    if !added.is_empty() {
        lines.push(format!("Now monitoring {}.", mentions(&added)));
    }
    if !already.is_empty() {
        lines.push(format!("Already monitoring {}.", mentions(&already)));
    }
    lines.extend(unknown_line(&unknown));
    Ok(lines.join("\n"))
}

async fn verbose(ctx: &CommandContext<'_>, text: &str) -> Result<String> {
    let args = arguments(text);
    let (value, rest) = match args.split_once(char::is_whitespace) {
        Some((first, rest)) if first.eq_ignore_ascii_case("on") => (Some(true), rest),
        Some((first, rest)) if first.eq_ignore_ascii_case("off") => (Some(false), rest),
        _ => (None, args),
    };

    let refs = parse_channel_refs(rest);
    if refs.is_empty() {
        return Ok("Usage: `verbose [on|off] #channel [#channel ...]`".to_string());
    }

    let (ids, unknown) = resolve(ctx, refs).await?;
    let tenant = &ctx.subscription.tenant;
    let mut configuration = ctx.repo.configuration_for(&tenant.id).await?;
    let mut on = Vec::new();
    let mut off = Vec::new();
    let mut unmonitored = Vec::new();
    for id in ids {
        match configuration.set_verbose(&id, value) {
            Some(true) => on.push(id),
            Some(false) => off.push(id),
            None => unmonitored.push(id),
        }
    }

    if !on.is_empty() || !off.is_empty() {
        persist(ctx, &configuration).await?;
    }

    let mut lines = Vec::new();
    if !on.is_empty() {
        lines.push(format!("Verbose mode is on for {}.", mentions(&on)));
    }
    if !off.is_empty() {
        lines.push(format!("Verbose mode is off for {}.", mentions(&off)));
    }
    if !unmonitored.is_empty() {
        lines.push(format!(
            "I am not monitoring {}. Use `join` first.",
            mentions(&unmonitored)
        ));
    }
    lines.extend(unknown_line(&unknown));
    Ok(lines.join("\n"))
}

async fn show_config(ctx: &CommandContext<'_>) -> Result<String> {
    let name = match ctx.repo.user_by_id(ctx.user).await {
        Ok(Some(user)) if !user.name.is_empty() => user.name,
        Ok(_) => format!("<@{}>", ctx.user),
        Err(e) => {
            warn!(user = %ctx.user, error = %e, "unable to load user");
            format!("<@{}>", ctx.user)
        }
    };

    let configuration = ctx
        .repo
        .configuration_for(&ctx.subscription.tenant.id)
        .await?;
    Ok(render_configuration(&name, &configuration))
}

fn render_configuration(name: &str, configuration: &TenantConfiguration) -> String {
    if configuration.channels.is_empty() {
        return format!(
            "Hi {name}, I am not monitoring any channels yet. Use `join #channel` to add one."
        );
    }

    let mut out = format!("Hi {name}, I am monitoring:");
    for (channel, settings) in &configuration.channels {
        out.push_str(&format!("\n• {}", mention(channel)));
        if settings.verbose {
            out.push_str(" (verbose)");
        }
    }
    out
}

pub fn help_text(tools: &[Arc<dyn LookupTool>]) -> String {
    let mut out = String::from(
        "I watch the channels you pick and look up links, IPs, hashes and files posted there.\n\
         • `join #channel [#channel ...]` start monitoring channels\n\
         • `verbose [on|off] #channel` report clean results too (no on/off toggles)\n\
         • `config` show what I am monitoring\n\
         • `help` or `?` this message",
    );
    for tool in tools {
        out.push_str(&format!(
            "\n• `{} <ip|url|hash>` look it up right here",
            tool.prefix()
        ));
    }
    out
}

async fn lookup(ctx: &CommandContext<'_>, tool: &str, text: &str) -> String {
    let Some(t) = ctx.tools.iter().find(|t| t.prefix().eq_ignore_ascii_case(tool)) else {
        return format!("Lookup tool `{tool}` is not available.");
    };

    let query = arguments(text);
    if query.is_empty() {
        return format!("Usage: `{} <ip|url|hash>`", t.prefix());
    }

    match t.lookup(&ctx.subscription.tenant, query).await {
        Ok(answer) => answer,
        Err(e) => {
            warn!(tool, team = %ctx.subscription.tenant.external_id, error = %e, "lookup failed");
            format!("Lookup with `{}` failed: {e}", t.prefix())
        }
    }
}
