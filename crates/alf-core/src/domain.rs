use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Platform-assigned team (workspace) id, e.g. `T024BE7LD`.
    TeamId
);
string_id!(
    /// Repository-assigned tenant id.
    TenantId
);
string_id!(
    /// Platform user id.
    UserId
);
string_id!(
    /// Platform channel, group or direct-message id.
    ChannelId
);

/// Direct-message channel ids start with this marker.
pub const DIRECT_MESSAGE_MARKER: char = 'D';

impl ChannelId {
    pub fn is_direct_message(&self) -> bool {
        self.0.starts_with(DIRECT_MESSAGE_MARKER)
    }
}

/// One onboarded team.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub external_id: TeamId,
    #[serde(default)]
    pub name: String,
    pub bot_token: String,
    pub bot_user_id: UserId,
    #[serde(default)]
    pub vt_key: Option<String>,
    #[serde(default)]
    pub xfe_key: Option<String>,
    #[serde(default)]
    pub xfe_pass: Option<String>,
}

impl Tenant {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            bot_token: self.bot_token.clone(),
            vt_key: self.vt_key.clone(),
            xfe_key: self.xfe_key.clone(),
            xfe_pass: self.xfe_pass.clone(),
        }
    }
}

/// Credential bundle handed to the enrichment workers.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub bot_token: String,
    pub vt_key: Option<String>,
    pub xfe_key: Option<String>,
    pub xfe_pass: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("bot_token", &"<redacted>")
            .field("vt_key", &self.vt_key.as_ref().map(|_| "<redacted>"))
            .field("xfe_key", &self.xfe_key.as_ref().map(|_| "<redacted>"))
            .field("xfe_pass", &self.xfe_pass.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub verbose: bool,
}

/// Channels and groups a tenant asked us to watch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConfiguration {
    pub tenant: TenantId,
    #[serde(default)]
    pub channels: BTreeMap<ChannelId, ChannelSettings>,
}

impl TenantConfiguration {
    pub fn new(tenant: TenantId) -> Self {
        Self {
            tenant,
            channels: BTreeMap::new(),
        }
    }

    pub fn is_monitored(&self, channel: &ChannelId) -> bool {
        self.channels.contains_key(channel)
    }

    pub fn is_verbose(&self, channel: &ChannelId) -> bool {
        self.channels.get(channel).map(|c| c.verbose).unwrap_or(false)
    }

    /// Returns `true` if the channel was not monitored before.
    pub fn join(&mut self, channel: ChannelId) -> bool {
        if self.channels.contains_key(&channel) {
            return false;
        }
        self.channels.insert(channel, ChannelSettings::default());
        true
    }

    /// Set (or toggle, when `value` is `None`) the verbosity of a monitored
    /// channel. Returns the new flag, or `None` if the channel is not monitored.
    pub fn set_verbose(&mut self, channel: &ChannelId, value: Option<bool>) -> Option<bool> {
        let settings = self.channels.get_mut(channel)?;
        settings.verbose = value.unwrap_or(!settings.verbose);
        Some(settings.verbose)
    }
}

/// A user known to the repository.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub tenant: TenantId,
    #[serde(default)]
    pub name: String,
}

/// Per-tenant message counter between flush cycles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantStatistics {
    pub tenant: TenantId,
    pub messages: u64,
}

/// The `event` object of an inbound platform callback.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventBody {
    pub kind: String,
    pub subtype: String,
    pub user: UserId,
    pub text: String,
    pub channel: ChannelId,
}

/// An inbound platform event, consumed once.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawEvent {
    pub team_id: Option<TeamId>,
    pub event: EventBody,
    pub raw: Value,
}

impl RawEvent {
    /// Parse an event callback envelope (`{"team_id": .., "event": {..}}`).
    ///
    /// Missing fields become empty strings; an empty team id becomes `None`.
    pub fn from_json(raw: Value) -> Result<Self> {
        if !raw.is_object() {
            return Err(Error::External(
                "event envelope is not a JSON object".to_string(),
            ));
        }

        let team_id = raw
            .get("team_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(TeamId::new);

        let body = raw.get("event").cloned().unwrap_or(Value::Null);
        let event = EventBody {
            kind: str_field(&body, "type"),
            subtype: str_field(&body, "subtype"),
            user: UserId(str_field(&body, "user")),
            text: str_field(&body, "text"),
            channel: ChannelId(str_field(&body, "channel")),
        };

        Ok(Self {
            team_id,
            event,
            raw,
        })
    }

    /// The nested `event` object, or `Null`.
    pub fn event_json(&self) -> &Value {
        self.raw.get("event").unwrap_or(&Value::Null)
    }
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Routing context carried with a work item and echoed back in its reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchContext {
    pub team: TeamId,
    pub user: UserId,
    pub original_user: UserId,
    pub channel: ChannelId,
    #[serde(rename = "type")]
    pub kind: String,
}

/// The part of the event the enrichment workers look at.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkPayload {
    pub text: String,
    #[serde(default)]
    pub files: Vec<Value>,
    pub event: Value,
}

impl WorkPayload {
    pub fn from_event(event: &RawEvent) -> Self {
        let body = event.event_json();
        let mut files: Vec<Value> = body
            .get("files")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if let Some(file) = body.get("file").filter(|f| f.is_object()) {
            files.push(file.clone());
        }

        Self {
            text: event.event.text.clone(),
            files,
            event: body.clone(),
        }
    }
}

/// Unit of work handed to the queue for asynchronous enrichment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub credentials: Credentials,
    pub reply_destination: String,
    pub context: DispatchContext,
    pub payload: WorkPayload,
}

/// Enrichment result routed back to the process that dispatched the work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkReply {
    pub context: DispatchContext,
    pub text: String,
    /// Nothing malicious was found. Clean results are only posted to
    /// verbose channels.
    #[serde(default)]
    pub clean: bool,
}

/// Cached runtime state for one tenant.
pub struct Subscription {
    pub tenant: Tenant,
    pub configuration: TenantConfiguration,
    pub client: std::sync::Arc<dyn crate::ports::ChatClient>,
    pub loaded_at: DateTime<Utc>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("team", &self.tenant.external_id)
            .field("tenant", &self.tenant.id)
            .field("channels", &self.configuration.channels.len())
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_event_envelope() {
        let ev = RawEvent::from_json(json!({
            "team_id": "T1",
            "event": {"type": "message", "user": "U1", "text": "hi", "channel": "C1", "subtype": null}
        }))
        .unwrap();
        assert_eq!(ev.team_id, Some(TeamId::new("T1")));
        assert_eq!(ev.event.kind, "message");
        assert_eq!(ev.event.subtype, "");
        assert_eq!(ev.event.channel, ChannelId::new("C1"));
    }

    #[test]
    fn empty_team_id_is_missing() {
        let ev = RawEvent::from_json(json!({"team_id": "", "event": {}})).unwrap();
        assert!(ev.team_id.is_none());
        assert!(RawEvent::from_json(json!("nope")).is_err());
    }

    #[test]
    fn payload_collects_files() {
        let ev = RawEvent::from_json(json!({
            "team_id": "T1",
            "event": {"type": "message", "subtype": "file_share", "files": [{"id": "F1"}], "file": {"id": "F2"}}
        }))
        .unwrap();
        let payload = WorkPayload::from_event(&ev);
        assert_eq!(payload.files.len(), 2);
        assert_eq!(payload.text, "");
    }

    #[test]
    fn verbose_toggles_only_monitored_channels() {
        let mut cfg = TenantConfiguration::new(TenantId::new("1"));
        let c = ChannelId::new("C1");
        assert_eq!(cfg.set_verbose(&c, None), None);
        assert!(cfg.join(c.clone()));
        assert!(!cfg.join(c.clone()));
        assert_eq!(cfg.set_verbose(&c, None), Some(true));
        assert_eq!(cfg.set_verbose(&c, None), Some(false));
        assert_eq!(cfg.set_verbose(&c, Some(true)), Some(true));
        assert!(cfg.is_verbose(&c));
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials {
            bot_token: "xoxb-secret".to_string(),
            vt_key: Some("vt".to_string()),
            xfe_key: None,
            xfe_pass: None,
        };
        let out = format!("{creds:?}");
        assert!(!out.contains("xoxb-secret"));
        assert!(!out.contains("\"vt\""));
    }
}
