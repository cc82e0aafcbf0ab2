//! Per-event routing decision.

use crate::{
    domain::{EventBody, RawEvent, Subscription, UserId},
    triggers::TriggerSet,
};

pub const MESSAGE_EVENT: &str = "message";
pub const FILE_SHARE_SUBTYPE: &str = "file_share";

/// A direct-message instruction to the bot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Join,
    Verbose,
    ShowConfig,
    Help,
    Lookup { tool: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Ignore,
    InternalCommand(Command),
    Trigger,
    Ordinary,
}

/// Pure classifier; knows the registered lookup-tool prefixes.
#[derive(Debug)]
pub struct Classifier {
    triggers: &'static TriggerSet,
    lookup_prefixes: Vec<String>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

impl Classifier {
    pub fn new<I, S>(lookup_prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lookup_prefixes = lookup_prefixes
            .into_iter()
            .map(|p| p.into().trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Self {
            triggers: TriggerSet::shared(),
            lookup_prefixes,
        }
    }

    pub fn lookup_prefixes(&self) -> &[String] {
        &self.lookup_prefixes
    }

    pub fn classify(&self, event: &RawEvent, subscription: &Subscription) -> Decision {
        self.classify_event(&event.event, &subscription.tenant.bot_user_id)
    }

    pub fn classify_event(&self, event: &EventBody, bot_user: &UserId) -> Decision {
        if event.kind != MESSAGE_EVENT {
            return Decision::Ignore;
        }
        // Never react to our own output.
        if &event.user == bot_user {
            return Decision::Ignore;
        }

        let lower = event.text.to_lowercase();

        // Commands win over trigger detection.
        if event.subtype.is_empty() && event.channel.is_direct_message() {
            if let Some(cmd) = self.command_for(&lower) {
                return Decision::InternalCommand(cmd);
            }
        }

        if event.subtype == FILE_SHARE_SUBTYPE {
            return Decision::Trigger;
        }

        if event.subtype.is_empty() && self.triggers.matches(&event.text) {
            return Decision::Trigger;
        }

        Decision::Ordinary
    }

    /// Match a lower-cased direct message against the command grammar.
    pub fn command_for(&self, lower: &str) -> Option<Command> {
        if lower.starts_with("join ") {
            return Some(Command::Join);
        }
        if lower.starts_with("verbose ") {
            return Some(Command::Verbose);
        }
        if lower == "config" {
            return Some(Command::ShowConfig);
        }
        if lower == "?" || lower.starts_with("help") {
            return Some(Command::Help);
        }
        self.lookup_prefixes
            .iter()
            .find(|p| {
                lower
                    .strip_prefix(p.as_str())
                    .is_some_and(|rest| rest.starts_with(' '))
            })
            .map(|p| Command::Lookup { tool: p.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChannelId;

    const BOT: &str = "UBOT";
    const SHA1: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";
    const MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    fn msg(channel: &str, subtype: &str, text: &str) -> EventBody {
        EventBody {
            kind: MESSAGE_EVENT.to_string(),
            subtype: subtype.to_string(),
            user: UserId::new("U1"),
            text: text.to_string(),
            channel: ChannelId::new(channel),
        }
    }

    fn classifier() -> Classifier {
        Classifier::new(["vt", "XFE"])
    }

    fn decide(ev: &EventBody) -> Decision {
        classifier().classify_event(ev, &UserId::new(BOT))
    }

    #[test]
    fn non_message_events_are_ignored() {
        let mut ev = msg("C1", "", MD5);
        ev.kind = "reaction_added".to_string();
        assert_eq!(decide(&ev), Decision::Ignore);
    }

    #[test]
    fn own_messages_are_ignored() {
        let mut ev = msg("D1", "", "join #general");
        ev.user = UserId::new(BOT);
        assert_eq!(decide(&ev), Decision::Ignore);
        let mut ev = msg("C1", FILE_SHARE_SUBTYPE, "");
        ev.user = UserId::new(BOT);
        assert_eq!(decide(&ev), Decision::Ignore);
    }

    #[test]
    fn recognizes_direct_message_commands() {
        let cases = [
            ("join #general", Command::Join),
            ("JOIN #general", Command::Join),
            ("verbose on #alerts", Command::Verbose),
            ("config", Command::ShowConfig),
            ("?", Command::Help),
            ("help me", Command::Help),
            ("vt 8.8.8.8", Command::Lookup { tool: "vt".to_string() }),
            ("xfe 8.8.8.8", Command::Lookup { tool: "xfe".to_string() }),
        ];
        for (text, cmd) in cases {
            assert_eq!(
                decide(&msg("D1", "", text)),
                Decision::InternalCommand(cmd),
                "{text}"
            );
        }
    }

    #[test]
    fn command_precedence_over_trigger() {
        let ev = msg("D1", "", &format!("verbose #alerts {MD5}"));
        assert_eq!(decide(&ev), Decision::InternalCommand(Command::Verbose));
    }

    #[test]
    fn commands_only_in_direct_messages() {
        assert_eq!(decide(&msg("C1", "", "join #general")), Decision::Ordinary);
        assert_eq!(decide(&msg("C1", "", "config")), Decision::Ordinary);
        // A subtype disables command parsing, even in a DM.
        assert_eq!(decide(&msg("D1", "message_changed", "config")), Decision::Ordinary);
    }

    #[test]
    fn near_commands_fall_through() {
        assert_eq!(decide(&msg("D1", "", "configure")), Decision::Ordinary);
        assert_eq!(decide(&msg("D1", "", "vtx 1")), Decision::Ordinary);
        assert_eq!(decide(&msg("D1", "", "join")), Decision::Ordinary);
        assert_eq!(decide(&msg("D1", "", &format!("vtx {MD5}"))), Decision::Trigger);
    }

    #[test]
    fn triggers() {
        assert_eq!(decide(&msg("C1", "", &format!("look at {SHA1}"))), Decision::Trigger);
        assert_eq!(decide(&msg("C1", "", "from 10.1.2.3")), Decision::Trigger);
        assert_eq!(decide(&msg("C1", "", "see <https://x.io>")), Decision::Trigger);
        assert_eq!(decide(&msg("C1", FILE_SHARE_SUBTYPE, "")), Decision::Trigger);
        assert_eq!(decide(&msg("D1", FILE_SHARE_SUBTYPE, "config")), Decision::Trigger);
    }

    #[test]
    fn subtypes_other_than_file_share_are_ordinary() {
        assert_eq!(decide(&msg("C1", "message_changed", MD5)), Decision::Ordinary);
        assert_eq!(decide(&msg("C1", "", "just chatting")), Decision::Ordinary);
    }
}
