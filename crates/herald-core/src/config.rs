//! Bot and channel configuration records
//!
//! These are the persisted settings a provider is built from. The connection
//! string is opaque here; only the adapter for the matching protocol parses it.

use crate::error::ChatError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Which wire protocol a bot speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatProviderKind {
    Irc,
    Discord,
}

impl FromStr for ChatProviderKind {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "irc" => Ok(Self::Irc),
            "discord" => Ok(Self::Discord),
            other => Err(ChatError::config(format!("unknown chat provider '{}'", other))),
        }
    }
}

impl std::fmt::Display for ChatProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Irc => write!(f, "irc"),
            Self::Discord => write!(f, "discord"),
        }
    }
}

/// A single configured chat bot
#[derive(Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub name: String,
    /// Protocol tag, parsed by the provider factory
    pub provider: String,
    pub connection_string: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_reconnection_interval")]
    pub reconnection_interval_minutes: u32,
    /// Maximum number of channels this bot may map
    #[serde(default)]
    pub channel_limit: Option<usize>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

fn default_enabled() -> bool {
    true
}

fn default_reconnection_interval() -> u32 {
    5
}

impl std::fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotConfig")
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("connection_string", &"***")
            .field("enabled", &self.enabled)
            .field(
                "reconnection_interval_minutes",
                &self.reconnection_interval_minutes,
            )
            .field("channel_limit", &self.channel_limit)
            .field("channels", &self.channels)
            .finish()
    }
}

impl BotConfig {
    /// Channels this bot should map, truncated to the configured limit
    pub fn limited_channels(&self) -> &[ChannelConfig] {
        match self.channel_limit {
            Some(limit) if limit < self.channels.len() => &self.channels[..limit],
            _ => &self.channels,
        }
    }
}

/// A channel a bot should be present in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// IRC channel name, optionally followed by `;key` for keyed channels
    #[serde(default)]
    pub irc_channel: Option<String>,
    /// Discord channel snowflake; `0` selects every unmapped text channel
    #[serde(default)]
    pub discord_channel_id: Option<u64>,
    #[serde(default)]
    pub is_admin_channel: bool,
    /// Receives deployment notices
    #[serde(default)]
    pub is_update_channel: bool,
    #[serde(default)]
    pub tag: Option<String>,
}

impl ChannelConfig {
    /// Split an IRC channel entry into its name and optional join key
    pub fn irc_name_and_key(&self) -> Option<(&str, Option<&str>)> {
        let raw = self.irc_channel.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        Some(match raw.split_once(';') {
            Some((name, key)) if !key.is_empty() => (name, Some(key)),
            Some((name, _)) => (name, None),
            None => (raw, None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_from_str() {
        assert_eq!("irc".parse::<ChatProviderKind>().unwrap(), ChatProviderKind::Irc);
        assert_eq!(
            " Discord ".parse::<ChatProviderKind>().unwrap(),
            ChatProviderKind::Discord
        );
        let err = "slack".parse::<ChatProviderKind>().unwrap_err();
        assert!(matches!(err, ChatError::Config { .. }));
    }

    #[test]
    fn test_irc_name_and_key() {
        let plain = ChannelConfig {
            irc_channel: Some("#ops".to_string()),
            ..Default::default()
        };
        assert_eq!(plain.irc_name_and_key(), Some(("#ops", None)));

        let keyed = ChannelConfig {
            irc_channel: Some("#secret;hunter2".to_string()),
            ..Default::default()
        };
        assert_eq!(keyed.irc_name_and_key(), Some(("#secret", Some("hunter2"))));

        let empty = ChannelConfig::default();
        assert_eq!(empty.irc_name_and_key(), None);
    }

    #[test]
    fn test_bot_config_defaults() {
        let bot: BotConfig = serde_json::from_str(
            r#"{"name":"ops","provider":"irc","connection_string":"irc.example.org;6667;herald;false"}"#,
        )
        .unwrap();
        assert!(bot.enabled);
        assert_eq!(bot.reconnection_interval_minutes, 5);
        assert!(bot.channels.is_empty());
    }

    #[test]
    fn test_limited_channels() {
        let mut bot: BotConfig = serde_json::from_str(
            r#"{"name":"ops","provider":"irc","connection_string":"x"}"#,
        )
        .unwrap();
        bot.channels = vec![ChannelConfig::default(), ChannelConfig::default()];
        assert_eq!(bot.limited_channels().len(), 2);
        bot.channel_limit = Some(1);
        assert_eq!(bot.limited_channels().len(), 1);
    }

    #[test]
    fn test_debug_masks_connection_string() {
        let bot: BotConfig = serde_json::from_str(
            r#"{"name":"ops","provider":"discord","connection_string":"super-secret-token"}"#,
        )
        .unwrap();
        let rendered = format!("{:?}", bot);
        assert!(!rendered.contains("super-secret-token"));
    }
}
