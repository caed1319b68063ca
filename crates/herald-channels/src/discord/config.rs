//! Discord connection string
//!
//! Format: `bot_token[;dm_output_display[;based_meme[;deployment_branding]]]`

use crate::irc::config::parse_bool;
use herald_core::error::{ChatError, Result};
use std::fmt;
use std::str::FromStr;

/// When build output is attached to deployment results posted in direct messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DmOutputDisplay {
    #[default]
    Always,
    OnError,
    Never,
}

impl DmOutputDisplay {
    pub fn includes_output(self, failed: bool) -> bool {
        match self {
            Self::Always => true,
            Self::OnError => failed,
            Self::Never => false,
        }
    }
}

impl FromStr for DmOutputDisplay {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "").as_str() {
            "always" => Ok(Self::Always),
            "onerror" => Ok(Self::OnError),
            "never" => Ok(Self::Never),
            other => Err(ChatError::config(format!(
                "unknown Discord DM output display '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct DiscordConnectionString {
    pub bot_token: String,
    pub dm_output_display: DmOutputDisplay,
    /// Answer "based?" with a canned reply
    pub based_meme: bool,
    /// Footer on deployment notices
    pub deployment_branding: bool,
}

impl FromStr for DiscordConnectionString {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(';').collect();
        if parts.len() > 4 {
            return Err(ChatError::config(format!(
                "Discord connection string has {} fields, at most 4 are allowed",
                parts.len()
            )));
        }

        let bot_token = parts[0].trim();
        if bot_token.is_empty() || bot_token.contains(char::is_whitespace) {
            return Err(ChatError::config("Discord bot token is missing or malformed"));
        }

        let flag = |index: usize, name: &str| -> Result<bool> {
            match parts.get(index) {
                None => Ok(true),
                Some(raw) => parse_bool(raw).ok_or_else(|| {
                    ChatError::config(format!("invalid Discord {} flag '{}'", name, raw))
                }),
            }
        };

        Ok(Self {
            bot_token: bot_token.to_string(),
            dm_output_display: match parts.get(1) {
                Some(raw) => raw.parse()?,
                None => DmOutputDisplay::default(),
            },
            based_meme: flag(2, "based_meme")?,
            deployment_branding: flag(3, "deployment_branding")?,
        })
    }
}

impl fmt::Debug for DiscordConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscordConnectionString")
            .field("bot_token", &"***")
            .field("dm_output_display", &self.dm_output_display)
            .field("based_meme", &self.based_meme)
            .field("deployment_branding", &self.deployment_branding)
            .finish()
    }
}
