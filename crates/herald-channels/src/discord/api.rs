//! Discord REST calls the adapter makes outside the gateway

use crate::notice::Notice;
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serenity::builder::{CreateEmbed, CreateEmbedFooter, CreateMessage, EditMessage};
use serenity::http::Http;
use serenity::model::Timestamp;
use serenity::model::channel::{Channel, ChannelType};
use serenity::model::id::{ChannelId, MessageId};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// A guild channel messages can be posted in
    Text,
    Private,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: u64,
    pub name: String,
    pub guild_name: Option<String>,
    pub kind: ChannelKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotUser {
    pub id: u64,
    pub name: String,
}

impl BotUser {
    pub fn mention(&self) -> String {
        format!("<@{}>", self.id)
    }
}

#[async_trait]
pub trait DiscordApi: Send + Sync {
    async fn current_user(&self) -> Result<BotUser>;

    async fn channel(&self, channel_id: u64) -> Result<ChannelInfo>;

    /// Text channels in every guild the bot is a member of
    async fn visible_text_channels(&self) -> Result<Vec<ChannelInfo>>;

    async fn send_text(&self, channel_id: u64, text: &str) -> Result<()>;

    /// Post a notice, returning the id of the created message
    async fn send_notice(&self, channel_id: u64, notice: &Notice) -> Result<u64>;

    async fn edit_notice(&self, channel_id: u64, message_id: u64, notice: &Notice) -> Result<()>;
}

/// [`DiscordApi`] over serenity's HTTP client
pub struct SerenityApi {
    http: Arc<Http>,
}

impl SerenityApi {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

fn embed(notice: &Notice) -> CreateEmbed {
    let mut embed = CreateEmbed::new()
        .title(&notice.title)
        .description(&notice.description)
        .colour(notice.color)
        .fields(
            notice
                .fields
                .iter()
                .map(|f| (f.name.clone(), f.value.clone(), f.inline)),
        );
    if let Some(footer) = &notice.footer {
        embed = embed.footer(CreateEmbedFooter::new(footer));
    }
    if let Some(timestamp) = notice
        .timestamp
        .and_then(|t| Timestamp::from_unix_timestamp(t.timestamp()).ok())
    {
        embed = embed.timestamp(timestamp);
    }
    embed
}

fn is_text_kind(kind: ChannelType) -> bool {
    matches!(kind, ChannelType::Text | ChannelType::News)
}

#[async_trait]
impl DiscordApi for SerenityApi {
    async fn current_user(&self) -> Result<BotUser> {
        let user = self
            .http
            .get_current_user()
            .await
            .context("failed to fetch the bot user")?;
        Ok(BotUser {
            id: user.id.get(),
            name: user.name.clone(),
        })
    }

    async fn channel(&self, channel_id: u64) -> Result<ChannelInfo> {
        let channel = ChannelId::new(channel_id)
            .to_channel(&self.http)
            .await
            .with_context(|| format!("failed to fetch channel {}", channel_id))?;

        Ok(match channel {
            Channel::Guild(guild_channel) => {
                let guild_name = guild_channel
                    .guild_id
                    .to_partial_guild(&self.http)
                    .await
                    .map(|guild| guild.name)
                    .ok();
                ChannelInfo {
                    id: channel_id,
                    name: guild_channel.name.clone(),
                    guild_name,
                    kind: if is_text_kind(guild_channel.kind) {
                        ChannelKind::Text
                    } else {
                        ChannelKind::Other
                    },
                }
            }
            Channel::Private(private) => ChannelInfo {
                id: channel_id,
                name: private.recipient.name.clone(),
                guild_name: None,
                kind: ChannelKind::Private,
            },
            _ => ChannelInfo {
                id: channel_id,
                name: channel_id.to_string(),
                guild_name: None,
                kind: ChannelKind::Other,
            },
        })
    }

    async fn visible_text_channels(&self) -> Result<Vec<ChannelInfo>> {
        let guilds = self
            .http
            .get_guilds(None, None)
            .await
            .context("failed to list guilds")?;

        let mut visible = Vec::new();
        for guild in guilds {
            let channels = guild
                .id
                .channels(&self.http)
                .await
                .with_context(|| format!("failed to list channels of guild {}", guild.name))?;
            visible.extend(
                channels
                    .into_values()
                    .filter(|c| is_text_kind(c.kind))
                    .map(|c| ChannelInfo {
                        id: c.id.get(),
                        name: c.name.clone(),
                        guild_name: Some(guild.name.clone()),
                        kind: ChannelKind::Text,
                    }),
            );
        }
        Ok(visible)
    }

    async fn send_text(&self, channel_id: u64, text: &str) -> Result<()> {
        ChannelId::new(channel_id)
            .say(&self.http, text)
            .await
            .with_context(|| format!("failed to send to channel {}", channel_id))?;
        Ok(())
    }

    async fn send_notice(&self, channel_id: u64, notice: &Notice) -> Result<u64> {
        let message = ChannelId::new(channel_id)
            .send_message(&self.http, CreateMessage::new().embed(embed(notice)))
            .await
            .with_context(|| format!("failed to post notice to channel {}", channel_id))?;
        Ok(message.id.get())
    }

    async fn edit_notice(&self, channel_id: u64, message_id: u64, notice: &Notice) -> Result<()> {
        ChannelId::new(channel_id)
            .edit_message(
                &self.http,
                MessageId::new(message_id),
                EditMessage::new().embed(embed(notice)),
            )
            .await
            .with_context(|| format!("failed to edit message {}", message_id))?;
        Ok(())
    }
}
