//! Chat manager
//!
//! Drives every enabled bot: starts its reconnection loop, maps its channels
//! once connected, and consumes its message queue until shutdown.

use anyhow::{Context, Result};
use herald_channels::{Provider, ProviderFactory};
use herald_core::config::BotConfig;
use herald_core::types::{InboundMessage, QueueItem};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A configured bot and the provider built for it
pub struct ManagedBot {
    pub config: BotConfig,
    pub provider: Arc<dyn Provider>,
}

pub struct ChatManager {
    bots: Vec<ManagedBot>,
}

impl ChatManager {
    /// Build a provider for each enabled bot, failing on the first bad one
    pub fn build<'a>(
        factory: &ProviderFactory,
        bots: impl IntoIterator<Item = &'a BotConfig>,
    ) -> Result<Self> {
        let bots = bots
            .into_iter()
            .filter(|b| b.enabled)
            .map(|config| {
                let provider = factory
                    .create(config)
                    .with_context(|| format!("Bot '{}' is misconfigured", config.name))?;
                Ok::<_, anyhow::Error>(ManagedBot {
                    config: config.clone(),
                    provider,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { bots })
    }

    pub fn bots(&self) -> &[ManagedBot] {
        &self.bots
    }

    /// Run every bot until `cancel` fires, then disconnect them all
    pub async fn run(self, cancel: CancellationToken) {
        let mut join_set = JoinSet::new();
        for bot in self.bots {
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let name = bot.config.name.clone();
                if let Err(e) = run_bot(&bot, &cancel).await {
                    error!("Bot '{}' stopped: {:#}", name, e);
                }
                if let Err(e) = bot.provider.disconnect(&CancellationToken::new()).await {
                    warn!("Bot '{}' did not disconnect cleanly: {}", name, e);
                }
                info!("Bot '{}' disconnected", name);
            });
        }

        while join_set.join_next().await.is_some() {}
    }
}

async fn run_bot(bot: &ManagedBot, cancel: &CancellationToken) -> Result<()> {
    let provider = &bot.provider;
    provider
        .set_reconnect_interval(bot.config.reconnection_interval_minutes, true)
        .await
        .context("failed to start the reconnection loop")?;

    let initial = provider.initial_connection();
    tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        connected = initial.wait() => {
            if connected {
                info!("Bot '{}' connected", bot.config.name);
                remap(bot, cancel).await;
            } else {
                warn!(
                    "Bot '{}' failed its first connection attempt, retrying every {} minute(s)",
                    bot.config.name, bot.config.reconnection_interval_minutes
                );
            }
        }
    }

    loop {
        let item = match provider.next_message(cancel).await {
            Ok(item) => item,
            Err(e) if e.is_cancelled() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        handle_item(bot, item, cancel).await;
    }
}

async fn remap(bot: &ManagedBot, cancel: &CancellationToken) {
    match bot
        .provider
        .map_channels(bot.config.limited_channels(), cancel)
        .await
    {
        Ok(addresses) => info!(
            "Bot '{}' mapped {} channel(s)",
            bot.config.name,
            addresses.len()
        ),
        Err(e) if e.is_cancelled() => debug!("Channel mapping for '{}' cancelled", bot.config.name),
        Err(e) => warn!("Bot '{}' could not map channels: {}", bot.config.name, e),
    }
}

async fn handle_item(bot: &ManagedBot, item: QueueItem, cancel: &CancellationToken) {
    match item {
        QueueItem::RemapRequested => {
            debug!("Bot '{}' requested a channel remap", bot.config.name);
            remap(bot, cancel).await;
        }
        QueueItem::Message(message) => handle_message(bot, message, cancel).await,
    }
}

async fn handle_message(bot: &ManagedBot, message: InboundMessage, cancel: &CancellationToken) {
    let channel = &message.author.channel;
    info!(
        "[{}] {} <{}> {}",
        bot.config.name, channel.friendly_name, message.author.display_name, message.content
    );

    let Ok(mention) = bot.provider.bot_mention() else {
        return;
    };
    let Some(command) = addressed_command(&message.content, &mention, channel.is_private) else {
        return;
    };
    if command.eq_ignore_ascii_case("ping") {
        let reply = format!("{}: pong", message.author.mention_token);
        if let Err(e) = bot
            .provider
            .send_message(channel.real_id, &reply, cancel)
            .await
        {
            warn!("Bot '{}' failed to answer ping: {}", bot.config.name, e);
        }
    }
}

/// The text of a message addressed to the bot, with the mention stripped.
/// Private messages are always addressed to the bot.
fn addressed_command<'a>(content: &'a str, mention: &str, is_private: bool) -> Option<&'a str> {
    let content = content.trim();
    let rest = match content.get(..mention.len()) {
        Some(head) if !mention.is_empty() && head.eq_ignore_ascii_case(mention) => {
            &content[mention.len()..]
        }
        _ if is_private => return Some(content),
        _ => return None,
    };
    // Mentions run straight into other words for nicks like "herald2"
    if rest.starts_with(|c: char| c.is_alphanumeric()) {
        return is_private.then_some(content);
    }
    Some(rest.trim_start_matches([':', ',']).trim())
}
