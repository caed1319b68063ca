//! Serenity event handler feeding the adapter

use super::DiscordContext;
use serenity::async_trait;
use serenity::model::channel::Message;
use serenity::model::gateway::Ready;
use serenity::prelude::*;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// The parts of a gateway message the adapter looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GatewayMessage {
    pub channel_id: u64,
    /// `None` for direct messages
    pub guild_id: Option<u64>,
    pub author_id: u64,
    pub author_name: String,
    pub content: String,
}

impl From<&Message> for GatewayMessage {
    fn from(msg: &Message) -> Self {
        Self {
            channel_id: msg.channel_id.get(),
            guild_id: msg.guild_id.map(|g| g.get()),
            author_id: msg.author.id.get(),
            author_name: msg.author.name.clone(),
            content: msg.content.clone(),
        }
    }
}

pub(crate) struct GatewayHandler {
    ready: StdMutex<Option<oneshot::Sender<()>>>,
    ctx: Arc<DiscordContext>,
}

impl GatewayHandler {
    pub(crate) fn new(ready: oneshot::Sender<()>, ctx: Arc<DiscordContext>) -> Self {
        Self {
            ready: StdMutex::new(Some(ready)),
            ctx,
        }
    }
}

#[async_trait]
impl EventHandler for GatewayHandler {
    async fn message(&self, _ctx: Context, msg: Message) {
        self.ctx.handle_message(GatewayMessage::from(&msg)).await;
    }

    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(
            "Discord gateway ready as {} in {} guild(s)",
            ready.user.name,
            ready.guilds.len()
        );
        let signal = self
            .ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match signal {
            Some(signal) => {
                let _ = signal.send(());
            }
            // Serenity resumes and re-identifies on its own
            None => debug!("Discord gateway ready again after reconnect"),
        }
    }
}
