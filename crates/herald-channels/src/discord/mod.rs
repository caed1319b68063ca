//! Discord protocol adapter using Serenity
//!
//! The gateway runs in its own task and handles heartbeats and resumes by
//! itself. REST calls go through [`DiscordApi`] so channel resolution and
//! sending can be exercised without a live gateway.

pub mod api;
pub mod config;
mod handler;

pub use api::{BotUser, ChannelInfo, ChannelKind, DiscordApi, SerenityApi};
pub use config::{DiscordConnectionString, DmOutputDisplay};

use crate::address::{ChannelAddressTable, NativeTarget};
use crate::notice::Notice;
use crate::provider::ProtocolAdapter;
use crate::queue::MessageQueue;
use async_trait::async_trait;
use handler::{GatewayHandler, GatewayMessage};
use herald_core::config::{ChannelConfig, ChatProviderKind};
use herald_core::error::{ChatError, Result};
use herald_core::types::{
    ChannelAddress, ChatUser, DeploymentUpdate, InboundMessage, UNMAPPED_CHANNELS_ID,
    UpdateFinalizer,
};
use serenity::gateway::{GatewayError, ShardManager};
use serenity::prelude::{Client, GatewayIntents};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Discord's maximum message length in characters
const DISCORD_MAX_LENGTH: usize = 2000;
const GATEWAY_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const UNMAPPED_CHANNELS_NAME: &str = "(Unmapped accessible channels)";
const DIRECT_MESSAGE_CONNECTION: &str = "Direct Message";
const BRANDING_FOOTER: &str = "Deployed by herald";
const BASED_REPLY: &str = "Based on what?";

/// Check if a serenity error represents a fatal gateway condition that should not be retried
fn is_fatal_gateway_error(err: &serenity::Error) -> bool {
    match err {
        serenity::Error::Gateway(gateway_err) => matches!(
            gateway_err,
            GatewayError::InvalidAuthentication
                | GatewayError::NoAuthentication
                | GatewayError::InvalidShardData
                | GatewayError::DisallowedGatewayIntents
                | GatewayError::InvalidGatewayIntents
        ),
        _ => false,
    }
}

fn is_based_prompt(content: &str) -> bool {
    let normalized = content.trim().to_lowercase();
    normalized == "based?" || normalized.ends_with(" based?")
}

/// Split a message into chunks that fit Discord's character limit,
/// preferring line breaks, then spaces
fn split_message(content: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in content.split('\n') {
        let line_len = line.chars().count();
        let separator = usize::from(!current.is_empty());
        if current_len + separator + line_len <= DISCORD_MAX_LENGTH {
            if separator == 1 {
                current.push('\n');
            }
            current.push_str(line);
            current_len += separator + line_len;
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len <= DISCORD_MAX_LENGTH {
            current.push_str(line);
            current_len = line_len;
            continue;
        }

        // A single line over the limit is cut on words, or hard if a word is too long
        for word in line.split(' ') {
            for piece in hard_split(word) {
                let piece_len = piece.chars().count();
                let separator = usize::from(!current.is_empty());
                if current_len + separator + piece_len > DISCORD_MAX_LENGTH {
                    chunks.push(std::mem::take(&mut current));
                    current_len = 0;
                } else if separator == 1 {
                    current.push(' ');
                    current_len += 1;
                }
                current.push_str(&piece);
                current_len += piece_len;
            }
        }
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}

fn hard_split(word: &str) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    if chars.len() <= DISCORD_MAX_LENGTH {
        return vec![word.to_string()];
    }
    chars
        .chunks(DISCORD_MAX_LENGTH)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// State shared with the gateway event handler
pub(crate) struct DiscordContext {
    settings: DiscordConnectionString,
    queue: MessageQueue,
    table: ChannelAddressTable<u64>,
    connected: AtomicBool,
    bot_user: RwLock<Option<BotUser>>,
    api: RwLock<Option<Arc<dyn DiscordApi>>>,
}

/// Fetch a configured channel, rejecting anything the bot cannot post text in
async fn text_channel_info(api: &dyn DiscordApi, channel_id: u64) -> Result<ChannelInfo> {
    let info = api.channel(channel_id).await.map_err(|e| {
        ChatError::metadata(format!("channel {} could not be fetched: {:#}", channel_id, e))
    })?;
    if info.kind != ChannelKind::Text {
        return Err(ChatError::metadata(format!(
            "channel {} ({}) is not a text channel",
            channel_id, info.name
        )));
    }
    Ok(info)
}

impl DiscordContext {
    async fn target(&self, real_id: u64) -> Result<NativeTarget<u64>> {
        self.table
            .lookup(real_id)
            .await
            .ok_or(ChatError::UnknownChannel { real_id })
    }

    fn bot_user(&self) -> Option<BotUser> {
        self.bot_user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn api(&self) -> Option<Arc<dyn DiscordApi>> {
        self.api
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_identity(&self, api: Option<Arc<dyn DiscordApi>>, bot_user: Option<BotUser>) {
        *self.api.write().unwrap_or_else(PoisonError::into_inner) = api;
        *self.bot_user.write().unwrap_or_else(PoisonError::into_inner) = bot_user;
    }

    pub(crate) async fn handle_message(&self, msg: GatewayMessage) {
        let Some(bot) = self.bot_user() else {
            debug!("Dropping Discord message received before the bot identity is known");
            return;
        };
        if msg.author_id == bot.id {
            return;
        }

        if self.settings.based_meme && is_based_prompt(&msg.content) {
            if let Some(api) = self.api()
                && let Err(e) = api.send_text(msg.channel_id, BASED_REPLY).await
            {
                warn!("Failed to send canned reply: {:#}", e);
            }
            return;
        }

        let channel = if msg.guild_id.is_none() {
            let real_id = self.table.resolve(&msg.channel_id, true).await;
            ChannelAddress::private(real_id, DIRECT_MESSAGE_CONNECTION, &msg.author_name)
        } else {
            let real_id = self.table.resolve(&msg.channel_id, false).await;
            match self.table.mapped_address(real_id).await {
                Some(address) => address,
                None => {
                    debug!(
                        "Ignoring message from {} in unmapped channel {}",
                        msg.author_name, msg.channel_id
                    );
                    return;
                }
            }
        };

        debug!(
            "Discord message from {} in {}",
            msg.author_name, channel.friendly_name
        );
        self.queue.enqueue(InboundMessage {
            content: msg.content,
            author: ChatUser {
                real_id: msg.author_id,
                display_name: msg.author_name,
                mention_token: format!("<@{}>", msg.author_id),
                channel,
            },
        });
    }
}

struct GatewaySession {
    shard_manager: Arc<ShardManager>,
    task: JoinHandle<serenity::Result<()>>,
}

impl GatewaySession {
    /// Ask the shards to close and wait for the gateway task
    async fn stop(self, token: &CancellationToken) {
        let GatewaySession {
            shard_manager,
            mut task,
        } = self;
        shard_manager.shutdown_all().await;

        tokio::select! {
            _ = token.cancelled() => {
                debug!("Discord shutdown cancelled, aborting the gateway task");
                task.abort();
            }
            result = tokio::time::timeout(GATEWAY_STOP_TIMEOUT, &mut task) => match result {
                Ok(Ok(Ok(()))) => debug!("Discord gateway stopped"),
                Ok(Ok(Err(e))) => warn!("Discord gateway stopped with an error: {}", e),
                Ok(Err(e)) => warn!("Discord gateway task failed: {}", e),
                Err(_) => {
                    warn!("Discord gateway did not stop in time, aborting it");
                    task.abort();
                }
            },
        }
    }
}

/// Discord implementation of [`ProtocolAdapter`]
pub struct DiscordAdapter {
    ctx: Arc<DiscordContext>,
    session: Mutex<Option<GatewaySession>>,
}

impl DiscordAdapter {
    pub fn new(settings: DiscordConnectionString) -> Self {
        Self {
            ctx: Arc::new(DiscordContext {
                settings,
                queue: MessageQueue::new(),
                table: ChannelAddressTable::new(),
                connected: AtomicBool::new(false),
                bot_user: RwLock::new(None),
                api: RwLock::new(None),
            }),
            session: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &DiscordConnectionString {
        &self.ctx.settings
    }

    async fn start_gateway(
        &self,
        token: &CancellationToken,
    ) -> Result<(GatewaySession, Arc<dyn DiscordApi>)> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        let mut client = Client::builder(&self.ctx.settings.bot_token, intents)
            .event_handler(GatewayHandler::new(ready_tx, self.ctx.clone()))
            .await
            .map_err(|e| ChatError::connection("create Discord client", e))?;

        let shard_manager = client.shard_manager.clone();
        let api: Arc<dyn DiscordApi> = Arc::new(SerenityApi::new(client.http.clone()));
        let ctx = self.ctx.clone();
        let mut task = tokio::spawn(async move {
            let result = client.start().await;
            ctx.connected.store(false, Ordering::SeqCst);
            result
        });

        let failure = tokio::select! {
            _ = token.cancelled() => ChatError::Cancelled,
            ready = ready_rx => match ready {
                Ok(()) => {
                    return Ok((GatewaySession { shard_manager, task }, api));
                }
                Err(_) => ChatError::connection(
                    "Discord gateway",
                    "event handler dropped before the gateway became ready",
                ),
            },
            exited = &mut task => {
                // The task is finished, nothing left to clean up
                return Err(match exited {
                    Ok(Ok(())) => ChatError::connection(
                        "Discord gateway",
                        "gateway stopped before becoming ready",
                    ),
                    Ok(Err(e)) => {
                        if is_fatal_gateway_error(&e) {
                            error!("Discord rejected the bot credentials or intents: {}", e);
                        }
                        ChatError::connection("Discord gateway", e)
                    }
                    Err(e) => ChatError::connection("Discord gateway task", e),
                });
            }
        };

        GatewaySession {
            shard_manager,
            task,
        }
        .stop(&CancellationToken::new())
        .await;
        Err(failure)
    }
}

#[async_trait]
impl ProtocolAdapter for DiscordAdapter {
    fn kind(&self) -> ChatProviderKind {
        ChatProviderKind::Discord
    }

    fn queue(&self) -> &MessageQueue {
        &self.ctx.queue
    }

    fn connected(&self) -> bool {
        self.ctx.connected.load(Ordering::SeqCst)
    }

    fn bot_mention(&self) -> Result<String> {
        if !self.connected() {
            return Err(ChatError::NotConnected);
        }
        self.ctx
            .bot_user()
            .map(|user| user.mention())
            .ok_or(ChatError::NotConnected)
    }

    async fn connect(&self, token: &CancellationToken) -> Result<()> {
        if let Some(stale) = self.session.lock().await.take() {
            debug!("Discarding previous Discord gateway session");
            stale.stop(token).await;
        }
        self.ctx.connected.store(false, Ordering::SeqCst);

        info!("Connecting to the Discord gateway");
        let (session, api) = self.start_gateway(token).await?;

        let fetched = tokio::select! {
            _ = token.cancelled() => None,
            user = api.current_user() => Some(user),
        };
        let bot_user = match fetched {
            Some(Ok(user)) if !token.is_cancelled() => user,
            Some(Err(e)) => {
                session.stop(&CancellationToken::new()).await;
                return Err(ChatError::connection("fetch the Discord bot user", e));
            }
            _ => {
                debug!("Discord connect cancelled, closing the gateway");
                session.stop(&CancellationToken::new()).await;
                return Err(ChatError::Cancelled);
            }
        };

        info!("Connected to Discord as {} ({})", bot_user.name, bot_user.id);
        self.ctx.set_identity(Some(api), Some(bot_user));
        *self.session.lock().await = Some(session);
        self.ctx.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect_impl(&self, token: &CancellationToken) -> Result<()> {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            info!("Disconnecting from Discord");
            session.stop(token).await;
        }
        self.ctx.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn map_channels(
        &self,
        channels: &[ChannelConfig],
        token: &CancellationToken,
    ) -> Result<Vec<ChannelAddress>> {
        let api = self.ctx.api().ok_or(ChatError::NotConnected)?;

        let mut desired = Vec::new();
        let mut unmapped_entry = None;
        for channel in channels {
            let Some(channel_id) = channel.discord_channel_id else {
                continue;
            };
            if channel_id == UNMAPPED_CHANNELS_ID {
                unmapped_entry = Some(channel);
                continue;
            }
            if token.is_cancelled() {
                return Err(ChatError::Cancelled);
            }

            match text_channel_info(api.as_ref(), channel_id).await {
                Ok(info) => desired.push((
                    channel_id,
                    ChannelAddress {
                        real_id: 0,
                        is_private: false,
                        is_admin_channel: channel.is_admin_channel,
                        tag: channel.tag.clone(),
                        connection_name: info.guild_name.unwrap_or_default(),
                        friendly_name: info.name,
                    },
                )),
                Err(e) => warn!("Skipping Discord channel {}: {}", channel_id, e),
            }
        }

        let mut addresses = self.ctx.table.remap(desired).await.addresses;
        if let Some(channel) = unmapped_entry {
            addresses.push(ChannelAddress {
                real_id: UNMAPPED_CHANNELS_ID,
                is_private: false,
                is_admin_channel: channel.is_admin_channel,
                tag: channel.tag.clone(),
                connection_name: "Discord".to_string(),
                friendly_name: UNMAPPED_CHANNELS_NAME.to_string(),
            });
        }
        info!("Mapped {} Discord channel(s)", addresses.len());
        Ok(addresses)
    }

    async fn send_message(&self, real_id: u64, text: &str, token: &CancellationToken) -> Result<()> {
        let Some(api) = self.ctx.api() else {
            warn!("Dropping Discord message: not connected");
            return Ok(());
        };

        let targets: Vec<u64> = if real_id == UNMAPPED_CHANNELS_ID {
            let mapped: HashSet<u64> = self.ctx.table.mapped_keys().await.into_iter().collect();
            match api.visible_text_channels().await {
                Ok(channels) => channels
                    .into_iter()
                    .map(|c| c.id)
                    .filter(|id| !mapped.contains(id))
                    .collect(),
                Err(e) => {
                    warn!("Could not list Discord channels: {:#}", e);
                    return Ok(());
                }
            }
        } else {
            match self.ctx.target(real_id).await {
                Ok(target) => vec![target.key],
                Err(e) => {
                    warn!("Dropping Discord message: {}", e);
                    return Ok(());
                }
            }
        };

        let chunks = split_message(text);
        for channel_id in targets {
            for chunk in &chunks {
                if token.is_cancelled() {
                    return Err(ChatError::Cancelled);
                }
                if let Err(e) = api.send_text(channel_id, chunk).await {
                    warn!("Failed to send Discord message to {}: {:#}", channel_id, e);
                    break;
                }
            }
        }
        Ok(())
    }

    async fn send_update_message(
        &self,
        update: &DeploymentUpdate,
        token: &CancellationToken,
    ) -> Result<UpdateFinalizer> {
        if token.is_cancelled() {
            return Err(ChatError::Cancelled);
        }
        let api = self.ctx.api().ok_or(ChatError::NotConnected)?;
        let target = match self.ctx.target(update.real_id).await {
            Ok(target) => target,
            Err(e) => {
                warn!("Cannot post deployment notice: {}", e);
                return Ok(UpdateFinalizer::noop());
            }
        };

        let branding = self.ctx.settings.deployment_branding;
        let brand = move |notice: Notice| {
            if branding {
                notice.with_footer(BRANDING_FOOTER)
            } else {
                notice
            }
        };

        let channel_id = target.key;
        let message_id = match api
            .send_notice(channel_id, &brand(Notice::deployment_started(update)))
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Failed to post deployment notice: {:#}", e);
                None
            }
        };

        // Raw build output only goes to direct messages, subject to the configured policy
        let dm_policy = target
            .is_private
            .then_some(self.ctx.settings.dm_output_display);
        let update = update.clone();
        Ok(UpdateFinalizer::new(move |error, output| async move {
            let include_output =
                dm_policy.is_some_and(|policy| policy.includes_output(error.is_some()));
            let output = output.as_deref().filter(|_| include_output);
            let finished = brand(Notice::deployment_finished(&update, error.as_deref(), output));

            if let Some(message_id) = message_id {
                match api.edit_notice(channel_id, message_id, &finished).await {
                    Ok(()) => return,
                    Err(e) => warn!("Could not edit deployment notice, posting a new one: {:#}", e),
                }
            }
            if let Err(e) = api.send_notice(channel_id, &finished).await {
                warn!("Failed to post deployment result: {:#}", e);
            }
        }))
    }

    fn abort(&self) {
        if let Ok(mut guard) = self.session.try_lock()
            && let Some(session) = guard.take()
        {
            session.task.abort();
            let shard_manager = session.shard_manager;
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { shard_manager.shutdown_all().await });
            }
        }
        self.ctx.connected.store(false, Ordering::SeqCst);
    }
}
