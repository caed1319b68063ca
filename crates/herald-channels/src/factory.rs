//! Provider factory
//!
//! Turns a [`BotConfig`] into a ready-to-start [`Provider`]. Only the adapter
//! matching the configured protocol parses the connection string, so a bad
//! string or unknown protocol is reported here, before anything connects.

use crate::discord::{DiscordAdapter, DiscordConnectionString};
use crate::irc::{IrcAdapter, IrcConnectionString, IrcConnector, TcpConnector};
use crate::provider::{ChatProvider, Provider};
use herald_core::config::{BotConfig, ChatProviderKind};
use herald_core::delay::{Delayer, TokioDelayer};
use herald_core::error::Result;
use herald_core::jobs::JobManager;
use std::sync::Arc;
use tracing::debug;

/// Builds providers wired to the shared job subsystem and delay source
pub struct ProviderFactory {
    jobs: Arc<dyn JobManager>,
    delayer: Arc<dyn Delayer>,
    irc_connector: Arc<dyn IrcConnector>,
}

impl ProviderFactory {
    pub fn new(jobs: Arc<dyn JobManager>) -> Self {
        Self {
            jobs,
            delayer: Arc::new(TokioDelayer),
            irc_connector: Arc::new(TcpConnector),
        }
    }

    pub fn with_delayer(mut self, delayer: Arc<dyn Delayer>) -> Self {
        self.delayer = delayer;
        self
    }

    pub fn with_irc_connector(mut self, connector: Arc<dyn IrcConnector>) -> Self {
        self.irc_connector = connector;
        self
    }

    pub fn create(&self, bot: &BotConfig) -> Result<Arc<dyn Provider>> {
        let kind: ChatProviderKind = bot.provider.parse()?;
        let provider: Arc<dyn Provider> = match kind {
            ChatProviderKind::Irc => {
                let settings: IrcConnectionString = bot.connection_string.parse()?;
                debug!("Bot {} uses IRC settings {:?}", bot.name, settings);
                Arc::new(ChatProvider::new(
                    bot.name.clone(),
                    IrcAdapter::new(settings, self.irc_connector.clone()),
                    self.jobs.clone(),
                    self.delayer.clone(),
                ))
            }
            ChatProviderKind::Discord => {
                let settings: DiscordConnectionString = bot.connection_string.parse()?;
                debug!("Bot {} uses Discord settings {:?}", bot.name, settings);
                Arc::new(ChatProvider::new(
                    bot.name.clone(),
                    DiscordAdapter::new(settings),
                    self.jobs.clone(),
                    self.delayer.clone(),
                ))
            }
        };
        Ok(provider)
    }
}
