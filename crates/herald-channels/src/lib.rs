//! herald-channels - Chat network providers
//!
//! This crate provides:
//! - A message queue and channel address table owned by each provider
//! - The provider engine with its self-healing reconnection loop
//! - IRC and Discord protocol adapters
//! - A factory building providers from bot configuration

pub mod address;
pub mod discord;
pub mod factory;
pub mod irc;
pub mod notice;
pub mod provider;
pub mod queue;

pub use address::{ChannelAddressTable, NativeTarget, RemapResult};
pub use discord::{DiscordAdapter, DiscordConnectionString};
pub use factory::ProviderFactory;
pub use irc::{IrcAdapter, IrcConnectionString, IrcConnector, TcpConnector};
pub use notice::Notice;
pub use provider::{ChatProvider, InitialConnection, Provider, ProtocolAdapter};
pub use queue::MessageQueue;
