//! IRC protocol adapter
//!
//! A connection is split in two phases. The handshake reads the stream inline
//! while registering, authenticating and confirming the nickname. Once that
//! succeeds a long-lived listen task takes over the read half and feeds the
//! message queue, while the write half stays shared behind a lock.

pub mod config;
pub mod message;
pub mod transport;

pub use config::{IrcConnectionString, IrcPasswordType};
pub use transport::{IrcConnector, TcpConnector};

use crate::address::ChannelAddressTable;
use crate::notice::Notice;
use crate::provider::ProtocolAdapter;
use crate::queue::MessageQueue;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use herald_core::config::{ChannelConfig, ChatProviderKind};
use herald_core::error::{ChatError, Result};
use herald_core::types::{
    ChannelAddress, ChatUser, DeploymentUpdate, InboundMessage, UNMAPPED_CHANNELS_ID,
    UpdateFinalizer,
};
use message::{IrcMessage, MAX_PAYLOAD_BYTES, flatten_lines, is_channel_name, split_payload};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transport::BoxedStream;

/// Bounds the whole connect, from opening the socket to a confirmed nickname
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(25);
const QUIT_TIMEOUT: Duration = Duration::from_secs(5);
const NICK_RETRY_DELAY: Duration = Duration::from_secs(2);
const QUIT_MESSAGE: &str = "Shutting down";
const REAL_NAME: &str = "herald chat bridge";
const NICKSERV: &str = "NickServ";

type LineReader = Lines<BufReader<ReadHalf<BoxedStream>>>;

/// Serializes writes of whole lines
struct IrcWriter {
    half: Mutex<WriteHalf<BoxedStream>>,
}

impl IrcWriter {
    fn new(half: WriteHalf<BoxedStream>) -> Self {
        Self {
            half: Mutex::new(half),
        }
    }

    async fn send(&self, line: &str) -> io::Result<()> {
        let mut half = self.half.lock().await;
        half.write_all(line.as_bytes()).await?;
        half.write_all(b"\r\n").await?;
        half.flush().await
    }

    async fn shutdown(&self) {
        if let Err(e) = self.half.lock().await.shutdown().await {
            debug!("IRC transport shutdown failed: {}", e);
        }
    }
}

fn pong(ping: &IrcMessage) -> String {
    match ping.trailing() {
        Some(payload) => format!("PONG :{}", payload),
        None => "PONG".to_string(),
    }
}

fn sasl_plain_blob(account: &str, password: &str) -> String {
    BASE64.encode(format!("{account}\0{account}\0{password}"))
}

/// State shared between the adapter and its listen task
struct IrcContext {
    server: String,
    queue: MessageQueue,
    table: ChannelAddressTable<String>,
    connected: AtomicBool,
    nickname: RwLock<String>,
}

impl IrcContext {
    fn nickname(&self) -> String {
        self.nickname
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_nickname(&self, nickname: &str) {
        *self.nickname.write().unwrap_or_else(PoisonError::into_inner) = nickname.to_string();
    }

    /// Follow what the server says our nickname is
    fn track(&self, msg: &IrcMessage) {
        match msg.command.as_str() {
            "001" => {
                if let Some(granted) = msg.param(0) {
                    self.set_nickname(granted);
                }
            }
            "NICK" => {
                let ours = msg
                    .source_nick()
                    .is_some_and(|nick| nick.eq_ignore_ascii_case(&self.nickname()));
                if ours && let Some(new_nick) = msg.param(0) {
                    debug!("Nickname on {} is now {}", self.server, new_nick);
                    self.set_nickname(new_nick);
                }
            }
            _ => {}
        }
    }

    async fn handle(&self, msg: &IrcMessage, writer: &IrcWriter) {
        self.track(msg);
        match msg.command.as_str() {
            "PING" => {
                if let Err(e) = writer.send(&pong(msg)).await {
                    warn!("Failed to answer PING from {}: {}", self.server, e);
                }
            }
            "PRIVMSG" => self.handle_privmsg(msg).await,
            "KICK" => {
                if msg
                    .param(1)
                    .is_some_and(|nick| nick.eq_ignore_ascii_case(&self.nickname()))
                {
                    warn!(
                        "Kicked from {} on {}: {}",
                        msg.param(0).unwrap_or("?"),
                        self.server,
                        msg.param(2).unwrap_or("")
                    );
                }
            }
            "ERROR" => warn!(
                "IRC server {} reported: {}",
                self.server,
                msg.trailing().unwrap_or("")
            ),
            _ => {}
        }
    }

    async fn handle_privmsg(&self, msg: &IrcMessage) {
        let (Some(sender), Some(target), Some(text)) =
            (msg.source_nick(), msg.param(0), msg.param(1))
        else {
            return;
        };
        if sender.eq_ignore_ascii_case(&self.nickname()) {
            return;
        }
        if text.starts_with('\u{1}') {
            debug!("Ignoring CTCP request from {}", sender);
            return;
        }

        let user_id = self.table.resolve(&sender.to_ascii_lowercase(), true).await;
        let channel = if is_channel_name(target) {
            let id = self.table.resolve(&target.to_ascii_lowercase(), false).await;
            match self.table.mapped_address(id).await {
                Some(address) => address,
                None => ChannelAddress {
                    real_id: id,
                    is_private: false,
                    is_admin_channel: false,
                    tag: None,
                    connection_name: self.server.clone(),
                    friendly_name: target.to_string(),
                },
            }
        } else {
            ChannelAddress::private(user_id, &self.server, sender)
        };

        debug!("IRC message from {} in {}", sender, channel.friendly_name);
        self.queue.enqueue(InboundMessage {
            content: text.to_string(),
            author: ChatUser {
                real_id: user_id,
                display_name: sender.to_string(),
                mention_token: sender.to_string(),
                channel,
            },
        });
    }
}

async fn listen_loop(
    ctx: Arc<IrcContext>,
    mut reader: LineReader,
    writer: Arc<IrcWriter>,
    token: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = reader.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                if let Some(msg) = IrcMessage::parse(&line) {
                    ctx.handle(&msg, &writer).await;
                }
            }
            Ok(None) => {
                info!("IRC server {} closed the connection", ctx.server);
                break;
            }
            Err(e) => {
                warn!("Lost connection to IRC server {}: {}", ctx.server, e);
                break;
            }
        }
    }
    ctx.connected.store(false, Ordering::SeqCst);
    debug!("IRC listen loop for {} exiting", ctx.server);
}

/// Inline reader used while registering
struct Handshake<'a> {
    reader: &'a mut LineReader,
    writer: &'a IrcWriter,
    ctx: &'a IrcContext,
}

impl Handshake<'_> {
    async fn send(&self, line: &str) -> Result<()> {
        self.writer
            .send(line)
            .await
            .map_err(|e| ChatError::connection(format!("IRC handshake with {}", self.ctx.server), e))
    }

    /// Next meaningful line. Answers pings and turns fatal numerics into errors.
    async fn next(&mut self) -> Result<IrcMessage> {
        let ctx: &IrcContext = self.ctx;
        let context = || format!("IRC handshake with {}", ctx.server);
        loop {
            let line = self
                .reader
                .next_line()
                .await
                .map_err(|e| ChatError::connection(context(), e))?
                .ok_or_else(|| ChatError::connection(context(), "server closed the connection"))?;
            let Some(msg) = IrcMessage::parse(&line) else {
                continue;
            };
            if msg.command == "PING" {
                self.send(&pong(&msg)).await?;
                continue;
            }
            self.ctx.track(&msg);

            let reason = msg.trailing().unwrap_or("").to_string();
            return match msg.command.as_str() {
                "ERROR" => Err(ChatError::connection(
                    context(),
                    format!("server closed the link: {}", reason),
                )),
                "464" | "465" => Err(ChatError::connection(
                    context(),
                    format!("registration rejected: {}", reason),
                )),
                "904" | "905" => Err(ChatError::connection(
                    context(),
                    format!("SASL authentication failed: {}", reason),
                )),
                _ => Ok(msg),
            };
        }
    }
}

struct IrcSession {
    writer: Arc<IrcWriter>,
    /// Channels joined on this connection, lowercased
    joined: HashSet<String>,
    listen_token: CancellationToken,
    listen_task: JoinHandle<()>,
}

impl IrcSession {
    fn abort(self) {
        self.listen_token.cancel();
        self.listen_task.abort();
    }
}

struct IrcInner {
    settings: IrcConnectionString,
    connector: Arc<dyn IrcConnector>,
    handshake_timeout: Duration,
    ctx: Arc<IrcContext>,
    session: Mutex<Option<IrcSession>>,
}

impl IrcInner {
    async fn clear_stale_session(&self) {
        let stale = self.session.lock().await.take();
        if let Some(stale) = stale {
            debug!("Discarding previous IRC session with {}", self.ctx.server);
            let writer = stale.writer.clone();
            stale.abort();
            writer.shutdown().await;
        }
        self.ctx.connected.store(false, Ordering::SeqCst);
    }

    async fn connect(&self, token: &CancellationToken) -> Result<()> {
        self.clear_stale_session().await;

        let settings = &self.settings;
        info!(
            "Connecting to IRC server {}:{} (tls: {})",
            settings.address, settings.port, settings.use_ssl
        );

        let attempt = async {
            let stream = self
                .connector
                .connect(&settings.address, settings.port, settings.use_ssl)
                .await
                .map_err(|e| {
                    ChatError::connection(
                        format!("connect to {}:{}", settings.address, settings.port),
                        e,
                    )
                })?;

            let (read_half, write_half) = tokio::io::split(stream);
            let writer = Arc::new(IrcWriter::new(write_half));
            let mut reader = BufReader::new(read_half).lines();
            self.ctx.set_nickname(&settings.nickname);

            let registered = {
                let mut handshake = Handshake {
                    reader: &mut reader,
                    writer: &writer,
                    ctx: &self.ctx,
                };
                self.register(&mut handshake).await
            };
            if let Err(e) = registered {
                writer.shutdown().await;
                return Err(e);
            }
            Ok::<_, ChatError>((reader, writer))
        };

        let (reader, writer) = tokio::select! {
            _ = token.cancelled() => {
                debug!("IRC connect to {} cancelled", settings.address);
                return Err(ChatError::Cancelled);
            }
            result = tokio::time::timeout(self.handshake_timeout, attempt) => match result {
                Ok(connected) => connected?,
                Err(_) => {
                    return Err(ChatError::connection(
                        format!("IRC handshake with {}", settings.address),
                        format!("timed out after {:?}", self.handshake_timeout),
                    ));
                }
            },
        };

        let listen_token = CancellationToken::new();
        self.ctx.connected.store(true, Ordering::SeqCst);
        let listen_task = tokio::spawn(listen_loop(
            self.ctx.clone(),
            reader,
            writer.clone(),
            listen_token.clone(),
        ));
        *self.session.lock().await = Some(IrcSession {
            writer,
            joined: HashSet::new(),
            listen_token,
            listen_task,
        });

        info!(
            "Connected to IRC server {} as {}",
            settings.address,
            self.ctx.nickname()
        );
        Ok(())
    }

    async fn register(&self, handshake: &mut Handshake<'_>) -> Result<()> {
        let nickname = self.settings.nickname.as_str();
        let sasl = self.settings.password_for(IrcPasswordType::Sasl);

        if sasl.is_some() {
            handshake.send("CAP REQ :sasl").await?;
        }
        if let Some(password) = self.settings.password_for(IrcPasswordType::Server) {
            handshake.send(&format!("PASS {}", password)).await?;
        }
        handshake.send(&format!("NICK {}", nickname)).await?;
        handshake
            .send(&format!("USER {} 0 * :{}", nickname, REAL_NAME))
            .await?;

        if let Some(password) = sasl {
            self.authenticate_sasl(handshake, nickname, password).await?;
        }

        self.verify_nickname(handshake).await?;

        if let Some(password) = self.settings.password_for(IrcPasswordType::NickServ) {
            debug!("Identifying with {}", NICKSERV);
            handshake
                .send(&format!("PRIVMSG {} :IDENTIFY {}", NICKSERV, password))
                .await?;
        }
        if let Some(password) = self.settings.password_for(IrcPasswordType::Oper) {
            debug!("Requesting operator status on {}", self.ctx.server);
            handshake
                .send(&format!("OPER {} {}", nickname, password))
                .await?;
        }
        Ok(())
    }

    async fn authenticate_sasl(
        &self,
        handshake: &mut Handshake<'_>,
        account: &str,
        password: &str,
    ) -> Result<()> {
        loop {
            let msg = handshake.next().await?;
            if msg.command != "CAP" {
                continue;
            }
            let offers_sasl = msg
                .trailing()
                .is_some_and(|caps| caps.split(' ').any(|c| c.eq_ignore_ascii_case("sasl")));
            match msg.param(1) {
                Some("ACK") if offers_sasl => break,
                Some("NAK") => {
                    return Err(ChatError::connection(
                        format!("IRC handshake with {}", self.ctx.server),
                        "server refused the SASL capability",
                    ));
                }
                _ => {}
            }
        }

        handshake.send("AUTHENTICATE PLAIN").await?;
        loop {
            let msg = handshake.next().await?;
            if msg.command == "AUTHENTICATE" && msg.param(0) == Some("+") {
                break;
            }
        }

        handshake
            .send(&format!("AUTHENTICATE {}", sasl_plain_blob(account, password)))
            .await?;
        handshake.send("CAP END").await
    }

    /// Wait for registration and keep asking for the configured nickname until we hold it
    async fn verify_nickname(&self, handshake: &mut Handshake<'_>) -> Result<()> {
        let desired = self.settings.nickname.as_str();
        let mut registered = false;
        let mut fallback = desired.to_string();

        loop {
            if registered && self.ctx.nickname().eq_ignore_ascii_case(desired) {
                return Ok(());
            }

            let msg = handshake.next().await?;
            match msg.command.as_str() {
                "001" => {
                    registered = true;
                    if !self.ctx.nickname().eq_ignore_ascii_case(desired) {
                        handshake.send(&format!("NICK {}", desired)).await?;
                    }
                }
                // Nickname in use, collision, or temporarily unavailable
                "433" | "436" | "437" => {
                    if registered {
                        debug!("Nickname {} still taken, asking again", desired);
                        tokio::time::sleep(NICK_RETRY_DELAY).await;
                        handshake.send(&format!("NICK {}", desired)).await?;
                    } else {
                        fallback.push('_');
                        warn!(
                            "Nickname {} is taken on {}, registering as {}",
                            desired, self.ctx.server, fallback
                        );
                        handshake.send(&format!("NICK {}", fallback)).await?;
                    }
                }
                _ => {}
            }
        }
    }

    async fn disconnect(&self, token: &CancellationToken) -> Result<()> {
        let session = self.session.lock().await.take();
        let Some(IrcSession {
            writer,
            listen_token,
            mut listen_task,
            ..
        }) = session
        else {
            self.ctx.connected.store(false, Ordering::SeqCst);
            return Ok(());
        };

        let quit = async {
            if let Err(e) = writer.send(&format!("QUIT :{}", QUIT_MESSAGE)).await {
                debug!("Failed to send QUIT to {}: {}", self.ctx.server, e);
            }
            // The server closes the link once it processed the QUIT
            let _ = (&mut listen_task).await;
        };
        tokio::select! {
            _ = token.cancelled() => debug!("IRC disconnect cancelled, closing the link"),
            result = tokio::time::timeout(QUIT_TIMEOUT, quit) => {
                if result.is_err() {
                    debug!("IRC server {} did not close the link in time", self.ctx.server);
                }
            }
        }

        listen_token.cancel();
        listen_task.abort();
        writer.shutdown().await;
        self.ctx.connected.store(false, Ordering::SeqCst);
        info!("Disconnected from IRC server {}", self.ctx.server);
        Ok(())
    }

    async fn map_channels(
        &self,
        channels: &[ChannelConfig],
        token: &CancellationToken,
    ) -> Result<Vec<ChannelAddress>> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ChatError::NotConnected)?;

        let mut desired = Vec::new();
        let mut join_keys = HashMap::new();
        for channel in channels {
            let Some((name, key)) = channel.irc_name_and_key() else {
                continue;
            };
            if !is_channel_name(name) || name.contains(' ') {
                warn!("Skipping invalid IRC channel name '{}'", name);
                continue;
            }
            let native = name.to_ascii_lowercase();
            if let Some(key) = key {
                join_keys.insert(native.clone(), key.to_string());
            }
            desired.push((
                native,
                ChannelAddress {
                    real_id: 0,
                    is_private: false,
                    is_admin_channel: channel.is_admin_channel,
                    tag: channel.tag.clone(),
                    connection_name: self.ctx.server.clone(),
                    friendly_name: name.to_string(),
                },
            ));
        }

        let order: Vec<String> = desired.iter().map(|(native, _)| native.clone()).collect();
        let wanted: HashSet<String> = order.iter().cloned().collect();
        let result = self.ctx.table.remap(desired).await;

        let stale: Vec<String> = session.joined.difference(&wanted).cloned().collect();
        for channel in stale {
            if token.is_cancelled() {
                return Err(ChatError::Cancelled);
            }
            info!("Leaving IRC channel {}", channel);
            session
                .writer
                .send(&format!("PART {}", channel))
                .await
                .map_err(|e| ChatError::send(format!("PART {}", channel), e))?;
            session.joined.remove(&channel);
        }

        for channel in order {
            if session.joined.contains(&channel) {
                continue;
            }
            if token.is_cancelled() {
                return Err(ChatError::Cancelled);
            }
            info!("Joining IRC channel {}", channel);
            let line = match join_keys.get(&channel) {
                Some(key) => format!("JOIN {} {}", channel, key),
                None => format!("JOIN {}", channel),
            };
            session
                .writer
                .send(&line)
                .await
                .map_err(|e| ChatError::send(format!("JOIN {}", channel), e))?;
            session.joined.insert(channel);
        }

        Ok(result.addresses)
    }

    async fn send_message(&self, real_id: u64, text: &str, token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(ChatError::Cancelled);
        }

        let Some(target) = self.ctx.table.lookup(real_id).await else {
            if real_id == UNMAPPED_CHANNELS_ID {
                warn!("IRC cannot broadcast to unmapped channels, dropping message");
            } else {
                warn!("Dropping IRC message for unknown channel id {}", real_id);
            }
            return Ok(());
        };

        let writer = self.session.lock().await.as_ref().map(|s| s.writer.clone());
        let Some(writer) = writer else {
            warn!("Dropping IRC message for {}: not connected", target.key);
            return Ok(());
        };

        // Private conversations get notices so other bots never answer them
        let command = if target.is_private { "NOTICE" } else { "PRIVMSG" };
        for chunk in split_payload(&flatten_lines(text), MAX_PAYLOAD_BYTES) {
            if token.is_cancelled() {
                return Err(ChatError::Cancelled);
            }
            if let Err(e) = writer
                .send(&format!("{} {} :{}", command, target.key, chunk))
                .await
            {
                warn!("Failed to send IRC message to {}: {}", target.key, e);
                break;
            }
        }
        Ok(())
    }
}

/// IRC implementation of [`ProtocolAdapter`]
pub struct IrcAdapter {
    inner: Arc<IrcInner>,
}

impl IrcAdapter {
    pub fn new(settings: IrcConnectionString, connector: Arc<dyn IrcConnector>) -> Self {
        Self::with_handshake_timeout(settings, connector, HANDSHAKE_TIMEOUT)
    }

    pub fn with_handshake_timeout(
        settings: IrcConnectionString,
        connector: Arc<dyn IrcConnector>,
        handshake_timeout: Duration,
    ) -> Self {
        let ctx = Arc::new(IrcContext {
            server: settings.address.clone(),
            queue: MessageQueue::new(),
            table: ChannelAddressTable::new(),
            connected: AtomicBool::new(false),
            nickname: RwLock::new(settings.nickname.clone()),
        });
        Self {
            inner: Arc::new(IrcInner {
                settings,
                connector,
                handshake_timeout,
                ctx,
                session: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &IrcConnectionString {
        &self.inner.settings
    }
}

#[async_trait]
impl ProtocolAdapter for IrcAdapter {
    fn kind(&self) -> ChatProviderKind {
        ChatProviderKind::Irc
    }

    fn queue(&self) -> &MessageQueue {
        &self.inner.ctx.queue
    }

    fn connected(&self) -> bool {
        self.inner.ctx.connected.load(Ordering::SeqCst)
    }

    fn bot_mention(&self) -> Result<String> {
        if !self.connected() {
            return Err(ChatError::NotConnected);
        }
        Ok(self.inner.ctx.nickname())
    }

    async fn connect(&self, token: &CancellationToken) -> Result<()> {
        self.inner.connect(token).await
    }

    async fn disconnect_impl(&self, token: &CancellationToken) -> Result<()> {
        self.inner.disconnect(token).await
    }

    async fn map_channels(
        &self,
        channels: &[ChannelConfig],
        token: &CancellationToken,
    ) -> Result<Vec<ChannelAddress>> {
        self.inner.map_channels(channels, token).await
    }

    async fn send_message(&self, real_id: u64, text: &str, token: &CancellationToken) -> Result<()> {
        self.inner.send_message(real_id, text, token).await
    }

    async fn send_update_message(
        &self,
        update: &DeploymentUpdate,
        token: &CancellationToken,
    ) -> Result<UpdateFinalizer> {
        let started = Notice::deployment_started(update);
        self.inner
            .send_message(update.real_id, &started.to_plain_text(), token)
            .await?;

        let inner = self.inner.clone();
        let update = update.clone();
        Ok(UpdateFinalizer::new(move |error, output| async move {
            let finished = Notice::deployment_finished(&update, error.as_deref(), output.as_deref());
            if let Err(e) = inner
                .send_message(update.real_id, &finished.to_plain_text(), &CancellationToken::new())
                .await
            {
                warn!("Failed to post deployment result to IRC: {}", e);
            }
        }))
    }

    fn abort(&self) {
        if let Ok(mut guard) = self.inner.session.try_lock()
            && let Some(session) = guard.take()
        {
            session.abort();
        }
        self.inner.ctx.connected.store(false, Ordering::SeqCst);
    }
}
