//! Provider engine
//!
//! [`Provider`] is the protocol-agnostic contract the chat manager talks to.
//! [`ChatProvider`] implements it on top of a [`ProtocolAdapter`], adding the
//! self-healing reconnection loop that keeps the adapter connected.

use crate::queue::MessageQueue;
use async_trait::async_trait;
use herald_core::config::{ChannelConfig, ChatProviderKind};
use herald_core::delay::Delayer;
use herald_core::error::{ChatError, Result};
use herald_core::jobs::{JobDescriptor, JobManager, JobOutcome, job_work};
use herald_core::types::{ChannelAddress, DeploymentUpdate, QueueItem, UpdateFinalizer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a stopped loop waits for its in-flight attempt to unwind
const ATTEMPT_SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Uniform contract for one configured chat bot
#[async_trait]
pub trait Provider: Send + Sync {
    /// Configured bot name
    fn name(&self) -> &str;

    fn kind(&self) -> ChatProviderKind;

    /// Whether the underlying connection is currently up
    fn connected(&self) -> bool;

    /// Text that mentions the bot itself. Fails when not connected.
    fn bot_mention(&self) -> Result<String>;

    /// Resolves once the first connection attempt has finished
    fn initial_connection(&self) -> InitialConnection;

    /// Wait for the next inbound message or remap request
    async fn next_message(&self, token: &CancellationToken) -> Result<QueueItem>;

    /// Stop reconnecting and gracefully leave the network
    async fn disconnect(&self, token: &CancellationToken) -> Result<()>;

    /// Replace the set of channels the bot is present in
    async fn map_channels(
        &self,
        channels: &[ChannelConfig],
        token: &CancellationToken,
    ) -> Result<Vec<ChannelAddress>>;

    /// Send text to a channel or private conversation by real id
    async fn send_message(&self, real_id: u64, text: &str, token: &CancellationToken) -> Result<()>;

    /// (Re)start the reconnection loop with a new interval
    async fn set_reconnect_interval(&self, minutes: u32, connect_now: bool) -> Result<()>;

    /// Announce a deployment and get a handle to post its result
    async fn send_update_message(
        &self,
        update: &DeploymentUpdate,
        token: &CancellationToken,
    ) -> Result<UpdateFinalizer>;
}

/// Protocol specific half of a provider
#[async_trait]
pub trait ProtocolAdapter: Send + Sync + 'static {
    fn kind(&self) -> ChatProviderKind;

    /// Queue the adapter's network callbacks feed
    fn queue(&self) -> &MessageQueue;

    fn connected(&self) -> bool;

    fn bot_mention(&self) -> Result<String>;

    /// Establish the connection. Must leave the adapter disconnected on failure.
    async fn connect(&self, token: &CancellationToken) -> Result<()>;

    /// Gracefully close the connection
    async fn disconnect_impl(&self, token: &CancellationToken) -> Result<()>;

    async fn map_channels(
        &self,
        channels: &[ChannelConfig],
        token: &CancellationToken,
    ) -> Result<Vec<ChannelAddress>>;

    async fn send_message(&self, real_id: u64, text: &str, token: &CancellationToken) -> Result<()>;

    async fn send_update_message(
        &self,
        update: &DeploymentUpdate,
        token: &CancellationToken,
    ) -> Result<UpdateFinalizer>;

    /// Synchronous hard stop of any background network tasks
    fn abort(&self) {}
}

/// Awaitable outcome of a provider's first connection attempt
#[derive(Clone)]
pub struct InitialConnection {
    rx: watch::Receiver<Option<bool>>,
    released: CancellationToken,
}

impl InitialConnection {
    /// Wait for the first attempt; `true` if it connected.
    /// Returns `false` once the provider is disconnected or dropped without an attempt.
    pub async fn wait(&self) -> bool {
        let mut rx = self.rx.clone();
        tokio::select! {
            biased;
            outcome = rx.wait_for(Option::is_some) => match outcome {
                Ok(outcome) => outcome.unwrap_or(false),
                Err(_) => false,
            },
            _ = self.released.cancelled() => self.outcome().unwrap_or(false),
        }
    }

    /// Outcome so far, `None` while the first attempt is pending
    pub fn outcome(&self) -> Option<bool> {
        *self.rx.borrow()
    }
}

struct InitialSignal {
    tx: watch::Sender<Option<bool>>,
    released: CancellationToken,
}

impl InitialSignal {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx,
            released: CancellationToken::new(),
        }
    }

    /// Record the outcome of the first attempt; later calls are ignored
    fn resolve(&self, connected: bool) {
        self.tx.send_if_modified(|value| {
            if value.is_none() {
                *value = Some(connected);
                true
            } else {
                false
            }
        });
    }

    /// Wake waiters without recording an outcome
    fn release(&self) {
        self.released.cancel();
    }

    fn subscribe(&self) -> InitialConnection {
        InitialConnection {
            rx: self.tx.subscribe(),
            released: self.released.clone(),
        }
    }
}

struct EngineShared<A> {
    name: String,
    adapter: Arc<A>,
    jobs: Arc<dyn JobManager>,
    delayer: Arc<dyn Delayer>,
    initial: InitialSignal,
}

impl<A: ProtocolAdapter> EngineShared<A> {
    /// Run one reconnection job and wait for it.
    ///
    /// If `token` fires mid-attempt the job is cancelled with it, and this
    /// still waits for the job to unwind so no attempt outlives the loop.
    async fn reconnect_once(&self, token: &CancellationToken) -> anyhow::Result<JobOutcome> {
        let adapter = self.adapter.clone();
        let work = job_work(move |job_token| async move {
            if adapter.connected() {
                adapter.disconnect_impl(&job_token).await?;
            }
            adapter.connect(&job_token).await?;
            if job_token.is_cancelled() {
                // Connected after the attempt was called off
                adapter.disconnect_impl(&CancellationToken::new()).await?;
                return Err(ChatError::Cancelled.into());
            }
            adapter.queue().request_remap();
            Ok::<(), anyhow::Error>(())
        });

        let descriptor = JobDescriptor::new(
            format!("Reconnect chat bot {}", self.name),
            format!("chat-reconnect:{}", self.name),
        );
        let job = self
            .jobs
            .register_operation(descriptor, work, token.child_token())
            .await?;

        let outcome = self.jobs.wait_for_job_completion(&job, token).await?;
        if !token.is_cancelled() {
            return Ok(outcome);
        }

        let settle = CancellationToken::new();
        match tokio::time::timeout(
            ATTEMPT_SETTLE_TIMEOUT,
            self.jobs.wait_for_job_completion(&job, &settle),
        )
        .await
        {
            Ok(Ok(outcome)) => debug!(
                "Cancelled reconnection attempt for {} ended: {:?}",
                self.name, outcome
            ),
            Ok(Err(e)) => warn!(
                "Lost track of reconnection attempt for {}: {:#}",
                self.name, e
            ),
            Err(_) => warn!(
                "Reconnection attempt for {} did not stop within {:?}",
                self.name, ATTEMPT_SETTLE_TIMEOUT
            ),
        }
        Ok(JobOutcome::Cancelled)
    }
}

async fn reconnection_loop<A: ProtocolAdapter>(
    shared: Arc<EngineShared<A>>,
    interval: Duration,
    mut connect_now: bool,
    token: CancellationToken,
) {
    debug!(
        "Reconnection loop for {} started (interval: {:?})",
        shared.name, interval
    );

    loop {
        if connect_now {
            connect_now = false;
        } else if shared.delayer.delay(interval, &token).await.is_err() {
            break;
        }
        if token.is_cancelled() {
            break;
        }

        if shared.adapter.connected() {
            shared.initial.resolve(true);
            continue;
        }

        match shared.reconnect_once(&token).await {
            Ok(JobOutcome::Completed) => {
                info!("Chat bot {} connected", shared.name);
                shared.initial.resolve(true);
            }
            Ok(JobOutcome::Cancelled) if token.is_cancelled() => break,
            Ok(JobOutcome::Cancelled) => {
                debug!("Reconnection attempt for {} was cancelled", shared.name);
                shared.initial.resolve(false);
            }
            Ok(JobOutcome::Faulted(message)) => {
                warn!("Reconnection attempt for {} failed: {}", shared.name, message);
                shared.initial.resolve(false);
            }
            Err(e) => {
                warn!(
                    "Could not start reconnection job for {}: {:#}",
                    shared.name, e
                );
                shared.initial.resolve(false);
            }
        }
    }

    debug!("Reconnection loop for {} exiting", shared.name);
}

struct ReconnectLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ReconnectLoop {
    /// Cancel the loop and wait for it to exit
    async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await
            && !e.is_cancelled()
        {
            warn!("Reconnection loop ended abnormally: {}", e);
        }
    }
}

/// A [`Provider`] driving a [`ProtocolAdapter`]
pub struct ChatProvider<A: ProtocolAdapter> {
    shared: Arc<EngineShared<A>>,
    reconnect: Mutex<Option<ReconnectLoop>>,
}

impl<A: ProtocolAdapter> ChatProvider<A> {
    pub fn new(
        name: impl Into<String>,
        adapter: A,
        jobs: Arc<dyn JobManager>,
        delayer: Arc<dyn Delayer>,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                name: name.into(),
                adapter: Arc::new(adapter),
                jobs,
                delayer,
                initial: InitialSignal::new(),
            }),
            reconnect: Mutex::new(None),
        }
    }

    /// The wrapped adapter
    pub fn adapter(&self) -> &A {
        &self.shared.adapter
    }

    async fn stop_reconnect_loop(&self) {
        let previous = self.reconnect.lock().await.take();
        if let Some(previous) = previous {
            debug!("Stopping reconnection loop for {}", self.shared.name);
            previous.stop().await;
        }
    }
}

#[async_trait]
impl<A: ProtocolAdapter> Provider for ChatProvider<A> {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn kind(&self) -> ChatProviderKind {
        self.shared.adapter.kind()
    }

    fn connected(&self) -> bool {
        self.shared.adapter.connected()
    }

    fn bot_mention(&self) -> Result<String> {
        self.shared.adapter.bot_mention()
    }

    fn initial_connection(&self) -> InitialConnection {
        self.shared.initial.subscribe()
    }

    async fn next_message(&self, token: &CancellationToken) -> Result<QueueItem> {
        self.shared.adapter.queue().next_message(token).await
    }

    async fn disconnect(&self, token: &CancellationToken) -> Result<()> {
        self.stop_reconnect_loop().await;
        self.shared.initial.release();
        if self.shared.adapter.connected() {
            info!("Disconnecting chat bot {}", self.shared.name);
            self.shared.adapter.disconnect_impl(token).await?;
        }
        Ok(())
    }

    async fn map_channels(
        &self,
        channels: &[ChannelConfig],
        token: &CancellationToken,
    ) -> Result<Vec<ChannelAddress>> {
        self.shared.adapter.map_channels(channels, token).await
    }

    async fn send_message(&self, real_id: u64, text: &str, token: &CancellationToken) -> Result<()> {
        self.shared.adapter.send_message(real_id, text, token).await
    }

    async fn set_reconnect_interval(&self, minutes: u32, connect_now: bool) -> Result<()> {
        if minutes == 0 {
            return Err(ChatError::invalid_argument(
                "reconnection interval must be at least one minute",
            ));
        }

        // Holding the lock across stop and start keeps exactly one loop alive
        let mut guard = self.reconnect.lock().await;
        if let Some(previous) = guard.take() {
            previous.stop().await;
        }

        let token = CancellationToken::new();
        let interval = Duration::from_secs(u64::from(minutes) * 60);
        let handle = tokio::spawn(reconnection_loop(
            self.shared.clone(),
            interval,
            connect_now,
            token.clone(),
        ));
        *guard = Some(ReconnectLoop { token, handle });
        info!(
            "Chat bot {} reconnects every {} minute(s)",
            self.shared.name, minutes
        );
        Ok(())
    }

    async fn send_update_message(
        &self,
        update: &DeploymentUpdate,
        token: &CancellationToken,
    ) -> Result<UpdateFinalizer> {
        self.shared.adapter.send_update_message(update, token).await
    }
}

impl<A: ProtocolAdapter> Drop for ChatProvider<A> {
    fn drop(&mut self) {
        if let Some(reconnect) = self.reconnect.get_mut().take() {
            reconnect.token.cancel();
            reconnect.handle.abort();
        }
        self.shared.initial.release();
        self.shared.adapter.abort();
    }
}
