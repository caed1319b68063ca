//! Shared types for herald-core

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Reserved channel id meaning "every visible channel that is not mapped"
pub const UNMAPPED_CHANNELS_ID: u64 = 0;

/// A channel (or private conversation) as seen by the rest of the platform.
///
/// `real_id` is stable for the lifetime of the provider that issued it and is
/// never reused for a different native channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAddress {
    pub real_id: u64,
    pub is_private: bool,
    pub is_admin_channel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Server or guild the channel lives on
    pub connection_name: String,
    /// Human readable channel name
    pub friendly_name: String,
}

impl ChannelAddress {
    /// Address for a private conversation with a single peer
    pub fn private(real_id: u64, connection_name: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            real_id,
            is_private: true,
            is_admin_channel: false,
            tag: None,
            connection_name: connection_name.into(),
            friendly_name: peer.into(),
        }
    }
}

/// The author of an inbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUser {
    pub real_id: u64,
    pub display_name: String,
    /// Text that pings this user when embedded in a message
    pub mention_token: String,
    pub channel: ChannelAddress,
}

/// A message received from a chat network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub content: String,
    pub author: ChatUser,
}

/// What a consumer gets back from a provider's message queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    /// A regular inbound message
    Message(InboundMessage),
    /// The provider reconnected and the channel mapping may be stale
    RemapRequested,
}

/// A pull request merged on top of the deployed revision for testing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestMerge {
    pub number: u64,
    pub title: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub target_commit_sha: String,
}

/// The source revision a deployment is built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionInfo {
    pub commit_sha: String,
    pub origin_commit_sha: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub test_merges: Vec<TestMerge>,
}

impl RevisionInfo {
    /// Abbreviated commit hash used in notices
    pub fn short_sha(&self) -> &str {
        let end = self
            .commit_sha
            .char_indices()
            .nth(7)
            .map(|(i, _)| i)
            .unwrap_or(self.commit_sha.len());
        &self.commit_sha[..end]
    }

    /// Whether the deployed revision differs from the remote branch head
    pub fn is_local_commit(&self) -> bool {
        self.commit_sha != self.origin_commit_sha
    }
}

/// Everything a provider needs to announce a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentUpdate {
    pub revision: RevisionInfo,
    /// Version of the game engine the deployment compiles against
    pub engine_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
    /// Channel to post the notice in
    pub real_id: u64,
    /// Whether the local commit was pushed to the remote repository
    pub local_commit_pushed: bool,
}

type FinalizeFn = Box<dyn FnOnce(Option<String>, Option<String>) -> BoxFuture<'static, ()> + Send>;

/// Completes a deployment notice once the deployment has finished.
///
/// Call [`UpdateFinalizer::finish`] with an error message on failure (or `None`
/// on success) and the compiler output, if any.
pub struct UpdateFinalizer {
    inner: FinalizeFn,
}

impl UpdateFinalizer {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Option<String>, Option<String>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Box::new(move |error, output| -> BoxFuture<'static, ()> {
                Box::pin(f(error, output))
            }),
        }
    }

    /// A finalizer that does nothing, used when the initial notice could not be posted
    pub fn noop() -> Self {
        Self::new(|_, _| async {})
    }

    pub async fn finish(self, error_message: Option<String>, build_output: Option<String>) {
        (self.inner)(error_message, build_output).await
    }
}

impl std::fmt::Debug for UpdateFinalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateFinalizer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn revision(sha: &str, origin: &str) -> RevisionInfo {
        RevisionInfo {
            commit_sha: sha.to_string(),
            origin_commit_sha: origin.to_string(),
            timestamp: Utc::now(),
            test_merges: vec![],
        }
    }

    #[test]
    fn test_short_sha() {
        assert_eq!(revision("0123456789abcdef", "x").short_sha(), "0123456");
        assert_eq!(revision("abc", "x").short_sha(), "abc");
    }

    #[test]
    fn test_is_local_commit() {
        assert!(!revision("abc", "abc").is_local_commit());
        assert!(revision("abc", "def").is_local_commit());
    }

    #[test]
    fn test_private_address() {
        let address = ChannelAddress::private(7, "irc.example.org", "alice");
        assert!(address.is_private);
        assert!(!address.is_admin_channel);
        assert_eq!(address.friendly_name, "alice");
        assert_eq!(address.real_id, 7);
    }

    #[tokio::test]
    async fn test_finalizer_runs_closure() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let finalizer = UpdateFinalizer::new(move |error, output| async move {
            assert_eq!(error.as_deref(), Some("boom"));
            assert!(output.is_none());
            flag.store(true, Ordering::SeqCst);
        });
        finalizer.finish(Some("boom".to_string()), None).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_noop_finalizer() {
        UpdateFinalizer::noop().finish(None, None).await;
    }
}
