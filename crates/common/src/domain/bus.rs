use crate::domain::packet::DedupKey;
use crate::domain::result::{DomainError, DomainResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// String-valued message attributes.
pub type Attributes = BTreeMap<String, String>;

pub fn topic_path(project_id: &str, topic_id: &str) -> String {
    format!("projects/{}/topics/{}", project_id, topic_id)
}

pub fn subscription_path(project_id: &str, subscription_id: &str) -> String {
    format!("projects/{}/subscriptions/{}", project_id, subscription_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    /// Fully qualified `projects/{project}/topics/{topic}`
    pub name: String,
    pub topic_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Fully qualified `projects/{project}/subscriptions/{subscription}`
    pub name: String,
    pub subscription_id: String,
    pub topic_id: String,
    pub exactly_once: bool,
}

/// A message as delivered by the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub message_id: String,
    pub data: Bytes,
    pub attributes: Attributes,
    pub ordering_key: Option<String>,
    pub publish_time: Option<DateTime<Utc>>,
}

/// Settles a delivered message with the bus.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledge and wait for the bus to confirm.
    async fn acknowledge(&self) -> anyhow::Result<()>;
}

/// A delivered message together with the handle used to acknowledge it.
pub struct ReceivedMessage {
    message: BusMessage,
    acknowledger: Box<dyn Acknowledger>,
}

impl ReceivedMessage {
    pub fn new(message: BusMessage, acknowledger: Box<dyn Acknowledger>) -> Self {
        Self {
            message,
            acknowledger,
        }
    }

    pub fn message(&self) -> &BusMessage {
        &self.message
    }

    /// Acknowledge and wait for confirmation, giving up after `deadline`.
    pub async fn ack_with_response(&self, deadline: Duration) -> DomainResult<()> {
        match tokio::time::timeout(deadline, self.acknowledger.acknowledge()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DomainError::AckError(format!(
                "message {}: {:#}",
                self.message.message_id, e
            ))),
            Err(_) => Err(DomainError::Timeout(format!(
                "ack of message {} exceeded {:?}",
                self.message.message_id, deadline
            ))),
        }
    }
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Terminal state reached by the consumer for one message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    Inserted(DedupKey),
    Duplicate { key: DedupKey, matches: u64 },
    DecodeFailed(String),
    InsertFailed { key: DedupKey, reason: String },
    TableUnavailable(DedupKey),
}

impl MessageOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            MessageOutcome::Inserted(_) => "INSERTED",
            MessageOutcome::Duplicate { .. } => "DUPLICATE",
            MessageOutcome::DecodeFailed(_) => "DECODE_FAILED",
            MessageOutcome::InsertFailed { .. } => "INSERT_FAILED",
            MessageOutcome::TableUnavailable(_) => "TABLE_UNAVAILABLE",
        }
    }
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message_received(&self, message: ReceivedMessage) -> MessageOutcome;
}

/// Topic and subscription administration within one project.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    async fn create_topic(&self, topic_id: &str) -> DomainResult<TopicInfo>;

    async fn list_topics(&self) -> DomainResult<Vec<TopicInfo>>;

    async fn delete_topic(&self, topic_id: &str) -> DomainResult<()>;

    async fn list_subscriptions(&self) -> DomainResult<Vec<SubscriptionInfo>>;

    async fn create_subscription(
        &self,
        subscription_id: &str,
        topic_id: &str,
        exactly_once: bool,
    ) -> DomainResult<SubscriptionInfo>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish and wait for the bus to accept the message. Returns its id.
    async fn publish(
        &self,
        topic_id: &str,
        data: Bytes,
        attributes: Attributes,
    ) -> DomainResult<String>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MessageSubscriber: Send + Sync {
    /// Deliver messages from `subscription_id` to `handler` until `cancel` fires.
    async fn subscribe(
        &self,
        subscription_id: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> DomainResult<()>;
}
