use crate::domain::{
    subscription_path, topic_path, validate_resource_id, Acknowledger, Attributes, BusMessage,
    DomainError, DomainResult, MessageHandler, MessagePublisher, MessageSubscriber,
    ReceivedMessage, SubscriptionInfo, TopicAdmin, TopicInfo,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;

struct Subscription {
    topic_id: String,
    exactly_once: bool,
    queue: VecDeque<BusMessage>,
}

#[derive(Default)]
struct BusState {
    topics: BTreeSet<String>,
    subscriptions: BTreeMap<String, Subscription>,
    acknowledged: Vec<String>,
    publish_failure: Option<String>,
}

#[derive(Default)]
struct Shared {
    state: RwLock<BusState>,
    fail_acks: AtomicBool,
}

/// Message bus kept in process memory. Each subscription gets its own copy of
/// every message published to its topic after it was created.
pub struct InMemoryBus {
    project_id: String,
    shared: Arc<Shared>,
    notify: Notify,
    next_id: AtomicU64,
    max_concurrency: usize,
}

impl InMemoryBus {
    pub fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            shared: Arc::new(Shared::default()),
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
            max_concurrency: 10,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Queue raw bytes on a subscription as if they had been published.
    pub async fn inject(
        &self,
        subscription_id: &str,
        data: Bytes,
        attributes: Attributes,
    ) -> DomainResult<String> {
        let message_id = self.next_message_id();
        {
            let mut state = self.shared.state.write().await;
            let subscription = state.subscriptions.get_mut(subscription_id).ok_or_else(|| {
                DomainError::NotFound(subscription_path(&self.project_id, subscription_id))
            })?;
            subscription.queue.push_back(BusMessage {
                message_id: message_id.clone(),
                data,
                attributes,
                ordering_key: None,
                publish_time: Some(Utc::now()),
            });
        }
        self.notify.notify_waiters();
        Ok(message_id)
    }

    pub async fn reject_publishes(&self, reason: Option<&str>) {
        self.shared.state.write().await.publish_failure = reason.map(str::to_string);
    }

    pub fn fail_acks(&self, fail: bool) {
        self.shared.fail_acks.store(fail, Ordering::SeqCst);
    }

    pub async fn pending(&self, subscription_id: &str) -> usize {
        self.shared
            .state
            .read()
            .await
            .subscriptions
            .get(subscription_id)
            .map(|s| s.queue.len())
            .unwrap_or(0)
    }

    pub async fn acknowledged(&self) -> Vec<String> {
        self.shared.state.read().await.acknowledged.clone()
    }

    fn next_message_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    async fn take_batch(&self, subscription_id: &str) -> DomainResult<Vec<BusMessage>> {
        let mut state = self.shared.state.write().await;
        let subscription = state.subscriptions.get_mut(subscription_id).ok_or_else(|| {
            DomainError::NotFound(subscription_path(&self.project_id, subscription_id))
        })?;
        Ok(subscription.queue.drain(..).collect())
    }
}

struct MemoryAcknowledger {
    shared: Arc<Shared>,
    message_id: String,
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn acknowledge(&self) -> anyhow::Result<()> {
        if self.shared.fail_acks.load(Ordering::SeqCst) {
            anyhow::bail!("acknowledgement of {} refused", self.message_id);
        }
        self.shared
            .state
            .write()
            .await
            .acknowledged
            .push(self.message_id.clone());
        Ok(())
    }
}

#[async_trait]
impl TopicAdmin for InMemoryBus {
    async fn create_topic(&self, topic_id: &str) -> DomainResult<TopicInfo> {
        validate_resource_id("topic_id", topic_id)?;
        self.shared
            .state
            .write()
            .await
            .topics
            .insert(topic_id.to_string());
        Ok(TopicInfo {
            name: topic_path(&self.project_id, topic_id),
            topic_id: topic_id.to_string(),
        })
    }

    async fn list_topics(&self) -> DomainResult<Vec<TopicInfo>> {
        Ok(self
            .shared
            .state
            .read()
            .await
            .topics
            .iter()
            .map(|topic_id| TopicInfo {
                name: topic_path(&self.project_id, topic_id),
                topic_id: topic_id.clone(),
            })
            .collect())
    }

    async fn delete_topic(&self, topic_id: &str) -> DomainResult<()> {
        let mut state = self.shared.state.write().await;
        if !state.topics.remove(topic_id) {
            return Err(DomainError::NotFound(topic_path(&self.project_id, topic_id)));
        }
        state.subscriptions.retain(|_, s| s.topic_id != topic_id);
        Ok(())
    }

    async fn list_subscriptions(&self) -> DomainResult<Vec<SubscriptionInfo>> {
        Ok(self
            .shared
            .state
            .read()
            .await
            .subscriptions
            .iter()
            .map(|(id, s)| SubscriptionInfo {
                name: subscription_path(&self.project_id, id),
                subscription_id: id.clone(),
                topic_id: s.topic_id.clone(),
                exactly_once: s.exactly_once,
            })
            .collect())
    }

    async fn create_subscription(
        &self,
        subscription_id: &str,
        topic_id: &str,
        exactly_once: bool,
    ) -> DomainResult<SubscriptionInfo> {
        validate_resource_id("subscription_id", subscription_id)?;
        let mut state = self.shared.state.write().await;
        if !state.topics.contains(topic_id) {
            return Err(DomainError::NotFound(topic_path(&self.project_id, topic_id)));
        }
        state
            .subscriptions
            .entry(subscription_id.to_string())
            .or_insert_with(|| Subscription {
                topic_id: topic_id.to_string(),
                exactly_once,
                queue: VecDeque::new(),
            });
        Ok(SubscriptionInfo {
            name: subscription_path(&self.project_id, subscription_id),
            subscription_id: subscription_id.to_string(),
            topic_id: topic_id.to_string(),
            exactly_once,
        })
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBus {
    async fn publish(
        &self,
        topic_id: &str,
        data: Bytes,
        attributes: Attributes,
    ) -> DomainResult<String> {
        let message_id = self.next_message_id();
        {
            let mut state = self.shared.state.write().await;
            if let Some(reason) = &state.publish_failure {
                return Err(DomainError::DeliveryError(reason.clone()));
            }
            if !state.topics.contains(topic_id) {
                return Err(DomainError::DeliveryError(format!(
                    "{} does not exist",
                    topic_path(&self.project_id, topic_id)
                )));
            }
            let message = BusMessage {
                message_id: message_id.clone(),
                data,
                attributes,
                ordering_key: None,
                publish_time: Some(Utc::now()),
            };
            for subscription in state
                .subscriptions
                .values_mut()
                .filter(|s| s.topic_id == topic_id)
            {
                subscription.queue.push_back(message.clone());
            }
        }
        self.notify.notify_waiters();
        Ok(message_id)
    }
}

#[async_trait]
impl MessageSubscriber for InMemoryBus {
    async fn subscribe(
        &self,
        subscription_id: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> DomainResult<()> {
        loop {
            // Registered before the queue is checked so a publish in between is not missed.
            let notified = self.notify.notified();
            let batch = self.take_batch(subscription_id).await?;

            if batch.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = notified => continue,
                }
            }

            futures::stream::iter(batch)
                .for_each_concurrent(self.max_concurrency, |message| {
                    let handler = handler.clone();
                    let acknowledger = MemoryAcknowledger {
                        shared: self.shared.clone(),
                        message_id: message.message_id.clone(),
                    };
                    async move {
                        handler
                            .on_message_received(ReceivedMessage::new(
                                message,
                                Box::new(acknowledger),
                            ))
                            .await;
                    }
                })
                .await;

            if cancel.is_cancelled() {
                return Ok(());
            }
        }
    }
}
