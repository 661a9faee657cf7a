use crate::domain::{
    subscription_path, topic_path, validate_struct, Acknowledger, Attributes, BusMessage,
    DomainError, DomainResult, MessageHandler, MessagePublisher, MessageSubscriber,
    ReceivedMessage, SubscriptionInfo, TopicAdmin, TopicInfo,
};
use crate::nats::trace_context::{inject_trace_context, is_trace_header, set_span_parent};
use anyhow::{anyhow, Context};
use async_nats::jetstream::{self, consumer::pull, stream::Config as StreamConfig};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use futures::{StreamExt, TryStreamExt};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Tuning for the pull loop behind [`MessageSubscriber::subscribe`].
#[derive(Debug, Clone, Copy)]
pub struct NatsBusSettings {
    pub batch_size: usize,
    pub fetch_wait: Duration,
    pub max_concurrency: usize,
    pub ack_wait: Duration,
}

impl Default for NatsBusSettings {
    fn default() -> Self {
        Self {
            batch_size: 30,
            fetch_wait: Duration::from_secs(5),
            max_concurrency: 10,
            ack_wait: Duration::from_secs(30),
        }
    }
}

/// Stored in the stream description so topics can be listed per project.
#[derive(Debug, Serialize, Deserialize)]
struct TopicDescriptor {
    project_id: String,
    topic_id: String,
}

/// Stored in the consumer description.
#[derive(Debug, Serialize, Deserialize)]
struct SubscriptionDescriptor {
    project_id: String,
    subscription_id: String,
    topic_id: String,
    exactly_once: bool,
}

/// Ids that become part of JetStream stream, subject and consumer names. They
/// are used verbatim, never rewritten, so distinct ids keep distinct names.
/// Project ids carry no `_`, which keeps `{project}_{topic}` unambiguous.
#[derive(Debug, Validate)]
struct JetStreamIds {
    #[garde(pattern(r"^[A-Za-z0-9-]+$"))]
    project_id: String,
    #[garde(pattern(r"^[A-Za-z0-9_-]+$"))]
    id: String,
}

impl JetStreamIds {
    fn check(project_id: &str, id: &str) -> DomainResult<()> {
        validate_struct(&Self {
            project_id: project_id.to_string(),
            id: id.to_string(),
        })
    }
}

pub fn stream_name(project_id: &str, topic_id: &str) -> DomainResult<String> {
    JetStreamIds::check(project_id, topic_id)?;
    Ok(format!("{}_{}", project_id, topic_id))
}

pub fn packet_subject(project_id: &str, topic_id: &str) -> DomainResult<String> {
    Ok(format!("{}.packets", stream_name(project_id, topic_id)?))
}

pub fn consumer_name(project_id: &str, subscription_id: &str) -> DomainResult<String> {
    JetStreamIds::check(project_id, subscription_id)?;
    Ok(subscription_id.to_string())
}

/// Topics are JetStream streams, subscriptions are durable pull consumers,
/// and attributes travel as message headers.
pub struct NatsMessageBus {
    jetstream: jetstream::Context,
    project_id: String,
    settings: NatsBusSettings,
}

impl NatsMessageBus {
    pub fn new(jetstream: jetstream::Context, project_id: &str, settings: NatsBusSettings) -> Self {
        Self {
            jetstream,
            project_id: project_id.to_string(),
            settings,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn project_streams(&self) -> anyhow::Result<Vec<(String, TopicDescriptor)>> {
        let mut streams = self.jetstream.streams();
        let mut found = Vec::new();
        while let Some(info) = streams
            .try_next()
            .await
            .context("Failed to list JetStream streams")?
        {
            let Some(description) = info.config.description.as_deref() else {
                continue;
            };
            match serde_json::from_str::<TopicDescriptor>(description) {
                Ok(descriptor) if descriptor.project_id == self.project_id => {
                    found.push((info.config.name.clone(), descriptor));
                }
                Ok(_) => {}
                Err(_) => debug!(stream = %info.config.name, "skipping stream without topic descriptor"),
            }
        }
        Ok(found)
    }

    async fn require_topic(&self, topic_id: &str) -> DomainResult<String> {
        self.project_streams()
            .await?
            .into_iter()
            .find(|(_, descriptor)| descriptor.topic_id == topic_id)
            .map(|(stream, _)| stream)
            .ok_or_else(|| DomainError::NotFound(topic_path(&self.project_id, topic_id)))
    }

    async fn require_subscription(
        &self,
        subscription_id: &str,
    ) -> DomainResult<(String, SubscriptionInfo)> {
        let subscription = self
            .list_subscriptions()
            .await?
            .into_iter()
            .find(|s| s.subscription_id == subscription_id)
            .ok_or_else(|| {
                DomainError::NotFound(subscription_path(&self.project_id, subscription_id))
            })?;
        let stream = stream_name(&self.project_id, &subscription.topic_id)?;
        Ok((stream, subscription))
    }

    async fn fetch_batch(
        &self,
        consumer: &jetstream::consumer::PullConsumer,
    ) -> anyhow::Result<Vec<jetstream::Message>> {
        let mut messages = consumer
            .fetch()
            .max_messages(self.settings.batch_size)
            .expires(self.settings.fetch_wait)
            .messages()
            .await
            .context("Failed to fetch messages")?;

        let mut batch = Vec::new();
        while let Some(message) = messages.next().await {
            match message {
                Ok(message) => batch.push(message),
                Err(e) => error!(error = %e, "Error receiving message"),
            }
        }
        Ok(batch)
    }

    async fn dispatch_batch(
        &self,
        messages: Vec<jetstream::Message>,
        handler: &Arc<dyn MessageHandler>,
    ) {
        let limit = self.settings.max_concurrency.max(1);
        futures::stream::iter(messages)
            .for_each_concurrent(limit, |message| {
                let handler = handler.clone();
                async move {
                    let span = info_span!(
                        "bus_message",
                        subject = %message.subject,
                        message_id = tracing::field::Empty,
                    );
                    if let Some(headers) = &message.headers {
                        set_span_parent(&span, headers);
                    }
                    let received = into_received_message(message);
                    span.record("message_id", received.message().message_id.as_str());

                    let outcome = handler
                        .on_message_received(received)
                        .instrument(span)
                        .await;
                    debug!(outcome = outcome.label(), "message handled");
                }
            })
            .await;
    }
}

fn headers_to_attributes(headers: &HeaderMap) -> Attributes {
    let mut attributes = Attributes::new();
    for (name, values) in headers.iter() {
        let name = name.to_string();
        if is_trace_header(&name) {
            continue;
        }
        if let Some(value) = values.last() {
            attributes.insert(name, value.as_str().to_string());
        }
    }
    attributes
}

fn into_received_message(message: jetstream::Message) -> ReceivedMessage {
    let (message_id, publish_time) = match message.info() {
        Ok(info) => (
            info.stream_sequence.to_string(),
            Some(DateTime::from_timestamp_nanos(
                info.published.unix_timestamp_nanos() as i64,
            )),
        ),
        Err(e) => {
            warn!(error = %e, "message carries no JetStream metadata");
            (xid::new().to_string(), None)
        }
    };

    let bus_message = BusMessage {
        message_id,
        data: message.payload.clone(),
        attributes: message
            .headers
            .as_ref()
            .map(headers_to_attributes)
            .unwrap_or_default(),
        ordering_key: None,
        publish_time,
    };

    ReceivedMessage::new(bus_message, Box::new(NatsAcknowledger { message }))
}

struct NatsAcknowledger {
    message: jetstream::Message,
}

#[async_trait]
impl Acknowledger for NatsAcknowledger {
    async fn acknowledge(&self) -> anyhow::Result<()> {
        self.message
            .double_ack()
            .await
            .map_err(|e| anyhow!("JetStream double ack failed: {}", e))
    }
}

#[async_trait]
impl TopicAdmin for NatsMessageBus {
    #[instrument(skip(self), fields(project_id = %self.project_id))]
    async fn create_topic(&self, topic_id: &str) -> DomainResult<TopicInfo> {
        let stream = stream_name(&self.project_id, topic_id)?;
        let info = TopicInfo {
            name: topic_path(&self.project_id, topic_id),
            topic_id: topic_id.to_string(),
        };

        if self.require_topic(topic_id).await.is_ok() {
            info!(topic = %info.name, "Topic already exists");
            return Ok(info);
        }

        let descriptor = TopicDescriptor {
            project_id: self.project_id.clone(),
            topic_id: topic_id.to_string(),
        };
        let config = StreamConfig {
            name: stream.clone(),
            subjects: vec![packet_subject(&self.project_id, topic_id)?],
            description: Some(
                serde_json::to_string(&descriptor).context("Failed to encode topic descriptor")?,
            ),
            ..Default::default()
        };

        self.jetstream
            .create_stream(config)
            .await
            .context("Failed to create stream")?;
        info!(topic = %info.name, stream = %stream, "Created topic");
        Ok(info)
    }

    async fn list_topics(&self) -> DomainResult<Vec<TopicInfo>> {
        let mut topics: Vec<TopicInfo> = self
            .project_streams()
            .await?
            .into_iter()
            .map(|(_, descriptor)| TopicInfo {
                name: topic_path(&self.project_id, &descriptor.topic_id),
                topic_id: descriptor.topic_id,
            })
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(topics)
    }

    #[instrument(skip(self), fields(project_id = %self.project_id))]
    async fn delete_topic(&self, topic_id: &str) -> DomainResult<()> {
        let stream = self.require_topic(topic_id).await?;
        self.jetstream
            .delete_stream(&stream)
            .await
            .context("Failed to delete stream")?;
        info!(stream = %stream, "Deleted topic");
        Ok(())
    }

    async fn list_subscriptions(&self) -> DomainResult<Vec<SubscriptionInfo>> {
        let mut subscriptions = Vec::new();
        for (stream_name, _) in self.project_streams().await? {
            let stream = self
                .jetstream
                .get_stream(&stream_name)
                .await
                .context("Failed to get stream")?;
            let mut consumers = stream.consumers();
            while let Some(info) = consumers
                .try_next()
                .await
                .context("Failed to list consumers")?
            {
                let Some(description) = info.config.description.as_deref() else {
                    continue;
                };
                if let Ok(descriptor) = serde_json::from_str::<SubscriptionDescriptor>(description)
                {
                    if descriptor.project_id != self.project_id {
                        continue;
                    }
                    subscriptions.push(SubscriptionInfo {
                        name: subscription_path(&self.project_id, &descriptor.subscription_id),
                        subscription_id: descriptor.subscription_id,
                        topic_id: descriptor.topic_id,
                        exactly_once: descriptor.exactly_once,
                    });
                }
            }
        }
        subscriptions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(subscriptions)
    }

    #[instrument(skip(self), fields(project_id = %self.project_id))]
    async fn create_subscription(
        &self,
        subscription_id: &str,
        topic_id: &str,
        exactly_once: bool,
    ) -> DomainResult<SubscriptionInfo> {
        let name = consumer_name(&self.project_id, subscription_id)?;
        let stream_name = self.require_topic(topic_id).await?;

        let descriptor = SubscriptionDescriptor {
            project_id: self.project_id.clone(),
            subscription_id: subscription_id.to_string(),
            topic_id: topic_id.to_string(),
            exactly_once,
        };
        let config = pull::Config {
            name: Some(name.clone()),
            durable_name: Some(name.clone()),
            description: Some(
                serde_json::to_string(&descriptor)
                    .context("Failed to encode subscription descriptor")?,
            ),
            filter_subject: packet_subject(&self.project_id, topic_id)?,
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ack_wait: self.settings.ack_wait,
            ..Default::default()
        };

        let stream = self
            .jetstream
            .get_stream(&stream_name)
            .await
            .context("Failed to get stream")?;
        stream
            .create_consumer(config)
            .await
            .context("Failed to create consumer")?;

        info!(consumer = %name, stream = %stream_name, exactly_once, "Created subscription");
        Ok(SubscriptionInfo {
            name: subscription_path(&self.project_id, subscription_id),
            subscription_id: subscription_id.to_string(),
            topic_id: topic_id.to_string(),
            exactly_once,
        })
    }
}

#[async_trait]
impl MessagePublisher for NatsMessageBus {
    #[instrument(skip(self, data, attributes), fields(payload_size = data.len()))]
    async fn publish(
        &self,
        topic_id: &str,
        data: Bytes,
        attributes: Attributes,
    ) -> DomainResult<String> {
        let subject = packet_subject(&self.project_id, topic_id)?;

        let mut headers = HeaderMap::new();
        for (key, value) in &attributes {
            headers.insert(key.as_str(), value.as_str());
        }
        inject_trace_context(&mut headers);

        let ack = self
            .jetstream
            .publish_with_headers(subject, headers, data)
            .await
            .map_err(|e| DomainError::DeliveryError(format!("publish to {}: {}", topic_id, e)))?;
        let ack = ack.await.map_err(|e| {
            DomainError::DeliveryError(format!("no acknowledgment from {}: {}", topic_id, e))
        })?;

        debug!(stream = %ack.stream, sequence = ack.sequence, "Message accepted");
        Ok(ack.sequence.to_string())
    }
}

#[async_trait]
impl MessageSubscriber for NatsMessageBus {
    #[instrument(skip(self, handler, cancel), fields(project_id = %self.project_id))]
    async fn subscribe(
        &self,
        subscription_id: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> DomainResult<()> {
        let (stream_name, subscription) = self.require_subscription(subscription_id).await?;
        let stream = self
            .jetstream
            .get_stream(&stream_name)
            .await
            .context("Failed to get stream")?;
        let consumer: jetstream::consumer::PullConsumer = stream
            .get_consumer(&consumer_name(&self.project_id, subscription_id)?)
            .await
            .map_err(|e| anyhow!("Failed to get consumer: {}", e))?;

        info!(
            subscription = %subscription.name,
            stream = %stream_name,
            max_concurrency = self.settings.max_concurrency,
            "Listening for messages"
        );

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.fetch_batch(&consumer) => result,
            };

            match batch {
                Ok(messages) if messages.is_empty() => debug!("no messages in batch"),
                Ok(messages) => {
                    debug!(message_count = messages.len(), "received message batch");
                    self.dispatch_batch(messages, &handler).await;
                }
                Err(e) => {
                    error!(error = %e, "error fetching batch");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!(subscription = %subscription.name, "Stopped listening");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_name_joins_project_and_topic() {
        assert_eq!(
            stream_name("data-platform-v1-6", "streaming_data_packet_topic").unwrap(),
            "data-platform-v1-6_streaming_data_packet_topic"
        );
    }

    #[test]
    fn test_ids_that_would_share_a_stream_name_are_rejected() {
        for (project, topic) in [
            ("p.x", "t"),
            ("p_x", "t"),
            ("p", "a b*c>"),
            ("p", "a.b"),
            ("", "t"),
            ("p", ""),
        ] {
            assert!(
                matches!(
                    stream_name(project, topic),
                    Err(DomainError::InvalidArgument(_))
                ),
                "{} / {}",
                project,
                topic
            );
        }
        // "a_b" + "c" and "a" + "b_c" would otherwise both become "a_b_c".
        assert!(stream_name("a_b", "c").is_err());
        assert_eq!(stream_name("a", "b_c").unwrap(), "a_b_c");
    }

    #[test]
    fn test_consumer_name_rejects_subject_tokens() {
        assert_eq!(
            consumer_name("p", "streaming_data_packet_subscription").unwrap(),
            "streaming_data_packet_subscription"
        );
        assert!(consumer_name("p", "sub.1").is_err());
        assert!(consumer_name("p", "sub>").is_err());
        assert!(consumer_name("p.x", "sub").is_err());
    }

    #[test]
    fn test_packet_subject() {
        assert_eq!(packet_subject("p", "t").unwrap(), "p_t.packets");
        assert!(packet_subject("p", "t.*").is_err());
    }

    #[test]
    fn test_headers_to_attributes_skips_trace_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("attrs", r#"{"business": "x"}"#);
        headers.insert(
            "traceparent",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        );

        let attributes = headers_to_attributes(&headers);
        assert_eq!(attributes.len(), 1);
        assert_eq!(
            attributes.get("attrs").map(String::as_str),
            Some(r#"{"business": "x"}"#)
        );
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let descriptor = SubscriptionDescriptor {
            project_id: "p".to_string(),
            subscription_id: "s".to_string(),
            topic_id: "t".to_string(),
            exactly_once: true,
        };
        let text = serde_json::to_string(&descriptor).unwrap();
        let parsed: SubscriptionDescriptor = serde_json::from_str(&text).unwrap();
        assert!(parsed.exactly_once);
        assert!(serde_json::from_str::<TopicDescriptor>("not json").is_err());
    }
}
