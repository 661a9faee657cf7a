use crate::domain::PacketGenerator;
use common::domain::{
    DomainError, DomainResult, MessagePublisher, Packet, PacketAttributes, TopicAdmin,
};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// Producer side of the pipeline: generates packets and hands them to the bus.
pub struct PacketPublishService {
    admin: Arc<dyn TopicAdmin>,
    publisher: Arc<dyn MessagePublisher>,
    generator: PacketGenerator,
    attributes: PacketAttributes,
}

impl PacketPublishService {
    pub fn new(
        admin: Arc<dyn TopicAdmin>,
        publisher: Arc<dyn MessagePublisher>,
        generator: PacketGenerator,
        attributes: PacketAttributes,
    ) -> Self {
        Self {
            admin,
            publisher,
            generator,
            attributes,
        }
    }

    /// Fails with `NotFound` unless the topic is listed in the project.
    #[instrument(skip(self))]
    pub async fn ensure_topic_exists(&self, topic_id: &str) -> DomainResult<()> {
        let topics = self.admin.list_topics().await?;
        if topics.iter().any(|t| t.topic_id == topic_id) {
            debug!(topic_count = topics.len(), "topic found");
            return Ok(());
        }
        let available: Vec<&str> = topics.iter().map(|t| t.name.as_str()).collect();
        error!(available = ?available, "topic not found");
        Err(DomainError::NotFound(format!("topic {}", topic_id)))
    }

    /// Publish one packet with the metadata attribute. Not retried on failure.
    #[instrument(skip(self, packet), fields(key = %packet.dedup_key()))]
    pub async fn publish(&self, packet: &Packet, topic_id: &str) -> DomainResult<String> {
        let data = packet.to_wire_bytes()?;
        let attributes = self.attributes.to_attributes()?;

        let message_id = self
            .publisher
            .publish(topic_id, data, attributes)
            .await
            .map_err(|e| match e {
                DomainError::DeliveryError(_) => e,
                other => DomainError::DeliveryError(other.to_string()),
            })?;

        info!(
            message_id = %message_id,
            topic = %topic_id,
            unix_ms = packet.unix_ms,
            "published packet"
        );
        Ok(message_id)
    }

    pub async fn publish_new_packet(
        &self,
        topic_id: &str,
        channel_count: usize,
        region: &str,
    ) -> DomainResult<(Packet, String)> {
        let packet = self.generator.generate_packet(channel_count, region)?;
        let message_id = self.publish(&packet, topic_id).await?;
        Ok((packet, message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use common::domain::{
        FixedClock, MockMessagePublisher, MockTopicAdmin, TopicInfo, ATTRS_ATTRIBUTE,
    };

    fn generator() -> PacketGenerator {
        let instant = DateTime::from_timestamp(1_726_846_298, 520_109_000).unwrap();
        PacketGenerator::new(Arc::new(FixedClock::new(instant)))
    }

    fn topic(id: &str) -> TopicInfo {
        TopicInfo {
            name: format!("projects/p/topics/{}", id),
            topic_id: id.to_string(),
        }
    }

    fn service(admin: MockTopicAdmin, publisher: MockMessagePublisher) -> PacketPublishService {
        PacketPublishService::new(
            Arc::new(admin),
            Arc::new(publisher),
            generator(),
            PacketAttributes::default(),
        )
    }

    #[tokio::test]
    async fn test_ensure_topic_exists() {
        let mut admin = MockTopicAdmin::new();
        admin
            .expect_list_topics()
            .times(2)
            .returning(|| Ok(vec![topic("other"), topic("streaming_data_packet_topic")]));

        let service = service(admin, MockMessagePublisher::new());
        assert!(service
            .ensure_topic_exists("streaming_data_packet_topic")
            .await
            .is_ok());
        assert!(matches!(
            service.ensure_topic_exists("missing").await,
            Err(DomainError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_sends_wire_bytes_and_attrs() {
        let mut publisher = MockMessagePublisher::new();
        publisher
            .expect_publish()
            .withf(|topic, data, attributes| {
                topic == "t"
                    && data.starts_with(br#"{"datetime_created": "2024-09-20T15:31:38.520109+0000", "unix_ms": 1726846298000.0"#)
                    && attributes.contains_key(ATTRS_ATTRIBUTE)
            })
            .times(1)
            .returning(|_, _, _| Ok("42".to_string()));

        let service = service(MockTopicAdmin::new(), publisher);
        let (packet, message_id) = service.publish_new_packet("t", 5, "us-east4").await.unwrap();

        assert_eq!(message_id, "42");
        assert_eq!(packet.channels.len(), 5);
    }

    #[tokio::test]
    async fn test_publish_failure_is_delivery_error() {
        let mut publisher = MockMessagePublisher::new();
        publisher
            .expect_publish()
            .times(1)
            .returning(|_, _, _| Err(DomainError::BackendError(anyhow::anyhow!("no responders"))));

        let service = service(MockTopicAdmin::new(), publisher);
        let err = service
            .publish_new_packet("t", 5, "us-east4")
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::DeliveryError(_)));
    }

    #[tokio::test]
    async fn test_invalid_packet_never_reaches_bus() {
        let mut publisher = MockMessagePublisher::new();
        publisher.expect_publish().never();

        let service = service(MockTopicAdmin::new(), publisher);
        assert!(matches!(
            service.publish_new_packet("t", 5, " ").await,
            Err(DomainError::InvalidArgument(_))
        ));
    }
}
