use crate::domain::PacketPublishService;
use anyhow::Context;
use common::domain::RunMode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct PublisherWorkerConfig {
    pub topic_id: String,
    pub region: String,
    pub channel_count: usize,
    pub run_mode: RunMode,
    /// Pause between packets in loop mode.
    pub publish_interval: Duration,
}

pub struct PublisherWorker {
    service: Arc<PacketPublishService>,
    config: PublisherWorkerConfig,
}

impl PublisherWorker {
    pub fn new(service: Arc<PacketPublishService>, config: PublisherWorkerConfig) -> Self {
        debug!("initializing publisher worker");
        Self { service, config }
    }

    /// Publish until cancelled (loop mode) or exactly once (once mode).
    ///
    /// A missing topic aborts before anything is published. In loop mode a
    /// failed publish is logged and the next packet goes out on schedule; in
    /// once mode it fails the run.
    pub async fn run(self, ctx: CancellationToken) -> anyhow::Result<()> {
        let config = &self.config;
        self.service
            .ensure_topic_exists(&config.topic_id)
            .await
            .with_context(|| format!("topic {} is not available", config.topic_id))?;

        info!(
            topic = %config.topic_id,
            region = %config.region,
            mode = %config.run_mode,
            "publisher started"
        );

        if config.run_mode == RunMode::Once {
            let (_, message_id) = self
                .service
                .publish_new_packet(&config.topic_id, config.channel_count, &config.region)
                .await
                .context("failed to publish packet")?;
            info!(message_id = %message_id, "single packet published");
            return Ok(());
        }

        loop {
            match self
                .service
                .publish_new_packet(&config.topic_id, config.channel_count, &config.region)
                .await
            {
                Ok((packet, message_id)) => {
                    debug!(message_id = %message_id, key = %packet.dedup_key(), "packet sent");
                }
                Err(e) => {
                    error!(error = %e, topic = %config.topic_id, "failed to publish packet");
                }
            }

            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("received shutdown signal, stopping publisher");
                    break;
                }
                _ = tokio::time::sleep(config.publish_interval) => {}
            }
        }

        Ok(())
    }

    #[allow(clippy::type_complexity)]
    pub fn into_runner_process(
        self,
    ) -> Box<
        dyn FnOnce(
                CancellationToken,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
            > + Send,
    > {
        Box::new(move |ctx| Box::pin(async move { self.run(ctx).await }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PacketGenerator;
    use common::domain::{
        MessageSubscriber, Packet, PacketAttributes, SystemClock, TopicAdmin,
    };
    use common::memory::InMemoryBus;

    fn worker(bus: Arc<InMemoryBus>, run_mode: RunMode) -> PublisherWorker {
        let service = PacketPublishService::new(
            bus.clone(),
            bus,
            PacketGenerator::new(Arc::new(SystemClock)),
            PacketAttributes::default(),
        );
        PublisherWorker::new(
            Arc::new(service),
            PublisherWorkerConfig {
                topic_id: "t".to_string(),
                region: "us-east4".to_string(),
                channel_count: 5,
                run_mode,
                publish_interval: Duration::from_secs(120),
            },
        )
    }

    async fn bus_with_topic() -> Arc<InMemoryBus> {
        let bus = Arc::new(InMemoryBus::new("p"));
        bus.create_topic("t").await.unwrap();
        bus.create_subscription("s", "t", true).await.unwrap();
        bus
    }

    #[tokio::test]
    async fn test_missing_topic_aborts() {
        let bus = Arc::new(InMemoryBus::new("p"));
        let result = worker(bus, RunMode::Once)
            .run(CancellationToken::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_once_mode_publishes_single_packet() {
        let bus = bus_with_topic().await;
        worker(bus.clone(), RunMode::Once)
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(bus.pending("s").await, 1);
    }

    #[tokio::test]
    async fn test_once_mode_fails_when_bus_rejects() {
        let bus = bus_with_topic().await;
        bus.reject_publishes(Some("quota exceeded")).await;
        let result = worker(bus.clone(), RunMode::Once)
            .run(CancellationToken::new())
            .await;
        assert!(result.is_err());
        assert_eq!(bus.pending("s").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_mode_publishes_every_interval_until_cancelled() {
        let bus = bus_with_topic().await;
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(worker(bus.clone(), RunMode::Loop).run(ctx.clone()));

        // First packet immediately, then one per 120 s.
        tokio::time::sleep(Duration::from_secs(250)).await;
        ctx.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(bus.pending("s").await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_mode_survives_publish_failures() {
        let bus = bus_with_topic().await;
        bus.reject_publishes(Some("unavailable")).await;
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(worker(bus.clone(), RunMode::Loop).run(ctx.clone()));

        tokio::time::sleep(Duration::from_secs(130)).await;
        bus.reject_publishes(None).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        ctx.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(bus.pending("s").await, 1);
    }

    #[tokio::test]
    async fn test_published_packet_decodes() {
        use common::domain::{MessageOutcome, MockMessageHandler};

        let bus = bus_with_topic().await;
        worker(bus.clone(), RunMode::Once)
            .run(CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let mut handler = MockMessageHandler::new();
        handler
            .expect_on_message_received()
            .times(1)
            .returning(move |message| {
                let packet = Packet::from_wire_bytes(&message.message().data).unwrap();
                assert_eq!(packet.region, "us-east4");
                assert_eq!(packet.channels.len(), 5);
                stop.cancel();
                MessageOutcome::DecodeFailed("inspected only".to_string())
            });

        bus.subscribe("s", Arc::new(handler), cancel).await.unwrap();
    }
}
