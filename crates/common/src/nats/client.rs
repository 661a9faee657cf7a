use crate::nats::message_bus::{NatsBusSettings, NatsMessageBus};
use anyhow::{Context, Result};
use async_nats::jetstream;
use std::sync::Arc;
use tracing::info;

pub struct NatsClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsClient {
    pub async fn connect(url: &str, timeout: std::time::Duration) -> Result<Self> {
        info!(url = %url, timeout_ms = timeout.as_millis(), "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .connect(url)
            .await
            .context("Failed to connect to NATS")?;

        let jetstream = jetstream::new(client.clone());

        info!("Successfully connected to NATS");
        Ok(Self { client, jetstream })
    }

    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    /// Bus binding scoped to one project. It implements topic admin,
    /// publishing, and subscribing.
    pub fn create_message_bus(
        &self,
        project_id: &str,
        settings: NatsBusSettings,
    ) -> Arc<NatsMessageBus> {
        Arc::new(NatsMessageBus::new(
            self.jetstream.clone(),
            project_id,
            settings,
        ))
    }

    pub async fn close(self) -> Result<()> {
        info!("Closing NATS connection");
        self.client
            .flush()
            .await
            .context("Failed to flush NATS connection")?;
        Ok(())
    }
}
