#![cfg(feature = "integration-tests")]

use analytics_worker::domain::TableAnalyticsService;
use anyhow::Result;
use chrono::DateTime;
use common::clickhouse::{ClickHouseClient, ClickHouseRowStore};
use common::domain::{
    FixedClock, PacketAttributes, QueryMode, RunMode, SystemClock, TableCatalog, TableRef,
    TopicAdmin,
};
use common::nats::{NatsBusSettings, NatsClient};
use publisher_worker::domain::{PacketGenerator, PacketPublishService};
use std::sync::Arc;
use std::time::Duration;
use subscriber_worker::domain::{DedupCoordinator, DedupSettings};
use subscriber_worker::subscriber_worker::{SubscriberWorker, SubscriberWorkerConfig};
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, Image};
use testcontainers_modules::clickhouse::ClickHouse;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const PROJECT: &str = "data-platform-v1-6";
const TOPIC: &str = "streaming_data_packet_topic";
const SUBSCRIPTION: &str = "streaming_data_packet_subscription";

/// NATS with JetStream enabled
#[derive(Debug, Clone)]
struct NatsWithJetStream {
    ports: Vec<ContainerPort>,
}

impl Default for NatsWithJetStream {
    fn default() -> Self {
        Self {
            ports: vec![ContainerPort::Tcp(4222)],
        }
    }
}

impl Image for NatsWithJetStream {
    fn name(&self) -> &str {
        "nats"
    }

    fn tag(&self) -> &str {
        "latest"
    }

    fn ready_conditions(&self) -> Vec<WaitFor> {
        vec![WaitFor::seconds(3)]
    }

    fn cmd(&self) -> impl IntoIterator<Item = impl Into<std::borrow::Cow<'_, str>>> {
        vec!["--js"]
    }

    fn expose_ports(&self) -> &[ContainerPort] {
        &self.ports
    }
}

async fn start_containers() -> Result<(
    ContainerAsync<ClickHouse>,
    ContainerAsync<NatsWithJetStream>,
    String, // clickhouse_http_url
    String, // nats_url
)> {
    let (clickhouse, nats) = tokio::join!(
        ClickHouse::default().start(),
        NatsWithJetStream::default().start()
    );
    let clickhouse = clickhouse?;
    let nats = nats?;

    let ch_host = clickhouse.get_host().await?;
    let ch_port = clickhouse.get_host_port_ipv4(8123).await?;
    let clickhouse_url = format!("http://{}:{}", ch_host, ch_port);

    let nats_host = nats.get_host().await?;
    let nats_port = nats.get_host_port_ipv4(4222).await?;
    let nats_url = format!("nats://{}:{}", nats_host, nats_port);

    Ok((clickhouse, nats, clickhouse_url, nats_url))
}

/// Database and packet table with five channels.
async fn create_table(client: &ClickHouseClient, table: &TableRef) -> Result<()> {
    client
        .get_client()
        .query(&format!("CREATE DATABASE IF NOT EXISTS {}", table.dataset_id()))
        .execute()
        .await?;
    client
        .get_client()
        .query(&format!(
            "CREATE TABLE IF NOT EXISTS {}.{} (
                pub_region String,
                datetime_created String,
                unix_ms Int64,
                msg_trip_s Float64,
                msg_proc_s Float64,
                Channel_1 Float64,
                Channel_2 Float64,
                Channel_3 Float64,
                Channel_4 Float64,
                Channel_5 Float64
            ) ENGINE = MergeTree ORDER BY unix_ms",
            table.dataset_id(),
            table.table_id()
        ))
        .execute()
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_packets_flow_from_nats_to_clickhouse_once() -> Result<()> {
    let (_clickhouse, _nats, clickhouse_url, nats_url) = start_containers().await?;
    let table = TableRef::new(PROJECT, "ds_data_platform", "tbl_pubsub")?;

    let ch_client = ClickHouseClient::new(&clickhouse_url, "default", "");
    ch_client.ping().await?;
    let store = Arc::new(ClickHouseRowStore::new(ch_client.clone()));
    let catalog = TableCatalog::new(store.clone());
    assert!(!catalog.table_ref_exists(&table).await?);
    create_table(&ch_client, &table).await?;
    assert!(catalog.table_ref_exists(&table).await?);

    sleep(Duration::from_millis(500)).await;
    let nats_client = NatsClient::connect(&nats_url, Duration::from_secs(10)).await?;
    let bus = nats_client.create_message_bus(PROJECT, NatsBusSettings::default());
    bus.create_topic(TOPIC).await?;
    bus.create_subscription(SUBSCRIPTION, TOPIC, true).await?;
    assert!(bus
        .list_topics()
        .await?
        .iter()
        .any(|t| t.topic_id == TOPIC));

    // Two packets from the same second and region collapse into one row.
    let created_at = DateTime::from_timestamp(1_726_846_298, 520_109_000).unwrap();
    let publisher = PacketPublishService::new(
        bus.clone(),
        bus.clone(),
        PacketGenerator::new(Arc::new(FixedClock::new(created_at))),
        PacketAttributes::default(),
    );
    publisher.publish_new_packet(TOPIC, 5, "us-east4").await?;
    publisher.publish_new_packet(TOPIC, 5, "us-east4").await?;
    publisher.publish_new_packet(TOPIC, 5, "europe-west1").await?;

    let handler = Arc::new(DedupCoordinator::new(
        store.clone(),
        table.clone(),
        Arc::new(SystemClock),
        DedupSettings::default(),
    ));
    let worker = SubscriberWorker::new(
        bus.clone(),
        bus.clone(),
        handler,
        SubscriberWorkerConfig {
            subscription_id: SUBSCRIPTION.to_string(),
            run_mode: RunMode::Once,
            listen_timeout: Duration::from_secs(10),
            check_interval: Duration::from_secs(60),
        },
    );
    worker.run(CancellationToken::new()).await?;

    let analytics = TableAnalyticsService::new(store.clone());
    let latencies = analytics
        .list_latencies(&table, QueryMode::Interactive)
        .await?;
    assert_eq!(latencies.len(), 2);
    assert!(latencies.iter().all(|r| r.unix_ms == 1_726_846_298_000));
    assert!(latencies.iter().all(|r| r.msg_trip_s > 0.0));
    assert!(latencies
        .iter()
        .any(|r| r.datetime_created == "2024-09-20T15:31:38.520109"));

    let frame = analytics
        .load_channel_frame(&table, 5, QueryMode::Batch(Default::default()))
        .await?;
    assert_eq!(frame.len(), 2);

    // Nothing left to redeliver.
    let replay = SubscriberWorker::new(
        bus.clone(),
        bus.clone(),
        Arc::new(DedupCoordinator::new(
            store.clone(),
            table.clone(),
            Arc::new(SystemClock),
            DedupSettings::default(),
        )),
        SubscriberWorkerConfig {
            subscription_id: SUBSCRIPTION.to_string(),
            run_mode: RunMode::Once,
            listen_timeout: Duration::from_secs(3),
            check_interval: Duration::from_secs(60),
        },
    );
    replay.run(CancellationToken::new()).await?;
    assert_eq!(
        analytics
            .list_latencies(&table, QueryMode::Interactive)
            .await?
            .len(),
        2
    );

    bus.delete_topic(TOPIC).await?;
    assert!(bus.list_topics().await?.is_empty());

    nats_client.close().await?;
    Ok(())
}
