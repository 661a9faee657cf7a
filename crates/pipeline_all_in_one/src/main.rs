mod config;

use analytics_worker::analytics_worker::{AnalyticsWorker, AnalyticsWorkerConfig};
use analytics_worker::domain::TableAnalyticsService;
use anyhow::Context;
use clap::{Parser, Subcommand};
use common::clickhouse::{ClickHouseClient, ClickHouseRowStore};
use common::domain::{
    PacketAttributes, QueryMode, RowStore, RunMode, SystemClock, TableCatalog, TopicAdmin,
};
use common::nats::{NatsClient, NatsMessageBus};
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryProviders};
use config::ServiceConfig;
use pipeline_runner::Runner;
use publisher_worker::domain::{PacketGenerator, PacketPublishService};
use publisher_worker::publisher_worker::{PublisherWorker, PublisherWorkerConfig};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use subscriber_worker::domain::DedupCoordinator;
use subscriber_worker::subscriber_worker::{SubscriberWorker, SubscriberWorkerConfig};
use tracing::{debug, error, info};

/// Synthetic telemetry pipeline over NATS JetStream and ClickHouse.
///
/// Settings come from `PIPELINE_*` environment variables; flags override a few
/// of them for a single invocation.
#[derive(Debug, Parser)]
#[command(name = "pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Publish generated packets to the topic
    Publish {
        /// Overrides PIPELINE_RUN_MODE
        #[arg(long)]
        mode: Option<RunMode>,
    },
    /// Store packets from the subscription, skipping duplicates
    Subscribe {
        /// Overrides PIPELINE_RUN_MODE
        #[arg(long)]
        mode: Option<RunMode>,
    },
    /// Summarise channel values stored in the table
    Analytics {
        /// Overrides PIPELINE_CHANNEL_COUNT
        #[arg(long)]
        channels: Option<usize>,
        /// Run the query at low priority and poll for completion
        #[arg(long)]
        batch: bool,
        /// Overrides PIPELINE_ANALYTICS_CACHE_PATH
        #[arg(long)]
        cache: Option<PathBuf>,
    },
    /// Manage topics of the project
    Topics {
        #[command(subcommand)]
        command: TopicsCommand,
    },
    /// Manage subscriptions of the project
    Subscriptions {
        #[command(subcommand)]
        command: SubscriptionsCommand,
    },
    /// Inspect the packet table
    Table {
        #[command(subcommand)]
        command: TableCommand,
    },
}

#[derive(Debug, Subcommand)]
enum TopicsCommand {
    List,
    /// Defaults to PIPELINE_TOPIC_ID
    Create { topic_id: Option<String> },
    /// Defaults to PIPELINE_TOPIC_ID
    Delete { topic_id: Option<String> },
}

#[derive(Debug, Subcommand)]
enum SubscriptionsCommand {
    List,
    /// Pull subscription on a topic; ids default to PIPELINE_SUBSCRIPTION_ID and PIPELINE_TOPIC_ID
    Create {
        subscription_id: Option<String>,
        #[arg(long)]
        topic: Option<String>,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        exactly_once: bool,
    },
}

#[derive(Debug, Subcommand)]
enum TableCommand {
    /// Report whether the dataset and table exist
    Check,
    /// List stored packets with their delivery latencies
    Rows {
        #[arg(long)]
        batch: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers = match init_telemetry(&config.telemetry_config()) {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        project_id = %config.project_id,
        otel_enabled = config.otel_enabled,
        "Starting telemetry pipeline"
    );
    debug!(
        nats_url = %config.nats_url,
        clickhouse_url = %config.clickhouse_url,
        run_mode = %config.run_mode,
        "Configuration loaded"
    );

    match cli.command {
        Command::Publish { mode } => {
            run_publisher(config, mode, telemetry_providers).await;
        }
        Command::Subscribe { mode } => {
            run_subscriber(config, mode, telemetry_providers).await;
        }
        command => {
            let result = run_command(command, &config).await;
            shutdown_telemetry(telemetry_providers);
            if let Err(e) = result {
                error!(error = format!("{:#}", e), "Command failed");
                eprintln!("Error: {:#}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn connect_nats(config: &ServiceConfig) -> anyhow::Result<Arc<NatsClient>> {
    let client = NatsClient::connect(
        &config.nats_url,
        Duration::from_secs(config.startup_timeout_secs),
    )
    .await?;
    Ok(Arc::new(client))
}

fn message_bus(client: &NatsClient, config: &ServiceConfig) -> Arc<NatsMessageBus> {
    client.create_message_bus(&config.project_id, config.nats_bus_settings())
}

async fn connect_clickhouse(config: &ServiceConfig) -> anyhow::Result<Arc<ClickHouseRowStore>> {
    let client = ClickHouseClient::new(
        &config.clickhouse_url,
        &config.clickhouse_username,
        &config.clickhouse_password,
    );
    tokio::time::timeout(
        Duration::from_secs(config.startup_timeout_secs),
        client.ping(),
    )
    .await
    .context("Timed out waiting for ClickHouse")??;
    Ok(Arc::new(ClickHouseRowStore::new(client)))
}

fn exit_on_startup_error<T>(result: anyhow::Result<T>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            error!(error = format!("{:#}", e), "Failed to initialize {}", what);
            std::process::exit(1);
        }
    }
}

fn nats_closer(
    nats_client: Arc<NatsClient>,
    telemetry_providers: Option<TelemetryProviders>,
) -> impl FnOnce() -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>
       + Send
       + 'static {
    move || {
        Box::pin(async move {
            info!("Running cleanup tasks...");
            if let Ok(client) = Arc::try_unwrap(nats_client) {
                client.close().await?;
            }
            shutdown_telemetry(telemetry_providers);
            info!("Cleanup complete");
            Ok(())
        })
    }
}

async fn run_publisher(
    config: ServiceConfig,
    mode: Option<RunMode>,
    telemetry_providers: Option<TelemetryProviders>,
) {
    let nats_client = exit_on_startup_error(connect_nats(&config).await, "NATS");
    let bus = message_bus(&nats_client, &config);

    let service = Arc::new(PacketPublishService::new(
        bus.clone(),
        bus,
        PacketGenerator::new(Arc::new(SystemClock)),
        PacketAttributes::default(),
    ));
    let worker = PublisherWorker::new(
        service,
        PublisherWorkerConfig {
            topic_id: config.topic_id.clone(),
            region: config.region.clone(),
            channel_count: config.channel_count,
            run_mode: mode.unwrap_or(config.run_mode),
            publish_interval: Duration::from_secs(config.publish_interval_secs),
        },
    );

    Runner::new()
        .with_app_process("publisher_worker", worker.into_runner_process())
        .with_closer(nats_closer(nats_client, telemetry_providers))
        .with_closer_timeout(Duration::from_secs(10))
        .run()
        .await;
}

async fn run_subscriber(
    config: ServiceConfig,
    mode: Option<RunMode>,
    telemetry_providers: Option<TelemetryProviders>,
) {
    let nats_client = exit_on_startup_error(connect_nats(&config).await, "NATS");
    let store = exit_on_startup_error(connect_clickhouse(&config).await, "ClickHouse");
    let table = exit_on_startup_error(
        config.table_ref().map_err(anyhow::Error::from),
        "table reference",
    );
    let bus = message_bus(&nats_client, &config);

    let handler = Arc::new(DedupCoordinator::new(
        store,
        table,
        Arc::new(SystemClock),
        config.dedup_settings(),
    ));
    let worker = SubscriberWorker::new(
        bus.clone(),
        bus,
        handler,
        SubscriberWorkerConfig {
            subscription_id: config.subscription_id.clone(),
            run_mode: mode.unwrap_or(config.run_mode),
            listen_timeout: Duration::from_secs(config.listen_timeout_secs),
            check_interval: Duration::from_secs(config.check_interval_secs),
        },
    );

    Runner::new()
        .with_app_process("subscriber_worker", worker.into_runner_process())
        .with_closer(nats_closer(nats_client, telemetry_providers))
        .with_closer_timeout(Duration::from_secs(10))
        .run()
        .await;
}

/// One-shot commands: print to stdout and return.
async fn run_command(command: Command, config: &ServiceConfig) -> anyhow::Result<()> {
    let mut out = std::io::stdout();
    match command {
        Command::Analytics {
            channels,
            batch,
            cache,
        } => {
            let store = connect_clickhouse(config).await?;
            let worker = AnalyticsWorker::new(
                Arc::new(TableAnalyticsService::new(store)),
                AnalyticsWorkerConfig {
                    table: config.table_ref()?,
                    channel_count: channels.unwrap_or(config.channel_count),
                    query_mode: query_mode(batch, config),
                    cache_path: cache.or_else(|| config.analytics_cache_path.clone()),
                },
            );
            let report = worker.run().await?;
            write!(out, "{}", report)?;
        }
        Command::Topics { command } => {
            let nats_client = connect_nats(config).await?;
            let bus = message_bus(&nats_client, config);
            run_topics_command(command, &*bus, config, &mut out).await?;
        }
        Command::Subscriptions { command } => {
            let nats_client = connect_nats(config).await?;
            let bus = message_bus(&nats_client, config);
            run_subscriptions_command(command, &*bus, config, &mut out).await?;
        }
        Command::Table { command } => {
            let store = connect_clickhouse(config).await?;
            run_table_command(command, store, config, &mut out).await?;
        }
        Command::Publish { .. } | Command::Subscribe { .. } => {
            anyhow::bail!("long-running commands are not handled here")
        }
    }
    Ok(())
}

fn query_mode(batch: bool, config: &ServiceConfig) -> QueryMode {
    if batch {
        QueryMode::Batch(config.poll_policy())
    } else {
        QueryMode::Interactive
    }
}

async fn run_topics_command(
    command: TopicsCommand,
    admin: &dyn TopicAdmin,
    config: &ServiceConfig,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    match command {
        TopicsCommand::List => {
            for topic in admin.list_topics().await? {
                writeln!(out, "{}", topic.name)?;
            }
        }
        TopicsCommand::Create { topic_id } => {
            let topic_id = topic_id.unwrap_or_else(|| config.topic_id.clone());
            let topic = admin.create_topic(&topic_id).await?;
            writeln!(out, "Created topic {}", topic.name)?;
        }
        TopicsCommand::Delete { topic_id } => {
            let topic_id = topic_id.unwrap_or_else(|| config.topic_id.clone());
            admin.delete_topic(&topic_id).await?;
            writeln!(out, "Deleted topic {}", topic_id)?;
        }
    }
    Ok(())
}

async fn run_subscriptions_command(
    command: SubscriptionsCommand,
    admin: &dyn TopicAdmin,
    config: &ServiceConfig,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    match command {
        SubscriptionsCommand::List => {
            for subscription in admin.list_subscriptions().await? {
                writeln!(
                    out,
                    "{}\ttopic={}\texactly_once={}",
                    subscription.name, subscription.topic_id, subscription.exactly_once
                )?;
            }
        }
        SubscriptionsCommand::Create {
            subscription_id,
            topic,
            exactly_once,
        } => {
            let subscription_id = subscription_id.unwrap_or_else(|| config.subscription_id.clone());
            let topic_id = topic.unwrap_or_else(|| config.topic_id.clone());
            let subscription = admin
                .create_subscription(&subscription_id, &topic_id, exactly_once)
                .await?;
            writeln!(
                out,
                "Created subscription {} on topic {}",
                subscription.name, subscription.topic_id
            )?;
        }
    }
    Ok(())
}

async fn run_table_command(
    command: TableCommand,
    store: Arc<dyn RowStore>,
    config: &ServiceConfig,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    match command {
        TableCommand::Check => {
            let catalog = TableCatalog::new(store);
            let dataset = catalog.dataset_exists(&config.dataset_id).await?;
            let table = dataset
                && catalog
                    .table_exists(&config.project_id, &config.dataset_id, &config.table_id)
                    .await?;
            writeln!(out, "dataset {}: {}", config.dataset_id, presence(dataset))?;
            writeln!(out, "table {}: {}", config.table_id, presence(table))?;
        }
        TableCommand::Rows { batch } => {
            let service = TableAnalyticsService::new(store);
            let latencies = service
                .list_latencies(&config.table_ref()?, query_mode(batch, config))
                .await?;
            writeln!(out, "unix_ms\tpub_region\tdatetime_created\tmsg_trip_s\tmsg_proc_s")?;
            for row in latencies {
                writeln!(
                    out,
                    "{}\t{}\t{}\t{}\t{}",
                    row.unix_ms, row.pub_region, row.datetime_created, row.msg_trip_s, row.msg_proc_s
                )?;
            }
        }
    }
    Ok(())
}

fn presence(exists: bool) -> &'static str {
    if exists {
        "found"
    } else {
        "not found or insufficient permission"
    }
}
