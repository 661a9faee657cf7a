use crate::domain::{ChannelFrame, Summary, TableAnalyticsService};
use anyhow::Context;
use common::domain::{QueryMode, TableRef};
use publisher_worker::domain::channel_labels;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub struct AnalyticsWorkerConfig {
    pub table: TableRef,
    pub channel_count: usize,
    pub query_mode: QueryMode,
    /// Snapshot file reused between runs instead of querying the table again.
    pub cache_path: Option<PathBuf>,
}

/// Channel frame of one table with its summary statistics.
pub struct AnalyticsReport {
    /// `unix_ms` of the first row before rebasing.
    pub first_unix_ms: Option<i64>,
    pub frame: ChannelFrame,
    pub summary: Summary,
    pub labels: Vec<String>,
}

impl fmt::Display for AnalyticsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({} rows)", self.frame.source, self.frame.len())?;
        if let Some(first) = self.first_unix_ms {
            writeln!(f, "first_row_unix_ms: {}", first)?;
        }
        let legend: Vec<String> = self
            .frame
            .columns
            .iter()
            .zip(&self.labels)
            .map(|(column, label)| format!("{}={}", column, label))
            .collect();
        writeln!(f, "channels: {}", legend.join(", "))?;
        writeln!(f)?;
        write!(f, "{}", self.summary)
    }
}

pub struct AnalyticsWorker {
    service: Arc<TableAnalyticsService>,
    config: AnalyticsWorkerConfig,
}

impl AnalyticsWorker {
    pub fn new(service: Arc<TableAnalyticsService>, config: AnalyticsWorkerConfig) -> Self {
        debug!("initializing analytics worker");
        Self { service, config }
    }

    pub async fn run(&self) -> anyhow::Result<AnalyticsReport> {
        let config = &self.config;
        let frame = match &config.cache_path {
            Some(path) => {
                self.service
                    .load_channel_frame_cached(
                        &config.table,
                        config.channel_count,
                        config.query_mode,
                        path,
                    )
                    .await
            }
            None => {
                self.service
                    .load_channel_frame(&config.table, config.channel_count, config.query_mode)
                    .await
            }
        }
        .with_context(|| format!("failed to load channels from {}", config.table))?;

        let first_unix_ms = frame.index.first().copied();
        let frame = frame.rebased();
        let summary = frame.describe();
        info!(rows = frame.len(), "analytics summary computed");

        Ok(AnalyticsReport {
            first_unix_ms,
            labels: channel_labels(config.channel_count),
            summary,
            frame,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use common::domain::StoredRow;
    use common::memory::InMemoryRowStore;

    fn table() -> TableRef {
        TableRef::new("p", "ds_data_platform", "tbl_pubsub").unwrap()
    }

    fn worker(store: Arc<InMemoryRowStore>, cache_path: Option<PathBuf>) -> AnalyticsWorker {
        AnalyticsWorker::new(
            Arc::new(TableAnalyticsService::new(store)),
            AnalyticsWorkerConfig {
                table: table(),
                channel_count: 2,
                query_mode: QueryMode::Interactive,
                cache_path,
            },
        )
    }

    fn stored(second: i64, values: [f64; 2]) -> StoredRow {
        StoredRow {
            pub_region: "us-east4".to_string(),
            datetime_created: DateTime::from_timestamp(second, 0).unwrap(),
            unix_ms: second * 1000,
            msg_trip_s: 1.0,
            msg_proc_s: 0.1,
            channels: values.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_report_rebases_and_summarises() {
        let store = Arc::new(InMemoryRowStore::new());
        store
            .seed_rows(
                &table(),
                vec![stored(100, [1.0, 4.0]), stored(220, [3.0, 8.0])],
            )
            .await;

        let report = worker(store, None).run().await.unwrap();

        assert_eq!(report.first_unix_ms, Some(100_000));
        assert_eq!(report.frame.index, vec![0, 120_000]);
        assert_eq!(report.summary.channels[0].mean, 2.0);
        assert_eq!(report.summary.channels[1].max, 8.0);
        assert_eq!(report.labels, vec!["raw", "cyc1"]);

        let rendered = report.to_string();
        assert!(rendered.starts_with("p.ds_data_platform.tbl_pubsub (2 rows)"));
        assert!(rendered.contains("Channel_1=raw, Channel_2=cyc1"));
    }

    #[tokio::test]
    async fn test_missing_table_fails_run() {
        let store = Arc::new(InMemoryRowStore::new());
        let err = worker(store, None).run().await.err().unwrap();
        assert!(format!("{:#}", err).contains("not found"));
    }

    #[tokio::test]
    async fn test_cache_path_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let store = Arc::new(InMemoryRowStore::new());
        store.seed_rows(&table(), vec![stored(100, [1.0, 4.0])]).await;

        worker(store, Some(path.clone())).run().await.unwrap();

        let snapshot = ChannelFrame::load_snapshot(&path).unwrap();
        assert_eq!(snapshot.index, vec![100_000]);
    }
}
