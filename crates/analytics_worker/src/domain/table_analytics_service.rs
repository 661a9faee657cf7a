use crate::domain::ChannelFrame;
use common::domain::{
    channel_column, DomainError, DomainResult, QueryMode, QueryRow, RowStore, TableCatalog,
    TableQuery, TableRef,
};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Delivery latencies recorded for one stored packet.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyRecord {
    pub unix_ms: i64,
    pub pub_region: String,
    pub datetime_created: String,
    pub msg_trip_s: f64,
    pub msg_proc_s: f64,
}

impl LatencyRecord {
    fn from_row(row: &QueryRow) -> DomainResult<Self> {
        let text = |column: &str| match row.get(column) {
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(DomainError::DecodeError(format!("missing {}", column))),
        };
        let number = |column: &str| match row.get(column) {
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| DomainError::DecodeError(format!("bad {}", column))),
            Some(Value::String(s)) => s
                .parse::<f64>()
                .map_err(|_| DomainError::DecodeError(format!("bad {}", column))),
            _ => Err(DomainError::DecodeError(format!("missing {}", column))),
        };

        Ok(Self {
            unix_ms: number("unix_ms")? as i64,
            pub_region: text("pub_region")?,
            datetime_created: text("datetime_created")?,
            msg_trip_s: number("msg_trip_s")?,
            msg_proc_s: number("msg_proc_s")?,
        })
    }
}

/// Read side of the packet table.
pub struct TableAnalyticsService {
    store: Arc<dyn RowStore>,
    catalog: TableCatalog,
}

impl TableAnalyticsService {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self {
            catalog: TableCatalog::new(store.clone()),
            store,
        }
    }

    async fn require_table(&self, table: &TableRef) -> DomainResult<()> {
        if self.catalog.table_ref_exists(table).await? {
            Ok(())
        } else {
            Err(DomainError::NotFound(format!("table {}", table)))
        }
    }

    /// `unix_ms` and the first `channel_count` channels, ordered by `unix_ms`.
    #[instrument(skip(self), fields(table = %table))]
    pub async fn load_channel_frame(
        &self,
        table: &TableRef,
        channel_count: usize,
        mode: QueryMode,
    ) -> DomainResult<ChannelFrame> {
        if channel_count == 0 {
            return Err(DomainError::InvalidArgument(
                "channel_count must be positive".to_string(),
            ));
        }
        self.require_table(table).await?;

        let mut columns = vec!["unix_ms".to_string()];
        columns.extend((0..channel_count).map(channel_column));
        let query = TableQuery::new(table.clone(), columns, Some("unix_ms".to_string()))?;
        debug!(sql = %query.to_sql(), "loading channels");

        let rows = self.store.query(&query, mode).await?;
        info!(rows = rows.len(), "channels loaded");
        ChannelFrame::from_rows(table.fully_qualified(), &rows, channel_count)
    }

    /// Like [`Self::load_channel_frame`], but served from the snapshot at
    /// `cache` when it holds the same table and channels. A fresh load is
    /// written back to `cache`.
    pub async fn load_channel_frame_cached(
        &self,
        table: &TableRef,
        channel_count: usize,
        mode: QueryMode,
        cache: &Path,
    ) -> DomainResult<ChannelFrame> {
        if cache.exists() {
            match ChannelFrame::load_snapshot(cache) {
                Ok(frame)
                    if frame.source == table.fully_qualified()
                        && frame.columns.len() == channel_count =>
                {
                    info!(path = %cache.display(), rows = frame.len(), "using snapshot");
                    return Ok(frame);
                }
                Ok(_) => warn!(path = %cache.display(), "snapshot is for another query, reloading"),
                Err(e) => warn!(error = %e, path = %cache.display(), "snapshot unreadable, reloading"),
            }
        }

        let frame = self.load_channel_frame(table, channel_count, mode).await?;
        frame.save_snapshot(cache)?;
        Ok(frame)
    }

    #[instrument(skip(self), fields(table = %table))]
    pub async fn list_latencies(
        &self,
        table: &TableRef,
        mode: QueryMode,
    ) -> DomainResult<Vec<LatencyRecord>> {
        self.require_table(table).await?;

        let columns = ["unix_ms", "pub_region", "datetime_created", "msg_trip_s", "msg_proc_s"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        let query = TableQuery::new(table.clone(), columns, Some("unix_ms".to_string()))?;

        self.store
            .query(&query, mode)
            .await?
            .iter()
            .map(LatencyRecord::from_row)
            .collect()
    }
}
