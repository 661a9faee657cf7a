use crate::clickhouse::ClickHouseClient;
use crate::domain::{
    wait_for_job, DedupKey, DomainError, DomainResult, InsertRowError, JobState, JobStatusSource,
    PollPolicy, QueryMode, QueryRow, RowStore, StoredRow, TableQuery, TableRef,
};
use anyhow::Context;
use async_trait::async_trait;
use clickhouse::sql::Identifier;
use clickhouse::{Client, Row};
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

type QueryJob = JoinHandle<DomainResult<Vec<QueryRow>>>;
type JobMap = Arc<Mutex<HashMap<String, QueryJob>>>;

/// Owns a submitted job until its rows are taken. Dropping it early, for
/// example when the waiting future is cancelled, forgets and aborts the job.
struct JobGuard {
    jobs: JobMap,
    job_id: String,
    armed: bool,
}

impl JobGuard {
    async fn take(mut self) -> Option<QueryJob> {
        let handle = self.jobs.lock().await.remove(&self.job_id);
        self.armed = false;
        handle
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut jobs) = self.jobs.try_lock() {
            if let Some(handle) = jobs.remove(&self.job_id) {
                handle.abort();
            }
            return;
        }
        // Lock is busy; finish the cleanup on the runtime.
        let jobs = self.jobs.clone();
        let job_id = std::mem::take(&mut self.job_id);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Some(handle) = jobs.lock().await.remove(&job_id) {
                    handle.abort();
                }
            });
        }
    }
}

#[derive(Debug, Row, Deserialize)]
struct JsonLine {
    line: String,
}

/// Literal `?` in statement text must be doubled so it is not taken for a bind slot.
fn escape_placeholders(text: &str) -> String {
    text.replace('?', "??")
}

/// Each selected row comes back as one JSON object string, so the column set
/// can vary per query.
fn select_template(query: &TableQuery) -> String {
    let columns = vec!["?"; query.columns().len()].join(", ");
    let mut sql = format!(
        "SELECT formatRowNoNewline('JSONEachRow', {}) AS line FROM ?.?",
        columns
    );
    if query.order_by().is_some() {
        sql.push_str(" ORDER BY ?");
    }
    sql
}

fn encode_rows(rows: &[StoredRow]) -> DomainResult<String> {
    let mut body = String::new();
    for row in rows {
        let line = serde_json::to_string(&row.to_json_row())
            .map_err(|e| DomainError::InsertError(format!("row encoding: {}", e)))?;
        body.push_str(&line);
        body.push('\n');
    }
    Ok(body)
}

async fn fetch_rows(client: &Client, query: &TableQuery) -> DomainResult<Vec<QueryRow>> {
    let sql = select_template(query);
    let mut statement = client.query(&sql);
    for column in query.columns() {
        statement = statement.bind(Identifier(column));
    }
    statement = statement
        .bind(Identifier(query.table().dataset_id()))
        .bind(Identifier(query.table().table_id()));
    if let Some(order_by) = query.order_by() {
        statement = statement.bind(Identifier(order_by));
    }

    let lines = statement
        .fetch_all::<JsonLine>()
        .await
        .with_context(|| format!("Failed to query {}", query.table()))?;

    lines
        .into_iter()
        .map(|l| {
            serde_json::from_str::<QueryRow>(&l.line)
                .map_err(|e| DomainError::BackendError(anyhow::anyhow!("bad row json: {}", e)))
        })
        .collect()
}

/// Rows live in `{dataset}.{table}` where the dataset is a ClickHouse database.
pub struct ClickHouseRowStore {
    client: ClickHouseClient,
    jobs: JobMap,
}

impl ClickHouseRowStore {
    pub fn new(client: ClickHouseClient) -> Self {
        Self {
            client,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn submit_batch(&self, query: TableQuery) -> JobGuard {
        let client = self.client.low_priority();
        self.track(async move { fetch_rows(&client, &query).await }).await
    }

    async fn track<F>(&self, job: F) -> JobGuard
    where
        F: Future<Output = DomainResult<Vec<QueryRow>>> + Send + 'static,
    {
        let job_id = xid::new().to_string();
        let handle = tokio::spawn(job);
        self.jobs.lock().await.insert(job_id.clone(), handle);
        debug!(job_id = %job_id, "submitted batch query");
        JobGuard {
            jobs: self.jobs.clone(),
            job_id,
            armed: true,
        }
    }

    async fn await_job(&self, guard: JobGuard, policy: PollPolicy) -> DomainResult<Vec<QueryRow>> {
        let job_id = guard.job_id.clone();
        if let Err(e) = wait_for_job(self, &job_id, policy).await {
            warn!(job_id = %job_id, error = %e, "batch query abandoned");
            return Err(e);
        }

        let handle = guard
            .take()
            .await
            .ok_or_else(|| DomainError::NotFound(format!("query job {}", job_id)))?;
        let rows = handle.await.context("Batch query task failed")??;
        info!(job_id = %job_id, row_count = rows.len(), "batch query finished");
        Ok(rows)
    }
}

#[async_trait]
impl JobStatusSource for ClickHouseRowStore {
    async fn poll_status(&self, job_id: &str) -> DomainResult<JobState> {
        let jobs = self.jobs.lock().await;
        match jobs.get(job_id) {
            Some(handle) if handle.is_finished() => Ok(JobState::Done),
            Some(_) => Ok(JobState::Running),
            None => Err(DomainError::NotFound(format!("query job {}", job_id))),
        }
    }
}

#[async_trait]
impl RowStore for ClickHouseRowStore {
    async fn dataset_exists(&self, dataset_id: &str) -> DomainResult<bool> {
        let count = self
            .client
            .get_client()
            .query("SELECT count() FROM system.databases WHERE name = ?")
            .bind(dataset_id)
            .fetch_one::<u64>()
            .await
            .context("Failed to look up database")?;
        Ok(count > 0)
    }

    async fn table_exists(&self, table: &TableRef) -> DomainResult<bool> {
        let count = self
            .client
            .get_client()
            .query("SELECT count() FROM system.tables WHERE database = ? AND name = ?")
            .bind(table.dataset_id())
            .bind(table.table_id())
            .fetch_one::<u64>()
            .await
            .context("Failed to look up table")?;
        Ok(count > 0)
    }

    #[instrument(skip(self), fields(table = %table, key = %key))]
    async fn count_matching_rows(&self, table: &TableRef, key: &DedupKey) -> DomainResult<u64> {
        let count = self
            .client
            .get_client()
            .query("SELECT count() FROM ?.? WHERE unix_ms = ? AND pub_region = ?")
            .bind(Identifier(table.dataset_id()))
            .bind(Identifier(table.table_id()))
            .bind(key.unix_ms)
            .bind(key.region.as_str())
            .fetch_one::<u64>()
            .await
            .context("Failed to count matching rows")?;
        debug!(count, "counted matching rows");
        Ok(count)
    }

    #[instrument(skip(self, rows), fields(table = %table, row_count = rows.len()))]
    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: &[StoredRow],
    ) -> DomainResult<Vec<InsertRowError>> {
        if rows.is_empty() {
            debug!("no rows to insert, skipping");
            return Ok(Vec::new());
        }

        let body = encode_rows(rows)?;
        let sql = format!(
            "INSERT INTO ?.? FORMAT JSONEachRow\n{}",
            escape_placeholders(&body)
        );

        self.client
            .get_client()
            .query(&sql)
            .bind(Identifier(table.dataset_id()))
            .bind(Identifier(table.table_id()))
            .execute()
            .await
            .map_err(|e| {
                error!(error = %e, "ClickHouse rejected insert");
                DomainError::InsertError(e.to_string())
            })?;

        debug!(rows_inserted = rows.len(), "stored rows");
        Ok(Vec::new())
    }

    #[instrument(skip(self, query), fields(table = %query.table(), sql = %query.to_sql()))]
    async fn query(&self, query: &TableQuery, mode: QueryMode) -> DomainResult<Vec<QueryRow>> {
        match mode {
            QueryMode::Interactive => fetch_rows(self.client.get_client(), query).await,
            QueryMode::Batch(policy) => {
                let guard = self.submit_batch(query.clone()).await;
                self.await_job(guard, policy).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn store() -> ClickHouseRowStore {
        ClickHouseRowStore::new(ClickHouseClient::new("http://localhost:8123", "default", ""))
    }

    fn policy(timeout: Duration) -> PollPolicy {
        PollPolicy {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            timeout,
        }
    }

    /// A job that never finishes; `rx` errors once the task is dropped.
    fn stuck_job() -> (
        impl Future<Output = DomainResult<Vec<QueryRow>>> + Send + 'static,
        oneshot::Receiver<()>,
    ) {
        let (tx, rx) = oneshot::channel::<()>();
        let job = async move {
            let _tx = tx;
            futures::future::pending::<()>().await;
            Ok(Vec::new())
        };
        (job, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_aborts_and_forgets_job() {
        let store = store();
        let (job, rx) = stuck_job();
        let guard = store.track(job).await;

        let waited = tokio::time::timeout(
            Duration::from_secs(2),
            store.await_job(guard, policy(Duration::from_secs(60))),
        )
        .await;
        assert!(waited.is_err());

        assert!(store.jobs.lock().await.is_empty());
        assert!(rx.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_job_is_aborted() {
        let store = store();
        let (job, rx) = stuck_job();
        let guard = store.track(job).await;

        let err = store
            .await_job(guard, policy(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Timeout(_)));
        assert!(store.jobs.lock().await.is_empty());
        assert!(rx.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_job_hands_over_rows() {
        let store = store();
        let mut row = QueryRow::new();
        row.insert("unix_ms".to_string(), serde_json::json!(1_726_846_298_000i64));
        let expected = vec![row];
        let rows = expected.clone();
        let guard = store.track(async move { Ok(rows) }).await;

        let rows = store
            .await_job(guard, policy(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(rows, expected);
        assert!(store.jobs.lock().await.is_empty());
    }

    #[test]
    fn test_select_template_has_one_slot_per_identifier() {
        let table = TableRef::new("p", "ds_data_platform", "tbl_pubsub").unwrap();
        let query = TableQuery::new(
            table,
            vec!["unix_ms".to_string(), "Channel_1".to_string()],
            Some("unix_ms".to_string()),
        )
        .unwrap();

        let sql = select_template(&query);
        assert_eq!(
            sql,
            "SELECT formatRowNoNewline('JSONEachRow', ?, ?) AS line FROM ?.? ORDER BY ?"
        );
        assert_eq!(sql.matches('?').count(), 5);
    }

    #[test]
    fn test_encode_rows_one_json_object_per_line() {
        let row = StoredRow {
            pub_region: "why?".to_string(),
            datetime_created: DateTime::from_timestamp(1_726_846_298, 0).unwrap(),
            unix_ms: 1_726_846_298_000,
            msg_trip_s: 1.0,
            msg_proc_s: 0.5,
            channels: vec![0.25],
        };
        let body = encode_rows(&[row.clone(), row]).unwrap();
        assert_eq!(body.lines().count(), 2);
        assert!(body.contains(r#""Channel_1":0.25"#));

        let escaped = escape_placeholders(&body);
        assert!(escaped.contains("why??"));
    }
}
