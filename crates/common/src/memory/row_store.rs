use crate::domain::{
    wait_for_job, DedupKey, DomainError, DomainResult, InsertRowError, JobState,
    JobStatusSource, QueryMode, QueryRow, RowStore, StoredRow, TableQuery, TableRef,
};
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Default)]
struct StoreState {
    datasets: HashSet<String>,
    tables: HashMap<(String, String), Vec<StoredRow>>,
    jobs: HashMap<String, (Instant, Vec<QueryRow>)>,
    insert_failure: Option<String>,
    row_errors: Option<String>,
}

/// Row store kept in process memory. Batch queries become jobs that turn
/// `Done` after `batch_latency`.
#[derive(Default)]
pub struct InMemoryRowStore {
    state: RwLock<StoreState>,
    batch_latency: Duration,
    insert_calls: AtomicU64,
    count_calls: AtomicU64,
    next_job: AtomicU64,
}

impl InMemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_latency(batch_latency: Duration) -> Self {
        Self {
            batch_latency,
            ..Self::default()
        }
    }

    pub async fn create_dataset(&self, dataset_id: &str) {
        self.state
            .write()
            .await
            .datasets
            .insert(dataset_id.to_string());
    }

    /// Creates the dataset too when missing.
    pub async fn create_table(&self, table: &TableRef) {
        let mut state = self.state.write().await;
        state.datasets.insert(table.dataset_id().to_string());
        state
            .tables
            .entry(table_key(table))
            .or_insert_with(Vec::new);
    }

    pub async fn rows(&self, table: &TableRef) -> Vec<StoredRow> {
        self.state
            .read()
            .await
            .tables
            .get(&table_key(table))
            .cloned()
            .unwrap_or_default()
    }

    /// Seed rows directly, bypassing the insert path.
    pub async fn seed_rows(&self, table: &TableRef, rows: Vec<StoredRow>) {
        let mut state = self.state.write().await;
        state.datasets.insert(table.dataset_id().to_string());
        state
            .tables
            .entry(table_key(table))
            .or_insert_with(Vec::new)
            .extend(rows);
    }

    /// Make every following insert fail with `reason`.
    pub async fn fail_inserts(&self, reason: Option<&str>) {
        self.state.write().await.insert_failure = reason.map(str::to_string);
    }

    /// Make every following insert report a per-row error instead of storing.
    pub async fn reject_rows(&self, reason: Option<&str>) {
        self.state.write().await.row_errors = reason.map(str::to_string);
    }

    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(AtomicOrdering::SeqCst)
    }

    pub fn count_calls(&self) -> u64 {
        self.count_calls.load(AtomicOrdering::SeqCst)
    }

    async fn project(&self, query: &TableQuery) -> DomainResult<Vec<QueryRow>> {
        let state = self.state.read().await;
        let rows = state
            .tables
            .get(&table_key(query.table()))
            .ok_or_else(|| DomainError::NotFound(query.table().fully_qualified()))?;

        let mut projected = Vec::with_capacity(rows.len());
        for row in rows {
            let full = row.to_json_row();
            let mut out = QueryRow::new();
            for column in query.columns() {
                let value = full.get(column).cloned().ok_or_else(|| {
                    DomainError::InvalidArgument(format!("unknown column '{}'", column))
                })?;
                out.insert(column.clone(), value);
            }
            if let Some(order_by) = query.order_by() {
                let key = full.get(order_by).cloned().ok_or_else(|| {
                    DomainError::InvalidArgument(format!("unknown column '{}'", order_by))
                })?;
                projected.push((key, out));
            } else {
                projected.push((Value::Null, out));
            }
        }

        if query.order_by().is_some() {
            projected.sort_by(|a, b| compare_values(&a.0, &b.0));
        }
        Ok(projected.into_iter().map(|(_, row)| row).collect())
    }
}

fn table_key(table: &TableRef) -> (String, String) {
    (table.dataset_id().to_string(), table.table_id().to_string())
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl JobStatusSource for InMemoryRowStore {
    async fn poll_status(&self, job_id: &str) -> DomainResult<JobState> {
        let state = self.state.read().await;
        let (ready_at, _) = state
            .jobs
            .get(job_id)
            .ok_or_else(|| DomainError::NotFound(format!("query job {}", job_id)))?;
        if Instant::now() >= *ready_at {
            Ok(JobState::Done)
        } else {
            Ok(JobState::Running)
        }
    }
}

#[async_trait]
impl RowStore for InMemoryRowStore {
    async fn dataset_exists(&self, dataset_id: &str) -> DomainResult<bool> {
        Ok(self.state.read().await.datasets.contains(dataset_id))
    }

    async fn table_exists(&self, table: &TableRef) -> DomainResult<bool> {
        Ok(self
            .state
            .read()
            .await
            .tables
            .contains_key(&table_key(table)))
    }

    async fn count_matching_rows(&self, table: &TableRef, key: &DedupKey) -> DomainResult<u64> {
        self.count_calls.fetch_add(1, AtomicOrdering::SeqCst);
        let state = self.state.read().await;
        let rows = state
            .tables
            .get(&table_key(table))
            .ok_or_else(|| DomainError::NotFound(table.fully_qualified()))?;
        Ok(rows.iter().filter(|row| row.key() == *key).count() as u64)
    }

    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: &[StoredRow],
    ) -> DomainResult<Vec<InsertRowError>> {
        self.insert_calls.fetch_add(1, AtomicOrdering::SeqCst);
        let mut state = self.state.write().await;
        if let Some(reason) = &state.insert_failure {
            return Err(DomainError::InsertError(reason.clone()));
        }
        if let Some(reason) = &state.row_errors {
            return Ok((0..rows.len())
                .map(|index| InsertRowError {
                    index,
                    message: reason.clone(),
                })
                .collect());
        }
        let stored = state
            .tables
            .get_mut(&table_key(table))
            .ok_or_else(|| DomainError::InsertError(format!("{} not found", table)))?;
        stored.extend_from_slice(rows);
        Ok(Vec::new())
    }

    async fn query(&self, query: &TableQuery, mode: QueryMode) -> DomainResult<Vec<QueryRow>> {
        let rows = self.project(query).await?;
        match mode {
            QueryMode::Interactive => Ok(rows),
            QueryMode::Batch(policy) => {
                let job_id = format!("job-{}", self.next_job.fetch_add(1, AtomicOrdering::SeqCst));
                self.state
                    .write()
                    .await
                    .jobs
                    .insert(job_id.clone(), (Instant::now() + self.batch_latency, rows));

                let waited = wait_for_job(self, &job_id, policy).await;
                let job = self.state.write().await.jobs.remove(&job_id);
                waited?;
                job.map(|(_, rows)| rows)
                    .ok_or_else(|| DomainError::NotFound(format!("query job {}", job_id)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PollPolicy;
    use chrono::DateTime;

    fn table() -> TableRef {
        TableRef::new("p", "ds_data_platform", "tbl_pubsub").unwrap()
    }

    fn row(unix_ms: i64, region: &str) -> StoredRow {
        StoredRow {
            pub_region: region.to_string(),
            datetime_created: DateTime::from_timestamp(unix_ms / 1000, 0).unwrap(),
            unix_ms,
            msg_trip_s: 0.0,
            msg_proc_s: 0.0,
            channels: vec![unix_ms as f64],
        }
    }

    #[tokio::test]
    async fn test_count_and_insert() {
        let store = InMemoryRowStore::new();
        store.create_table(&table()).await;

        let key = DedupKey::new(1000, "r");
        assert_eq!(store.count_matching_rows(&table(), &key).await.unwrap(), 0);
        let errors = store.insert_rows(&table(), &[row(1000, "r")]).await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(store.count_matching_rows(&table(), &key).await.unwrap(), 1);
        assert_eq!(store.insert_calls(), 1);
    }

    #[tokio::test]
    async fn test_query_orders_rows() {
        let store = InMemoryRowStore::new();
        store
            .seed_rows(&table(), vec![row(3000, "r"), row(1000, "r"), row(2000, "r")])
            .await;

        let query = TableQuery::new(
            table(),
            vec!["unix_ms".to_string()],
            Some("unix_ms".to_string()),
        )
        .unwrap();
        let rows = store.query(&query, QueryMode::Interactive).await.unwrap();
        let order: Vec<i64> = rows
            .iter()
            .map(|r| r["unix_ms"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![1000, 2000, 3000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_query_times_out() {
        let store = InMemoryRowStore::with_batch_latency(Duration::from_secs(60));
        store.seed_rows(&table(), vec![row(1000, "r")]).await;
        let query = TableQuery::new(table(), vec!["unix_ms".to_string()], None).unwrap();
        let policy = PollPolicy {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
        };

        let err = store
            .query(&query, QueryMode::Batch(policy))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Timeout(_)));
    }
}
