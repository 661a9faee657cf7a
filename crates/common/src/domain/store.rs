use crate::domain::job::PollPolicy;
use crate::domain::packet::DedupKey;
use crate::domain::result::DomainResult;
use crate::domain::stored_row::StoredRow;
use crate::domain::validate::{non_blank, validate_struct};
use async_trait::async_trait;
use garde::Validate;
use std::fmt;

/// One result row, keyed by column name.
pub type QueryRow = serde_json::Map<String, serde_json::Value>;

/// A validated `{project}.{dataset}.{table}` reference. Dataset ids take no
/// dashes; table ids may carry dashes but no separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Validate)]
pub struct TableRef {
    #[garde(custom(non_blank))]
    project_id: String,
    #[garde(pattern(r"^[^:.\-]+$"))]
    dataset_id: String,
    #[garde(pattern(r"^[^:.]+$"))]
    table_id: String,
}

impl TableRef {
    pub fn new(
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        table_id: impl Into<String>,
    ) -> DomainResult<Self> {
        let table = Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
        };
        validate_struct(&table)?;
        Ok(table)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn table_id(&self) -> &str {
        &self.table_id
    }

    pub fn fully_qualified(&self) -> String {
        format!("{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fully_qualified())
    }
}

/// A column projection over one table, optionally ordered by one column.
/// Column names end up inside SQL text, so only `[A-Za-z0-9_]` is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct TableQuery {
    #[garde(dive)]
    table: TableRef,
    #[garde(length(min = 1), inner(pattern(r"^[A-Za-z0-9_]+$")))]
    columns: Vec<String>,
    #[garde(pattern(r"^[A-Za-z0-9_]+$"))]
    order_by: Option<String>,
}

impl TableQuery {
    pub fn new(
        table: TableRef,
        columns: Vec<String>,
        order_by: Option<String>,
    ) -> DomainResult<Self> {
        let query = Self {
            table,
            columns,
            order_by,
        };
        validate_struct(&query)?;
        Ok(query)
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn order_by(&self) -> Option<&str> {
        self.order_by.as_deref()
    }

    /// Render as SQL against `dataset.table`. Identifiers are validated on
    /// construction so quoting them with backticks is enough.
    pub fn to_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| format!("`{}`", c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT {} FROM `{}`.`{}`",
            columns,
            self.table.dataset_id(),
            self.table.table_id()
        );
        if let Some(order_by) = &self.order_by {
            sql.push_str(&format!(" ORDER BY `{}`", order_by));
        }
        sql
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Interactive,
    /// Low-priority background job, polled until done.
    Batch(PollPolicy),
}

/// A per-row rejection reported by the store after an insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertRowError {
    pub index: usize,
    pub message: String,
}

impl fmt::Display for InsertRowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {}: {}", self.index, self.message)
    }
}

/// Tabular store holding the delivered packets.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn dataset_exists(&self, dataset_id: &str) -> DomainResult<bool>;

    async fn table_exists(&self, table: &TableRef) -> DomainResult<bool>;

    /// Number of rows whose `(unix_ms, pub_region)` equals `key`.
    async fn count_matching_rows(&self, table: &TableRef, key: &DedupKey) -> DomainResult<u64>;

    /// Insert rows. An empty result means every row was accepted.
    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: &[StoredRow],
    ) -> DomainResult<Vec<InsertRowError>>;

    async fn query(&self, query: &TableQuery, mode: QueryMode) -> DomainResult<Vec<QueryRow>>;
}
