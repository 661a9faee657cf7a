use crate::domain::result::DomainResult;
use crate::domain::store::{RowStore, TableRef};
use crate::domain::validate::{validate_struct, DatasetId};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Existence checks for datasets and tables. Identifiers are validated before
/// the store is contacted.
pub struct TableCatalog {
    store: Arc<dyn RowStore>,
}

impl TableCatalog {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub async fn dataset_exists(&self, dataset_id: &str) -> DomainResult<bool> {
        validate_struct(&DatasetId::new(dataset_id))?;
        let exists = self.store.dataset_exists(dataset_id).await?;
        if !exists {
            warn!(dataset_id = %dataset_id, "dataset not found or insufficient permission");
        }
        Ok(exists)
    }

    /// The dataset is checked first; a missing dataset means a missing table.
    #[instrument(skip(self))]
    pub async fn table_exists(
        &self,
        project_id: &str,
        dataset_id: &str,
        table_id: &str,
    ) -> DomainResult<bool> {
        let table = TableRef::new(project_id, dataset_id, table_id)?;
        self.table_ref_exists(&table).await
    }

    #[instrument(skip(self), fields(table = %table))]
    pub async fn table_ref_exists(&self, table: &TableRef) -> DomainResult<bool> {
        if !self.dataset_exists(table.dataset_id()).await? {
            return Ok(false);
        }
        let exists = self.store.table_exists(table).await?;
        if exists {
            debug!("table exists");
        } else {
            warn!("table not found or insufficient permission");
        }
        Ok(exists)
    }
}
