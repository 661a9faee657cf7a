//! Garde validation utilities.

use crate::domain::{DomainError, DomainResult};
use garde::{Report, Validate};

/// Convert a garde validation report into [`DomainError::InvalidArgument`].
pub fn validate_struct<T>(value: &T) -> DomainResult<()>
where
    T: Validate,
    T::Context: Default,
{
    value
        .validate()
        .map_err(|report| DomainError::InvalidArgument(format_validation_errors(&report)))
}

fn format_validation_errors(report: &Report) -> String {
    report
        .iter()
        .map(|(path, error)| {
            if path.to_string().is_empty() {
                error.message().to_string()
            } else {
                format!("{}: {}", path, error.message())
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Rejects empty and whitespace-only strings.
pub fn non_blank(value: &str, _context: &()) -> garde::Result {
    if value.trim().is_empty() {
        return Err(garde::Error::new("must not be blank"));
    }
    Ok(())
}

/// Dataset ids are plain names: no project separators, no dashes.
#[derive(Debug, Validate)]
pub struct DatasetId {
    #[garde(pattern(r"^[^:.\-]+$"))]
    pub dataset_id: String,
}

impl DatasetId {
    pub fn new(dataset_id: &str) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
        }
    }
}

/// The region (source tag) stamped on a packet.
#[derive(Debug, Validate)]
pub struct SourceRegion {
    #[garde(custom(non_blank))]
    pub region: String,
}

impl SourceRegion {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
        }
    }
}

#[derive(Debug, Validate)]
struct ResourceId {
    #[garde(custom(non_blank))]
    id: String,
}

/// Topic and subscription ids only need to be present; `kind` names the id in
/// the error.
pub fn validate_resource_id(kind: &str, id: &str) -> DomainResult<()> {
    validate_struct(&ResourceId { id: id.to_string() })
        .map_err(|_| DomainError::InvalidArgument(format!("{}: must not be blank", kind)))
}
