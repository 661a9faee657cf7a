use anyhow::Context;
use common::domain::{channel_column, DomainError, DomainResult, QueryRow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Channel readings of one table, indexed by `unix_ms`.
///
/// Columns are stored column-major. A missing or null cell is `None` and is
/// left out of the summary statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFrame {
    /// Fully qualified table the rows were loaded from.
    pub source: String,
    pub index: Vec<i64>,
    pub columns: Vec<String>,
    pub values: Vec<Vec<Option<f64>>>,
}

fn cell_i64(row: &QueryRow, column: &str, position: usize) -> DomainResult<i64> {
    match row.get(column) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| DomainError::DecodeError(format!("row {}: bad {}", position, column))),
        // 64-bit integers may come back quoted
        Some(Value::String(s)) => s
            .parse()
            .map_err(|_| DomainError::DecodeError(format!("row {}: bad {}", position, column))),
        _ => Err(DomainError::DecodeError(format!(
            "row {}: missing {}",
            position, column
        ))),
    }
}

fn cell_f64(row: &QueryRow, column: &str) -> Option<f64> {
    match row.get(column) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

impl ChannelFrame {
    /// Build from rows carrying `unix_ms` and `Channel_1..=Channel_{channel_count}`,
    /// keeping row order.
    pub fn from_rows(
        source: impl Into<String>,
        rows: &[QueryRow],
        channel_count: usize,
    ) -> DomainResult<Self> {
        let columns: Vec<String> = (0..channel_count).map(channel_column).collect();
        let mut index = Vec::with_capacity(rows.len());
        let mut values = vec![Vec::with_capacity(rows.len()); channel_count];

        for (position, row) in rows.iter().enumerate() {
            index.push(cell_i64(row, "unix_ms", position)?);
            for (column, series) in columns.iter().zip(values.iter_mut()) {
                series.push(cell_f64(row, column));
            }
        }

        Ok(Self {
            source: source.into(),
            index,
            columns,
            values,
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Shift the index so the first row sits at zero.
    pub fn rebased(mut self) -> Self {
        if let Some(&first) = self.index.first() {
            for value in self.index.iter_mut() {
                *value -= first;
            }
        }
        self
    }

    pub fn describe(&self) -> Summary {
        Summary {
            channels: self
                .columns
                .iter()
                .zip(&self.values)
                .map(|(name, series)| ChannelSummary::of(name, series))
                .collect(),
        }
    }

    pub fn save_snapshot(&self, path: &Path) -> DomainResult<()> {
        let encoded = serde_json::to_vec(self).context("failed to encode channel snapshot")?;
        std::fs::write(path, encoded)
            .with_context(|| format!("failed to write snapshot {}", path.display()))?;
        debug!(path = %path.display(), rows = self.len(), "snapshot saved");
        Ok(())
    }

    pub fn load_snapshot(path: &Path) -> DomainResult<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        serde_json::from_slice(&raw)
            .map_err(|e| DomainError::DecodeError(format!("snapshot {}: {}", path.display(), e)))
    }
}

/// Linear interpolation between closest ranks; `sorted` must be non-empty.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Count, mean, sample standard deviation, min, quartiles and max of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSummary {
    pub name: String,
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub max: f64,
}

impl ChannelSummary {
    pub fn of(name: &str, series: &[Option<f64>]) -> Self {
        let mut sorted: Vec<f64> = series
            .iter()
            .flatten()
            .copied()
            .filter(|v| v.is_finite())
            .collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let count = sorted.len();
        if count == 0 {
            return Self {
                name: name.to_string(),
                count,
                mean: f64::NAN,
                std: f64::NAN,
                min: f64::NAN,
                p25: f64::NAN,
                p50: f64::NAN,
                p75: f64::NAN,
                max: f64::NAN,
            };
        }

        let mean = sorted.iter().sum::<f64>() / count as f64;
        let std = if count > 1 {
            let squares: f64 = sorted.iter().map(|v| (v - mean).powi(2)).sum();
            (squares / (count - 1) as f64).sqrt()
        } else {
            f64::NAN
        };

        Self {
            name: name.to_string(),
            count,
            mean,
            std,
            min: sorted[0],
            p25: quantile(&sorted, 0.25),
            p50: quantile(&sorted, 0.50),
            p75: quantile(&sorted, 0.75),
            max: sorted[count - 1],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub channels: Vec<ChannelSummary>,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<6}", "")?;
        for channel in &self.channels {
            write!(f, "{:>14}", channel.name)?;
        }
        writeln!(f)?;

        write!(f, "{:<6}", "count")?;
        for channel in &self.channels {
            write!(f, "{:>14}", channel.count)?;
        }
        writeln!(f)?;

        let stats: [(&str, fn(&ChannelSummary) -> f64); 7] = [
            ("mean", |c| c.mean),
            ("std", |c| c.std),
            ("min", |c| c.min),
            ("25%", |c| c.p25),
            ("50%", |c| c.p50),
            ("75%", |c| c.p75),
            ("max", |c| c.max),
        ];
        for (label, stat) in stats {
            write!(f, "{:<6}", label)?;
            for channel in &self.channels {
                write!(f, "{:>14.6}", stat(channel))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
