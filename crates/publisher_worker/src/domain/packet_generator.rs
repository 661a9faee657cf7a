use chrono::SubsecRound;
use common::domain::{validate_struct, Clock, DomainError, DomainResult, Packet, SourceRegion};
use std::sync::Arc;
use tracing::debug;

/// Signal shape of one payload channel, selected by the channel's zero-based index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFunction {
    Raw,
    Cyc1,
    Poly,
    Lin1,
    Cyc2,
    Square,
    Cubic,
    Lin2,
    Exp,
    /// Channels past the named set repeat the polynomial.
    Extra(usize),
}

fn polynomial(x: f64) -> f64 {
    x.powi(4) + x.powi(3) + x.powi(2) + x
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

impl TransferFunction {
    pub fn for_index(index: usize) -> Self {
        match index {
            0 => TransferFunction::Raw,
            1 => TransferFunction::Cyc1,
            2 => TransferFunction::Poly,
            3 => TransferFunction::Lin1,
            4 => TransferFunction::Cyc2,
            5 => TransferFunction::Square,
            6 => TransferFunction::Cubic,
            7 => TransferFunction::Lin2,
            8 => TransferFunction::Exp,
            n => TransferFunction::Extra(n),
        }
    }

    pub fn label(&self) -> String {
        match self {
            TransferFunction::Raw => "raw".to_string(),
            TransferFunction::Cyc1 => "cyc1".to_string(),
            TransferFunction::Poly => "poly".to_string(),
            TransferFunction::Lin1 => "lin1".to_string(),
            TransferFunction::Cyc2 => "cyc2".to_string(),
            TransferFunction::Square => "square".to_string(),
            TransferFunction::Cubic => "cubic".to_string(),
            TransferFunction::Lin2 => "lin2".to_string(),
            TransferFunction::Exp => "exp".to_string(),
            TransferFunction::Extra(n) => format!("ch{}", n),
        }
    }

    /// Always finite for finite `x`: a non-finite result falls back to `x`
    /// (`Exp` tries the polynomial first).
    pub fn apply(&self, x: f64) -> f64 {
        match self {
            TransferFunction::Raw => x,
            TransferFunction::Cyc1 => {
                let value = if x < 1.0 { x.sin() } else { (1.0 / x).sin() };
                finite_or(value, x)
            }
            TransferFunction::Poly | TransferFunction::Extra(_) => finite_or(polynomial(x), x),
            TransferFunction::Lin1 => finite_or(3.0 * x + 1.0 / 3.0, x),
            TransferFunction::Cyc2 => finite_or(10.0 * x + 10.0 * x, x),
            TransferFunction::Square => finite_or(x.powi(2), x),
            TransferFunction::Cubic => finite_or(x.powi(3), x),
            TransferFunction::Lin2 => finite_or(-(1.0 / 7.0) * x + 1.0 / 7.0, x),
            TransferFunction::Exp => finite_or(x.exp(), finite_or(polynomial(x), x)),
        }
    }
}

/// Display labels for the first `channel_count` channels.
pub fn channel_labels(channel_count: usize) -> Vec<String> {
    (0..channel_count)
        .map(|i| TransferFunction::for_index(i).label())
        .collect()
}

fn decimal_digits(value: i64) -> i32 {
    let mut n = value.unsigned_abs();
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

/// Scale `unix_ms` below 1 by its own digit count and keep the fractional part.
pub fn driver_value(unix_ms: i64) -> f64 {
    let scaled = unix_ms as f64 / 10f64.powi(decimal_digits(unix_ms));
    scaled - scaled.trunc()
}

/// Channel values for a packet stamped `unix_ms`.
pub fn channels_for(unix_ms: i64, channel_count: usize) -> Vec<f64> {
    let x = driver_value(unix_ms);
    (0..channel_count)
        .map(|i| TransferFunction::for_index(i).apply(x))
        .collect()
}

/// Produces packets whose payload depends only on the whole-second timestamp.
pub struct PacketGenerator {
    clock: Arc<dyn Clock>,
}

impl PacketGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn generate_packet(&self, channel_count: usize, source_tag: &str) -> DomainResult<Packet> {
        validate_struct(&SourceRegion::new(source_tag))?;
        if channel_count == 0 {
            return Err(DomainError::InvalidArgument(
                "channel_count must be positive".to_string(),
            ));
        }

        let created_at = self.clock.now().trunc_subsecs(6);
        let unix_ms = created_at.timestamp() * 1000;
        let channels = channels_for(unix_ms, channel_count);

        debug!(unix_ms, channel_count, region = %source_tag, "generated packet");

        Ok(Packet {
            created_at,
            unix_ms,
            region: source_tag.to_string(),
            channels,
        })
    }
}
