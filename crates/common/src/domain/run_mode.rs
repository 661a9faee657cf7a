use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Whether a worker performs one cycle and exits or keeps cycling until shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Once,
    #[default]
    Loop,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(RunMode::Once),
            "loop" => Ok(RunMode::Loop),
            other => Err(format!("unknown run mode '{}' (expected once or loop)", other)),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Once => f.write_str("once"),
            RunMode::Loop => f.write_str("loop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_mode() {
        assert_eq!("once".parse::<RunMode>().unwrap(), RunMode::Once);
        assert_eq!(" LOOP ".parse::<RunMode>().unwrap(), RunMode::Loop);
        assert!("forever".parse::<RunMode>().is_err());
        assert_eq!(RunMode::default(), RunMode::Loop);
    }
}
